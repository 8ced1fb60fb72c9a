//! # hvmgr Common
//!
//! Shared utilities for hvmgr binaries.
//!
//! ```rust,no_run
//! hvmgr_common::init_logging("info").unwrap();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat};
