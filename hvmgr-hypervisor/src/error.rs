//! Error types for the hypervisor lifecycle core.

use std::collections::BTreeSet;

use thiserror::Error;

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Operator input was rejected before touching the control plane.
    #[error("Invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    /// The control plane is unreachable or the session is dead.
    #[error("Failed to connect to hypervisor: {0}")]
    Connection(String),

    /// The target virtual network is missing or could not be activated.
    #[error("Network '{name}' not available: {reason}")]
    Network {
        name: String,
        reason: String,
        /// Names of every active or defined network, for remediation.
        available: BTreeSet<String>,
    },

    /// Disk image allocation failed.
    #[error("Failed to provision disk {path}: {diagnostic}")]
    Provisioning {
        path: String,
        diagnostic: String,
    },

    /// The control plane rejected the domain descriptor.
    #[error("Failed to define domain: {0}")]
    Definition(String),

    /// A domain or network vanished between listing and action.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another lifecycle operation is already in flight for this domain.
    #[error("Operation already in progress for domain '{name}' ({state})")]
    Conflict {
        name: String,
        state: String,
    },

    /// Domain is in an invalid state for the requested operation.
    #[error("Invalid domain state for operation: {0}")]
    InvalidState(String),

    /// A destructive action was requested without confirmation.
    #[error("Confirmation required: {0}")]
    Unconfirmed(String),

    /// A control-plane call failed for a reason other than the above.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    Xml(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Field name carried by a validation error.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            _ => None,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
