//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// hvmgr - single-host VM lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "hvmgr")]
#[command(about = "hvmgr - create, start and manage virtual machines on one hypervisor host")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "HVMGR_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Hypervisor connection URI (e.g., qemu:///system)
    #[arg(long, env = "HVMGR_URI")]
    pub uri: Option<String>,

    /// Directory holding disk images
    #[arg(long, env = "HVMGR_IMAGE_DIR")]
    pub image_dir: Option<PathBuf>,

    /// Disk image tool binary
    #[arg(long)]
    pub qemu_img: Option<String>,

    /// Enable development mode (in-memory mock hypervisor)
    #[arg(long)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List all domains
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Create and start a new domain
    Create(CreateArgs),

    /// Start a stopped domain
    Start { name: String },

    /// Reboot a running domain, or start a stopped one
    Restart { name: String },

    /// Shut a domain down
    Stop {
        name: String,
        /// Power off immediately instead of an ACPI shutdown
        #[arg(long)]
        force: bool,
    },

    /// Undefine a domain (disk images are kept)
    Delete {
        name: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Delete a disk image under the image directory
    RemoveDisk {
        path: PathBuf,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Show domain details
    Info { name: String },

    /// Show the lifecycle state of a domain
    State { name: String },

    /// Print the VNC console address of a running domain
    Console { name: String },

    /// List virtual networks
    Networks,
}

/// Raw create parameters. Values are validated by the core, not by clap.
#[derive(ClapArgs, Debug, Clone)]
pub struct CreateArgs {
    pub name: String,

    /// Memory in MiB
    #[arg(long)]
    pub memory: Option<String>,

    /// Number of vCPUs
    #[arg(long)]
    pub vcpus: Option<String>,

    /// Disk size in GiB
    #[arg(long)]
    pub disk: Option<String>,

    /// Installation media (ISO)
    #[arg(long)]
    pub install_media: Option<String>,

    /// Driver media (ISO)
    #[arg(long)]
    pub driver_media: Option<String>,

    /// Virtual network to attach
    #[arg(long)]
    pub network: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_create() {
        let args = Args::parse_from(["hvmgr", "--dev", "create", "test-vm", "--memory", "4096"]);
        assert!(args.dev);
        match args.command {
            Command::Create(create) => {
                assert_eq!(create.name, "test-vm");
                assert_eq!(create.memory.as_deref(), Some("4096"));
                assert!(create.vcpus.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
