//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// ztgate - zero-trust network access control plane and enforcement agent
#[derive(Parser, Debug)]
#[command(name = "ztgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "ZTGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "ZTGATE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "ZTGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the control plane
    Control {
        /// Port to listen on
        #[arg(short, long, env = "ZTGATE_PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long, env = "ZTGATE_HOST")]
        host: Option<String>,
    },

    /// Run an enforcement agent next to the tunnel daemon
    Agent,

    /// Certificate authority administration
    Ca(CaArgs),
}

/// Connection settings for CA administration
#[derive(clap::Args, Debug)]
pub struct CaArgs {
    /// Control plane base URL
    #[arg(long, env = "ZTGATE_CONTROL_URL", default_value = "http://127.0.0.1:9443")]
    pub url: String,

    /// Admin bearer token
    #[arg(long, env = "ZTGATE_ADMIN_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Action
    #[command(subcommand)]
    pub action: CaCommand,
}

/// CA subcommands
#[derive(Subcommand, Debug)]
pub enum CaCommand {
    /// List every CA with its status
    List,

    /// Generate a pending CA for rotation
    Prepare,

    /// Activate a pending CA, retiring the current one
    Activate {
        /// CA id
        id: String,
    },

    /// Revoke a CA
    Revoke {
        /// CA id
        id: String,
    },

    /// Print the active CA fingerprint
    Fingerprint,
}
