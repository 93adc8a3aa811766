//! Command-line argument definitions for the `spindle` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command-line interface for the Spindle plugin host.
#[derive(Parser, Debug)]
#[command(
    name = "spindle",
    about = "Starts, calls and reclaims local plugin servers",
    disable_help_subcommand = true
)]
pub(crate) struct Cli {
    /// The command to run.
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

/// Commands understood by the host.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum CliCommand {
    /// Prints the launch command selected for a plugin source tree.
    Detect {
        /// Directory holding the plugin source.
        path: PathBuf,
    },
    /// Starts a plugin, waits until it is ready and reports its port.
    Start {
        /// Plugin name under the plugins directory.
        name: String,
    },
    /// Forwards one JSON payload to a plugin and prints the reply.
    Call {
        /// Plugin name under the plugins directory.
        name: String,
        /// JSON payload sent as the request body.
        #[arg(value_name = "JSON")]
        payload: String,
    },
    /// Starts a plugin if needed and prints the tools, resources and prompts
    /// it advertises.
    Capabilities {
        /// Plugin name under the plugins directory.
        name: String,
    },
    /// Preloads plugins and keeps them running until interrupted.
    Serve {
        /// Plugins to start before waiting.
        #[arg(value_name = "NAME")]
        names: Vec<String>,
    },
}
