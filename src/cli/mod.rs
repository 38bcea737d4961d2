//! Command-line interface definitions for the `nodeprep` binary.
//!
//! The clap parser structures live here so both the binary and the build
//! script can use them; the build script renders the manual page from them.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `nodeprep` binary.
#[derive(Debug, Parser)]
#[command(
    name = "nodeprep",
    about = "Check and prepare this host for a local single-node virtual cluster",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log verbosity: error, warn, info, debug, or trace.
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    pub(crate) log_level: String,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `nodeprep`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Verify host preconditions without changing anything.
    #[command(name = "preflight")]
    Preflight(RunArgs),
    /// Verify host preconditions and fix the ones that can be fixed.
    #[command(name = "setup")]
    Setup(RunArgs),
    /// Undo host changes made by setup.
    #[command(name = "cleanup")]
    Cleanup(RunArgs),
    /// Read and write persisted settings such as `skip-<check>`.
    #[command(name = "config", subcommand)]
    Config(ConfigCommand),
}

/// Arguments shared by the check-running subcommands.
#[derive(Debug, Args)]
pub(crate) struct RunArgs {
    /// Override the configured network mode (`system` or `user`).
    #[arg(long, value_name = "MODE")]
    pub(crate) network_mode: Option<String>,
    /// Report format written to stdout.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub(crate) output: OutputFormat,
}

/// Report format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum OutputFormat {
    /// One line per check.
    Text,
    /// A JSON array of check records.
    Json,
}

/// `nodeprep config` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum ConfigCommand {
    /// Persist a setting.
    Set {
        /// Setting name, for example `skip-check-vsock`.
        key: String,
        /// Value: `true`/`false`, an integer, or a string.
        value: String,
    },
    /// Print the effective value of a setting.
    Get {
        /// Setting name.
        key: String,
    },
    /// Remove a persisted setting.
    Unset {
        /// Setting name.
        key: String,
    },
}
