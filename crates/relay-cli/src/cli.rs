//! CLI argument definitions for relay.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// relay -- cross-sandbox service dispatch.
#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "relay -- cross-sandbox service dispatch",
    long_about = "Runs a coordinator, loads extensions into isolated in-process sandboxes, \
                  and routes calls between them by service name."
)]
pub struct Cli {
    /// Configuration file.  A missing file means built-in defaults.
    #[arg(long, short, global = true, default_value = "config/relay.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load the configured extensions, query each service, then shut down.
    Run,

    /// Load the configured extensions and call one service method from a
    /// client sandbox.
    Call {
        /// Service name, e.g. `extension.0.0`.
        service: String,

        /// Method name.
        method: String,

        /// Positional arguments.  Each is parsed as JSON; anything that is not
        /// valid JSON is passed as a string.
        args: Vec<String>,
    },

    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        /// Path to the TOML file.
        path: PathBuf,
    },

    /// List the built-in demo extension locations.
    Extensions,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn call_collects_trailing_arguments() {
        let cli = Cli::parse_from(["relay", "call", "extension.0.0", "add", "1", "2"]);
        match cli.command {
            Commands::Call {
                service,
                method,
                args,
            } => {
                assert_eq!(service, "extension.0.0");
                assert_eq!(method, "add");
                assert_eq!(args, vec!["1", "2"]);
            }
            _ => panic!("expected call"),
        }
        assert_eq!(cli.config, PathBuf::from("config/relay.toml"));
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::parse_from(["relay", "run", "--config", "other.toml"]);
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.config, PathBuf::from("other.toml"));
    }
}
