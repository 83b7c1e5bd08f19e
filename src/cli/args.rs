//! CLI argument definitions using clap
//!
//! Commands:
//! - aerolive serve --config <path>
//! - aerolive check-config --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// aerolive - access-controlled live queries over a document store
#[derive(Parser, Debug)]
#[command(name = "aerolive")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the engine and the websocket server
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./aerolive.json")]
        config: PathBuf,
    },

    /// Validate a configuration file and exit
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./aerolive.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from(["aerolive", "serve", "--config", "/etc/live.json"]).unwrap();
        match cli.command {
            Command::Serve { config } => assert_eq!(config, PathBuf::from("/etc/live.json")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_default_config_path() {
        let cli = Cli::try_parse_from(["aerolive", "check-config"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::CheckConfig { config } if config == PathBuf::from("./aerolive.json")
        ));
    }
}
