//! CLI module for aerolive
//!
//! - serve: run the engine and websocket server until Ctrl-C
//! - check-config: validate a configuration file

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{check_config, run, run_command, serve};
pub use errors::{CliError, CliErrorCode, CliResult};
