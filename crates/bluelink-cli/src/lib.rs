//! bluelink CLI library
//!
//! The pieces behind the `bluelink` binary: argument parsing, layered
//! configuration, platform selection and the command handlers.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod platform;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::CliAppConfig;
pub use error::{CliError, Result};
