//! CLI command handlers.

use clap::Subcommand;

pub mod config_check;
pub mod diagnostics;
pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Run diagnostics and display system/Docker connectivity information
    Diagnostics,
    /// Load and validate a config file without starting the server
    ConfigCheck,
}
