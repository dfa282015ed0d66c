//! Configuration loading: a TOML file with an environment-variable overlay.

mod config;

pub use config::*;
