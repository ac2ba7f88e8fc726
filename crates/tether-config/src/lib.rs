//! Configuration for tether applications.
//!
//! Provides runtime-configurable settings that persist to disk as RON files,
//! with CLI overrides via clap and forward-compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, LogConfig, NetworkConfig};
pub use error::ConfigError;
