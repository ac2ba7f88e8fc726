//! Command-line argument parsing for tether applications.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Common command-line arguments for tether binaries.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(about = "tether messaging")]
pub struct CliArgs {
    /// Server address.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Use the datagram (UDP) transport.
    #[arg(long)]
    pub datagrams: Option<bool>,

    /// Peer liveness timeout in milliseconds (datagram transport).
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to the config directory (overrides the default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(datagrams) = args.datagrams {
            self.network.use_datagrams = datagrams;
        }
        if let Some(timeout) = args.timeout_ms {
            self.network.timeout_ms = timeout;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            server: Some("192.168.1.1".to_string()),
            port: Some(9000),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.server_address, "192.168.1.1");
        assert_eq!(config.network.server_port, 9000);
        // Non-overridden fields retain defaults.
        assert_eq!(config.network.timeout_ms, 5_000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }
}
