//! Chat demo server: echoes pings and relays chat lines between clients.
//!
//! Runs the TCP facade by default; pass `--datagrams true` (or set it in
//! `config.ron`) for the UDP flavour.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use tether_config::{CliArgs, Config};
use tether_demo::{ChatServer, DemoAction};
use tether_net::{tcp, udp};

fn main() {
    let args = CliArgs::parse();
    let config_dir = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("./config"));

    let mut config = Config::load_or_create(&config_dir).unwrap_or_default();
    config.apply_cli_overrides(&args);
    tether_log::init_logging(Some(&config.log.level));

    let handler = Arc::new(ChatServer::default());
    let batch = match config.network.update_batch {
        0 => usize::MAX,
        n => n as usize,
    };

    if config.network.use_datagrams {
        let mut server = udp::Server::with_timeout(
            config.network.server_port,
            Duration::from_millis(config.network.timeout_ms),
            Arc::clone(&handler),
        );
        if !server.start() {
            std::process::exit(1);
        }
        loop {
            server.update(batch, true);
            for action in handler.drain_actions() {
                match action {
                    DemoAction::Reply(id, msg) => server.message_client(id, msg),
                    DemoAction::Broadcast(from, msg) => server.message_all_clients(msg, from),
                }
            }
        }
    } else {
        let mut server = tcp::Server::new(config.network.server_port, Arc::clone(&handler));
        if !server.start() {
            std::process::exit(1);
        }
        loop {
            server.update(batch, true);
            for action in handler.drain_actions() {
                match action {
                    DemoAction::Reply(id, msg) => server.message_client(id, msg),
                    DemoAction::Broadcast(from, msg) => server.message_all_clients(msg, from),
                }
            }
        }
    }
}
