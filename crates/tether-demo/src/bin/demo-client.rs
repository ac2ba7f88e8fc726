//! Chat demo client: pings the server, sends a few chat lines, and prints
//! everything it receives for a short while.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;

use tether_config::{CliArgs, Config};
use tether_demo::DemoMsg;
use tether_net::{tcp, udp, Message, TaggedMessage, TsDeque};

fn main() {
    let args = CliArgs::parse();
    let config_dir = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("./config"));

    let mut config = Config::load_or_create(&config_dir).unwrap_or_default();
    config.apply_cli_overrides(&args);
    tether_log::init_logging(Some(&config.log.level));

    let host = config.network.server_address.clone();
    let port = config.network.server_port;

    if config.network.use_datagrams {
        let mut client =
            udp::Client::with_timeout(Duration::from_millis(config.network.timeout_ms));
        if !client.connect(&host, port) {
            std::process::exit(1);
        }
        chat_session(|msg| client.send(msg), client.incoming());
        client.disconnect();
    } else {
        let mut client = tcp::Client::new();
        if !client.connect(&host, port) {
            std::process::exit(1);
        }
        chat_session(|msg| client.send(msg), client.incoming());
        client.disconnect();
    }
}

/// Send a ping and a couple of chat lines, then print incoming traffic for a
/// few seconds.
fn chat_session(
    send: impl Fn(Message<DemoMsg>),
    incoming: &TsDeque<TaggedMessage<DemoMsg>>,
) {
    let mut ping = Message::new(DemoMsg::Ping);
    ping.push(now_nanos());
    send(ping);

    for line in ["hello from the demo client", "anyone around?"] {
        let mut chat = Message::new(DemoMsg::Chat);
        chat.push_bytes(line.as_bytes());
        send(chat);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        while let Some(tagged) = incoming.pop_front() {
            let mut msg = tagged.msg;
            match msg.kind() {
                DemoMsg::Ping => {
                    let sent: u64 = msg.pop();
                    let rtt = now_nanos().saturating_sub(sent);
                    tracing::info!("ping: {:.3} ms", rtt as f64 / 1_000_000.0);
                }
                DemoMsg::Chat => {
                    tracing::info!(
                        "[{}] {}",
                        tagged.remote,
                        String::from_utf8_lossy(msg.body())
                    );
                }
                DemoMsg::Unknown => {}
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
