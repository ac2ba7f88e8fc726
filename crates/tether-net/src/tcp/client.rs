//! TCP client facade: one session against a server.

use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, trace, warn};

use super::session;
use crate::error::ConnectError;
use crate::framing::MAX_MESSAGE_SIZE;
use crate::message::{Message, MessageId, TaggedMessage};
use crate::queue::TsDeque;

/// Single-connection TCP client.
///
/// [`connect`](Self::connect) resolves the host, establishes the connection,
/// and spawns an I/O worker that completes the handshake and relays messages.
/// Incoming messages accumulate in [`incoming`](Self::incoming) for the
/// application to drain.
pub struct Client<T: MessageId> {
    incoming: Arc<TsDeque<TaggedMessage<T>>>,
    link: Option<Link<T>>,
}

struct Link<T: MessageId> {
    thread: thread::JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    out_tx: mpsc::UnboundedSender<Message<T>>,
    open: Arc<AtomicBool>,
}

impl<T: MessageId> Client<T> {
    /// Create a disconnected client.
    pub fn new() -> Self {
        Self {
            incoming: Arc::new(TsDeque::new()),
            link: None,
        }
    }

    /// Connect to the server at `host:port`.
    ///
    /// Resolution and the TCP connect happen synchronously and report
    /// failure as `false`; [`try_connect`](Self::try_connect) reports the
    /// same failures as typed errors. The scramble handshake completes
    /// asynchronously on the I/O worker.
    pub fn connect(&mut self, host: &str, port: u16) -> bool {
        match self.try_connect(host, port) {
            Ok(()) => true,
            Err(e) => {
                error!("{e}");
                false
            }
        }
    }

    /// Typed form of [`connect`](Self::connect). An existing connection is
    /// torn down first.
    pub fn try_connect(&mut self, host: &str, port: u16) -> Result<(), ConnectError> {
        if self.link.is_some() {
            self.disconnect();
        }

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|source| ConnectError::Resolve {
                host: host.to_string(),
                port,
                source,
            })?
            .next()
            .ok_or_else(|| ConnectError::NoAddress {
                host: host.to_string(),
                port,
            })?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ConnectError::Worker)?;

        let stream = runtime
            .block_on(TcpStream::connect(addr))
            .map_err(|source| ConnectError::Connect { addr, source })?;
        let _ = stream.set_nodelay(true);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let incoming = Arc::clone(&self.incoming);
        let open_for_worker = Arc::clone(&open);

        let thread = thread::Builder::new()
            .name("tether-tcp-client".into())
            .spawn(move || {
                runtime.block_on(session::run_client_session(
                    stream,
                    incoming,
                    out_rx,
                    open_for_worker,
                    shutdown_rx,
                ));
            })
            .map_err(ConnectError::Worker)?;

        self.link = Some(Link {
            thread,
            shutdown: shutdown_tx,
            out_tx,
            open,
        });
        info!("connecting to {addr}");
        Ok(())
    }

    /// Tear down the connection and join the I/O worker. Idempotent.
    pub fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let _ = link.shutdown.send(true);
        if link.thread.join().is_err() {
            error!("I/O worker panicked during shutdown");
        }
        link.open.store(false, Ordering::SeqCst);
        info!("client disconnected");
    }

    /// Whether the underlying socket is believed open.
    pub fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .map(|link| link.open.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Send a message to the server. Silently dropped when not connected;
    /// oversize messages are dropped with a warning.
    pub fn send(&self, msg: Message<T>) {
        let Some(link) = self.link.as_ref() else {
            trace!("send while disconnected, dropping message");
            return;
        };
        if !link.open.load(Ordering::SeqCst) {
            trace!("send on a closed session, dropping message");
            return;
        }
        if msg.body_len() > MAX_MESSAGE_SIZE as usize {
            warn!(
                "dropping message with a {}-byte body (max {})",
                msg.body_len(),
                MAX_MESSAGE_SIZE
            );
            return;
        }
        if link.out_tx.send(msg).is_err() {
            link.open.store(false, Ordering::SeqCst);
        }
    }

    /// The inbound queue of messages from the server.
    pub fn incoming(&self) -> &TsDeque<TaggedMessage<T>> {
        &self.incoming
    }
}

impl<T: MessageId> Default for Client<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MessageId> Drop for Client<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
