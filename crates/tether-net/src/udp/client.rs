//! UDP client facade: one connected socket against a server.

use std::net::{Ipv4Addr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, trace, warn};

use super::{CONNECTION_REQUEST_MAGIC, DEFAULT_TIMEOUT_MS};
use crate::error::ConnectError;
use crate::framing::{self, MAX_DATAGRAM_LEN, MAX_MESSAGE_SIZE};
use crate::lock;
use crate::message::{Message, MessageId, TaggedMessage, SERVER_USER_ID};
use crate::queue::TsDeque;
use crate::scramble::scramble;

/// Single-server UDP client.
///
/// [`connect`](Self::connect) binds a socket, sends the connection-request
/// magic, and answers the server's scramble challenge on the I/O worker.
/// Because datagrams carry no connection state,
/// [`is_connected`](Self::is_connected) is a belief: true while the server
/// has sent something within the liveness timeout.
pub struct Client<T: MessageId> {
    timeout: Duration,
    incoming: Arc<TsDeque<TaggedMessage<T>>>,
    /// When the last data message from the server arrived. Initialized at
    /// connect so a fresh connection counts as live until the first timeout.
    last_message_at: Arc<Mutex<Instant>>,
    link: Option<Link<T>>,
}

struct Link<T: MessageId> {
    thread: thread::JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    out_tx: mpsc::UnboundedSender<Message<T>>,
    handshake_done: Arc<AtomicBool>,
}

impl<T: MessageId> Client<T> {
    /// Create a disconnected client with the default 5-second timeout.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    /// Create a disconnected client with an explicit liveness timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            incoming: Arc::new(TsDeque::new()),
            last_message_at: Arc::new(Mutex::new(Instant::now())),
            link: None,
        }
    }

    /// Connect to the server at `host:port`.
    ///
    /// Resolution and the socket setup happen synchronously and report
    /// failure as `false`; [`try_connect`](Self::try_connect) reports the
    /// same failures as typed errors. The 3-step handshake (magic,
    /// challenge, response) completes asynchronously on the I/O worker.
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

        let socket = runtime
            .block_on(async {
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
                socket.connect(addr).await?;
                Ok::<_, std::io::Error>(socket)
            })
            .map_err(|source| ConnectError::Connect { addr, source })?;

        *lock(&self.last_message_at) = Instant::now();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handshake_done = Arc::new(AtomicBool::new(false));
        let incoming = Arc::clone(&self.incoming);
        let last_message_at = Arc::clone(&self.last_message_at);
        let handshake_flag = Arc::clone(&handshake_done);

        let thread = thread::Builder::new()
            .name("tether-udp-client".into())
            .spawn(move || {
                runtime.block_on(run_client(
                    socket,
                    incoming,
                    out_rx,
                    last_message_at,
                    handshake_flag,
                    shutdown_rx,
                ));
            })
            .map_err(ConnectError::Worker)?;

        self.link = Some(Link {
            thread,
            shutdown: shutdown_tx,
            out_tx,
            handshake_done,
        });
        info!("connecting to {addr}");
        Ok(())
    }

    /// Tear down the socket and join the I/O worker. Idempotent.
    pub fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let _ = link.shutdown.send(true);
        if link.thread.join().is_err() {
            error!("I/O worker panicked during shutdown");
        }
        info!("client disconnected");
    }

    /// The client's belief about liveness: connected while the server has
    /// sent a data message within the timeout window (measured from connect
    /// for a fresh session).
    pub fn is_connected(&self) -> bool {
        self.link.is_some() && lock(&self.last_message_at).elapsed() <= self.timeout
    }

    /// Whether the scramble handshake has completed. Messages sent before
    /// then are queued and flushed once it has.
    pub fn is_validated(&self) -> bool {
        self.link
            .as_ref()
            .map(|link| link.handshake_done.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Send a message to the server. An oversize body is a programmer error:
    /// it asserts in debug builds and is rejected before anything touches the
    /// wire in release. Sends while disconnected are dropped silently.
    pub fn send(&self, msg: Message<T>) {
        debug_assert!(
            msg.body_len() <= MAX_MESSAGE_SIZE as usize,
            "message body of {} bytes exceeds MAX_MESSAGE_SIZE ({})",
            msg.body_len(),
            MAX_MESSAGE_SIZE
        );
        if msg.body_len() > MAX_MESSAGE_SIZE as usize {
            warn!(
                "dropping message with a {}-byte body (max {})",
                msg.body_len(),
                MAX_MESSAGE_SIZE
            );
            return;
        }
        if !self.is_connected() {
            trace!("send while disconnected, dropping message");
            return;
        }
        if let Some(link) = self.link.as_ref() {
            let _ = link.out_tx.send(msg);
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

/// Worker body: complete the 3-step handshake, then relay datagrams in both
/// directions until shutdown or a socket error.
async fn run_client<T: MessageId>(
    socket: UdpSocket,
    incoming: Arc<TsDeque<TaggedMessage<T>>>,
    mut out_rx: mpsc::UnboundedReceiver<Message<T>>,
    last_message_at: Arc<Mutex<Instant>>,
    handshake_done: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if let Err(e) = socket.send(&CONNECTION_REQUEST_MAGIC.to_be_bytes()).await {
        warn!("failed to send connection request: {e}");
        return;
    }

    // The challenge may never come (server down, wrong address); stay
    // responsive to disconnect while waiting.
    let mut challenge = [0u8; 8];
    tokio::select! {
        result = socket.recv(&mut challenge) => match result {
            Ok(8) => {}
            Ok(n) => {
                warn!("unexpected {n}-byte handshake reply");
                return;
            }
            Err(e) => {
                warn!("failed to receive handshake challenge: {e}");
                return;
            }
        },
        _ = wait_shutdown(&mut shutdown_rx) => return,
    }

    let response = scramble(u64::from_be_bytes(challenge));
    if let Err(e) = socket.send(&response.to_be_bytes()).await {
        warn!("failed to send handshake response: {e}");
        return;
    }
    handshake_done.store(true, Ordering::SeqCst);
    info!("connected to server");

    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        tokio::select! {
            result = socket.recv(&mut buf) => match result {
                Ok(len) => process_datagram(&buf[..len], &incoming, &last_message_at),
                Err(e) => {
                    warn!("receive failed: {e}");
                    break;
                }
            },
            outbound = out_rx.recv() => match outbound {
                Some(msg) => {
                    let datagram = framing::encode_datagram(&msg);
                    if let Err(e) = socket.send(&datagram).await {
                        warn!("send failed: {e}");
                        break;
                    }
                }
                None => break,
            },
            _ = wait_shutdown(&mut shutdown_rx) => break,
        }
    }
}

/// Parse one datagram as a complete message; malformed packets are ignored.
/// Valid messages refresh the liveness clock.
fn process_datagram<T: MessageId>(
    datagram: &[u8],
    incoming: &TsDeque<TaggedMessage<T>>,
    last_message_at: &Mutex<Instant>,
) {
    let Some(msg) = framing::decode_datagram::<T>(datagram) else {
        return;
    };
    *lock(last_message_at) = Instant::now();
    incoming.push_back(TaggedMessage {
        remote: SERVER_USER_ID,
        msg,
    });
}

async fn wait_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
}
