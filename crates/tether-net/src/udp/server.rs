//! UDP server facade: one socket, many peers, timeout-based liveness.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{CONNECTION_REQUEST_MAGIC, DEFAULT_TIMEOUT_MS};
use crate::error::StartError;
use crate::framing::{self, MAX_DATAGRAM_LEN, MAX_MESSAGE_SIZE};
use crate::handler::ServerHandler;
use crate::lock;
use crate::message::{Message, MessageId, TaggedMessage, UserId, FIRST_CLIENT_ID};
use crate::queue::TsDeque;
use crate::scramble::{clock_seed, scramble};

/// Per-peer state tracked by the server.
struct Peer {
    endpoint: SocketAddr,
    /// When the last datagram from this peer arrived; drives the timeout.
    last_message_at: Instant,
    /// Whether the scramble handshake has completed.
    validated: bool,
    /// The response that completes the handshake.
    expected: u64,
}

/// Both peer maps plus the id counter, mutated only by the I/O worker's
/// tasks. The counter lives here so ids stay monotonic across stop/start.
struct Registry {
    endpoint_to_id: HashMap<SocketAddr, UserId>,
    id_to_peer: HashMap<UserId, Peer>,
    next_id: UserId,
}

impl Registry {
    fn new() -> Self {
        Self {
            endpoint_to_id: HashMap::new(),
            id_to_peer: HashMap::new(),
            next_id: FIRST_CLIENT_ID,
        }
    }

    fn remove(&mut self, id: UserId) {
        if let Some(peer) = self.id_to_peer.remove(&id) {
            self.endpoint_to_id.remove(&peer.endpoint);
        }
    }
}

/// Multi-peer UDP server.
///
/// A single bound socket receives all traffic. Unknown endpoints must present
/// the connection-request magic and pass the scramble handshake before their
/// datagrams reach the inbound queue. Peers that stay silent longer than the
/// timeout are dropped and reported through `on_disconnect`.
pub struct Server<T: MessageId, H: ServerHandler<T>> {
    port: u16,
    timeout: Duration,
    handler: Arc<H>,
    incoming: Arc<TsDeque<TaggedMessage<T>>>,
    registry: Arc<Mutex<Registry>>,
    worker: Option<Worker<T>>,
}

struct Worker<T: MessageId> {
    thread: thread::JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    out_tx: mpsc::UnboundedSender<(UserId, Message<T>)>,
    local_addr: SocketAddr,
}

impl<T: MessageId, H: ServerHandler<T>> Server<T, H> {
    /// Create a server for `port` with the default 5-second peer timeout.
    pub fn new(port: u16, handler: Arc<H>) -> Self {
        Self::with_timeout(port, Duration::from_millis(DEFAULT_TIMEOUT_MS), handler)
    }

    /// Create a server for `port` with an explicit peer timeout.
    pub fn with_timeout(port: u16, timeout: Duration, handler: Arc<H>) -> Self {
        Self {
            port,
            timeout,
            handler,
            incoming: Arc::new(TsDeque::new()),
            registry: Arc::new(Mutex::new(Registry::new())),
            worker: None,
        }
    }

    /// Bind the socket and start the receive and send pipelines on the I/O
    /// worker. Returns `false` when already running or the bind fails;
    /// [`try_start`](Self::try_start) reports the same failures as typed
    /// errors.
    pub fn start(&mut self) -> bool {
        match self.try_start() {
            Ok(()) => true,
            Err(StartError::AlreadyRunning) => {
                warn!("server already running");
                false
            }
            Err(e) => {
                error!("{e}");
                false
            }
        }
    }

    /// Typed form of [`start`](Self::start).
    pub fn try_start(&mut self) -> Result<(), StartError> {
        if self.worker.is_some() {
            return Err(StartError::AlreadyRunning);
        }

        let port = self.port;
        let bind_err = |source| StartError::Bind { port, source };

        let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = socket.local_addr().map_err(bind_err)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(StartError::Worker)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handler = Arc::clone(&self.handler);
        let incoming = Arc::clone(&self.incoming);
        let registry = Arc::clone(&self.registry);
        let timeout = self.timeout;

        let thread = thread::Builder::new()
            .name("tether-udp-server".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let socket = match UdpSocket::from_std(socket) {
                        Ok(socket) => Arc::new(socket),
                        Err(e) => {
                            error!("failed to register socket with the runtime: {e}");
                            return;
                        }
                    };
                    tokio::select! {
                        _ = recv_loop(
                            Arc::clone(&socket),
                            Arc::clone(&registry),
                            Arc::clone(&handler),
                            incoming,
                            timeout,
                            shutdown_rx,
                        ) => {}
                        _ = send_loop(socket, registry, handler, out_rx, timeout) => {}
                    }
                });
            })
            .map_err(StartError::Worker)?;

        self.worker = Some(Worker {
            thread,
            shutdown: shutdown_tx,
            out_tx,
            local_addr,
        });
        info!("server started on {local_addr}");
        Ok(())
    }

    /// Stop the pipelines and join the worker thread. Peer state survives a
    /// restart; stale peers age out through the normal timeout path.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.shutdown.send(true);
        if worker.thread.join().is_err() {
            error!("I/O worker panicked during shutdown");
        }
        info!("server stopped");
    }

    /// Address the socket is bound to, once running. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker.as_ref().map(|w| w.local_addr)
    }

    /// Whether the receive pipeline is currently running.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Number of peers currently in the registry.
    pub fn client_count(&self) -> usize {
        lock(&self.registry).id_to_peer.len()
    }

    /// Queue a message for one peer. An oversize body is a programmer error:
    /// it asserts in debug builds and is rejected before anything is posted
    /// in release. Messages for departed peers are purged by the send
    /// pipeline; disconnects surface through the timeout path, not here.
    pub fn message_client(&self, id: UserId, msg: Message<T>) {
        debug_assert!(
            msg.body_len() <= MAX_MESSAGE_SIZE as usize,
            "message body of {} bytes exceeds MAX_MESSAGE_SIZE ({})",
            msg.body_len(),
            MAX_MESSAGE_SIZE
        );
        if msg.body_len() > MAX_MESSAGE_SIZE as usize {
            warn!(
                "[{id}] dropping message with a {}-byte body (max {})",
                msg.body_len(),
                MAX_MESSAGE_SIZE
            );
            return;
        }
        if let Some(worker) = self.worker.as_ref() {
            let _ = worker.out_tx.send((id, msg));
        }
    }

    /// Queue a copy of `msg` for every known peer except `ignore_id`. As in
    /// [`message_client`](Self::message_client), an oversize body asserts in
    /// debug builds and is dropped in release.
    pub fn message_all_clients(&self, msg: Message<T>, ignore_id: UserId) {
        debug_assert!(
            msg.body_len() <= MAX_MESSAGE_SIZE as usize,
            "broadcast body of {} bytes exceeds MAX_MESSAGE_SIZE ({})",
            msg.body_len(),
            MAX_MESSAGE_SIZE
        );
        if msg.body_len() > MAX_MESSAGE_SIZE as usize {
            warn!(
                "dropping broadcast with a {}-byte body (max {})",
                msg.body_len(),
                MAX_MESSAGE_SIZE
            );
            return;
        }
        let Some(worker) = self.worker.as_ref() else {
            return;
        };
        let ids: Vec<UserId> = lock(&self.registry)
            .id_to_peer
            .keys()
            .copied()
            .filter(|&id| id != ignore_id)
            .collect();
        for id in ids {
            let _ = worker.out_tx.send((id, msg.clone()));
        }
    }

    /// Drain up to `max_messages` from the inbound queue, dispatching each
    /// through `on_message` in arrival order. With `wait`, blocks until at
    /// least one message is queued. Returns the number dispatched.
    pub fn update(&self, max_messages: usize, wait: bool) -> usize {
        if wait {
            self.incoming.wait();
        }

        let mut processed = 0;
        while processed < max_messages {
            let Some(tagged) = self.incoming.pop_front() else {
                break;
            };
            self.handler.on_message(tagged.remote, tagged.msg);
            processed += 1;
        }
        processed
    }

    /// The shared inbound queue, exposed for direct draining.
    pub fn incoming(&self) -> &TsDeque<TaggedMessage<T>> {
        &self.incoming
    }
}

impl<T: MessageId, H: ServerHandler<T>> Drop for Server<T, H> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Receive datagrams until shutdown. Each packet first drives the timeout
/// sweep, then dispatches on the sender's state: unknown endpoints may only
/// request a connection, known-but-unvalidated peers may only answer the
/// handshake, validated peers deliver messages.
async fn recv_loop<T: MessageId, H: ServerHandler<T>>(
    socket: Arc<UdpSocket>,
    registry: Arc<Mutex<Registry>>,
    handler: Arc<H>,
    incoming: Arc<TsDeque<TaggedMessage<T>>>,
    timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => {
                    for id in cleanup_timeouts(&registry, timeout) {
                        handler.on_disconnect(id);
                    }

                    let data = &buf[..len];
                    let known = lock(&registry).endpoint_to_id.get(&from).copied();
                    match known {
                        None => {
                            handle_new_connection(&socket, &registry, &*handler, from, data).await;
                        }
                        Some(id) => {
                            let validated = lock(&registry)
                                .id_to_peer
                                .get(&id)
                                .map(|peer| peer.validated)
                                .unwrap_or(false);
                            if validated {
                                process_message(&registry, &incoming, id, data);
                            } else {
                                handle_validation(&registry, &*handler, id, data);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("receive failed: {e}");
                }
            },
            _ = wait_shutdown(&mut shutdown_rx) => break,
        }
    }
}

/// Drain the outbound queue one datagram at a time. Entries whose peer has
/// left the registry are purged instead of sent.
async fn send_loop<T: MessageId, H: ServerHandler<T>>(
    socket: Arc<UdpSocket>,
    registry: Arc<Mutex<Registry>>,
    handler: Arc<H>,
    mut out_rx: mpsc::UnboundedReceiver<(UserId, Message<T>)>,
    timeout: Duration,
) {
    while let Some((id, msg)) = out_rx.recv().await {
        for expired in cleanup_timeouts(&registry, timeout) {
            handler.on_disconnect(expired);
        }

        let endpoint = lock(&registry).id_to_peer.get(&id).map(|peer| peer.endpoint);
        let Some(endpoint) = endpoint else {
            debug!("[{id}] dropping message for departed client");
            continue;
        };

        let datagram = framing::encode_datagram(&msg);
        if let Err(e) = socket.send_to(&datagram, endpoint).await {
            warn!("[{id}] send failed: {e}");
        }
    }
}

/// A datagram from an endpoint with no assigned id: accept only an exact
/// 8-byte connection-request magic, gate it through `on_connect`, then record
/// the peer and issue the handshake challenge.
async fn handle_new_connection<T: MessageId, H: ServerHandler<T>>(
    socket: &UdpSocket,
    registry: &Mutex<Registry>,
    handler: &H,
    from: SocketAddr,
    data: &[u8],
) {
    if data.len() != 8 {
        return;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(data);
    if u64::from_be_bytes(raw) != CONNECTION_REQUEST_MAGIC {
        return;
    }

    if !handler.on_connect(from.ip()) {
        info!("connection from {from} denied");
        return;
    }

    let challenge = scramble(clock_seed());
    let expected = scramble(challenge);

    let id = {
        let mut reg = lock(registry);
        let id = reg.next_id;
        reg.next_id += 1;
        reg.endpoint_to_id.insert(from, id);
        reg.id_to_peer.insert(
            id,
            Peer {
                endpoint: from,
                last_message_at: Instant::now(),
                validated: false,
                expected,
            },
        );
        id
    };
    info!("[{id}] connection approved from {from}");

    if let Err(e) = socket.send_to(&challenge.to_be_bytes(), from).await {
        warn!("[{id}] failed to send handshake challenge: {e}");
    }
}

/// A datagram from a known but unvalidated peer: it must be exactly the
/// 8-byte scrambled response, otherwise the peer is dropped silently.
fn handle_validation<T: MessageId, H: ServerHandler<T>>(
    registry: &Mutex<Registry>,
    handler: &H,
    id: UserId,
    data: &[u8],
) {
    if data.len() != 8 {
        warn!("[{id}] handshake failed");
        lock(registry).remove(id);
        return;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(data);
    let response = u64::from_be_bytes(raw);

    let valid = lock(registry)
        .id_to_peer
        .get(&id)
        .map(|peer| peer.expected == response)
        .unwrap_or(false);
    if !valid {
        warn!("[{id}] handshake failed");
        lock(registry).remove(id);
        return;
    }

    {
        let mut reg = lock(registry);
        if let Some(peer) = reg.id_to_peer.get_mut(&id) {
            peer.validated = true;
            peer.last_message_at = Instant::now();
        }
    }
    info!("[{id}] client validated");
    handler.on_validate(id);
}

/// A datagram from a validated peer: parse it as one complete message and
/// queue it. Malformed packets are ignored without dropping the peer.
fn process_message<T: MessageId>(
    registry: &Mutex<Registry>,
    incoming: &TsDeque<TaggedMessage<T>>,
    id: UserId,
    data: &[u8],
) {
    let Some(msg) = framing::decode_datagram::<T>(data) else {
        return;
    };
    if let Some(peer) = lock(registry).id_to_peer.get_mut(&id) {
        peer.last_message_at = Instant::now();
    }
    incoming.push_back(TaggedMessage { remote: id, msg });
}

/// Remove every peer whose last datagram is older than `timeout` and return
/// their ids. Callers fire `on_disconnect` once per returned id, outside the
/// registry lock.
fn cleanup_timeouts(registry: &Mutex<Registry>, timeout: Duration) -> Vec<UserId> {
    let mut reg = lock(registry);
    let now = Instant::now();
    let expired: Vec<UserId> = reg
        .id_to_peer
        .iter()
        .filter(|(_, peer)| now.duration_since(peer.last_message_at) > timeout)
        .map(|(&id, _)| id)
        .collect();

    for &id in &expired {
        warn!("[{id}] client timed out");
        reg.remove(id);
    }
    expired
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
