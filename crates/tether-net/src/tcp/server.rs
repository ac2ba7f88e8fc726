//! TCP server facade: accepts clients, assigns ids, relays messages.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::session::{self, SessionHandle};
use crate::error::StartError;
use crate::handler::ServerHandler;
use crate::lock;
use crate::message::{Message, MessageId, TaggedMessage, UserId, FIRST_CLIENT_ID};
use crate::queue::TsDeque;

type Registry<T> = Mutex<HashMap<UserId, SessionHandle<T>>>;

/// Multi-client TCP server.
///
/// Owns one I/O worker thread driving a current-thread tokio runtime; the
/// accept loop and every session task run there. Application code interacts
/// through [`message_client`](Self::message_client),
/// [`message_all_clients`](Self::message_all_clients) and
/// [`update`](Self::update), with lifecycle callbacks delivered through the
/// injected [`ServerHandler`].
pub struct Server<T: MessageId, H: ServerHandler<T>> {
    port: u16,
    handler: Arc<H>,
    incoming: Arc<TsDeque<TaggedMessage<T>>>,
    sessions: Arc<Registry<T>>,
    /// Next id to hand out; monotonic across restarts so ids are never
    /// reused within this server's lifetime.
    next_id: Arc<AtomicI32>,
    worker: Option<Worker>,
}

struct Worker {
    thread: thread::JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl<T: MessageId, H: ServerHandler<T>> Server<T, H> {
    /// Create a server that will listen on `port` (0 picks an ephemeral
    /// port). Nothing happens until [`start`](Self::start).
    pub fn new(port: u16, handler: Arc<H>) -> Self {
        Self {
            port,
            handler,
            incoming: Arc::new(TsDeque::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicI32::new(FIRST_CLIENT_ID)),
            worker: None,
        }
    }

    /// Bind the listener and start accepting clients on the I/O worker.
    ///
    /// Returns `false` if the server is already running or the port cannot
    /// be bound; [`try_start`](Self::try_start) reports the same failures as
    /// typed errors.
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

    /// Typed form of [`start`](Self::start). The accept loop is queued on
    /// the runtime before the worker thread starts, so the worker always has
    /// work.
    pub fn try_start(&mut self) -> Result<(), StartError> {
        if self.worker.is_some() {
            return Err(StartError::AlreadyRunning);
        }

        let port = self.port;
        let bind_err = |source| StartError::Bind { port, source };

        let listener =
            StdTcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(StartError::Worker)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handler = Arc::clone(&self.handler);
        let incoming = Arc::clone(&self.incoming);
        let sessions = Arc::clone(&self.sessions);
        let next_id = Arc::clone(&self.next_id);

        let thread = thread::Builder::new()
            .name("tether-tcp-server".into())
            .spawn(move || {
                runtime.block_on(accept_loop(
                    listener,
                    handler,
                    incoming,
                    sessions,
                    next_id,
                    shutdown_rx,
                ));
            })
            .map_err(StartError::Worker)?;

        self.worker = Some(Worker {
            thread,
            shutdown: shutdown_tx,
            local_addr,
        });
        info!("server started on {local_addr}");
        Ok(())
    }

    /// Stop accepting, close all live sessions, and join the worker thread.
    /// The server can be started again afterwards.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.shutdown.send(true);
        if worker.thread.join().is_err() {
            error!("I/O worker panicked during shutdown");
        }

        // Dropping the runtime cancelled every session task and closed the
        // sockets; reflect that in the registry.
        for (_, handle) in lock(&self.sessions).drain() {
            handle.mark_closed();
        }
        info!("server stopped");
    }

    /// Address the listener is bound to, once running. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker.as_ref().map(|w| w.local_addr)
    }

    /// Whether the accept loop is currently running.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Number of sessions currently held in the registry (live or not yet
    /// observed dead).
    pub fn client_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Send a message to one client.
    ///
    /// A dead session is removed here and `on_disconnect` fires exactly
    /// once; this observation is the only disconnect path for the stream
    /// transport.
    pub fn message_client(&self, id: UserId, msg: Message<T>) {
        let mut sessions = lock(&self.sessions);
        let alive = match sessions.get(&id) {
            Some(handle) if handle.is_connected() => {
                handle.send(msg);
                true
            }
            Some(_) => false,
            None => return,
        };

        if !alive {
            if let Some(handle) = sessions.remove(&id) {
                info!("[{id}] client disconnected ({})", handle.addr());
            }
            drop(sessions);
            self.handler.on_disconnect(id);
        }
    }

    /// Send a copy of `msg` to every connected client except `ignore_id`.
    ///
    /// Dead sessions observed along the way are collected, removed, and each
    /// reported through `on_disconnect` after the sweep.
    pub fn message_all_clients(&self, msg: Message<T>, ignore_id: UserId) {
        let mut dead = Vec::new();
        {
            let sessions = lock(&self.sessions);
            for (&id, handle) in sessions.iter() {
                if id == ignore_id {
                    continue;
                }
                if handle.is_connected() {
                    handle.send(msg.clone());
                } else {
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut sessions = lock(&self.sessions);
            for id in &dead {
                if let Some(handle) = sessions.remove(id) {
                    info!("[{id}] client disconnected ({})", handle.addr());
                }
            }
            drop(sessions);
            for id in dead {
                self.handler.on_disconnect(id);
            }
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

/// Accept clients until shutdown. Every accepted socket passes the
/// application's `on_connect` gate before an id is assigned; the loop re-arms
/// on every outcome, including accept errors.
async fn accept_loop<T: MessageId, H: ServerHandler<T>>(
    listener: StdTcpListener,
    handler: Arc<H>,
    incoming: Arc<TsDeque<TaggedMessage<T>>>,
    sessions: Arc<Registry<T>>,
    next_id: Arc<AtomicI32>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to register listener with the runtime: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);

                    if !handler.on_connect(peer.ip()) {
                        info!("connection from {peer} denied");
                        continue;
                    }

                    let id = next_id.fetch_add(1, Ordering::SeqCst);
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    let open = Arc::new(AtomicBool::new(true));

                    lock(&sessions).insert(id, SessionHandle::new(peer, out_tx, Arc::clone(&open)));
                    info!("[{id}] connection approved from {peer}");

                    tokio::spawn(session::run_server_session(
                        stream,
                        id,
                        Arc::clone(&handler),
                        Arc::clone(&incoming),
                        out_rx,
                        open,
                    ));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
