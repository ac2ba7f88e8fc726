//! Per-peer session over a reliable byte stream.
//!
//! A session runs as one task on its facade's single-threaded runtime:
//! handshake first, then a reader loop and a writer loop raced against each
//! other. The reader deposits tagged messages into the shared inbound queue;
//! the writer drains the session's outbound channel. When either side fails
//! the whole task ends, the socket drops, and the `open` flag goes false —
//! the closed state is terminal and observable by the facade.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::framing::{self, FrameError, MAX_MESSAGE_SIZE};
use crate::handler::ServerHandler;
use crate::message::{Message, MessageId, TaggedMessage, UserId, SERVER_USER_ID};
use crate::queue::TsDeque;
use crate::scramble::{clock_seed, scramble};

/// The facade's view of a live session: where to enqueue outbound messages
/// and whether the underlying socket is still open.
pub(crate) struct SessionHandle<T: MessageId> {
    addr: SocketAddr,
    out_tx: mpsc::UnboundedSender<Message<T>>,
    open: Arc<AtomicBool>,
}

impl<T: MessageId> SessionHandle<T> {
    pub(crate) fn new(
        addr: SocketAddr,
        out_tx: mpsc::UnboundedSender<Message<T>>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self { addr, out_tx, open }
    }

    /// Peer address this session talks to.
    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the session's socket is believed open.
    pub(crate) fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Force the closed state (used when the facade tears everything down).
    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Enqueue a message for the writer loop. Oversize messages are dropped
    /// with a warning; a failed enqueue means the session task is gone.
    pub(crate) fn send(&self, msg: Message<T>) {
        if msg.body_len() > MAX_MESSAGE_SIZE as usize {
            warn!(
                "dropping message with a {}-byte body (max {})",
                msg.body_len(),
                MAX_MESSAGE_SIZE
            );
            return;
        }
        if self.out_tx.send(msg).is_err() {
            self.open.store(false, Ordering::SeqCst);
        }
    }
}

/// Issue the challenge and check the response. Returns `Ok(true)` on a valid
/// handshake, `Ok(false)` when the peer answered with the wrong bytes.
async fn server_handshake<S>(stream: &mut S) -> Result<bool, std::io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let challenge = scramble(clock_seed());
    let expected = scramble(challenge);

    stream.write_all(&challenge.to_be_bytes()).await?;
    stream.flush().await?;

    let mut response = [0u8; 8];
    stream.read_exact(&mut response).await?;
    Ok(u64::from_be_bytes(response) == expected)
}

/// Receive the challenge and answer with its scramble.
async fn client_handshake<S>(stream: &mut S) -> Result<(), std::io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; 8];
    stream.read_exact(&mut challenge).await?;

    let response = scramble(u64::from_be_bytes(challenge));
    stream.write_all(&response.to_be_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Drive a server-side session to completion: validate the peer, then relay
/// messages until the socket dies. The session never removes itself from the
/// facade's registry; the facade observes the dead socket on its next send.
pub(crate) async fn run_server_session<S, T, H>(
    mut stream: S,
    id: UserId,
    handler: Arc<H>,
    incoming: Arc<TsDeque<TaggedMessage<T>>>,
    out_rx: mpsc::UnboundedReceiver<Message<T>>,
    open: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    T: MessageId,
    H: ServerHandler<T>,
{
    match server_handshake(&mut stream).await {
        Ok(true) => {}
        Ok(false) => {
            warn!("[{id}] handshake failed, closing");
            open.store(false, Ordering::SeqCst);
            return;
        }
        Err(e) => {
            warn!("[{id}] handshake error: {e}");
            open.store(false, Ordering::SeqCst);
            return;
        }
    }

    info!("[{id}] client validated");
    handler.on_validate(id);

    let (reader, writer) = tokio::io::split(stream);
    tokio::select! {
        _ = read_loop(reader, id, Arc::clone(&incoming)) => {}
        _ = write_loop(writer, out_rx) => {}
    }

    open.store(false, Ordering::SeqCst);
    debug!("[{id}] session closed");
}

/// Drive a client-side session: answer the server's challenge, then relay
/// until the socket dies or a disconnect is requested.
pub(crate) async fn run_client_session<S, T>(
    mut stream: S,
    incoming: Arc<TsDeque<TaggedMessage<T>>>,
    out_rx: mpsc::UnboundedReceiver<Message<T>>,
    open: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    T: MessageId,
{
    // The handshake can stall indefinitely against an unresponsive server, so
    // it must also honor the disconnect signal.
    tokio::select! {
        result = client_handshake(&mut stream) => match result {
            Ok(()) => {}
            Err(e) => {
                warn!("handshake error: {e}");
                open.store(false, Ordering::SeqCst);
                return;
            }
        },
        _ = wait_shutdown(shutdown_rx.clone()) => {
            open.store(false, Ordering::SeqCst);
            return;
        }
    }

    info!("connected to server");

    let (reader, writer) = tokio::io::split(stream);
    tokio::select! {
        _ = read_loop(reader, SERVER_USER_ID, Arc::clone(&incoming)) => {}
        _ = write_loop(writer, out_rx) => {}
        _ = wait_shutdown(shutdown_rx) => {}
    }

    open.store(false, Ordering::SeqCst);
    debug!("session closed");
}

/// Read messages until the peer hangs up or errors, tagging each with the
/// remote id and pushing it onto the shared inbound queue.
async fn read_loop<S, T>(
    mut reader: ReadHalf<S>,
    remote: UserId,
    incoming: Arc<TsDeque<TaggedMessage<T>>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    T: MessageId,
{
    loop {
        match framing::read_message::<T, _>(&mut reader, MAX_MESSAGE_SIZE).await {
            Ok(msg) => incoming.push_back(TaggedMessage { remote, msg }),
            Err(FrameError::Closed) => {
                debug!("[{remote}] peer closed the stream");
                break;
            }
            Err(e) => {
                warn!("[{remote}] read failed: {e}");
                break;
            }
        }
    }
}

/// Write queued messages in arrival order until the channel closes or a
/// write fails. The single persistent writer per session is what serializes
/// concurrent senders: the channel's FIFO order is the wire order.
async fn write_loop<S, T>(mut writer: WriteHalf<S>, mut out_rx: mpsc::UnboundedReceiver<Message<T>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: MessageId,
{
    while let Some(msg) = out_rx.recv().await {
        if let Err(e) = framing::write_message(&mut writer, &msg).await {
            warn!("write failed: {e}");
            break;
        }
    }
}

async fn wait_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::duplex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestMsg {
        Ping,
        Other,
    }

    impl MessageId for TestMsg {
        fn to_raw(self) -> u32 {
            match self {
                TestMsg::Ping => 0,
                TestMsg::Other => u32::MAX,
            }
        }

        fn from_raw(raw: u32) -> Self {
            match raw {
                0 => TestMsg::Ping,
                _ => TestMsg::Other,
            }
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        validated: AtomicUsize,
    }

    impl ServerHandler<TestMsg> for CountingHandler {
        fn on_connect(&self, _address: IpAddr) -> bool {
            true
        }
        fn on_validate(&self, _id: UserId) {
            self.validated.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnect(&self, _id: UserId) {}
        fn on_message(&self, _id: UserId, _msg: Message<TestMsg>) {}
    }

    #[tokio::test]
    async fn test_handshake_pair_validates() {
        let (mut server_side, mut client_side) = duplex(256);

        let server = tokio::spawn(async move { server_handshake(&mut server_side).await });
        let client = tokio::spawn(async move { client_handshake(&mut client_side).await });

        assert!(server.await.unwrap().unwrap(), "correct response must validate");
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wrong_response_fails_validation() {
        let (mut server_side, mut client_side) = duplex(256);

        let server = tokio::spawn(async move { server_handshake(&mut server_side).await });

        // Read the challenge but echo it back unscrambled.
        let mut challenge = [0u8; 8];
        client_side.read_exact(&mut challenge).await.unwrap();
        client_side.write_all(&challenge).await.unwrap();

        assert!(
            !server.await.unwrap().unwrap(),
            "echoed challenge must fail validation"
        );
    }

    #[tokio::test]
    async fn test_failed_handshake_never_validates_session() {
        let (server_side, mut client_side) = duplex(4096);

        let handler = Arc::new(CountingHandler::default());
        let incoming = Arc::new(TsDeque::new());
        let open = Arc::new(AtomicBool::new(true));
        let (_out_tx, out_rx) = mpsc::unbounded_channel::<Message<TestMsg>>();

        let session = tokio::spawn(run_server_session(
            server_side,
            100_000,
            Arc::clone(&handler),
            Arc::clone(&incoming),
            out_rx,
            Arc::clone(&open),
        ));

        // Send 8 arbitrary bytes that are not the scrambled challenge.
        let mut challenge = [0u8; 8];
        client_side.read_exact(&mut challenge).await.unwrap();
        client_side.write_all(&[0xFF; 8]).await.unwrap();

        session.await.unwrap();
        assert_eq!(handler.validated.load(Ordering::SeqCst), 0);
        assert!(!open.load(Ordering::SeqCst), "session must end closed");
    }

    #[tokio::test]
    async fn test_validated_sessions_relay_messages_in_order() {
        let (server_side, client_side) = duplex(65_536);

        let handler = Arc::new(CountingHandler::default());
        let server_in = Arc::new(TsDeque::new());
        let client_in = Arc::new(TsDeque::new());
        let server_open = Arc::new(AtomicBool::new(true));
        let client_open = Arc::new(AtomicBool::new(true));
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_server_session(
            server_side,
            100_000,
            Arc::clone(&handler),
            Arc::clone(&server_in),
            server_rx,
            Arc::clone(&server_open),
        ));
        tokio::spawn(run_client_session(
            client_side,
            Arc::clone(&client_in),
            client_rx,
            Arc::clone(&client_open),
            shutdown_rx,
        ));

        // Client -> server burst; order must survive.
        for i in 0..20u32 {
            let mut msg = Message::new(TestMsg::Ping);
            msg.push(i);
            client_tx.send(msg).unwrap();
        }
        // Server -> client single echo.
        let mut reply = Message::new(TestMsg::Ping);
        reply.push(777u32);
        server_tx.send(reply).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while (server_in.len() < 20 || client_in.is_empty())
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(handler.validated.load(Ordering::SeqCst), 1);
        assert_eq!(server_in.len(), 20);
        for i in 0..20u32 {
            let mut tagged = server_in.pop_front().expect("message present");
            assert_eq!(tagged.remote, 100_000);
            assert_eq!(tagged.msg.pop::<u32>(), i, "messages must arrive in send order");
        }

        let mut tagged = client_in.pop_front().expect("echo present");
        assert_eq!(tagged.remote, SERVER_USER_ID);
        assert_eq!(tagged.msg.pop::<u32>(), 777);
    }

    #[tokio::test]
    async fn test_session_handle_drops_oversize_sends() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message<TestMsg>>();
        let handle = SessionHandle::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
            out_tx,
            Arc::new(AtomicBool::new(true)),
        );

        let mut oversize = Message::new(TestMsg::Ping);
        oversize.push_bytes(&vec![0u8; MAX_MESSAGE_SIZE as usize + 1]);
        handle.send(oversize);

        let mut fits = Message::new(TestMsg::Ping);
        fits.push(1u8);
        handle.send(fits);

        let queued = out_rx.recv().await.expect("in-bounds message queued");
        assert_eq!(queued.body_len(), 1, "oversize message must not be queued");
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_session() {
        let (server_side, client_side) = duplex(4096);

        let handler = Arc::new(CountingHandler::default());
        let incoming = Arc::new(TsDeque::<TaggedMessage<TestMsg>>::new());
        let open = Arc::new(AtomicBool::new(true));
        let (_out_tx, out_rx) = mpsc::unbounded_channel();

        let session = tokio::spawn(run_server_session(
            server_side,
            100_000,
            Arc::clone(&handler),
            Arc::clone(&incoming),
            out_rx,
            Arc::clone(&open),
        ));

        // Complete the handshake legitimately, then hang up.
        let mut client_side = client_side;
        client_handshake(&mut client_side).await.unwrap();
        drop(client_side);

        session.await.unwrap();
        assert!(!open.load(Ordering::SeqCst));
        assert_eq!(handler.validated.load(Ordering::SeqCst), 1);
    }
}
