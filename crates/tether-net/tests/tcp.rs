//! End-to-end tests for the TCP client and server facades.

use std::io::{Read, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tether_net::tcp;
use tether_net::{
    ConnectError, Message, MessageId, ServerHandler, StartError, UserId, FIRST_CLIENT_ID,
    INVALID_USER_ID, SERVER_USER_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatMsg {
    Ping,
    Chat,
    Other,
}

impl MessageId for ChatMsg {
    fn to_raw(self) -> u32 {
        match self {
            ChatMsg::Ping => 0,
            ChatMsg::Chat => 1,
            ChatMsg::Other => u32::MAX,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => ChatMsg::Ping,
            1 => ChatMsg::Chat,
            _ => ChatMsg::Other,
        }
    }
}

/// Handler that records every callback for later assertions.
#[derive(Default)]
struct Recorder {
    connects: AtomicUsize,
    validated: Mutex<Vec<UserId>>,
    disconnects: Mutex<Vec<UserId>>,
    messages: Mutex<Vec<(UserId, ChatMsg, Vec<u8>)>>,
}

impl Recorder {
    fn validated(&self) -> Vec<UserId> {
        self.validated.lock().unwrap().clone()
    }

    fn disconnects(&self) -> Vec<UserId> {
        self.disconnects.lock().unwrap().clone()
    }

    fn messages(&self) -> Vec<(UserId, ChatMsg, Vec<u8>)> {
        self.messages.lock().unwrap().clone()
    }
}

impl ServerHandler<ChatMsg> for Recorder {
    fn on_connect(&self, _address: IpAddr) -> bool {
        self.connects.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn on_validate(&self, id: UserId) {
        self.validated.lock().unwrap().push(id);
    }

    fn on_disconnect(&self, id: UserId) {
        self.disconnects.lock().unwrap().push(id);
    }

    fn on_message(&self, id: UserId, msg: Message<ChatMsg>) {
        self.messages
            .lock()
            .unwrap()
            .push((id, msg.kind(), msg.body().to_vec()));
    }
}

/// Poll `cond` every 10 ms until it holds or `timeout` elapses.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn started_server() -> (tcp::Server<ChatMsg, Recorder>, Arc<Recorder>, u16) {
    let handler = Arc::new(Recorder::default());
    let mut server = tcp::Server::new(0, Arc::clone(&handler));
    assert!(server.start(), "server must start on an ephemeral port");
    let port = server.local_addr().expect("running server has an address").port();
    (server, handler, port)
}

#[test]
fn test_ping_pong_roundtrip() {
    let (server, handler, port) = started_server();

    let mut client: tcp::Client<ChatMsg> = tcp::Client::new();
    assert!(client.connect("127.0.0.1", port));
    assert!(
        wait_until(Duration::from_secs(5), || !handler.validated().is_empty()),
        "client must pass validation"
    );

    let mut ping = Message::new(ChatMsg::Ping);
    ping.push_bytes(&[0x01, 0x02, 0x03]);
    client.send(ping);

    assert!(wait_until(Duration::from_secs(5), || {
        server.update(usize::MAX, false);
        !handler.messages().is_empty()
    }));

    let (id, kind, body) = handler.messages()[0].clone();
    assert_eq!(id, FIRST_CLIENT_ID);
    assert_eq!(kind, ChatMsg::Ping);
    assert_eq!(body, vec![1, 2, 3]);

    let mut echo = Message::new(ChatMsg::Ping);
    echo.push_bytes(&body);
    server.message_client(id, echo);

    assert!(wait_until(Duration::from_secs(5), || {
        client.incoming().len() == 1
    }));
    let tagged = client.incoming().pop_front().expect("echo arrived");
    assert_eq!(tagged.remote, SERVER_USER_ID);
    assert_eq!(tagged.msg.kind(), ChatMsg::Ping);
    assert_eq!(tagged.msg.body(), &[1, 2, 3]);

    assert!(
        handler.disconnects().is_empty(),
        "no disconnect may fire while both sockets stay open"
    );
}

#[test]
fn test_handshake_rejection_closes_and_reports_once() {
    let (server, handler, port) = started_server();

    let mut raw = std::net::TcpStream::connect(("127.0.0.1", port)).expect("raw connect");
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut challenge = [0u8; 8];
    raw.read_exact(&mut challenge).expect("challenge arrives");
    // Answer with bytes that are not scramble(challenge).
    raw.write_all(&[0xAA; 8]).expect("write bogus response");

    // The server closes the socket without replying.
    let mut buf = [0u8; 1];
    match raw.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("server sent {n} unexpected bytes after a failed handshake"),
        Err(_) => {} // reset also counts as closed
    }

    assert!(handler.validated().is_empty(), "on_validate must not fire");

    // The dead session lingers until observed by a send attempt.
    server.message_client(FIRST_CLIENT_ID, Message::new(ChatMsg::Ping));
    assert_eq!(handler.disconnects(), vec![FIRST_CLIENT_ID]);

    // Observation is exactly-once.
    server.message_client(FIRST_CLIENT_ID, Message::new(ChatMsg::Ping));
    assert_eq!(handler.disconnects().len(), 1);
}

#[test]
fn test_broadcast_skips_ignored_client() {
    let (server, handler, port) = started_server();

    let mut clients = Vec::new();
    for i in 0..3 {
        let mut client: tcp::Client<ChatMsg> = tcp::Client::new();
        assert!(client.connect("127.0.0.1", port));
        assert!(
            wait_until(Duration::from_secs(5), || handler.validated().len() == i + 1),
            "client {i} must validate"
        );
        clients.push(client);
    }

    let ids = handler.validated();
    assert_eq!(ids, vec![FIRST_CLIENT_ID, FIRST_CLIENT_ID + 1, FIRST_CLIENT_ID + 2]);

    let mut msg = Message::new(ChatMsg::Chat);
    msg.push_bytes(b"hello");
    server.message_all_clients(msg, ids[1]);

    assert!(wait_until(Duration::from_secs(5), || {
        clients[0].incoming().len() == 1 && clients[2].incoming().len() == 1
    }));
    // Give a stray copy time to arrive before asserting absence.
    thread::sleep(Duration::from_millis(200));

    assert_eq!(clients[0].incoming().len(), 1);
    assert_eq!(clients[2].incoming().len(), 1);
    assert!(
        clients[1].incoming().is_empty(),
        "the ignored client must receive nothing"
    );
}

#[test]
fn test_burst_preserves_send_order() {
    let (server, handler, port) = started_server();

    let mut client: tcp::Client<ChatMsg> = tcp::Client::new();
    assert!(client.connect("127.0.0.1", port));
    assert!(wait_until(Duration::from_secs(5), || {
        !handler.validated().is_empty()
    }));

    const BURST: u32 = 50;
    for i in 0..BURST {
        let mut msg = Message::new(ChatMsg::Chat);
        msg.push(i);
        client.send(msg);
    }

    assert!(wait_until(Duration::from_secs(5), || {
        server.update(usize::MAX, false);
        handler.messages().len() == BURST as usize
    }));

    let messages = handler.messages();
    for (i, (id, kind, body)) in messages.iter().enumerate() {
        assert_eq!(*id, FIRST_CLIENT_ID);
        assert_eq!(*kind, ChatMsg::Chat);
        let seq = u32::from_ne_bytes(body.as_slice().try_into().unwrap());
        assert_eq!(seq as usize, i, "messages must arrive contiguously in send order");
    }
}

#[test]
fn test_client_disconnect_observed_exactly_once() {
    let (server, handler, port) = started_server();

    let mut client: tcp::Client<ChatMsg> = tcp::Client::new();
    assert!(client.connect("127.0.0.1", port));
    assert!(wait_until(Duration::from_secs(5), || {
        !handler.validated().is_empty()
    }));

    client.disconnect();

    // The registry entry lingers until a send observes the dead socket.
    assert!(wait_until(Duration::from_secs(5), || {
        server.message_client(FIRST_CLIENT_ID, Message::new(ChatMsg::Ping));
        !handler.disconnects().is_empty()
    }));
    assert_eq!(handler.disconnects(), vec![FIRST_CLIENT_ID]);
    assert_eq!(server.client_count(), 0);

    server.message_client(FIRST_CLIENT_ID, Message::new(ChatMsg::Ping));
    assert_eq!(
        handler.disconnects().len(),
        1,
        "on_disconnect must fire exactly once per peer"
    );
}

#[test]
fn test_broadcast_observes_dead_clients() {
    let (server, handler, port) = started_server();

    let mut survivor: tcp::Client<ChatMsg> = tcp::Client::new();
    assert!(survivor.connect("127.0.0.1", port));
    assert!(wait_until(Duration::from_secs(5), || {
        handler.validated().len() == 1
    }));

    let mut quitter: tcp::Client<ChatMsg> = tcp::Client::new();
    assert!(quitter.connect("127.0.0.1", port));
    assert!(wait_until(Duration::from_secs(5), || {
        handler.validated().len() == 2
    }));

    quitter.disconnect();

    let mut msg = Message::new(ChatMsg::Chat);
    msg.push_bytes(b"news");
    assert!(wait_until(Duration::from_secs(5), || {
        server.message_all_clients(msg.clone(), INVALID_USER_ID);
        handler.disconnects().len() == 1
    }));
    assert_eq!(handler.disconnects(), vec![FIRST_CLIENT_ID + 1]);

    assert!(
        wait_until(Duration::from_secs(5), || !survivor.incoming().is_empty()),
        "the surviving client must still receive broadcasts"
    );
}

#[test]
fn test_start_is_idempotent_and_restartable() {
    let (mut server, handler, port) = {
        let handler = Arc::new(Recorder::default());
        let mut server: tcp::Server<ChatMsg, Recorder> = tcp::Server::new(0, Arc::clone(&handler));
        assert!(server.start());
        let port = server.local_addr().unwrap().port();
        (server, handler, port)
    };

    assert!(!server.start(), "starting a running server must fail");
    assert!(
        matches!(server.try_start(), Err(StartError::AlreadyRunning)),
        "the typed form must name the failure"
    );

    let mut first: tcp::Client<ChatMsg> = tcp::Client::new();
    assert!(first.connect("127.0.0.1", port));
    assert!(wait_until(Duration::from_secs(5), || {
        handler.validated().len() == 1
    }));

    server.stop();
    assert!(!server.is_running());
    first.disconnect();

    assert!(server.start(), "a stopped server must start again");
    let port = server.local_addr().unwrap().port();

    let mut second: tcp::Client<ChatMsg> = tcp::Client::new();
    assert!(second.connect("127.0.0.1", port));
    assert!(wait_until(Duration::from_secs(5), || {
        handler.validated().len() == 2
    }));

    // Ids are never reused, even across a restart.
    assert_eq!(
        handler.validated(),
        vec![FIRST_CLIENT_ID, FIRST_CLIENT_ID + 1]
    );
}

#[test]
fn test_empty_body_message_roundtrip() {
    let (server, handler, port) = started_server();

    let mut client: tcp::Client<ChatMsg> = tcp::Client::new();
    assert!(client.connect("127.0.0.1", port));
    assert!(wait_until(Duration::from_secs(5), || {
        !handler.validated().is_empty()
    }));

    // A bare tag with no body is a legal message.
    client.send(Message::new(ChatMsg::Ping));

    assert!(wait_until(Duration::from_secs(5), || {
        server.update(usize::MAX, false);
        !handler.messages().is_empty()
    }));
    let (id, kind, body) = handler.messages()[0].clone();
    assert_eq!(id, FIRST_CLIENT_ID);
    assert_eq!(kind, ChatMsg::Ping);
    assert!(body.is_empty());

    server.message_client(id, Message::new(ChatMsg::Ping));
    assert!(wait_until(Duration::from_secs(5), || {
        client.incoming().len() == 1
    }));
    assert!(client.incoming().pop_front().unwrap().msg.is_empty());
}

#[test]
fn test_oversize_stream_send_is_dropped_locally() {
    let (server, handler, port) = started_server();

    let mut client: tcp::Client<ChatMsg> = tcp::Client::new();
    assert!(client.connect("127.0.0.1", port));
    assert!(wait_until(Duration::from_secs(5), || {
        !handler.validated().is_empty()
    }));

    // One byte over the body cap: never leaves the client. The stream
    // transport drops without asserting; only the datagram cap is a
    // programmer error.
    let mut oversize = Message::new(ChatMsg::Chat);
    oversize.push_bytes(&vec![0u8; tether_net::MAX_MESSAGE_SIZE as usize + 1]);
    client.send(oversize);

    // A normal message afterwards still goes through, proving the session
    // survived the rejection.
    let mut fits = Message::new(ChatMsg::Chat);
    fits.push_bytes(b"ok");
    client.send(fits);

    assert!(wait_until(Duration::from_secs(5), || {
        server.update(usize::MAX, false);
        !handler.messages().is_empty()
    }));
    let messages = handler.messages();
    assert_eq!(messages.len(), 1, "only the in-bounds message may arrive");
    assert_eq!(messages[0].2, b"ok");
    assert!(client.is_connected());
}

#[test]
fn test_send_while_disconnected_is_silent() {
    let mut client: tcp::Client<ChatMsg> = tcp::Client::new();
    assert!(!client.is_connected());
    client.send(Message::new(ChatMsg::Ping));
    assert!(client.incoming().is_empty());

    // connect to nowhere fails cleanly
    assert!(!client.connect("127.0.0.1", 1));
    assert!(!client.is_connected());

    // and the typed form reports the socket failure
    match client.try_connect("127.0.0.1", 1) {
        Err(ConnectError::Connect { .. }) => {}
        other => panic!("expected a Connect error, got {other:?}"),
    }
}

#[test]
fn test_update_with_wait_blocks_until_message() {
    let (server, handler, port) = started_server();

    let mut client: tcp::Client<ChatMsg> = tcp::Client::new();
    assert!(client.connect("127.0.0.1", port));
    assert!(wait_until(Duration::from_secs(5), || {
        !handler.validated().is_empty()
    }));

    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let mut msg = Message::new(ChatMsg::Ping);
        msg.push(1u8);
        client.send(msg);
        client
    });

    // Blocks until the delayed send arrives, then dispatches it.
    let processed = server.update(usize::MAX, true);
    assert_eq!(processed, 1);
    assert_eq!(handler.messages().len(), 1);

    let _client = sender.join().unwrap();
}
