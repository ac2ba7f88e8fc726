//! Shared protocol and server logic for the tether demo binaries.

use std::sync::Mutex;

use tether_net::{Message, MessageId, ServerHandler, UserId};

/// Message tags exchanged by the demo client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoMsg {
    /// Round-trip probe; the server echoes it back untouched.
    Ping,
    /// Chat line broadcast to every other connected client.
    Chat,
    /// Catch-all for tags this build does not know.
    Unknown,
}

impl MessageId for DemoMsg {
    fn to_raw(self) -> u32 {
        match self {
            DemoMsg::Ping => 0,
            DemoMsg::Chat => 1,
            DemoMsg::Unknown => u32::MAX,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => DemoMsg::Ping,
            1 => DemoMsg::Chat,
            _ => DemoMsg::Unknown,
        }
    }
}

/// What the main loop should do with a message the handler processed.
pub enum DemoAction {
    /// Send a message back to one client.
    Reply(UserId, Message<DemoMsg>),
    /// Broadcast a message to everyone except the originator.
    Broadcast(UserId, Message<DemoMsg>),
}

/// Chat server logic: echo pings, broadcast chat lines.
///
/// Lifecycle callbacks run on the I/O worker, so the handler only records
/// work; the main loop drains it and talks back through the server facade.
#[derive(Default)]
pub struct ChatServer {
    pending: Mutex<Vec<DemoAction>>,
}

impl ChatServer {
    /// Take the actions queued since the last drain.
    pub fn drain_actions(&self) -> Vec<DemoAction> {
        std::mem::take(&mut self.pending.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn queue(&self, action: DemoAction) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action);
    }
}

impl ServerHandler<DemoMsg> for ChatServer {
    fn on_connect(&self, address: std::net::IpAddr) -> bool {
        tracing::info!("incoming connection from {address}");
        true
    }

    fn on_validate(&self, id: UserId) {
        tracing::info!("[{id}] joined the chat");
    }

    fn on_disconnect(&self, id: UserId) {
        tracing::info!("[{id}] left the chat");
    }

    fn on_message(&self, id: UserId, msg: Message<DemoMsg>) {
        match msg.kind() {
            DemoMsg::Ping => self.queue(DemoAction::Reply(id, msg)),
            DemoMsg::Chat => {
                tracing::info!("[{id}] {}", String::from_utf8_lossy(msg.body()));
                self.queue(DemoAction::Broadcast(id, msg));
            }
            DemoMsg::Unknown => {
                tracing::warn!("[{id}] sent an unknown message tag, dropping");
            }
        }
    }
}
