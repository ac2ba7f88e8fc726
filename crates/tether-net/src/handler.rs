//! Application extension points for the server facades.

use std::net::IpAddr;

use crate::message::{Message, MessageId, UserId};

/// Lifecycle and message callbacks implemented by the application and
/// injected into a server at construction.
///
/// `on_connect`, `on_validate`, and `on_disconnect` run on the server's I/O
/// worker and must not block; `on_message` runs on whichever thread calls the
/// server's `update`.
pub trait ServerHandler<T: MessageId>: Send + Sync + 'static {
    /// A peer is attempting to connect from `address`. Return `false` to
    /// reject it before any id is assigned (e.g. to ban addresses or cap the
    /// player count).
    fn on_connect(&self, address: IpAddr) -> bool;

    /// The peer with `id` completed the scramble handshake and may now
    /// exchange messages.
    fn on_validate(&self, id: UserId);

    /// The peer with `id` was observed to be gone: a dead stream session, or
    /// a datagram peer past its liveness timeout. Fired at most once per id.
    fn on_disconnect(&self, id: UserId);

    /// A message from `id`, dispatched during `update`.
    fn on_message(&self, id: UserId, msg: Message<T>);
}
