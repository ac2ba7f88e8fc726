//! Typed, length-prefixed messaging between one server and many clients.
//!
//! The same application surface is offered over two transports: a reliable
//! byte stream ([`tcp`]) and an unreliable datagram socket ([`udp`]). In both
//! cases the application sends [`Message`]s, drains [`TaggedMessage`]s from a
//! shared inbound queue, and reacts to lifecycle callbacks through a
//! [`ServerHandler`]. Each facade owns a single I/O worker thread driving a
//! current-thread tokio runtime; the inbound [`TsDeque`] is the only hand-off
//! point between the I/O worker and application code.

pub mod error;
pub mod framing;
pub mod handler;
pub mod message;
pub mod queue;
pub mod scramble;
pub mod tcp;
pub mod udp;

pub use error::{ConnectError, StartError};
pub use framing::{FrameError, HEADER_LEN, MAX_MESSAGE_SIZE};
pub use handler::ServerHandler;
pub use message::{
    Message, MessageId, TaggedMessage, UserId, FIRST_CLIENT_ID, INVALID_USER_ID, SERVER_USER_ID,
};
pub use queue::TsDeque;
pub use scramble::scramble;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
