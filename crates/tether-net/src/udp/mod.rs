//! Datagram transport: connectionless messaging over UDP.
//!
//! One datagram carries one complete message (or one handshake packet). The
//! transport adds no reliability, ordering, retransmission, or fragmentation
//! on top of UDP; liveness is tracked per peer with a receive timeout.

mod client;
mod server;

pub use client::Client;
pub use server::Server;

/// Magic number a client sends (big-endian, 8 bytes) to request a
/// connection. Datagrams from unknown endpoints that do not carry it are
/// dropped silently.
pub const CONNECTION_REQUEST_MAGIC: u64 = 0x26E5_5500;

/// Default per-peer liveness timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
