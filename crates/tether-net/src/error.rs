//! Typed failures behind the boolean facade surface.
//!
//! `start` and `connect` report plain success/failure to match the simple
//! application surface; `try_start` and `try_connect` are the same
//! operations with the failure spelled out. The boolean wrappers log these
//! errors at the point where they collapse to `false`.

use std::net::SocketAddr;

/// Why a server failed to start.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// `start` was called while the server was already running.
    #[error("server already running")]
    AlreadyRunning,

    /// The listening socket could not be bound or configured.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// The requested port.
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The I/O worker thread or its runtime could not be brought up.
    #[error("failed to start I/O worker: {0}")]
    Worker(#[source] std::io::Error),
}

/// Why a client failed to connect.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Hostname resolution failed.
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        /// The host that was looked up.
        host: String,
        /// The requested port.
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Resolution succeeded but produced no usable address.
    #[error("{host}:{port} resolved to no addresses")]
    NoAddress {
        /// The host that was looked up.
        host: String,
        /// The requested port.
        port: u16,
    },

    /// The socket could not be opened or connected.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The resolved address.
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The I/O worker thread or its runtime could not be brought up.
    #[error("failed to start I/O worker: {0}")]
    Worker(#[source] std::io::Error),
}
