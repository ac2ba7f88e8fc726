//! Stream transport: reliable, ordered messaging over TCP.

mod client;
mod server;
mod session;

pub use client::Client;
pub use server::Server;
