//! Network infrastructure: the WebSocket socket server, per-connection
//! wrappers, and the connection-id pool.

pub mod client_connection;
pub mod id_pool;
pub mod socket_server;

pub use client_connection::{ClientHandle, ConnectionCommand};
pub use socket_server::{ServerError, ServerEvent, SocketServer};
