//! Transport Layer
//!
//! This module frames messages onto byte streams and models the peers at
//! the other end as [`Connection`]s.
//!
//! # Architecture
//!
//! - **Codec**: [`FrameCodec`] turns a [`Message`](crate::protocol::Message)
//!   into a length-value frame and back
//! - **Connection**: the [`Connection`] trait (`send`, `shutdown`,
//!   `connected`) that every manager holds as a [`ConnectionRef`]
//! - **Events**: [`ConnectionEvents`] receives connect, message and close
//!   notifications on the connection's reader task
//!
//! # Components
//!
//! - **[`TcpConnection`]**: socket-backed connection with reader/writer tasks
//! - **[`TcpTransport`]**: outbound connector
//! - **[`TcpServer`]**: accept loop
//! - **[`MemoryConnection`]**: in-process connection that records its output
//!
//! # Frame Size Limits
//!
//! Readers enforce a 10 MiB ceiling ([`MAX_FRAME_SIZE`]) and tear the
//! connection down when a peer exceeds it.

pub mod codec;
pub mod connection;
pub mod memory;
pub mod tcp;
pub mod tcp_server;

pub use codec::{FrameCodec, HEADER_LEN, MAX_FRAME_SIZE};
pub use connection::{next_connection_id, Connection, ConnectionEvents, ConnectionId, ConnectionRef};
pub use memory::MemoryConnection;
pub use tcp::{TcpConnection, TcpTransport};
pub use tcp_server::TcpServer;
