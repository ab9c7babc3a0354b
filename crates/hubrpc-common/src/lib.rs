//! hubrpc Common Types and Transport
//!
//! This crate provides the message model, wire codec, connection plumbing
//! and request correlation shared by every hubrpc client and server role.
//!
//! # Overview
//!
//! hubrpc is an RPC runtime with a service registry and a topic-based
//! publish/subscribe layer, all multiplexed over one connection type and
//! one wire protocol:
//!
//! - **Protocol Layer**: six message variants (RPC, topic and service
//!   requests and responses), integer-coded enums, response codes
//! - **Transport Layer**: length-value framing over TCP, the
//!   [`Connection`](transport::Connection) abstraction
//! - **Dispatch**: [`Dispatcher`] routes inbound messages by type tag
//! - **Correlation**: [`Requestor`] matches responses to pending requests
//!
//! # Architecture
//!
//! The wire protocol:
//! - **Transport**: TCP, one long-lived connection per peer
//! - **Serialization**: JSON bodies, binary header
//! - **Frame Format**: `[total_len][type][id_len][id][body]`, 32-bit big-endian integers
//! - **Max Frame Size**: 10 MiB (larger frames tear the connection down)
//!
//! # Example
//!
//! ```
//! use hubrpc_common::{Message, RpcRequest, RpcResponse, RespCode};
//! use serde_json::json;
//!
//! let request = RpcRequest::new("add", json!({"num1": 2, "num2": 3}));
//! let response = RpcResponse::success(request.id.clone(), json!(5));
//!
//! assert_eq!(response.rcode, RespCode::Success);
//! let message: Message = response.into();
//! assert_eq!(message.id(), request.id);
//! ```

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod requestor;
pub mod sync;
pub mod transport;

pub use clock::{Clock, ClockRef, ManualClock, SystemClock};
pub use config::HeartbeatConfig;
pub use dispatcher::Dispatcher;
pub use protocol::*;
pub use requestor::{PendingResponse, Requestor, ResponseCallback};
