//! hubrpc
//!
//! Facade over the hubrpc crates:
//!
//! - [`common`]: message model, wire codec, connections, dispatch and
//!   request correlation
//! - [`client`]: RPC, discovery and topic clients
//! - [`server`]: RPC server, service registry and topic server

pub use hubrpc_client as client;
pub use hubrpc_common as common;
pub use hubrpc_server as server;
