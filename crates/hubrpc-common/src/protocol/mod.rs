pub mod codes;
pub mod error;
pub mod host;
pub mod messages;

#[cfg(test)]
mod tests;

pub use codes::{ForwardStrategy, MessageType, RespCode, ServiceOpType, TopicOpType};
pub use error::{Result, RpcError};
pub use host::{HostDetail, HostInfo};
pub use messages::{
    new_correlation_id, CorrelationId, Message, RpcRequest, RpcResponse, ServiceRequest,
    ServiceResponse, TopicRequest, TopicResponse,
};
