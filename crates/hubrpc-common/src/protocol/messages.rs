//! Message Model
//!
//! The six message variants exchanged over a connection. Each variant is a
//! plain struct whose serde representation is the JSON body of a frame; the
//! correlation id travels in the frame header, so it is skipped by serde and
//! filled in by the codec.
//!
//! # Request / Response Pairing
//!
//! Every request has a counterpart response sharing its correlation id:
//!
//! | Request          | Response          |
//! |------------------|-------------------|
//! | [`RpcRequest`]     | [`RpcResponse`]     |
//! | [`TopicRequest`]   | [`TopicResponse`]   |
//! | [`ServiceRequest`] | [`ServiceResponse`] |
//!
//! The pairing is established by whichever handler builds the response, not
//! by the wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::codes::{ForwardStrategy, MessageType, RespCode, ServiceOpType, TopicOpType};
use super::error::{Result, RpcError};
use super::host::{HostDetail, HostInfo};

/// Opaque string linking a request to its response.
pub type CorrelationId = String;

/// Generates a fresh correlation id (UUID v4).
pub fn new_correlation_id() -> CorrelationId {
    Uuid::new_v4().to_string()
}

/// Invoke `method` with named `parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(skip)]
    pub id: CorrelationId,
    pub method: String,
    /// Named parameters; must be a JSON object.
    #[serde(rename = "parameters", default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: new_correlation_id(),
            method: method.into(),
            params,
        }
    }
}

/// Outcome of an [`RpcRequest`]. `result` is `null` unless `rcode` is success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(skip)]
    pub id: CorrelationId,
    pub rcode: RespCode,
    #[serde(default)]
    pub result: Value,
}

impl RpcResponse {
    pub fn success(id: impl Into<CorrelationId>, result: Value) -> Self {
        Self {
            id: id.into(),
            rcode: RespCode::Success,
            result,
        }
    }

    pub fn error(id: impl Into<CorrelationId>, rcode: RespCode) -> Self {
        Self {
            id: id.into(),
            rcode,
            result: Value::Null,
        }
    }
}

/// A topic lifecycle operation or a publish.
///
/// The forwarding parameters (`fanout`, `shard_key`, `priority`, `tags`,
/// `redundant`) only matter for [`TopicOpType::Publish`]; `priority` and
/// `tags` are also read on [`TopicOpType::Subscribe`] to describe the
/// subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicRequest {
    #[serde(skip)]
    pub id: CorrelationId,
    #[serde(rename = "topic_key")]
    pub topic: String,
    pub optype: TopicOpType,
    #[serde(rename = "topic_msg", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub forward_strategy: ForwardStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fanout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redundant: Option<u32>,
}

impl TopicRequest {
    pub fn new(topic: impl Into<String>, optype: TopicOpType) -> Self {
        Self {
            id: new_correlation_id(),
            topic: topic.into(),
            optype,
            message: None,
            forward_strategy: ForwardStrategy::Broadcast,
            priority: None,
            tags: Vec::new(),
            fanout: None,
            shard_key: None,
            redundant: None,
        }
    }

    /// A publish of `message` to `topic` with broadcast forwarding.
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        let mut request = Self::new(topic, TopicOpType::Publish);
        request.message = Some(message.into());
        request
    }
}

/// Outcome of a [`TopicRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicResponse {
    #[serde(skip)]
    pub id: CorrelationId,
    pub rcode: RespCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl TopicResponse {
    pub fn new(id: impl Into<CorrelationId>, rcode: RespCode) -> Self {
        Self {
            id: id.into(),
            rcode,
            result: None,
        }
    }
}

/// A registry operation, or a registry-initiated online/offline push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    #[serde(skip)]
    pub id: CorrelationId,
    pub method: String,
    pub optype: ServiceOpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<u32>,
}

impl ServiceRequest {
    pub fn new(method: impl Into<String>, optype: ServiceOpType, host: Option<HostInfo>) -> Self {
        Self {
            id: new_correlation_id(),
            method: method.into(),
            optype,
            host,
            load: None,
        }
    }

    pub fn with_load(mut self, load: u32) -> Self {
        self.load = Some(load);
        self
    }
}

/// Outcome of a [`ServiceRequest`].
///
/// A successful discovery carries the method name and the provider list
/// (serialized under the `host` key). Failures carry
/// [`ServiceOpType::Unknown`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    #[serde(skip)]
    pub id: CorrelationId,
    pub rcode: RespCode,
    pub optype: ServiceOpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(rename = "host", default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<HostDetail>>,
}

impl ServiceResponse {
    pub fn new(id: impl Into<CorrelationId>, rcode: RespCode, optype: ServiceOpType) -> Self {
        Self {
            id: id.into(),
            rcode,
            optype,
            method: None,
            hosts: None,
        }
    }

    pub fn failure(id: impl Into<CorrelationId>, rcode: RespCode) -> Self {
        Self::new(id, rcode, ServiceOpType::Unknown)
    }

    pub fn discovered(
        id: impl Into<CorrelationId>,
        method: impl Into<String>,
        hosts: Vec<HostDetail>,
    ) -> Self {
        Self {
            id: id.into(),
            rcode: RespCode::Success,
            optype: ServiceOpType::Discover,
            method: Some(method.into()),
            hosts: Some(hosts),
        }
    }
}

/// Any message that can travel in a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RpcRequest(RpcRequest),
    RpcResponse(RpcResponse),
    TopicRequest(TopicRequest),
    TopicResponse(TopicResponse),
    ServiceRequest(ServiceRequest),
    ServiceResponse(ServiceResponse),
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::RpcRequest(m) => &m.id,
            Message::RpcResponse(m) => &m.id,
            Message::TopicRequest(m) => &m.id,
            Message::TopicResponse(m) => &m.id,
            Message::ServiceRequest(m) => &m.id,
            Message::ServiceResponse(m) => &m.id,
        }
    }

    pub fn set_id(&mut self, id: CorrelationId) {
        match self {
            Message::RpcRequest(m) => m.id = id,
            Message::RpcResponse(m) => m.id = id,
            Message::TopicRequest(m) => m.id = id,
            Message::TopicResponse(m) => m.id = id,
            Message::ServiceRequest(m) => m.id = id,
            Message::ServiceResponse(m) => m.id = id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RpcRequest(_) => MessageType::ReqRpc,
            Message::RpcResponse(_) => MessageType::RspRpc,
            Message::TopicRequest(_) => MessageType::ReqTopic,
            Message::TopicResponse(_) => MessageType::RspTopic,
            Message::ServiceRequest(_) => MessageType::ReqService,
            Message::ServiceResponse(_) => MessageType::RspService,
        }
    }

    /// A failure response to this request carrying `rcode`, or `None` if
    /// this message is itself a response.
    pub fn error_response(&self, rcode: RespCode) -> Option<Message> {
        let id = self.id().to_string();
        match self.message_type() {
            MessageType::ReqRpc => Some(RpcResponse::error(id, rcode).into()),
            MessageType::ReqTopic => Some(TopicResponse::new(id, rcode).into()),
            MessageType::ReqService => Some(ServiceResponse::failure(id, rcode).into()),
            _ => None,
        }
    }

    /// Serializes the payload (everything but the id) to a JSON document.
    pub fn to_body(&self) -> Result<Vec<u8>> {
        let body = match self {
            Message::RpcRequest(m) => serde_json::to_vec(m)?,
            Message::RpcResponse(m) => serde_json::to_vec(m)?,
            Message::TopicRequest(m) => serde_json::to_vec(m)?,
            Message::TopicResponse(m) => serde_json::to_vec(m)?,
            Message::ServiceRequest(m) => serde_json::to_vec(m)?,
            Message::ServiceResponse(m) => serde_json::to_vec(m)?,
        };
        Ok(body)
    }

    /// Rebuilds a message from its type tag, correlation id and JSON body.
    pub fn from_body(message_type: MessageType, id: CorrelationId, body: &[u8]) -> Result<Self> {
        let mut message = match message_type {
            MessageType::ReqRpc => Message::RpcRequest(serde_json::from_slice(body)?),
            MessageType::RspRpc => Message::RpcResponse(serde_json::from_slice(body)?),
            MessageType::ReqTopic => Message::TopicRequest(serde_json::from_slice(body)?),
            MessageType::RspTopic => Message::TopicResponse(serde_json::from_slice(body)?),
            MessageType::ReqService => Message::ServiceRequest(serde_json::from_slice(body)?),
            MessageType::RspService => Message::ServiceResponse(serde_json::from_slice(body)?),
        };
        message.set_id(id);
        Ok(message)
    }

    /// Checks the field combinations serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidMessage`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(RpcError::InvalidMessage(reason.to_string()));
        match self {
            Message::RpcRequest(m) => {
                if !m.params.is_object() {
                    return invalid("rpc parameters must be an object");
                }
            }
            Message::RpcResponse(_) | Message::TopicResponse(_) => {}
            Message::TopicRequest(m) => {
                if m.optype == TopicOpType::Publish && m.message.is_none() {
                    return invalid("publish request without topic_msg");
                }
            }
            Message::ServiceRequest(m) => {
                if m.optype != ServiceOpType::Discover && m.host.is_none() {
                    return invalid("service request without host");
                }
                if m.optype == ServiceOpType::LoadReport && m.load.is_none() {
                    return invalid("load report without load");
                }
            }
            Message::ServiceResponse(m) => {
                if m.rcode.is_success()
                    && m.optype == ServiceOpType::Discover
                    && (m.method.is_none() || m.hosts.is_none())
                {
                    return invalid("discover response without method or host list");
                }
            }
        }
        Ok(())
    }
}

macro_rules! message_variant {
    ($variant:ident, $tag:ident) => {
        impl From<$variant> for Message {
            fn from(message: $variant) -> Self {
                Message::$variant(message)
            }
        }

        impl TryFrom<Message> for $variant {
            type Error = RpcError;

            fn try_from(message: Message) -> Result<Self> {
                match message {
                    Message::$variant(inner) => Ok(inner),
                    other => Err(RpcError::UnexpectedMessage {
                        expected: MessageType::$tag,
                        actual: other.message_type(),
                    }),
                }
            }
        }
    };
}

message_variant!(RpcRequest, ReqRpc);
message_variant!(RpcResponse, RspRpc);
message_variant!(TopicRequest, ReqTopic);
message_variant!(TopicResponse, RspTopic);
message_variant!(ServiceRequest, ReqService);
message_variant!(ServiceResponse, RspService);
