use thiserror::Error;

use super::codes::{MessageType, RespCode};

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Frame too large: {len} bytes (max {max} bytes)")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unknown {kind} value: {value}")]
    UnknownEnumValue { kind: &'static str, value: i32 },

    #[error("Remote call failed: {}", .0.reason())]
    Remote(RespCode),

    #[error("Unexpected message type: expected {expected:?}, got {actual:?}")]
    UnexpectedMessage {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("Duplicate correlation id: {0}")]
    DuplicateRequestId(String),

    #[error("No provider available for method: {0}")]
    NoProvider(String),

    #[error("Invalid service definition: {0}")]
    InvalidService(String),
}

impl RpcError {
    /// The response code carried by a remote failure, if any.
    pub fn resp_code(&self) -> Option<RespCode> {
        match self {
            RpcError::Remote(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<std::net::AddrParseError> for RpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RpcError::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
