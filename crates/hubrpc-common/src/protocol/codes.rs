//! Integer-coded enums carried on the wire.
//!
//! Every enum here travels as a plain JSON integer (or, for [`MessageType`],
//! as the 32-bit type tag of a frame header). Unknown integers are rejected
//! with [`RpcError::UnknownEnumValue`] instead of being mapped to a fallback.

use serde::{Deserialize, Serialize};

use super::error::{Result, RpcError};

macro_rules! int_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($kind:literal) {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "i32", into = "i32")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl TryFrom<i32> for $name {
            type Error = RpcError;

            fn try_from(value: i32) -> Result<Self> {
                match value {
                    $( $value => Ok($name::$variant), )+
                    other => Err(RpcError::UnknownEnumValue { kind: $kind, value: other }),
                }
            }
        }

        impl From<$name> for i32 {
            fn from(value: $name) -> i32 {
                value as i32
            }
        }
    };
}

int_enum! {
    /// Frame type tag.
    MessageType("message type") {
        ReqRpc = 0,
        RspRpc = 1,
        ReqTopic = 2,
        RspTopic = 3,
        ReqService = 4,
        RspService = 5,
    }
}

impl MessageType {
    /// Whether this tag marks a request (as opposed to a response).
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::ReqRpc | MessageType::ReqTopic | MessageType::ReqService
        )
    }

    /// The response tag paired with a request tag.
    ///
    /// Returns `None` for tags that are already responses.
    pub fn response_type(self) -> Option<MessageType> {
        match self {
            MessageType::ReqRpc => Some(MessageType::RspRpc),
            MessageType::ReqTopic => Some(MessageType::RspTopic),
            MessageType::ReqService => Some(MessageType::RspService),
            _ => None,
        }
    }
}

int_enum! {
    /// Outcome code carried by every response.
    RespCode("response code") {
        Success = 0,
        ParseFailed = 1,
        InvalidMsgType = 2,
        InvalidMsg = 3,
        ConnectionClosed = 4,
        InvalidParams = 5,
        ServiceNotFound = 6,
        InvalidOptype = 7,
        TopicNotFound = 8,
        InternalError = 9,
    }
}

impl RespCode {
    /// Fixed human-readable reason for this code.
    pub fn reason(self) -> &'static str {
        match self {
            RespCode::Success => "success",
            RespCode::ParseFailed => "message parse failed",
            RespCode::InvalidMsgType => "invalid message type",
            RespCode::InvalidMsg => "invalid message",
            RespCode::ConnectionClosed => "connection closed",
            RespCode::InvalidParams => "invalid parameters",
            RespCode::ServiceNotFound => "service not found",
            RespCode::InvalidOptype => "invalid operation type",
            RespCode::TopicNotFound => "topic not found",
            RespCode::InternalError => "internal error",
        }
    }

    pub fn is_success(self) -> bool {
        self == RespCode::Success
    }
}

int_enum! {
    /// Topic operation requested by a client.
    TopicOpType("topic operation") {
        Create = 0,
        Remove = 1,
        Subscribe = 2,
        Unsubscribe = 3,
        Publish = 4,
    }
}

int_enum! {
    /// How a published message is forwarded to a topic's subscribers.
    ForwardStrategy("forward strategy") {
        Broadcast = 0,
        RoundRobin = 1,
        Fanout = 2,
        SourceHash = 3,
        Priority = 4,
        Redundant = 5,
    }
}

impl Default for ForwardStrategy {
    fn default() -> Self {
        ForwardStrategy::Broadcast
    }
}

int_enum! {
    /// Registry operation carried by service requests and responses.
    ServiceOpType("service operation") {
        Register = 0,
        Discover = 1,
        Online = 2,
        Offline = 3,
        LoadReport = 4,
        HeartbeatProvider = 5,
        Unknown = 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_pairs() {
        assert_eq!(MessageType::ReqRpc.response_type(), Some(MessageType::RspRpc));
        assert_eq!(MessageType::ReqTopic.response_type(), Some(MessageType::RspTopic));
        assert_eq!(MessageType::ReqService.response_type(), Some(MessageType::RspService));
        assert_eq!(MessageType::RspRpc.response_type(), None);
        assert!(MessageType::ReqService.is_request());
        assert!(!MessageType::RspTopic.is_request());
    }

    #[test]
    fn test_unknown_value_rejected() {
        let err = MessageType::try_from(6).unwrap_err();
        assert!(matches!(err, RpcError::UnknownEnumValue { value: 6, .. }));
        assert!(RespCode::try_from(-1).is_err());
        assert_eq!(ServiceOpType::try_from(6).unwrap(), ServiceOpType::Unknown);
    }

    #[test]
    fn test_codes_serialize_as_integers() {
        assert_eq!(serde_json::to_string(&RespCode::TopicNotFound).unwrap(), "8");
        assert_eq!(serde_json::to_string(&ForwardStrategy::Redundant).unwrap(), "5");
        let op: TopicOpType = serde_json::from_str("4").unwrap();
        assert_eq!(op, TopicOpType::Publish);
        assert!(serde_json::from_str::<TopicOpType>("9").is_err());
    }

    #[test]
    fn test_reasons_are_distinct() {
        let codes = [
            RespCode::Success,
            RespCode::ParseFailed,
            RespCode::InvalidMsgType,
            RespCode::InvalidMsg,
            RespCode::ConnectionClosed,
            RespCode::InvalidParams,
            RespCode::ServiceNotFound,
            RespCode::InvalidOptype,
            RespCode::TopicNotFound,
            RespCode::InternalError,
        ];
        let reasons: std::collections::HashSet<_> = codes.iter().map(|c| c.reason()).collect();
        assert_eq!(reasons.len(), codes.len());
        assert_eq!(RespCode::ServiceNotFound.reason(), "service not found");
    }

    #[test]
    fn test_forward_strategy_default() {
        assert_eq!(ForwardStrategy::default(), ForwardStrategy::Broadcast);
    }
}
