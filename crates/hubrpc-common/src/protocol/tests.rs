//! Tests for the message model
//!
//! These tests pin the JSON body layout of every variant, correlation id
//! generation, and the validation rules applied on receipt.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_rpc_request_creation() {
        let req = RpcRequest::new("add", json!({"num1": 2, "num2": 3}));
        assert_eq!(req.method, "add");
        assert_eq!(req.params, json!({"num1": 2, "num2": 3}));
        assert!(!req.id.is_empty());
    }

    #[test]
    fn test_correlation_id_uniqueness() {
        let ids: HashSet<_> = (0..1000)
            .map(|_| RpcRequest::new("test", json!({})).id)
            .collect();
        assert_eq!(ids.len(), 1000, "All correlation ids should be unique");
    }

    #[test]
    fn test_rpc_request_body_keys() {
        let req = RpcRequest::new("add", json!({"num1": 1}));
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body, json!({"method": "add", "parameters": {"num1": 1}}));
    }

    #[test]
    fn test_rpc_response_error_has_null_result() {
        let resp = RpcResponse::error("abc", RespCode::ServiceNotFound);
        let body = serde_json::to_value(&resp).unwrap();
        assert_eq!(body, json!({"rcode": 6, "result": null}));
    }

    #[test]
    fn test_topic_request_omits_absent_fields() {
        let req = TopicRequest::new("news", TopicOpType::Create);
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(
            body,
            json!({"topic_key": "news", "optype": 0, "forward_strategy": 0})
        );
    }

    #[test]
    fn test_topic_request_publish_body() {
        let mut req = TopicRequest::publish("news", "hello");
        req.forward_strategy = ForwardStrategy::Priority;
        req.priority = Some(5);
        req.tags = vec!["vip".to_string()];

        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["topic_msg"], json!("hello"));
        assert_eq!(body["forward_strategy"], json!(4));
        assert_eq!(body["priority"], json!(5));
        assert_eq!(body["tags"], json!(["vip"]));
        assert!(body.get("fanout").is_none());
    }

    #[test]
    fn test_topic_request_missing_strategy_defaults_to_broadcast() {
        let req: TopicRequest =
            serde_json::from_value(json!({"topic_key": "t", "optype": 4, "topic_msg": "m"}))
                .unwrap();
        assert_eq!(req.forward_strategy, ForwardStrategy::Broadcast);
        assert!(req.tags.is_empty());
        assert_eq!(req.fanout, None);
    }

    #[test]
    fn test_service_response_hosts_use_host_key() {
        let resp = ServiceResponse::discovered(
            "id-1",
            "add",
            vec![HostDetail::new(HostInfo::new("127.0.0.1", 9001), 10)],
        );
        let body = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            body,
            json!({
                "rcode": 0,
                "optype": 1,
                "method": "add",
                "host": [{"ip": "127.0.0.1", "port": 9001, "load": 10}]
            })
        );
    }

    #[test]
    fn test_host_detail_load_defaults_to_zero() {
        let detail: HostDetail =
            serde_json::from_value(json!({"ip": "10.0.0.1", "port": 80})).unwrap();
        assert_eq!(detail.host, HostInfo::new("10.0.0.1", 80));
        assert_eq!(detail.load, 0);
    }

    #[test]
    fn test_service_failure_uses_unknown_optype() {
        let resp = ServiceResponse::failure("x", RespCode::InvalidOptype);
        assert_eq!(resp.optype, ServiceOpType::Unknown);
        assert!(resp.hosts.is_none());
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_validate_rpc_params_must_be_object() {
        let ok: Message = RpcRequest::new("m", json!({})).into();
        assert!(ok.validate().is_ok());

        let bad: Message = RpcRequest::new("m", json!([1, 2])).into();
        assert!(matches!(bad.validate(), Err(RpcError::InvalidMessage(_))));
    }

    #[test]
    fn test_validate_publish_requires_message() {
        let bad: Message = TopicRequest::new("t", TopicOpType::Publish).into();
        assert!(bad.validate().is_err());

        let ok: Message = TopicRequest::publish("t", "m").into();
        assert!(ok.validate().is_ok());

        let create: Message = TopicRequest::new("t", TopicOpType::Create).into();
        assert!(create.validate().is_ok());
    }

    #[test]
    fn test_validate_service_request_host_rules() {
        let discover: Message = ServiceRequest::new("m", ServiceOpType::Discover, None).into();
        assert!(discover.validate().is_ok());

        let register: Message = ServiceRequest::new("m", ServiceOpType::Register, None).into();
        assert!(register.validate().is_err());

        let host = HostInfo::new("127.0.0.1", 1);
        let report: Message =
            ServiceRequest::new("m", ServiceOpType::LoadReport, Some(host.clone())).into();
        assert!(report.validate().is_err());

        let report: Message = ServiceRequest::new("m", ServiceOpType::LoadReport, Some(host))
            .with_load(3)
            .into();
        assert!(report.validate().is_ok());
    }

    #[test]
    fn test_validate_discover_response() {
        let bad: Message = ServiceResponse::new("x", RespCode::Success, ServiceOpType::Discover).into();
        assert!(bad.validate().is_err());

        let failed: Message = ServiceResponse::failure("x", RespCode::ServiceNotFound).into();
        assert!(failed.validate().is_ok());
    }

    // ========================================================================
    // Variant Conversion
    // ========================================================================

    #[test]
    fn test_try_from_wrong_variant() {
        let message: Message = TopicResponse::new("x", RespCode::Success).into();
        let err = RpcResponse::try_from(message).unwrap_err();
        assert!(matches!(
            err,
            RpcError::UnexpectedMessage {
                expected: MessageType::RspRpc,
                actual: MessageType::RspTopic,
            }
        ));
    }

    #[test]
    fn test_from_body_sets_id() {
        let body = br#"{"rcode":0,"result":5}"#;
        let message = Message::from_body(MessageType::RspRpc, "rid".to_string(), body).unwrap();
        assert_eq!(message.id(), "rid");
        assert_eq!(message.message_type(), MessageType::RspRpc);
        let resp = RpcResponse::try_from(message).unwrap();
        assert_eq!(resp.result, json!(5));
    }

    #[test]
    fn test_from_body_rejects_malformed_json() {
        let result = Message::from_body(MessageType::ReqRpc, "x".to_string(), b"{not json");
        assert!(matches!(result, Err(RpcError::JsonSerialization(_))));
    }
}
