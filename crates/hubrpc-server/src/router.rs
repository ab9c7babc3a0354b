//! RPC method table and request routing.
//!
//! A [`ServiceDescribe`] binds a method name to a handler plus a contract:
//! the named, typed parameters it requires and the type of value it
//! returns. The [`RpcRouter`] looks methods up by name and answers each
//! [`RpcRequest`] with an [`RpcResponse`]:
//!
//! | condition | code |
//! |---|---|
//! | unknown method | [`RespCode::ServiceNotFound`] |
//! | missing or mistyped parameter | [`RespCode::InvalidParams`] |
//! | handler error or panic, or wrong return type | [`RespCode::InternalError`] |
//! | otherwise | [`RespCode::Success`] with the result |

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use hubrpc_common::protocol::error::Result;
use hubrpc_common::sync::{read, write};
use hubrpc_common::transport::ConnectionRef;
use hubrpc_common::{RespCode, RpcError, RpcRequest, RpcResponse};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Handler invoked with the request parameters.
pub type ServiceHandler = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

/// Shape of a JSON value in a method contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    /// Integer numbers only.
    Integral,
    /// Any number, integer or floating point.
    Numeric,
    String,
    Array,
    Object,
    Null,
}

impl ValueType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ValueType::Bool => value.is_boolean(),
            ValueType::Integral => value.is_i64() || value.is_u64(),
            ValueType::Numeric => value.is_number(),
            ValueType::String => value.is_string(),
            ValueType::Array => value.is_array(),
            ValueType::Object => value.is_object(),
            ValueType::Null => value.is_null(),
        }
    }
}

/// Why a [`ServiceDescribe::call`] failed.
#[derive(Debug, Error)]
pub enum CallError {
    /// A required parameter is absent or has the wrong type.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    /// The handler failed, panicked, or returned the wrong type.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CallError {
    pub fn resp_code(&self) -> RespCode {
        match self {
            CallError::InvalidParams(_) => RespCode::InvalidParams,
            CallError::Internal(_) => RespCode::InternalError,
        }
    }
}

/// An immutable method binding: name, handler, parameter contract and
/// return type.
///
/// # Example
///
/// ```
/// use hubrpc_server::router::{ServiceDescribe, ValueType};
/// use serde_json::json;
///
/// let add = ServiceDescribe::builder("add")
///     .param("num1", ValueType::Integral)
///     .param("num2", ValueType::Integral)
///     .returns(ValueType::Integral)
///     .handler(|params| {
///         let a = params["num1"].as_i64().unwrap_or_default();
///         let b = params["num2"].as_i64().unwrap_or_default();
///         Ok(json!(a + b))
///     })
///     .build()
///     .unwrap();
///
/// assert_eq!(add.call(&json!({"num1": 2, "num2": 3})).unwrap(), json!(5));
/// ```
pub struct ServiceDescribe {
    name: String,
    params: Vec<(String, ValueType)>,
    returns: ValueType,
    handler: ServiceHandler,
}

impl ServiceDescribe {
    pub fn builder(name: impl Into<String>) -> ServiceDescribeBuilder {
        ServiceDescribeBuilder {
            name: name.into(),
            params: Vec::new(),
            returns: None,
            handler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn return_type(&self) -> ValueType {
        self.returns
    }

    /// Checks `params` against the contract, stopping at the first missing
    /// or mistyped field.
    pub fn check_params(&self, params: &Value) -> std::result::Result<(), CallError> {
        for (name, expected) in &self.params {
            match params.get(name) {
                None => return Err(CallError::InvalidParams(format!("missing field '{}'", name))),
                Some(value) if !expected.matches(value) => {
                    return Err(CallError::InvalidParams(format!(
                        "field '{}' is not {:?}",
                        name, expected
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Validates `params`, runs the handler and checks the result type.
    pub fn call(&self, params: &Value) -> std::result::Result<Value, CallError> {
        self.check_params(params)?;

        let result = match catch_unwind(AssertUnwindSafe(|| (self.handler)(params))) {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(CallError::Internal(format!("{:#}", e))),
            Err(_) => return Err(CallError::Internal("handler panicked".to_string())),
        };

        if !self.returns.matches(&result) {
            return Err(CallError::Internal(format!(
                "handler returned {} where {:?} was declared",
                result, self.returns
            )));
        }
        Ok(result)
    }
}

impl fmt::Debug for ServiceDescribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescribe")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ServiceDescribe`].
pub struct ServiceDescribeBuilder {
    name: String,
    params: Vec<(String, ValueType)>,
    returns: Option<ValueType>,
    handler: Option<ServiceHandler>,
}

impl ServiceDescribeBuilder {
    /// Declares a required parameter. Parameters are checked in declaration
    /// order.
    pub fn param(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.params.push((name.into(), value_type));
        self
    }

    pub fn returns(mut self, value_type: ValueType) -> Self {
        self.returns = Some(value_type);
        self
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// # Errors
    ///
    /// [`RpcError::InvalidService`] if the name is empty or the handler or
    /// return type was never set.
    pub fn build(self) -> Result<ServiceDescribe> {
        if self.name.is_empty() {
            return Err(RpcError::InvalidService("empty method name".to_string()));
        }
        let handler = self
            .handler
            .ok_or_else(|| RpcError::InvalidService(format!("method '{}' has no handler", self.name)))?;
        let returns = self
            .returns
            .ok_or_else(|| RpcError::InvalidService(format!("method '{}' has no return type", self.name)))?;

        Ok(ServiceDescribe {
            name: self.name,
            params: self.params,
            returns,
            handler,
        })
    }
}

/// Method table serving RPC requests.
#[derive(Default)]
pub struct RpcRouter {
    services: RwLock<HashMap<String, Arc<ServiceDescribe>>>,
    served: AtomicU64,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `service`, replacing any method with the same name.
    pub fn register_method(&self, service: ServiceDescribe) {
        let name = service.name().to_string();
        if write(&self.services)
            .insert(name.clone(), Arc::new(service))
            .is_some()
        {
            warn!(method = %name, "replaced existing method");
        } else {
            info!(method = %name, "method registered");
        }
    }

    pub fn remove_method(&self, name: &str) -> bool {
        write(&self.services).remove(name).is_some()
    }

    pub fn has_method(&self, name: &str) -> bool {
        read(&self.services).contains_key(name)
    }

    pub fn methods(&self) -> Vec<String> {
        read(&self.services).keys().cloned().collect()
    }

    /// Builds the response for `request`.
    pub fn handle(&self, request: &RpcRequest) -> RpcResponse {
        self.served.fetch_add(1, Ordering::Relaxed);
        debug!(id = %request.id, method = %request.method, "rpc request");

        let service = read(&self.services).get(&request.method).cloned();
        let Some(service) = service else {
            warn!(method = %request.method, "service not found");
            return RpcResponse::error(request.id.clone(), RespCode::ServiceNotFound);
        };

        match service.call(&request.params) {
            Ok(result) => RpcResponse::success(request.id.clone(), result),
            Err(e) => {
                error!(method = %request.method, error = %e, "rpc call failed");
                RpcResponse::error(request.id.clone(), e.resp_code())
            }
        }
    }

    /// Answers `request` on `conn`.
    pub fn on_rpc_request(&self, conn: &ConnectionRef, request: RpcRequest) {
        let response = self.handle(&request);
        if let Err(e) = conn.send(&response.into()) {
            warn!(conn = conn.id(), method = %request.method, error = %e, "failed to send rpc response");
        }
    }

    /// Requests handled since the previous call.
    pub fn take_served(&self) -> u64 {
        self.served.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubrpc_common::transport::MemoryConnection;
    use serde_json::json;

    fn add_service() -> ServiceDescribe {
        ServiceDescribe::builder("add")
            .param("num1", ValueType::Integral)
            .param("num2", ValueType::Integral)
            .returns(ValueType::Integral)
            .handler(|params| {
                let a = params["num1"].as_i64().unwrap_or_default();
                let b = params["num2"].as_i64().unwrap_or_default();
                Ok(json!(a + b))
            })
            .build()
            .unwrap()
    }

    fn router_with(services: Vec<ServiceDescribe>) -> RpcRouter {
        let router = RpcRouter::new();
        for service in services {
            router.register_method(service);
        }
        router
    }

    #[test]
    fn test_value_type_matches() {
        assert!(ValueType::Integral.matches(&json!(3)));
        assert!(!ValueType::Integral.matches(&json!(3.5)));
        assert!(ValueType::Numeric.matches(&json!(3)));
        assert!(ValueType::Numeric.matches(&json!(3.5)));
        assert!(ValueType::String.matches(&json!("x")));
        assert!(ValueType::Bool.matches(&json!(false)));
        assert!(ValueType::Array.matches(&json!([])));
        assert!(ValueType::Object.matches(&json!({})));
        assert!(ValueType::Null.matches(&Value::Null));
        assert!(!ValueType::Null.matches(&json!(0)));
    }

    #[test]
    fn test_builder_requires_handler_and_return_type() {
        let missing_handler = ServiceDescribe::builder("m").returns(ValueType::Null).build();
        assert!(matches!(missing_handler, Err(RpcError::InvalidService(_))));

        let missing_return = ServiceDescribe::builder("m").handler(|_| Ok(Value::Null)).build();
        assert!(matches!(missing_return, Err(RpcError::InvalidService(_))));

        let empty_name = ServiceDescribe::builder("")
            .returns(ValueType::Null)
            .handler(|_| Ok(Value::Null))
            .build();
        assert!(matches!(empty_name, Err(RpcError::InvalidService(_))));
    }

    #[test]
    fn test_successful_call() {
        let router = router_with(vec![add_service()]);
        let request = RpcRequest::new("add", json!({"num1": 2, "num2": 3}));

        let response = router.handle(&request);
        assert_eq!(response.id, request.id);
        assert_eq!(response.rcode, RespCode::Success);
        assert_eq!(response.result, json!(5));
    }

    #[test]
    fn test_unknown_method() {
        let router = router_with(vec![add_service()]);
        let response = router.handle(&RpcRequest::new("mul", json!({})));
        assert_eq!(response.rcode, RespCode::ServiceNotFound);
    }

    #[test]
    fn test_param_checks_stop_at_first_problem() {
        let router = router_with(vec![add_service()]);

        let missing = router.handle(&RpcRequest::new("add", json!({"num1": 2})));
        assert_eq!(missing.rcode, RespCode::InvalidParams);

        let mistyped = router.handle(&RpcRequest::new("add", json!({"num1": "2", "num2": 3})));
        assert_eq!(mistyped.rcode, RespCode::InvalidParams);

        let err = add_service().check_params(&json!({"num2": "x"})).unwrap_err();
        assert!(err.to_string().contains("num1"));
    }

    #[test]
    fn test_wrong_return_type_is_internal_error() {
        let service = ServiceDescribe::builder("broken")
            .returns(ValueType::Integral)
            .handler(|_| Ok(json!("not a number")))
            .build()
            .unwrap();
        let router = router_with(vec![service]);

        let response = router.handle(&RpcRequest::new("broken", json!({})));
        assert_eq!(response.rcode, RespCode::InternalError);
        assert_eq!(response.result, Value::Null);
    }

    #[test]
    fn test_handler_error_and_panic_are_internal_errors() {
        let failing = ServiceDescribe::builder("fail")
            .returns(ValueType::Null)
            .handler(|_| Err(anyhow::anyhow!("database unavailable")))
            .build()
            .unwrap();
        let panicking = ServiceDescribe::builder("panic")
            .returns(ValueType::Null)
            .handler(|_| panic!("boom"))
            .build()
            .unwrap();
        let router = router_with(vec![failing, panicking]);

        assert_eq!(
            router.handle(&RpcRequest::new("fail", json!({}))).rcode,
            RespCode::InternalError
        );
        assert_eq!(
            router.handle(&RpcRequest::new("panic", json!({}))).rcode,
            RespCode::InternalError
        );
    }

    #[test]
    fn test_register_replace_and_remove() {
        let router = router_with(vec![add_service()]);
        assert!(router.has_method("add"));

        router.register_method(add_service());
        assert_eq!(router.methods(), vec!["add".to_string()]);

        assert!(router.remove_method("add"));
        assert!(!router.remove_method("add"));
        assert!(!router.has_method("add"));
    }

    #[test]
    fn test_on_rpc_request_replies_on_connection() {
        let router = router_with(vec![add_service()]);
        let memory = Arc::new(MemoryConnection::new());
        let conn: ConnectionRef = memory.clone();

        let request = RpcRequest::new("add", json!({"num1": 40, "num2": 2}));
        let id = request.id.clone();
        router.on_rpc_request(&conn, request);

        let sent = memory.take_sent();
        assert_eq!(sent.len(), 1);
        let response = RpcResponse::try_from(sent[0].clone()).unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.result, json!(42));
    }

    #[test]
    fn test_served_counter_resets_on_take() {
        let router = router_with(vec![add_service()]);
        for _ in 0..3 {
            router.handle(&RpcRequest::new("add", json!({"num1": 1, "num2": 1})));
        }
        router.handle(&RpcRequest::new("missing", json!({})));

        assert_eq!(router.take_served(), 4);
        assert_eq!(router.take_served(), 0);
    }

    #[test]
    fn test_call_error_display_and_source() {
        let invalid = CallError::InvalidParams("missing num1".to_string());
        let internal = CallError::Internal("handler panicked".to_string());
        assert_eq!(invalid.to_string(), "invalid parameters: missing num1");
        assert_eq!(internal.to_string(), "internal error: handler panicked");

        let boxed: Box<dyn std::error::Error> = Box::new(internal);
        assert!(boxed.source().is_none());
    }
}
