//! JSON-RPC 2.0 envelope types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request or notification (no `id` means notification).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: Value,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), result: Some(result), error: None, id }
    }

    pub fn failure(id: Value, error: ErrorObject) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), result: None, error: Some(error), id }
    }

    /// Build a failure response from a `ProxyError`, sanitizing the message
    /// and mapping it to its JSON-RPC error code.
    pub fn from_error(id: Value, err: &crate::error::ProxyError) -> Self {
        Self::failure(id, ErrorObject { code: err.jsonrpc_code(), message: err.sanitize(), data: None })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self { code: Self::PARSE_ERROR, message: message.into(), data: None }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self { code: Self::INVALID_REQUEST, message: message.into(), data: None }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self { code: Self::METHOD_NOT_FOUND, message: format!("method not found: {method}"), data: None }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self { code: Self::INVALID_PARAMS, message: message.into(), data: None }
    }
}

/// Wrap a JSON-RPC `id` (present on requests, absent on notifications) so
/// downstream code never has to special-case `Option<Value>` vs `Value::Null`.
pub fn id_or_null(id: Option<Value>) -> Value {
    id.unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_has_no_id() {
        let req: Request = serde_json::from_str(r#"{"jsonrpc":"2.0","method":"heartbeat"}"#).unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn request_round_trips() {
        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"tools/list","id":1}"#).unwrap();
        assert!(!req.is_notification());
        assert_eq!(req.method, "tools/list");
    }

    #[test]
    fn error_response_serializes_without_result_field() {
        let resp = Response::failure(Value::from(1), ErrorObject::method_not_found("foo"));
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v.get("result").is_none());
        assert_eq!(v["error"]["code"], -32601);
    }

    #[test]
    fn from_error_maps_jsonrpc_code() {
        let err = crate::error::ProxyError::backend_not_found("b1");
        let resp = Response::from_error(Value::from(2), &err);
        assert_eq!(resp.error.unwrap().code, -32002);
    }
}
