//! JSON-RPC 2.0 envelopes
//!
//! Requests and responses travel as single UTF-8 datagrams. A response
//! carries either `result` or `error`, always together with the request id
//! (`null` when the id could not be read).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{codes, IpcError};
use crate::JSONRPC_VERSION;

/// Request sent to the daemon
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, params: Value, id: impl Into<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: id.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, IpcError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error member of a response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(codes::PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, "Invalid Request").with_data(Value::String(detail.into()))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "Method not found")
            .with_data(Value::String(method.to_string()))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal_error() -> Self {
        Self::new(codes::INTERNAL_ERROR, "Internal error")
    }
}

/// Response returned by the daemon
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(default)]
    pub id: Value,
}

impl ResponseEnvelope {
    /// Create a success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response
    pub fn error(id: Value, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_json(&self) -> Result<String, IpcError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Result value, or the remote error as `ServiceFailure`
    pub fn into_result(self) -> Result<Value, IpcError> {
        match self.error {
            Some(error) => Err(IpcError::ServiceFailure {
                code: error.code,
                message: error.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = RequestEnvelope::new("sen0395.status", json!({"name": "hall"}), 7);
        let text = req.to_json().unwrap();
        let back: RequestEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, req);
        assert_eq!(back.jsonrpc, "2.0");
    }

    #[test]
    fn test_request_without_params() {
        let back: RequestEnvelope =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"rpio.status","id":"a"}"#).unwrap();
        assert!(back.params.is_null());
        assert_eq!(back.id, json!("a"));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = ResponseEnvelope::error(json!(3), ErrorObject::method_not_found("nope"));
        let value: Value = serde_json::from_str(&resp.to_json().unwrap()).unwrap();
        assert_eq!(value["id"], json!(3));
        assert_eq!(value["error"]["code"], json!(-32601));
        assert!(value.get("result").is_none());

        let back: ResponseEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, resp);
        match back.into_result() {
            Err(IpcError::ServiceFailure { code, .. }) => assert_eq!(code, codes::METHOD_NOT_FOUND),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_success_response() {
        let resp = ResponseEnvelope::success(Value::Null, json!([{"result": "done"}]));
        assert!(!resp.is_error());
        assert_eq!(resp.into_result().unwrap(), json!([{"result": "done"}]));
    }
}
