//! JSON-RPC 2.0 envelope types and message classification
//!
//! Incoming payloads are checked for an `id` member before being decoded: its
//! presence (even when `null`) makes the payload a request, its absence a
//! notification.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::RpcError;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error.into_error_object()),
        }
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::failure(Value::Null, RpcError::Parse(detail.into()))
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    /// A reply from the client to a server-initiated request; carries no method.
    ClientResponse(Value),
}

impl JsonRpcMessage {
    /// Classifies a decoded payload. On failure the offending id (or `null`)
    /// is returned alongside the error so a response can still be correlated.
    pub fn from_value(payload: Value) -> Result<Self, (Value, RpcError)> {
        let Some(object) = payload.as_object() else {
            return Err((
                Value::Null,
                RpcError::InvalidRequest("payload must be a JSON object".to_string()),
            ));
        };

        let id = object.get("id").cloned();
        if object.get("method").is_none()
            && (object.contains_key("result") || object.contains_key("error"))
        {
            return Ok(Self::ClientResponse(payload));
        }

        let method = match object.get("method").and_then(Value::as_str) {
            Some(method) if !method.trim().is_empty() => method.to_string(),
            _ => {
                return Err((
                    id.unwrap_or(Value::Null),
                    RpcError::InvalidRequest("method must be a non-empty string".to_string()),
                ))
            }
        };
        let params = object.get("params").cloned();

        Ok(match id {
            Some(id) => Self::Request(JsonRpcRequest::new(id, method, params)),
            None => Self::Notification(JsonRpcNotification::new(method, params)),
        })
    }
}

/// Object-shaped params as a map; `None` and `null` become an empty map.
pub fn params_object(params: Option<&Value>) -> Result<Map<String, Value>, RpcError> {
    match params {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(RpcError::InvalidParams(
            "params must be a JSON object".to_string(),
        )),
    }
}

/// Stable string key for a request id, used to correlate cancellations.
pub fn id_key(id: &Value) -> String {
    id.to_string()
}
