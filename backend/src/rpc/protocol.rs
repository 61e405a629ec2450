use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Caller lacks the permission the method's group requires.
pub const UNAUTHORIZED: i32 = 401;

/// JSON-RPC error object.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(PARSE_ERROR, format!("Parse error: {detail}"))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, detail)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, detail.to_string())
    }

    pub fn unauthorized(method: &str) -> Self {
        Self::new(UNAUTHORIZED, format!("Permission denied for {method}"))
    }
}

impl From<sea_orm::DbErr> for RpcError {
    fn from(err: sea_orm::DbErr) -> Self {
        RpcError::internal(format!("Database error: {err}"))
    }
}

/// Keeps an explicit `"id": null` apart from a missing id.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// `None` marks a notification.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// A decoded websocket or HTTP payload.
#[derive(Debug, PartialEq)]
pub enum Payload {
    Single(Value),
    Batch(Vec<Value>),
}

pub fn parse_payload(text: &str) -> Result<Payload, RpcError> {
    match serde_json::from_str::<Value>(text).map_err(RpcError::parse_error)? {
        Value::Array(items) => Ok(Payload::Batch(items)),
        other => Ok(Payload::Single(other)),
    }
}

/// Validates one envelope. On failure the error carries whatever id could be
/// recovered, `null` otherwise.
pub fn validate_request(value: Value) -> Result<RpcRequest, (Value, RpcError)> {
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    if !value.is_object() {
        return Err((id, RpcError::invalid_request("Request must be an object")));
    }
    let request: RpcRequest = serde_json::from_value(value)
        .map_err(|e| (id.clone(), RpcError::invalid_request(format!("Invalid request: {e}"))))?;
    if request.jsonrpc != JSONRPC_VERSION {
        return Err((id, RpcError::invalid_request("jsonrpc must be \"2.0\"")));
    }
    if request.method.is_empty() {
        return Err((id, RpcError::invalid_request("method must not be empty")));
    }
    Ok(request)
}
