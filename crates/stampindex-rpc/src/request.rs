//! JSON-RPC wire types as spoken by bitcoind.
//!
//! bitcoind accepts `"1.0"` requests and answers with `result`, `error` and
//! `id` always present (`null` when unused).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC request ID: string, number, or null.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    #[default]
    Null,
}

/// A JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: RpcId,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "1.0".into(),
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }
}

/// bitcoind's "Invalid address or key" code, also used for unknown blocks
/// and transactions.
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn is_not_found(&self) -> bool {
        self.code == RPC_INVALID_ADDRESS_OR_KEY
    }
}

/// A JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: RpcId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id: RpcId::Number(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: JsonRpcError) -> Self {
        Self {
            id: RpcId::Number(id),
            result: None,
            error: Some(error),
        }
    }

    /// Unwrap the result value or return the node's error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
