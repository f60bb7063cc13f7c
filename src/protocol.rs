use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of one request-response exchange. Query text and variables are
/// opaque to the client; shape knowledge lives in the typed layer above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQlRequest {
    pub query: String,
    pub variables: Value,
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlResponse {
    pub data: Option<Value>,
    pub errors: Option<Vec<GraphQlErrorEntry>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlErrorEntry {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

/// Outbound streaming-channel envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectionInit {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Subscribe { id: String, payload: GraphQlRequest },
    Stop { id: String },
    Pong,
}

/// Inbound streaming-channel envelope. `next` and `data` are wire synonyms.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck,
    #[serde(alias = "data")]
    Next { id: String, payload: Value },
    Error { id: String, payload: Value },
    Complete { id: String },
    Ping,
}
