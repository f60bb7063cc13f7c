use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::GraphQlErrorEntry;

/// Every outcome surfaced to a caller carries exactly one of these kinds.
///
/// Outcomes are shared between all waiters attached to the same in-flight
/// exchange, so the whole taxonomy is `Clone`; underlying causes are kept
/// behind `Arc`.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Transport-level failure. Not retried here; callers own retry policy.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    /// The credential pair is no longer usable. The client clears it and
    /// fails every request with this kind until a new pair is set.
    #[error("session expired, re-authentication required")]
    SessionExpired,
    /// Well-formed response carrying protocol-level errors. Never retried.
    #[error("graphql error: {0}")]
    GraphQl(GraphQlErrorList),
    /// Abnormal termination of a single live subscription.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

impl ClientError {
    pub fn graphql(errors: Vec<GraphQlErrorEntry>) -> Self {
        ClientError::GraphQl(GraphQlErrorList(errors))
    }
}

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("http request failed: {0}")]
    Http(#[source] Arc<reqwest::Error>),
    #[error("websocket failure: {0}")]
    WebSocket(#[source] Arc<tokio_tungstenite::tungstenite::Error>),
    #[error("malformed payload: {0}")]
    Body(#[source] Arc<serde_json::Error>),
    #[error("streaming channel closed")]
    ChannelClosed,
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Network(NetworkError::Http(Arc::new(e)))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Network(NetworkError::WebSocket(Arc::new(e)))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Network(NetworkError::Body(Arc::new(e)))
    }
}

/// Full top-level error list from a protocol-level failure.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQlErrorList(pub Vec<GraphQlErrorEntry>);

impl fmt::Display for GraphQlErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            f.write_str(&entry.message)?;
            first = false;
        }
        Ok(())
    }
}

/// Terminal failure of one subscription: a server `error` frame or the loss
/// of the whole streaming connection.
#[derive(Debug, Clone, Error)]
#[error("subscription terminated: {reason}")]
pub struct SubscriptionError {
    pub reason: String,
    /// Raw server error payload, when the server sent one.
    pub payload: Option<Value>,
}
