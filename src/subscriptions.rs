use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::credentials::Credentials;
use crate::error::{ClientError, NetworkError, SubscriptionError};
use crate::protocol::{ClientMessage, GraphQlRequest, ServerMessage};
use crate::request_key::request_key;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callbacks for one logical subscription, invoked from the channel's reader
/// task. After `on_error` or `on_complete`, nothing further is delivered.
pub trait SubscriptionHandler: Send + 'static {
    fn on_data(&mut self, data: Value);
    fn on_error(&mut self, error: ClientError);
    fn on_complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Subscribed,
}

struct SubscriptionEntry {
    state: EntryState,
    handler: Arc<StdMutex<Box<dyn SubscriptionHandler>>>,
}

/// One live streaming connection. Individual subscriptions never own it;
/// they hold a `Weak` reference for cancellation only.
struct Connection {
    generation: u64,
    outbound: mpsc::Sender<Message>,
    entries: DashMap<String, SubscriptionEntry>,
}

struct ManagerInner {
    endpoint: String,
    send_buffer: usize,
    credentials: Arc<Credentials>,
    connection: Mutex<Option<Arc<Connection>>>,
    generations: AtomicU64,
}

/// Owns the single persistent streaming connection and multiplexes logical
/// subscriptions onto it by identifier. The connection opens lazily on the
/// first `subscribe` and again on the first `subscribe` after a closure;
/// there is no background reconnect loop.
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(endpoint: String, send_buffer: usize, credentials: Arc<Credentials>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                endpoint,
                send_buffer,
                credentials,
                connection: Mutex::new(None),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub async fn subscribe(
        &self,
        query: &str,
        variables: Value,
        handler: Box<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionHandle, ClientError> {
        let request = GraphQlRequest {
            query: query.to_owned(),
            variables,
            operation_name: None,
        };
        let id = request_key(&request.query, &request.variables, None);

        let mut slot = self.inner.connection.lock().await;
        let connection = match slot.as_ref().filter(|c| !c.outbound.is_closed()) {
            Some(live) => live.clone(),
            None => {
                let opened = open_connection(self.inner.clone()).await?;
                *slot = Some(opened.clone());
                opened
            }
        };

        // Replace semantics: a live subscription with the same identity is
        // torn down before the new one starts.
        if let Some((_, stale)) = connection.entries.remove(&id) {
            debug!(%id, "replacing live subscription with identical identity");
            if let Ok(stop) = encode(&ClientMessage::Stop { id: id.clone() }) {
                let _ = connection.outbound.try_send(stop);
            }
            if let Ok(mut handler) = stale.handler.lock() {
                handler.on_complete();
            }
        }

        let start = encode(&ClientMessage::Subscribe {
            id: id.clone(),
            payload: request,
        })?;
        connection.entries.insert(
            id.clone(),
            SubscriptionEntry {
                state: EntryState::Pending,
                handler: Arc::new(StdMutex::new(handler)),
            },
        );

        if connection.outbound.send(start).await.is_err() {
            // The connection died under us; if teardown already drained the
            // entry it also delivered the terminal callback.
            connection.entries.remove(&id);
            return Err(ClientError::Network(NetworkError::ChannelClosed));
        }
        if let Some(mut entry) = connection.entries.get_mut(&id) {
            entry.state = EntryState::Subscribed;
        }
        debug!(%id, "subscribed");

        Ok(SubscriptionHandle {
            id,
            connection: Arc::downgrade(&connection),
        })
    }

    /// Close the streaming connection. Live subscriptions receive their
    /// `on_complete`; the next `subscribe` reconnects.
    pub async fn close(&self) {
        let taken = self.inner.connection.lock().await.take();
        if let Some(connection) = taken {
            info!("closing subscription channel");
            let _ = connection.outbound.send(Message::Close(None)).await;
        }
    }
}

async fn open_connection(inner: Arc<ManagerInner>) -> Result<Arc<Connection>, ClientError> {
    info!(endpoint = %inner.endpoint, "opening subscription channel");
    let mut ws_request = inner.endpoint.as_str().into_client_request()?;
    ws_request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static("graphql-transport-ws"),
    );
    let (mut socket, _) = connect_async(ws_request).await?;

    // Channel-level handshake: init carrying the current credential, then
    // wait for the ack.
    let payload = inner
        .credentials
        .access_token()
        .await
        .map(|token| json!({ "authorization": format!("Bearer {token}") }));
    socket
        .send(encode(&ClientMessage::ConnectionInit { payload })?)
        .await?;

    loop {
        let message = match socket.next().await {
            Some(frame) => frame?,
            None => return Err(ClientError::Network(NetworkError::ChannelClosed)),
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::ConnectionAck) => break,
                Ok(ServerMessage::Ping) => {
                    socket.send(encode(&ClientMessage::Pong)?).await?;
                }
                Ok(other) => warn!(?other, "unexpected message before connection ack"),
                Err(e) => warn!(error = %e, "unparseable message before connection ack"),
            },
            Message::Close(_) => return Err(ClientError::Network(NetworkError::ChannelClosed)),
            _ => {}
        }
    }
    debug!("subscription channel acknowledged");

    let (sink, stream) = socket.split();
    let (outbound, outbound_rx) = mpsc::channel(inner.send_buffer);
    let connection = Arc::new(Connection {
        generation: inner.generations.fetch_add(1, Ordering::SeqCst),
        outbound,
        entries: DashMap::new(),
    });

    tokio::spawn(write_loop(sink, outbound_rx));
    tokio::spawn(read_loop(inner, connection.clone(), stream));
    Ok(connection)
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut outbound: mpsc::Receiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    inner: Arc<ManagerInner>,
    connection: Arc<Connection>,
    mut stream: SplitStream<WsStream>,
) {
    let failure = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => dispatch_message(&connection, &text),
            Some(Ok(Message::Close(_))) | None => break None,
            Some(Ok(_)) => {}
            Some(Err(e)) => break Some(e),
        }
    };
    teardown(&inner, &connection, failure).await;
}

/// Fan one inbound frame out to the subscription it names.
fn dispatch_message(connection: &Arc<Connection>, text: &str) {
    let message = match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "dropping unparseable frame");
            return;
        }
    };

    match message {
        ServerMessage::Next { id, payload } => {
            // Clone the handler out so no map guard is held across the
            // callback; a handler may cancel from inside `on_data`.
            let handler = match connection.entries.get(&id) {
                Some(entry) => {
                    if entry.state == EntryState::Pending {
                        debug!(%id, "data arrived before start settled");
                    }
                    entry.handler.clone()
                }
                None => {
                    debug!(%id, "data for unknown subscription");
                    return;
                }
            };
            if let Ok(mut handler) = handler.lock() {
                handler.on_data(payload);
            };
        }
        ServerMessage::Error { id, payload } => {
            if let Some((_, entry)) = connection.entries.remove(&id) {
                let error = ClientError::Subscription(SubscriptionError {
                    reason: render_error_payload(&payload),
                    payload: Some(payload),
                });
                if let Ok(mut handler) = entry.handler.lock() {
                    handler.on_error(error);
                }
            }
        }
        ServerMessage::Complete { id } => {
            if let Some((_, entry)) = connection.entries.remove(&id) {
                debug!(%id, "subscription completed by server");
                if let Ok(mut handler) = entry.handler.lock() {
                    handler.on_complete();
                }
            }
        }
        ServerMessage::Ping => {
            if let Ok(pong) = encode(&ClientMessage::Pong) {
                let _ = connection.outbound.try_send(pong);
            }
        }
        ServerMessage::ConnectionAck => debug!("redundant connection ack"),
    }
}

/// Whole-connection closure: every remaining entry gets exactly one terminal
/// callback, then the connection slot is released for lazy reconnection.
async fn teardown(
    inner: &Arc<ManagerInner>,
    connection: &Arc<Connection>,
    failure: Option<tokio_tungstenite::tungstenite::Error>,
) {
    {
        let mut slot = inner.connection.lock().await;
        let stale = slot
            .as_ref()
            .is_some_and(|current| current.generation == connection.generation);
        if stale {
            *slot = None;
        }
    }

    let terminal = failure.map(|cause| {
        ClientError::Subscription(SubscriptionError {
            reason: format!("streaming connection lost: {cause}"),
            payload: None,
        })
    });
    match &terminal {
        Some(error) => warn!(error = %error, "subscription channel closed abnormally"),
        None => info!("subscription channel closed"),
    }

    let ids: Vec<String> = connection.entries.iter().map(|e| e.key().clone()).collect();
    for id in ids {
        if let Some((_, entry)) = connection.entries.remove(&id) {
            if let Ok(mut handler) = entry.handler.lock() {
                match &terminal {
                    Some(error) => handler.on_error(error.clone()),
                    None => handler.on_complete(),
                }
            }
        }
    }
}

fn render_error_payload(payload: &Value) -> String {
    match payload {
        Value::Array(entries) => {
            let messages: Vec<&str> = entries
                .iter()
                .filter_map(|entry| entry.get("message").and_then(Value::as_str))
                .collect();
            if messages.is_empty() {
                payload.to_string()
            } else {
                messages.join("; ")
            }
        }
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}

fn encode(message: &ClientMessage) -> Result<Message, ClientError> {
    Ok(Message::Text(serde_json::to_string(message)?))
}

/// Cancellation handle for one subscription. Dropping the handle does not
/// cancel; call [`SubscriptionHandle::cancel`].
pub struct SubscriptionHandle {
    id: String,
    connection: Weak<Connection>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancel this subscription: remove it locally and send a stop message
    /// if the connection is still open. Idempotent; a no-op once the
    /// subscription or its connection has closed. No callback fires for a
    /// caller-initiated cancellation.
    pub fn cancel(&self) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        if connection.entries.remove(&self.id).is_some() {
            debug!(id = %self.id, "unsubscribed");
            if let Ok(stop) = encode(&ClientMessage::Stop {
                id: self.id.clone(),
            }) {
                let _ = connection.outbound.try_send(stop);
            }
        }
    }
}
