//! Unified GraphQL transport client.
//!
//! One object owns the three protocol concerns the screens above it should
//! never reimplement:
//!
//! - deduplicated request-response exchanges: at most one in-flight exchange
//!   per distinct query + variables, concurrent callers share the outcome;
//! - transparent credential refresh: an unauthorized exchange triggers one
//!   deduplicated refresh and exactly one retry, without losing the caller;
//! - multiplexed subscriptions: any number of logical subscriptions share
//!   one lazily-opened streaming connection, each with its own lifecycle.
//!
//! Construct a [`GraphQlClient`] explicitly and pass it by reference (it is
//! cheaply cloneable); there is no ambient global instance.

mod config;
mod credentials;
mod dispatcher;
mod error;
mod protocol;
mod request_key;
mod subscriptions;
mod transport;

use std::sync::Arc;

use serde_json::Value;

pub use crate::config::Config;
pub use crate::credentials::{
    CredentialPair, CredentialStore, Credentials, MemoryCredentialStore, RefreshExchange,
};
pub use crate::dispatcher::Dispatcher;
pub use crate::error::{ClientError, GraphQlErrorList, NetworkError, SubscriptionError};
pub use crate::protocol::{GraphQlErrorEntry, GraphQlRequest};
pub use crate::request_key::request_key;
pub use crate::subscriptions::{SubscriptionHandle, SubscriptionHandler, SubscriptionManager};
pub use crate::transport::{HttpRefreshExchange, HttpTransport, RequestTransport};

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub operation_name: Option<String>,
}

struct ClientInner {
    credentials: Arc<Credentials>,
    dispatcher: Dispatcher,
    subscriptions: SubscriptionManager,
}

/// The client instance. All handles cloned from one instance share the same
/// credential pair, in-flight table, and streaming connection.
#[derive(Clone)]
pub struct GraphQlClient {
    inner: Arc<ClientInner>,
}

impl GraphQlClient {
    /// Build a client with in-process credential storage.
    pub async fn new(config: Config) -> Result<Self, ClientError> {
        Self::with_store(config, Arc::new(MemoryCredentialStore::default())).await
    }

    /// Build a client on top of a host-supplied durable credential store.
    pub async fn with_store(
        config: Config,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().build()?;
        let refresh = Arc::new(HttpRefreshExchange::new(
            http.clone(),
            config.refresh_endpoint.clone(),
        ));
        let credentials = Arc::new(Credentials::new(store, refresh).await);
        let transport = Arc::new(HttpTransport::new(
            http,
            config.endpoint.clone(),
            credentials.clone(),
        ));
        let dispatcher = Dispatcher::new(transport);
        let subscriptions = SubscriptionManager::new(
            config.subscription_endpoint,
            config.ws_send_buffer,
            credentials.clone(),
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                credentials,
                dispatcher,
                subscriptions,
            }),
        })
    }

    /// Execute a query or mutation. Concurrent calls with identical query
    /// and variables share one underlying exchange and settle together.
    pub async fn request(&self, query: &str, variables: Value) -> Result<Value, ClientError> {
        self.request_with_options(query, variables, RequestOptions::default())
            .await
    }

    pub async fn request_with_options(
        &self,
        query: &str,
        variables: Value,
        options: RequestOptions,
    ) -> Result<Value, ClientError> {
        self.inner
            .dispatcher
            .dispatch(GraphQlRequest {
                query: query.to_owned(),
                variables,
                operation_name: options.operation_name,
            })
            .await
    }

    /// Start a subscription over the shared streaming connection, opening it
    /// if necessary. The returned handle cancels; cancellation is idempotent.
    pub async fn subscribe(
        &self,
        query: &str,
        variables: Value,
        handler: impl SubscriptionHandler,
    ) -> Result<SubscriptionHandle, ClientError> {
        self.inner
            .subscriptions
            .subscribe(query, variables, Box::new(handler))
            .await
    }

    /// Install or remove the credential pair. `None` signs out.
    pub async fn set_credential(&self, pair: Option<CredentialPair>) {
        self.inner.credentials.set(pair).await;
    }

    /// Handle to the shared credential provider.
    pub fn credentials(&self) -> Arc<Credentials> {
        self.inner.credentials.clone()
    }

    /// Close the streaming connection. Pending request-response exchanges
    /// are unaffected; live subscriptions complete. The next `subscribe`
    /// reconnects.
    pub async fn close(&self) {
        self.inner.subscriptions.close().await;
    }
}
