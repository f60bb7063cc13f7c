use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::ClientError;

/// Access + refresh tokens, both opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access: String,
    pub refresh: String,
}

/// Durable home for the credential pair. The client only ever reads, writes,
/// and clears; storage details never leak into protocol logic.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Option<CredentialPair>;
    async fn save(&self, pair: &CredentialPair);
    async fn clear(&self);
}

/// In-process store; the default when the host app supplies nothing durable.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: RwLock<Option<CredentialPair>>,
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Option<CredentialPair> {
        self.slot.read().await.clone()
    }

    async fn save(&self, pair: &CredentialPair) {
        *self.slot.write().await = Some(pair.clone());
    }

    async fn clear(&self) {
        *self.slot.write().await = None;
    }
}

/// Exchanges a refresh token for a new credential pair.
#[async_trait]
pub trait RefreshExchange: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<CredentialPair, ClientError>;
}

enum CredentialState {
    /// No credential; requests go out anonymous.
    Absent,
    Present(CredentialPair),
    /// Refresh failed terminally. Every request short-circuits to
    /// `SessionExpired` until a new pair is set.
    Expired,
}

pub struct Credentials {
    state: RwLock<CredentialState>,
    store: Arc<dyn CredentialStore>,
    exchange: Arc<dyn RefreshExchange>,
    refresh_gate: Mutex<()>,
    /// Bumped on every state change; lets refresh callers that lost the gate
    /// race detect that the winner already settled the question.
    generation: AtomicU64,
}

impl Credentials {
    pub async fn new(store: Arc<dyn CredentialStore>, exchange: Arc<dyn RefreshExchange>) -> Self {
        let state = match store.load().await {
            Some(pair) => CredentialState::Present(pair),
            None => CredentialState::Absent,
        };
        Self {
            state: RwLock::new(state),
            store,
            exchange,
            refresh_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub async fn get(&self) -> Option<CredentialPair> {
        match &*self.state.read().await {
            CredentialState::Present(pair) => Some(pair.clone()),
            _ => None,
        }
    }

    pub async fn access_token(&self) -> Option<String> {
        self.get().await.map(|pair| pair.access)
    }

    pub(crate) async fn is_expired(&self) -> bool {
        matches!(*self.state.read().await, CredentialState::Expired)
    }

    /// Overwrite or remove the credential pair. The swap is atomic with
    /// respect to concurrent readers, and persists through the store before
    /// the lock is released. Setting a pair clears the expired latch.
    pub async fn set(&self, pair: Option<CredentialPair>) {
        let mut state = self.state.write().await;
        match pair {
            Some(pair) => {
                self.store.save(&pair).await;
                *state = CredentialState::Present(pair);
            }
            None => {
                self.store.clear().await;
                *state = CredentialState::Absent;
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn clear(&self) {
        self.set(None).await;
    }

    /// Exchange the refresh token for a fresh pair. Deduplicated: concurrent
    /// callers behind an in-progress refresh observe its outcome instead of
    /// issuing a second exchange. Failure clears the stored pair and latches
    /// the expired state for every waiter.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let observed = self.generation.load(Ordering::SeqCst);
        let _gate = self.refresh_gate.lock().await;

        if self.generation.load(Ordering::SeqCst) != observed {
            // Someone refreshed (or replaced the pair) while we waited.
            return match &*self.state.read().await {
                CredentialState::Present(_) => Ok(()),
                _ => Err(ClientError::SessionExpired),
            };
        }

        // Extract the refresh token, releasing the read guard before any
        // `invalidate` (which takes the write guard on the same lock).
        let refresh_token = match &*self.state.read().await {
            CredentialState::Present(pair) => Some(pair.refresh.clone()),
            _ => None,
        };
        let refresh_token = match refresh_token {
            Some(token) => token,
            None => {
                self.invalidate().await;
                return Err(ClientError::SessionExpired);
            }
        };

        match self.exchange.exchange(&refresh_token).await {
            Ok(pair) => {
                debug!("credential refresh succeeded");
                let mut state = self.state.write().await;
                self.store.save(&pair).await;
                *state = CredentialState::Present(pair);
                self.generation.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "credential refresh failed");
                self.invalidate().await;
                Err(ClientError::SessionExpired)
            }
        }
    }

    /// Terminal auth failure: drop the pair and latch expired.
    pub(crate) async fn invalidate(&self) {
        let mut state = self.state.write().await;
        self.store.clear().await;
        *state = CredentialState::Expired;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}
