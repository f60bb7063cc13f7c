use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::error::ClientError;
use crate::protocol::GraphQlRequest;
use crate::request_key::request_key;
use crate::transport::RequestTransport;

type Outcome = Result<Value, ClientError>;
type Settlement = Arc<watch::Sender<Option<Outcome>>>;

struct Inflight {
    settled: Settlement,
}

/// Guarantees at most one concurrent transport execution per request key.
///
/// The claiming caller does not run the exchange itself: a detached task
/// does, so every caller (claimer included) is just a waiter and dropping
/// any one of them cannot tear down the shared exchange. The exchange is
/// abandoned only once every waiter is gone.
pub struct Dispatcher {
    transport: Arc<dyn RequestTransport>,
    inflight: Arc<DashMap<String, Inflight>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn RequestTransport>) -> Self {
        Self {
            transport,
            inflight: Arc::new(DashMap::new()),
        }
    }

    pub async fn dispatch(&self, request: GraphQlRequest) -> Outcome {
        let key = request_key(
            &request.query,
            &request.variables,
            request.operation_name.as_deref(),
        );

        loop {
            // The entry API holds the shard lock, so claim-or-attach is
            // atomic: no window between the existence check and the insert.
            let mut waiter = match self.inflight.entry(key.clone()) {
                Entry::Occupied(entry) => entry.get().settled.subscribe(),
                Entry::Vacant(slot) => {
                    let (tx, rx) = watch::channel(None);
                    let settled = Arc::new(tx);
                    slot.insert(Inflight {
                        settled: settled.clone(),
                    });
                    self.spawn_exchange(key.clone(), request.clone(), settled);
                    rx
                }
            };

            match waiter.wait_for(|outcome| outcome.is_some()).await {
                Ok(outcome) => {
                    if let Some(outcome) = outcome.as_ref().cloned() {
                        return outcome;
                    }
                }
                // The exchange was abandoned before settling (every earlier
                // waiter cancelled). Claim a fresh one.
                Err(_) => continue,
            };
        }
    }

    fn spawn_exchange(&self, key: String, request: GraphQlRequest, settled: Settlement) {
        let transport = self.transport.clone();
        let inflight = self.inflight.clone();

        tokio::spawn(async move {
            tokio::select! {
                outcome = transport.execute(&request) => {
                    // Remove before publishing: late arrivals must claim a
                    // fresh exchange, never attach to a settled one.
                    inflight.remove_if(&key, |_, entry| Arc::ptr_eq(&entry.settled, &settled));
                    let _ = settled.send(Some(outcome));
                }
                _ = settled.closed() => {
                    debug!("all waiters cancelled, abandoning exchange");
                    inflight.remove_if(&key, |_, entry| Arc::ptr_eq(&entry.settled, &settled));
                }
            }
        });
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    struct GatedTransport {
        hits: AtomicUsize,
        gate: watch::Receiver<bool>,
    }

    impl GatedTransport {
        fn new() -> (Arc<Self>, watch::Sender<bool>) {
            let (tx, rx) = watch::channel(false);
            (
                Arc::new(Self {
                    hits: AtomicUsize::new(0),
                    gate: rx,
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl RequestTransport for GatedTransport {
        async fn execute(&self, request: &GraphQlRequest) -> Result<Value, ClientError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let mut gate = self.gate.clone();
            let _ = gate.wait_for(|open| *open).await;
            Ok(json!({ "echo": request.query }))
        }
    }

    fn req(query: &str) -> GraphQlRequest {
        GraphQlRequest {
            query: query.into(),
            variables: json!({}),
            operation_name: None,
        }
    }

    #[tokio::test]
    async fn concurrent_identical_requests_share_one_exchange() {
        let (transport, gate) = GatedTransport::new();
        let dispatcher = Dispatcher::new(transport.clone());

        let first = dispatcher.dispatch(req("{ me { id } }"));
        let second = dispatcher.dispatch(req("{ me { id } }"));
        let both = tokio::join!(first, async {
            gate.send(true).unwrap();
            second.await
        });

        assert_eq!(both.0.unwrap(), both.1.unwrap());
        assert_eq!(transport.hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share() {
        let (transport, gate) = GatedTransport::new();
        let dispatcher = Dispatcher::new(transport.clone());
        gate.send(true).unwrap();

        let a = dispatcher.dispatch(req("{ contacts { id } }")).await;
        let b = dispatcher.dispatch(req("{ leads { id } }")).await;
        assert_ne!(a.unwrap(), b.unwrap());
        assert_eq!(transport.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn settled_entries_are_not_reused() {
        let (transport, gate) = GatedTransport::new();
        let dispatcher = Dispatcher::new(transport.clone());
        gate.send(true).unwrap();

        dispatcher.dispatch(req("{ me }")).await.unwrap();
        dispatcher.dispatch(req("{ me }")).await.unwrap();
        assert_eq!(transport.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn one_cancelled_waiter_does_not_abort_the_exchange() {
        let (transport, gate) = GatedTransport::new();
        let dispatcher = Arc::new(Dispatcher::new(transport.clone()));

        let doomed = tokio::spawn({
            let d = dispatcher.clone();
            async move { d.dispatch(req("{ tasks }")).await }
        });
        let survivor = tokio::spawn({
            let d = dispatcher.clone();
            async move { d.dispatch(req("{ tasks }")).await }
        });
        tokio::task::yield_now().await;

        doomed.abort();
        let _ = doomed.await;
        gate.send(true).unwrap();

        let outcome = survivor.await.unwrap();
        assert_eq!(outcome.unwrap(), json!({ "echo": "{ tasks }" }));
        assert_eq!(transport.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_when_every_waiter_cancels() {
        let (transport, gate) = GatedTransport::new();
        let dispatcher = Arc::new(Dispatcher::new(transport.clone()));

        let a = tokio::spawn({
            let d = dispatcher.clone();
            async move { d.dispatch(req("{ campaigns }")).await }
        });
        let b = tokio::spawn({
            let d = dispatcher.clone();
            async move { d.dispatch(req("{ campaigns }")).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(transport.hits.load(Ordering::SeqCst), 1);

        a.abort();
        b.abort();
        let _ = a.await;
        let _ = b.await;
        // Let the executor observe the closed settlement channel.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.in_flight(), 0);

        // A later call claims a fresh exchange.
        gate.send(true).unwrap();
        dispatcher.dispatch(req("{ campaigns }")).await.unwrap();
        assert_eq!(transport.hits.load(Ordering::SeqCst), 2);
    }
}
