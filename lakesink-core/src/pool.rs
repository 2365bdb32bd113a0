//! Pooling of remote client handles. Handles are expensive to create, so
//! partitions map onto a small set of pooled handles via the configured
//! [`PoolingPolicy`]. Each pool key holds at most one live handle; creation
//! and replacement for a key are serialized through a per-key gate so
//! concurrent acquires never race two handles into existence.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::Result;
use crate::client::{IngestClient, IngestConnector};
use crate::config::{PoolConfig, PoolingPolicy};
use crate::error::Error;
use crate::metrics::SinkMetrics;
use crate::record::TopicPartition;

const STATE_OPEN: u8 = 0;
const STATE_INVALIDATED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Identity of one pooled handle slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum PoolKey {
    Shared,
    Group { topic: Arc<str>, slot: i32 },
}

impl PoolKey {
    fn for_partition(config: &PoolConfig, partition: &TopicPartition) -> Self {
        match config.policy {
            PoolingPolicy::Shared => PoolKey::Shared,
            PoolingPolicy::Isolated => PoolKey::Group {
                topic: Arc::clone(&partition.topic),
                slot: partition.partition / config.partitions_per_client as i32,
            },
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKey::Shared => write!(f, "shared"),
            PoolKey::Group { topic, slot } => write!(f, "{topic}-g{slot}"),
        }
    }
}

/// A handle owned by the pool and borrowed by workers for one flush. State
/// transitions are atomic; a concurrent holder of an invalidated handle
/// observes it on its next acquire.
pub(crate) struct PooledClient<T> {
    id: u64,
    key: PoolKey,
    state: AtomicU8,
    created_at: Instant,
    inner: T,
}

impl<T> PooledClient<T> {
    pub(crate) fn client(&self) -> &T {
        &self.inner
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_OPEN
    }

    /// Returns true when this call performed the transition.
    fn invalidate(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_OPEN,
                STATE_INVALIDATED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl<T> fmt::Debug for PooledClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledClient")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

struct Slot<T> {
    /// Serializes creation and replacement for one key.
    gate: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<PooledClient<T>>>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
        }
    }
}

/// The pool service. Explicitly constructed and injected, shut down with the
/// task; never process-global.
pub(crate) struct ClientPool<C: IngestConnector> {
    connector: Arc<C>,
    config: PoolConfig,
    slots: Mutex<HashMap<PoolKey, Arc<Slot<C::Client>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    metrics: Arc<SinkMetrics>,
}

impl<C> ClientPool<C>
where
    C: IngestConnector,
{
    pub(crate) fn new(connector: Arc<C>, config: PoolConfig, metrics: Arc<SinkMetrics>) -> Self {
        Self {
            connector,
            config,
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Returns the live handle for the partition's pool key, creating one if
    /// the slot is empty or its handle was invalidated. Creation failures are
    /// retryable by the caller.
    pub(crate) async fn acquire(
        &self,
        partition: &TopicPartition,
    ) -> Result<Arc<PooledClient<C::Client>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Task("client pool is shut down".to_string()));
        }
        let key = PoolKey::for_partition(&self.config, partition);
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(
                slots
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Slot::new())),
            )
        };
        let _gate = slot.gate.lock().await;

        {
            let current = slot.current.lock();
            if let Some(existing) = current.as_ref()
                && existing.is_open()
            {
                return Ok(Arc::clone(existing));
            }
        }

        // whatever is in the slot is invalidated, close it before replacing
        let stale = slot.current.lock().take();
        if let Some(stale) = stale {
            self.close_handle(&stale).await;
        }

        let name = key.to_string();
        let client = match timeout(self.config.create_timeout(), self.connector.connect(&name))
            .await
        {
            Err(_) => {
                return Err(Error::ClientCreation(format!(
                    "client {name}: creation timed out after {}ms",
                    self.config.create_timeout_ms
                )));
            }
            Ok(Err(e)) => return Err(Error::ClientCreation(format!("client {name}: {e}"))),
            Ok(Ok(client)) => client,
        };

        let pooled = Arc::new(PooledClient {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key,
            state: AtomicU8::new(STATE_OPEN),
            created_at: Instant::now(),
            inner: client,
        });
        self.metrics.clients_created.inc();
        info!(client_id = pooled.id, client = %name, "Created remote ingest client");
        *slot.current.lock() = Some(Arc::clone(&pooled));
        Ok(pooled)
    }

    /// Marks a handle unusable; the next acquire for its key replaces it.
    pub(crate) fn invalidate(&self, handle: &PooledClient<C::Client>) {
        if handle.invalidate() {
            self.metrics.clients_invalidated.inc();
            warn!(
                client_id = handle.id,
                client = %handle.key,
                lived = ?handle.created_at.elapsed(),
                "Invalidated remote ingest client"
            );
        }
    }

    /// Best-effort close of every live handle. Individual close failures are
    /// logged, never propagated.
    pub(crate) async fn close_all(&self) {
        let slots: Vec<Arc<Slot<C::Client>>> =
            { self.slots.lock().values().map(Arc::clone).collect() };
        for slot in slots {
            let _gate = slot.gate.lock().await;
            let handle = slot.current.lock().take();
            if let Some(handle) = handle {
                self.close_handle(&handle).await;
            }
        }
        info!("Closed all remote ingest clients");
    }

    /// Stops handing out handles and closes everything. Idempotent.
    pub(crate) async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_all().await;
    }

    async fn close_handle(&self, handle: &PooledClient<C::Client>) {
        if handle.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return;
        }
        if let Err(e) = handle.inner.close().await {
            warn!(client_id = handle.id, client = %handle.key, err = %e, "Failed to close remote ingest client");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{MockConnector, tp};

    fn pool_config(policy: PoolingPolicy, partitions_per_client: u32) -> PoolConfig {
        PoolConfig {
            policy,
            partitions_per_client,
            create_timeout_ms: 1_000,
        }
    }

    fn metrics() -> Arc<SinkMetrics> {
        Arc::new(SinkMetrics::new())
    }

    #[tokio::test]
    async fn shared_policy_hands_out_one_handle_for_all_partitions() {
        let connector = Arc::new(MockConnector::default());
        let state = Arc::clone(&connector.state);
        let pool = ClientPool::new(connector, pool_config(PoolingPolicy::Shared, 1), metrics());

        let a = pool.acquire(&tp("orders", 0)).await.unwrap();
        let b = pool.acquire(&tp("orders", 7)).await.unwrap();
        let c = pool.acquire(&tp("returns", 2)).await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(b.id, c.id);
        assert_eq!(state.connect_count(), 1);
    }

    #[tokio::test]
    async fn isolated_policy_hands_out_distinct_handles() {
        let connector = Arc::new(MockConnector::default());
        let state = Arc::clone(&connector.state);
        let pool = ClientPool::new(connector, pool_config(PoolingPolicy::Isolated, 1), metrics());

        let a = pool.acquire(&tp("orders", 0)).await.unwrap();
        let b = pool.acquire(&tp("orders", 1)).await.unwrap();
        assert_ne!(a.id, b.id);

        // stable for the same partition
        let a_again = pool.acquire(&tp("orders", 0)).await.unwrap();
        assert_eq!(a.id, a_again.id);
        assert_eq!(state.connect_count(), 2);
    }

    #[tokio::test]
    async fn isolated_policy_groups_partitions_per_client() {
        let connector = Arc::new(MockConnector::default());
        let pool = ClientPool::new(connector, pool_config(PoolingPolicy::Isolated, 2), metrics());

        let p0 = pool.acquire(&tp("orders", 0)).await.unwrap();
        let p1 = pool.acquire(&tp("orders", 1)).await.unwrap();
        let p2 = pool.acquire(&tp("orders", 2)).await.unwrap();
        let other_topic = pool.acquire(&tp("returns", 0)).await.unwrap();

        assert_eq!(p0.id, p1.id);
        assert_ne!(p1.id, p2.id);
        assert_ne!(p0.id, other_topic.id);
    }

    #[tokio::test]
    async fn invalidated_handle_is_closed_and_replaced() {
        let connector = Arc::new(MockConnector::default());
        let state = Arc::clone(&connector.state);
        let pool = ClientPool::new(connector, pool_config(PoolingPolicy::Shared, 1), metrics());
        let partition = tp("orders", 0);

        let first = pool.acquire(&partition).await.unwrap();
        pool.invalidate(&first);
        assert!(!first.is_open());

        let second = pool.acquire(&partition).await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.is_open());
        // the stale handle was closed during replacement
        assert_eq!(state.closed_clients(), vec![0]);
    }

    #[tokio::test]
    async fn creation_failure_is_retryable() {
        let connector = Arc::new(MockConnector::default());
        let state = Arc::clone(&connector.state);
        state.fail_next_connects(1);
        let pool = ClientPool::new(connector, pool_config(PoolingPolicy::Shared, 1), metrics());
        let partition = tp("orders", 0);

        let err = pool.acquire(&partition).await.unwrap_err();
        assert!(matches!(err, Error::ClientCreation(_)));

        // the next acquire starts over and succeeds
        let handle = pool.acquire(&partition).await.unwrap();
        assert!(handle.is_open());
    }

    #[tokio::test]
    async fn concurrent_acquires_create_one_handle() {
        let connector = Arc::new(MockConnector::default());
        let state = Arc::clone(&connector.state);
        state.set_connect_delay(Duration::from_millis(50));
        let pool = Arc::new(ClientPool::new(
            connector,
            pool_config(PoolingPolicy::Shared, 1),
            metrics(),
        ));

        let left = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&tp("orders", 0)).await })
        };
        let right = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&tp("orders", 1)).await })
        };

        let a = left.await.unwrap().unwrap();
        let b = right.await.unwrap().unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(state.connect_count(), 1);
    }

    #[tokio::test]
    async fn handle_debug_output_carries_id_and_state() {
        let connector = Arc::new(MockConnector::default());
        let pool = ClientPool::new(connector, pool_config(PoolingPolicy::Shared, 1), metrics());

        let handle = pool.acquire(&tp("orders", 0)).await.unwrap();
        let rendered = format!("{handle:?}");
        assert!(rendered.contains("PooledClient"));
        assert!(rendered.contains("id: 0"));
        assert!(rendered.contains("state: 0"));
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_rejects_acquires() {
        let connector = Arc::new(MockConnector::default());
        let state = Arc::clone(&connector.state);
        let pool = ClientPool::new(connector, pool_config(PoolingPolicy::Isolated, 1), metrics());

        pool.acquire(&tp("orders", 0)).await.unwrap();
        pool.acquire(&tp("orders", 1)).await.unwrap();

        pool.shutdown().await;
        assert_eq!(state.closed_clients().len(), 2);

        let err = pool.acquire(&tp("orders", 0)).await.unwrap_err();
        assert!(matches!(err, Error::Task(_)));
    }
}
