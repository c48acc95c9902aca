// =============================================================================
// Partitioned serial executor
// =============================================================================
//
// N single-threaded actor queues; work for a key always lands on the same
// queue (hash of the key), so work addressed to one entity id executes
// serially while different ids run in parallel. This is the ordering
// backbone for the signal coordinator (per symbol) and the trade coordinator
// (per trade id).
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct PartitionPool {
    name: &'static str,
    senders: Vec<mpsc::UnboundedSender<Job>>,
}

impl PartitionPool {
    /// Spawn `partitions` worker tasks, each draining its own queue in order.
    pub fn new(name: &'static str, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        for index in 0..partitions {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            senders.push(tx);
            tokio::spawn(async move {
                debug!(pool = name, partition = index, "partition worker started");
                while let Some(job) = rx.recv().await {
                    job.await;
                }
                debug!(pool = name, partition = index, "partition worker stopped");
            });
        }
        info!(pool = name, partitions, "partition pool started");
        Self { name, senders }
    }

    fn index_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }

    /// Fire-and-forget: enqueue work on the key's partition.
    pub fn dispatch<F>(&self, key: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let index = self.index_for(key);
        if self.senders[index].send(Box::pin(fut)).is_err() {
            debug!(pool = self.name, key, "partition worker gone; job dropped");
        }
    }

    /// Run work on the key's partition and await its result. All state
    /// transitions for one key observe strict happens-before ordering.
    ///
    /// Enqueues synchronously; the returned future owns only the reply
    /// channel, so callers may collect many before awaiting any.
    pub fn run_on<F, T>(&self, key: &str, fut: F) -> impl Future<Output = T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(key, async move {
            let _ = tx.send(fut.await);
        });
        async move { rx.await.expect("partition worker dropped reply channel") }
    }

    pub fn partition_count(&self) -> usize {
        self.senders.len()
    }
}

impl std::fmt::Debug for PartitionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionPool")
            .field("name", &self.name)
            .field("partitions", &self.senders.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn same_key_executes_serially() {
        let pool = PartitionPool::new("test", 4);
        let counter = Arc::new(AtomicU64::new(0));
        let max_seen = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let counter = counter.clone();
            let max_seen = max_seen.clone();
            handles.push(pool.run_on("trade-1", async move {
                // Concurrent executions of the same key would both observe 1.
                let inflight = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(inflight, Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        futures_util::future::join_all(handles).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_on_returns_result() {
        let pool = PartitionPool::new("test", 2);
        let value = pool.run_on("key", async { 21 * 2 }).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn different_keys_land_deterministically() {
        let pool = PartitionPool::new("test", 8);
        assert_eq!(pool.index_for("trade-1"), pool.index_for("trade-1"));
        assert_eq!(pool.partition_count(), 8);
    }
}
