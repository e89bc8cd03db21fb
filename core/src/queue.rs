//! Durable priority-ordered work queue with retries, used directly by the
//! Event and Summary pipelines (two named instances of this type).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::storage::QueueFileStore;
use crate::types::QueuedOperation;

/// Retry/backoff tunables for a queue instance.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction of the computed delay randomized, e.g. 0.2 for +/-20%.
    /// 0.0 disables jitter.
    pub jitter_factor: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_retries: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl QueueConfig {
    /// `min(initial_delay_ms * multiplier^retry_count, max_delay_ms)`, then
    /// jittered by +/- `jitter_factor`.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(retry_count as i32);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0) as u64;
        if self.jitter_factor <= 0.0 {
            return Duration::from_millis(capped);
        }
        let spread = (capped as f64 * self.jitter_factor) as i64;
        if spread == 0 {
            return Duration::from_millis(capped);
        }
        let delta = rand::thread_rng().gen_range(-spread..=spread);
        let jittered = (capped as i64 + delta).max(0) as u64;
        Duration::from_millis(jittered)
    }
}

/// Processor capability borrowed by the queue, not owned. Returns `Ok(true)`
/// on success, `Ok(false)` on a recoverable failure that should retry, and
/// `Err` for a failure the retry policy should also treat as a miss.
#[async_trait]
pub trait QueueProcessor<T>: Send + Sync {
    async fn process(&self, data: &T) -> Result<bool>;
}

fn sort_pending<T>(pending: &mut [QueuedOperation<T>]) {
    pending.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at_ms.cmp(&b.created_at_ms))
    });
}

/// A durable, priority-ordered, at-least-once work queue.
pub struct PersistentQueue<T> {
    name: String,
    pending: Mutex<Vec<QueuedOperation<T>>>,
    store: QueueFileStore,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    processor: Arc<dyn QueueProcessor<T>>,
    paused: AtomicBool,
    shutdown: AtomicBool,
    draining: AtomicBool,
    wake: Notify,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T> PersistentQueue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        dir: impl AsRef<Path>,
        name: impl Into<String>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        processor: Arc<dyn QueueProcessor<T>>,
    ) -> Result<Self> {
        let name = name.into();
        let store = QueueFileStore::new(dir, &name)?;
        let mut loaded: Vec<QueuedOperation<T>> = store.load();
        sort_pending(&mut loaded);
        Ok(PersistentQueue {
            name,
            pending: Mutex::new(loaded),
            store,
            config,
            clock,
            processor,
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            wake: Notify::new(),
            task: std::sync::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue `data`. If `unique_key` matches an existing pending entry,
    /// that entry is evicted and replaced (dedup) rather than appended.
    pub async fn enqueue(
        &self,
        data: T,
        priority: i32,
        unique_key: Option<String>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let op = QueuedOperation {
            id: id.clone(),
            data,
            unique_key: unique_key.clone(),
            priority,
            created_at_ms: self.clock.now_wall_ms(),
            retry_count: 0,
        };

        let mut pending = self.pending.lock().await;
        if let Some(key) = unique_key.as_ref() {
            pending.retain(|existing| existing.unique_key.as_ref() != Some(key));
        }
        pending.push(op);
        sort_pending(&mut pending);
        self.persist_locked(&pending)?;
        drop(pending);
        self.wake.notify_one();
        Ok(id)
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|op| op.id != id);
        let removed = pending.len() != before;
        if removed {
            let _ = self.persist_locked(&pending);
        }
        removed
    }

    pub async fn clear(&self) {
        let mut pending = self.pending.lock().await;
        pending.clear();
        let _ = self.persist_locked(&pending);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Start the autonomous background processing loop: pops and processes
    /// the head whenever idle, non-empty, and not paused, exactly as
    /// `drain()` does, but running for the lifetime of the queue rather than
    /// stopping once empty. Idempotent; a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let queue = self.clone();
        *task = Some(tokio::spawn(async move {
            queue.background_loop().await;
        }));
    }

    async fn background_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if self.paused.load(Ordering::SeqCst) || self.pending.lock().await.is_empty() {
                self.wake.notified().await;
                continue;
            }
            self.drain().await;
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn persist_locked(&self, pending: &[QueuedOperation<T>]) -> Result<()> {
        if let Err(err) = self.store.persist(pending) {
            tracing::error!(queue = %self.name, error = %err, "failed to persist queue");
        }
        Ok(())
    }

    /// Pop the current head under the lock, releasing it before returning.
    async fn pop_head(&self) -> Option<QueuedOperation<T>> {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return None;
        }
        Some(pending.remove(0))
    }

    async fn requeue_for_retry(&self, mut op: QueuedOperation<T>) -> bool {
        if op.retry_count >= self.config.max_retries {
            tracing::warn!(queue = %self.name, id = %op.id, "dropping operation after max retries");
            let pending = self.pending.lock().await;
            let _ = self.persist_locked(&pending);
            return false;
        }
        let delay = self.config.delay_for_retry(op.retry_count);
        op.retry_count += 1;
        tokio::time::sleep(delay).await;

        let mut pending = self.pending.lock().await;
        pending.push(op);
        sort_pending(&mut pending);
        let _ = self.persist_locked(&pending);
        true
    }

    /// Drain the queue: process the head, one at a time, until empty,
    /// paused, or shut down. Returns the count of successful completions.
    /// A single in-flight drain is enforced via `draining`; a concurrent
    /// caller simply returns 0 rather than racing the active drain.
    ///
    /// Each processed operation gets its own `CorrelationId`-tagged span, so
    /// logs from a single processor call (including a retry's backoff sleep)
    /// can be traced back to that one operation.
    pub async fn drain(&self) -> usize {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return 0;
        }
        let mut successes = 0usize;
        loop {
            if self.paused.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let op = match self.pop_head().await {
                Some(op) => op,
                None => break,
            };

            let correlation_id = crate::logging::CorrelationId::new();
            let span = tracing::info_span!(
                "queue_op",
                queue = %self.name,
                id = %op.id,
                correlation_id = %correlation_id,
            );
            use tracing::Instrument;
            let result = self.processor.process(&op.data).instrument(span).await;
            match result {
                Ok(true) => {
                    successes += 1;
                    let pending = self.pending.lock().await;
                    let _ = self.persist_locked(&pending);
                }
                Ok(false) | Err(_) => {
                    self.requeue_for_retry(op).await;
                }
            }
        }
        self.draining.store(false, Ordering::SeqCst);
        successes
    }

    /// Alias matching the public contract's `flush()` name.
    pub async fn flush(&self) -> usize {
        self.drain().await
    }
}

impl<T> Drop for PersistentQueue<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
