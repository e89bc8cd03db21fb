//! Event and Summary pipelines: two named `PersistentQueue` instances, each
//! POSTing a JSON array to its own endpoint.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::error::Result;
use crate::queue::{PersistentQueue, QueueConfig, QueueProcessor};
use crate::transport::HttpTransport;

/// A tracked analytics event. `session_id` is captured at enqueue time and
/// is not mutated by later session rotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    pub properties: JsonValue,
    pub session_id: String,
    pub timestamp_ms: i64,
}

/// A flag-evaluation summary, keyed by (flag key, variation_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub flag_key: String,
    pub variation_id: Option<String>,
    pub session_id: String,
    pub timestamp_ms: i64,
}

struct HttpPostProcessor<T> {
    transport: Arc<dyn HttpTransport>,
    breakers: CircuitBreakerRegistry,
    op_key: String,
    url: String,
    _marker: std::marker::PhantomData<T>,
}

#[async_trait]
impl<T> QueueProcessor<T> for HttpPostProcessor<T>
where
    T: Serialize + Send + Sync,
{
    async fn process(&self, data: &T) -> Result<bool> {
        let body = serde_json::to_vec(&serde_json::json!([data]))?;
        let breaker = self.breakers.get_or_create(&self.op_key);
        let transport = self.transport.clone();
        let url = self.url.clone();
        let result = breaker
            .execute(
                &self.op_key,
                || async move {
                    let response = transport.post(&url, &body, &Default::default()).await?;
                    Ok(response.status == 200 || response.status == 202)
                },
                None,
            )
            .await?;
        Ok(result)
    }
}

/// Flush triggers, checked by the owning Lifecycle Coordinator on a timer
/// and by pipelines themselves on every enqueue (size-based).
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub queue_size: usize,
    pub flush_time_seconds: u64,
}

pub struct Pipelines {
    pub events: Arc<PersistentQueue<EventRecord>>,
    pub summaries: Arc<PersistentQueue<SummaryRecord>>,
    events_policy: FlushPolicy,
    summaries_policy: FlushPolicy,
}

impl Pipelines {
    pub fn new(
        dir: impl AsRef<Path>,
        transport: Arc<dyn HttpTransport>,
        breakers: CircuitBreakerRegistry,
        events_url: impl Into<String>,
        summaries_url: impl Into<String>,
        retry_config: QueueConfig,
        clock: Arc<dyn Clock>,
        events_policy: FlushPolicy,
        summaries_policy: FlushPolicy,
    ) -> Result<Self> {
        let events_processor: Arc<dyn QueueProcessor<EventRecord>> = Arc::new(HttpPostProcessor {
            transport: transport.clone(),
            breakers: breakers.clone(),
            op_key: "events".to_string(),
            url: events_url.into(),
            _marker: std::marker::PhantomData,
        });
        let summaries_processor: Arc<dyn QueueProcessor<SummaryRecord>> = Arc::new(HttpPostProcessor {
            transport,
            breakers,
            op_key: "summaries".to_string(),
            url: summaries_url.into(),
            _marker: std::marker::PhantomData,
        });

        let events = Arc::new(PersistentQueue::new(
            dir.as_ref(),
            "events",
            retry_config.clone(),
            clock.clone(),
            events_processor,
        )?);
        let summaries = Arc::new(PersistentQueue::new(
            dir.as_ref(),
            "summaries",
            retry_config,
            clock,
            summaries_processor,
        )?);

        Ok(Pipelines {
            events,
            summaries,
            events_policy,
            summaries_policy,
        })
    }

    /// Start both queues' autonomous background processing loops. Idempotent
    /// per queue. Safe to call even when the queues were loaded non-empty
    /// from a prior run: processing begins immediately.
    pub fn start(&self) {
        self.events.start();
        self.summaries.start();
    }

    /// Enqueue an event. Per the ordering guarantee, pending summaries are
    /// flushed first so they are never POSTed after the event that could
    /// refer to them.
    pub async fn track_event(&self, event: EventRecord) -> Result<String> {
        self.summaries.flush().await;
        let id = self.events.enqueue(event, 0, None).await?;
        if self.events.pending_count().await >= self.events_policy.queue_size {
            self.events.flush().await;
        }
        Ok(id)
    }

    pub async fn track_summary(&self, summary: SummaryRecord) -> Result<String> {
        let id = self.summaries.enqueue(summary, 0, None).await?;
        if self.summaries.pending_count().await >= self.summaries_policy.queue_size {
            self.summaries.flush().await;
        }
        Ok(id)
    }

    pub fn flush_intervals(&self) -> (u64, u64) {
        (
            self.events_policy.flush_time_seconds,
            self.summaries_policy.flush_time_seconds,
        )
    }

    /// Best-effort flush of both queues, summaries first.
    pub async fn shutdown_flush(&self) {
        self.summaries.flush().await;
        self.events.flush().await;
        self.events.shutdown();
        self.summaries.shutdown();
    }
}
