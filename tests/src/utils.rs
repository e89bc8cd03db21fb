//! Mock collaborators and small builders shared by the end-to-end tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cf_core::{
    CircuitBreakerConfig, CircuitBreakerRegistry, Clock, ConfigCache, ConfigFetcher,
    ConfigManager, Error, HttpResponse, HttpTransport, ManualClock, MemoryKvStore, PollingConfig,
    Result,
};

/// A scripted transport with independent response queues for the
/// SDK-settings GET and the user-configs POST, mirroring the two
/// independently-conditional endpoints the Config Fetcher talks to.
pub struct ScriptedTransport {
    get_responses: Mutex<Vec<HttpResponse>>,
    post_responses: Mutex<Vec<HttpResponse>>,
    pub get_calls: AtomicUsize,
    pub post_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(get_responses: Vec<HttpResponse>, post_responses: Vec<HttpResponse>) -> Self {
        let mut get_responses = get_responses;
        let mut post_responses = post_responses;
        get_responses.reverse();
        post_responses.reverse();
        ScriptedTransport {
            get_responses: Mutex::new(get_responses),
            post_responses: Mutex::new(post_responses),
            get_calls: AtomicUsize::new(0),
            post_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, _url: &str, _headers: &HashMap<String, String>) -> Result<HttpResponse> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.get_responses
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| Error::internal("no more scripted GET responses"))
    }

    async fn post(
        &self,
        _url: &str,
        _body: &[u8],
        _headers: &HashMap<String, String>,
    ) -> Result<HttpResponse> {
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        self.post_responses
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| Error::internal("no more scripted POST responses"))
    }

    fn set_timeouts(&self, _connect: Duration, _read: Duration) {}
}

pub fn json_response(status: u16, body: serde_json::Value) -> HttpResponse {
    HttpResponse {
        status,
        body: serde_json::to_vec(&body).unwrap(),
        headers: HashMap::new(),
    }
}

pub fn not_modified() -> HttpResponse {
    HttpResponse {
        status: 304,
        body: vec![],
        headers: HashMap::new(),
    }
}

pub fn error_response(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        body: vec![],
        headers: HashMap::new(),
    }
}

pub fn fetcher_with(
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    breaker_config: CircuitBreakerConfig,
) -> ConfigFetcher {
    let breakers = CircuitBreakerRegistry::new(breaker_config, clock);
    ConfigFetcher::new(
        transport,
        breakers,
        "client-key",
        "https://example.com/sdk-settings",
        "https://example.com/user-configs",
    )
}

pub fn manager_with(
    fetcher: Arc<ConfigFetcher>,
    clock: Arc<dyn Clock>,
    polling: PollingConfig,
) -> Arc<ConfigManager> {
    let cache = Arc::new(ConfigCache::new(Arc::new(MemoryKvStore::default()), clock.clone()));
    ConfigManager::new(fetcher, cache, clock, polling, "cache-key")
}

pub fn manual_clock(start_wall_ms: i64) -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_wall_ms))
}

/// Poll `check` on a short cadence until it returns true or the deadline
/// passes, yielding to the runtime between attempts so a background task
/// spawned via `ConfigManager::start` gets a chance to run.
pub async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let attempts: u32 = 50;
    let step = timeout / attempts;
    for _ in 0..attempts {
        if check() {
            return true;
        }
        tokio::time::sleep(step).await;
    }
    check()
}

/// A `SummaryPusher` that records every push for assertions.
pub struct SummaryRecorder {
    pub pushes: Mutex<Vec<(String, Option<String>)>>,
}

impl SummaryRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(SummaryRecorder {
            pushes: Mutex::new(Vec::new()),
        })
    }

    pub fn as_pusher(self: &Arc<Self>) -> cf_core::config_manager::SummaryPusher {
        let this = self.clone();
        Arc::new(move |key: String, variation_id: Option<String>, _event: String| {
            this.pushes.lock().unwrap().push((key, variation_id));
        })
    }
}
