//! Config Manager: polling scheduler, change detection, listener dispatch,
//! flag store, and the lock-free evaluation API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cache::{CachePolicy, ConfigCache};
use crate::clock::Clock;
use crate::config::PollingConfig;
use crate::fetcher::ConfigFetcher;
use crate::types::{
    AppState, BatteryState, ConfigMap, ConnectionInfo, ConnectionStatus, FlagRecord, FlagValue,
    SDK_SETTINGS_WHITELIST,
};

/// `Arc`-held (not `Box`-held) so dispatch can clone the live set out from
/// under the registry lock before invoking any of them, per spec.md §4.6/§5
/// ("listener dispatch must not hold the Config-manager lock").
type FlagListener = Arc<dyn Fn(Option<&FlagRecord>, Option<&FlagRecord>) + Send + Sync>;
type AllFlagsListener = Arc<dyn Fn(&ConfigMap) + Send + Sync>;
type ConnectionListener = Arc<dyn Fn(ConnectionStatus, &ConnectionInfo) + Send + Sync>;

/// A function that pushes a summary record for an evaluated flag. Modeled
/// as a callback rather than a direct dependency on the pipeline type so
/// the manager doesn't need to know about queue internals.
pub type SummaryPusher = Arc<dyn Fn(String, Option<String>, String) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollingState {
    Idle,
    Scheduled,
    Running,
    Paused,
}

struct ListenerRegistry {
    per_key: Mutex<HashMap<String, Vec<(u64, FlagListener)>>>,
    all_flags: Mutex<Vec<(u64, AllFlagsListener)>>,
    connection: Mutex<Vec<(u64, ConnectionListener)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    fn new() -> Self {
        ListenerRegistry {
            per_key: Mutex::new(HashMap::new()),
            all_flags: Mutex::new(Vec::new()),
            connection: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// The scheduler, flag store, and evaluation surface.
pub struct ConfigManager {
    fetcher: Arc<ConfigFetcher>,
    cache: Arc<ConfigCache>,
    clock: Arc<dyn Clock>,
    snapshot: ArcSwap<ConfigMap>,
    previous_settings_fields: Mutex<Option<HashMap<String, JsonValue>>>,
    gate_skip_sdk: AtomicBool,
    gate_account_enabled: AtomicBool,
    listeners: ListenerRegistry,
    connection_info: Mutex<ConnectionInfo>,
    polling_state: Mutex<PollingState>,
    current_interval_ms: AtomicU64,
    app_state: Mutex<AppState>,
    battery_state: Mutex<Option<BatteryState>>,
    polling_config: PollingConfig,
    wake: Notify,
    shutdown: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    summary_pusher: Mutex<Option<SummaryPusher>>,
    cache_key: String,
    evaluations_since_refresh: AtomicUsize,
}

impl ConfigManager {
    pub fn new(
        fetcher: Arc<ConfigFetcher>,
        cache: Arc<ConfigCache>,
        clock: Arc<dyn Clock>,
        polling_config: PollingConfig,
        cache_key: impl Into<String>,
    ) -> Arc<Self> {
        let interval = polling_config.sdk_settings_check_interval_ms;
        Arc::new(ConfigManager {
            fetcher,
            cache,
            clock,
            snapshot: ArcSwap::from_pointee(ConfigMap::new()),
            previous_settings_fields: Mutex::new(None),
            gate_skip_sdk: AtomicBool::new(false),
            gate_account_enabled: AtomicBool::new(true),
            listeners: ListenerRegistry::new(),
            connection_info: Mutex::new(ConnectionInfo::default()),
            polling_state: Mutex::new(PollingState::Idle),
            current_interval_ms: AtomicU64::new(interval),
            app_state: Mutex::new(AppState::Foreground),
            battery_state: Mutex::new(None),
            polling_config,
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            task: Mutex::new(None),
            summary_pusher: Mutex::new(None),
            cache_key: cache_key.into(),
            evaluations_since_refresh: AtomicUsize::new(0),
        })
    }

    pub fn set_summary_pusher(&self, pusher: SummaryPusher) {
        *self.summary_pusher.lock().unwrap() = Some(pusher);
    }

    /// Start the periodic settings-check loop as a single background task.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        *self.polling_state.lock().unwrap() = PollingState::Scheduled;
        let manager = self.clone();
        *task = Some(tokio::spawn(async move {
            manager.poll_loop().await;
        }));
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if *self.polling_state.lock().unwrap() == PollingState::Paused {
                self.wake.notified().await;
                continue;
            }
            let interval_ms = self.current_interval_ms.load(Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(interval_ms)) => {}
                _ = self.wake.notified() => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if *self.polling_state.lock().unwrap() == PollingState::Paused {
                continue;
            }
            *self.polling_state.lock().unwrap() = PollingState::Running;
            self.run_settings_check().await;
            *self.polling_state.lock().unwrap() = PollingState::Scheduled;
        }
    }

    pub fn pause_polling(&self) {
        *self.polling_state.lock().unwrap() = PollingState::Paused;
    }

    pub fn resume_polling(&self) {
        *self.polling_state.lock().unwrap() = PollingState::Scheduled;
        self.wake.notify_one();
    }

    pub fn force_immediate_check(&self) {
        self.wake.notify_one();
    }

    pub fn set_interval_ms(&self, interval_ms: u64) {
        self.current_interval_ms.store(interval_ms, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        self.listeners.per_key.lock().unwrap().clear();
        self.listeners.all_flags.lock().unwrap().clear();
        self.listeners.connection.lock().unwrap().clear();
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// One settings check: fetch metadata, detect change, refresh if needed.
    /// Tagged with a fresh `CorrelationId` so every log line this cycle
    /// emits (metadata fetch, refresh, listener dispatch) can be traced
    /// back to the same settings check.
    async fn run_settings_check(self: &Arc<Self>) {
        let correlation_id = crate::logging::CorrelationId::new();
        let span = tracing::info_span!("settings_check", correlation_id = %correlation_id);
        use tracing::Instrument;
        self.run_settings_check_inner().instrument(span).await
    }

    async fn run_settings_check_inner(self: &Arc<Self>) {
        match self.fetcher.fetch_metadata().await {
            Ok(None) => {
                self.report_connection(ConnectionStatus::Connected, 0, None, None);
            }
            Ok(Some(settings)) => {
                self.gate_skip_sdk.store(settings.cf_skip_sdk, Ordering::SeqCst);
                self.gate_account_enabled
                    .store(settings.cf_account_enabled, Ordering::SeqCst);

                let mut fields: HashMap<String, JsonValue> = settings.extra.clone();
                for (name, value) in [
                    ("last_modified", settings.last_modified.clone()),
                    ("version", settings.version.clone()),
                    ("config_version", settings.config_version.clone()),
                    ("hash", settings.hash.clone()),
                ] {
                    if let Some(v) = value {
                        fields.insert(name.to_string(), JsonValue::String(v));
                    }
                }
                if let Some(timestamp) = settings.timestamp {
                    fields.insert("timestamp".to_string(), JsonValue::Number(timestamp.into()));
                }

                let should_refresh = {
                    let mut previous = self.previous_settings_fields.lock().unwrap();
                    let changed = match previous.as_ref() {
                        None => true,
                        Some(prev) => settings_differ(prev, &fields),
                    };
                    *previous = Some(fields);
                    changed
                };

                self.report_connection(ConnectionStatus::Connected, 0, None, None);

                if should_refresh && self.gates_open() {
                    self.refresh().await;
                }
            }
            Err(err) => {
                self.report_connection(
                    ConnectionStatus::Disconnected,
                    1,
                    Some(err.to_string()),
                    Some(self.clock.now_wall_ms() + 30_000),
                );
            }
        }
    }

    fn report_connection(
        &self,
        status: ConnectionStatus,
        failure_delta: u32,
        last_error: Option<String>,
        next_retry_at_ms: Option<i64>,
    ) {
        let info = {
            let mut info = self.connection_info.lock().unwrap();
            if failure_delta == 0 {
                info.failure_count = 0;
                info.last_error = None;
                info.next_retry_at_ms = None;
            } else {
                info.failure_count += failure_delta;
                info.last_error = last_error;
                info.next_retry_at_ms = next_retry_at_ms;
            }
            info.clone()
        };
        // Snapshot the live listener set, release the lock, then invoke.
        let listeners: Vec<ConnectionListener> = self
            .listeners
            .connection
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in &listeners {
            listener(status, &info);
        }
    }

    /// Fetch the full config, diff against the previous snapshot, notify
    /// listeners, and persist. Retains the previous Config on failure.
    async fn refresh(self: &Arc<Self>) {
        let user = serde_json::json!({});
        match self.fetcher.fetch_config(user).await {
            Ok(true) => {
                let new_configs = match self.fetcher.get_configs() {
                    Ok(c) => c,
                    Err(_) => return,
                };
                let old_configs = self.snapshot.load_full();
                let changed_keys: Vec<String> = diff_keys(&old_configs, &new_configs);

                self.snapshot.store(Arc::new(new_configs.clone()));

                // Snapshot the live listener set per changed key, release the
                // lock, then invoke.
                let per_key_dispatch: Vec<(FlagListener, Option<&FlagRecord>, Option<&FlagRecord>)> = {
                    let per_key = self.listeners.per_key.lock().unwrap();
                    changed_keys
                        .iter()
                        .filter_map(|key| per_key.get(key).map(|entries| (key, entries)))
                        .flat_map(|(key, entries)| {
                            let old_val = old_configs.get(key);
                            let new_val = new_configs.get(key);
                            entries
                                .iter()
                                .map(move |(_, listener)| (listener.clone(), old_val, new_val))
                                .collect::<Vec<_>>()
                        })
                        .collect()
                };
                for (listener, old_val, new_val) in &per_key_dispatch {
                    listener(*old_val, *new_val);
                }

                let all_flags_listeners: Vec<AllFlagsListener> = self
                    .listeners
                    .all_flags
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(_, listener)| listener.clone())
                    .collect();
                for listener in &all_flags_listeners {
                    listener(&new_configs);
                }

                let _ = self.cache.store(
                    &self.cache_key,
                    new_configs,
                    None,
                    None,
                    CachePolicy::CONFIG_CACHE_DEFAULT,
                );
            }
            Ok(false) => {}
            Err(_) => {}
        }
    }

    pub fn add_listener(&self, key: impl Into<String>, listener: FlagListener) -> u64 {
        let id = self.listeners.next();
        self.listeners
            .per_key
            .lock()
            .unwrap()
            .entry(key.into())
            .or_default()
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, key: &str, id: u64) {
        if let Some(entries) = self.listeners.per_key.lock().unwrap().get_mut(key) {
            entries.retain(|(lid, _)| *lid != id);
        }
    }

    pub fn add_all_flags_listener(&self, listener: AllFlagsListener) -> u64 {
        let id = self.listeners.next();
        self.listeners.all_flags.lock().unwrap().push((id, listener));
        id
    }

    pub fn remove_all_flags_listener(&self, id: u64) {
        self.listeners.all_flags.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    pub fn add_connection_listener(&self, listener: ConnectionListener) -> u64 {
        let id = self.listeners.next();
        self.listeners.connection.lock().unwrap().push((id, listener));
        id
    }

    pub fn remove_connection_listener(&self, id: u64) {
        self.listeners.connection.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    fn gates_open(&self) -> bool {
        !self.gate_skip_sdk.load(Ordering::SeqCst) && self.gate_account_enabled.load(Ordering::SeqCst)
    }

    fn push_summary(&self, key: &str, variation_id: Option<String>) {
        self.evaluations_since_refresh.fetch_add(1, Ordering::SeqCst);
        if let Some(pusher) = self.summary_pusher.lock().unwrap().as_ref() {
            pusher(key.to_string(), variation_id, "evaluated".to_string());
        }
    }

    fn evaluate(&self, key: &str) -> Option<FlagRecord> {
        if !self.gates_open() {
            return None;
        }
        let snapshot = self.snapshot.load();
        let record = snapshot.get(key).cloned();
        if let Some(record) = &record {
            self.push_summary(key, record.variation_id.clone());
        }
        record
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.evaluate(key)
            .and_then(|r| r.value.as_str().map(String::from))
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_number(&self, key: &str, default: f64) -> f64 {
        self.evaluate(key).and_then(|r| r.value.as_f64()).unwrap_or(default)
    }

    pub fn get_boolean(&self, key: &str, default: bool) -> bool {
        self.evaluate(key).and_then(|r| r.value.as_bool()).unwrap_or(default)
    }

    pub fn get_json(&self, key: &str, default: JsonValue) -> JsonValue {
        self.evaluate(key).map(|r| r.value.to_json()).unwrap_or(default)
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.connection_info.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> ConfigMap {
        (*self.snapshot.load_full()).clone()
    }

    // --- Lifecycle-driven polling adaptation (invoked by the Lifecycle Coordinator) ---

    pub fn on_app_state_changed(&self, state: AppState) {
        *self.app_state.lock().unwrap() = state;
        self.recompute_interval();
        match state {
            AppState::Foreground => {
                self.resume_polling();
                self.force_immediate_check();
            }
            AppState::Background => {
                if self.polling_config.disable_background_polling {
                    self.pause_polling();
                }
            }
        }
    }

    pub fn on_battery_state_changed(&self, battery: BatteryState) {
        *self.battery_state.lock().unwrap() = Some(battery);
        self.recompute_interval();
    }

    fn recompute_interval(&self) {
        let app_state = *self.app_state.lock().unwrap();
        let battery = *self.battery_state.lock().unwrap();
        let low_battery = battery.map(|b| b.is_low()).unwrap_or(false);

        let interval = if app_state == AppState::Background
            && self.polling_config.use_reduced_polling_when_battery_low
            && low_battery
        {
            self.polling_config.reduced_polling_interval_ms
        } else if app_state == AppState::Background {
            self.polling_config.background_polling_interval_ms
        } else {
            self.polling_config.sdk_settings_check_interval_ms
        };
        self.set_interval_ms(interval);
    }
}

impl Drop for ConfigManager {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn diff_keys(old: &ConfigMap, new: &ConfigMap) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for (key, new_val) in new {
        match old.get(key) {
            Some(old_val) if old_val == new_val => {}
            _ => keys.push(key.clone()),
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            keys.push(key.clone());
        }
    }
    keys
}

/// Whitelist fields plus a structural diff over everything else.
fn settings_differ(
    previous: &HashMap<String, JsonValue>,
    current: &HashMap<String, JsonValue>,
) -> bool {
    for field in SDK_SETTINGS_WHITELIST {
        if previous.get(*field) != current.get(*field) {
            return true;
        }
    }
    previous != current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::clock::ManualClock;
    use crate::storage::MemoryKvStore;
    use crate::transport::HttpTransport;
    use crate::types::FlagValue;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration as StdDuration;

    struct StaticTransport {
        settings_body: Vec<u8>,
        configs_body: Vec<u8>,
        calls: StdAtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for StaticTransport {
        async fn get(
            &self,
            _url: &str,
            _headers: &HashMap<String, String>,
        ) -> crate::error::Result<crate::transport::HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(crate::transport::HttpResponse {
                status: 200,
                body: self.settings_body.clone(),
                headers: HashMap::new(),
            })
        }

        async fn post(
            &self,
            _url: &str,
            _body: &[u8],
            _headers: &HashMap<String, String>,
        ) -> crate::error::Result<crate::transport::HttpResponse> {
            Ok(crate::transport::HttpResponse {
                status: 200,
                body: self.configs_body.clone(),
                headers: HashMap::new(),
            })
        }

        fn set_timeouts(&self, _connect: StdDuration, _read: StdDuration) {}
    }

    fn manager_with_static_transport() -> Arc<ConfigManager> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let transport = Arc::new(StaticTransport {
            settings_body: serde_json::to_vec(&serde_json::json!({
                "cf_skip_sdk": false,
                "cf_account_enabled": true
            }))
            .unwrap(),
            configs_body: br#"{"configs":{"hero":{"value":true,"variation_id":"v1"}}}"#.to_vec(),
            calls: StdAtomicUsize::new(0),
        });
        let breakers = CircuitBreakerRegistry::new(Default::default(), clock.clone());
        let fetcher = Arc::new(ConfigFetcher::new(
            transport,
            breakers,
            "key",
            "https://x/settings",
            "https://x/configs",
        ));
        let cache = Arc::new(ConfigCache::new(Arc::new(MemoryKvStore::default()), clock.clone()));
        ConfigManager::new(fetcher, cache, clock, PollingConfig::default(), "cache-key")
    }

    #[tokio::test]
    async fn settings_change_triggers_refresh_and_notifies_listeners() {
        let manager = manager_with_static_transport();
        let notified = Arc::new(StdAtomicUsize::new(0));
        let n = notified.clone();
        manager.add_listener(
            "hero",
            Arc::new(move |_old, _new| {
                n.fetch_add(1, Ordering::SeqCst);
            }),
        );
        manager.run_settings_check().await;
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(manager.snapshot().contains_key("hero"));
    }

    #[tokio::test]
    async fn evaluation_gate_skips_sdk_and_returns_default() {
        let manager = manager_with_static_transport();
        manager.run_settings_check().await;
        manager.gate_skip_sdk.store(true, Ordering::SeqCst);
        assert_eq!(manager.get_string("hero", "dflt"), "dflt");
    }

    #[tokio::test]
    async fn evaluation_returns_flag_value_when_gates_open() {
        let manager = manager_with_static_transport();
        manager.run_settings_check().await;
        assert!(manager.get_boolean("hero", false));
    }

    #[tokio::test]
    async fn unknown_key_returns_default() {
        let manager = manager_with_static_transport();
        manager.run_settings_check().await;
        assert_eq!(manager.get_string("missing", "dflt"), "dflt");
    }

    #[test]
    fn diff_keys_reports_added_changed_and_removed() {
        let mut old = ConfigMap::new();
        old.insert(
            "a".into(),
            FlagRecord {
                value: FlagValue::Bool(true),
                config_id: None,
                variation_id: None,
                experience_id: None,
                rule_id: None,
                version: None,
                priority: None,
            },
        );
        let mut new = old.clone();
        new.get_mut("a").unwrap().value = FlagValue::Bool(false);
        new.insert(
            "b".into(),
            FlagRecord {
                value: FlagValue::Bool(true),
                config_id: None,
                variation_id: None,
                experience_id: None,
                rule_id: None,
                version: None,
                priority: None,
            },
        );
        old.insert(
            "c".into(),
            FlagRecord {
                value: FlagValue::Bool(true),
                config_id: None,
                variation_id: None,
                experience_id: None,
                rule_id: None,
                version: None,
                priority: None,
            },
        );
        let mut keys = diff_keys(&old, &new);
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn settings_differ_checks_whitelist_fields() {
        let mut previous = HashMap::new();
        previous.insert("version".to_string(), JsonValue::String("1".into()));
        let mut current = previous.clone();
        assert!(!settings_differ(&previous, &current));
        current.insert("version".to_string(), JsonValue::String("2".into()));
        assert!(settings_differ(&previous, &current));
    }
}
