//! Config Fetcher: conditional HTTP, response flattening, validator bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::{Error, Result};
use crate::transport::HttpTransport;
use crate::types::{ConfigMap, FlagRecord, FlagValue, SdkSettings};

const NESTED_KEY: &str = "experience_behaviour_response";

/// Flatten one response body's `configs` object. Nested-field values win
/// over same-named parent fields; null-valued fields are dropped entirely.
/// Applying this twice is idempotent: the nested key is already gone and
/// there are no nulls left to drop the second time.
pub fn flatten_configs(body: &JsonValue) -> HashMap<String, JsonValue> {
    let mut result = HashMap::new();
    let configs = match body.get("configs").and_then(JsonValue::as_object) {
        Some(map) => map,
        None => return result,
    };

    for (key, entry) in configs {
        let mut fields = match entry.as_object() {
            Some(obj) => obj.clone(),
            None => continue,
        };
        if let Some(nested) = fields.remove(NESTED_KEY) {
            if let Some(nested_obj) = nested.as_object() {
                for (nk, nv) in nested_obj {
                    fields.insert(nk.clone(), nv.clone());
                }
            }
        }
        fields.retain(|_, v| !v.is_null());
        result.insert(key.clone(), JsonValue::Object(fields));
    }
    result
}

fn to_flag_value(value: &JsonValue) -> FlagValue {
    match value {
        JsonValue::Bool(b) => FlagValue::Bool(*b),
        JsonValue::Number(n) => FlagValue::Number(n.as_f64().unwrap_or(0.0)),
        JsonValue::String(s) => FlagValue::String(s.clone()),
        JsonValue::Array(items) => FlagValue::Array(items.iter().map(to_flag_value).collect()),
        JsonValue::Object(map) => FlagValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), to_flag_value(v)))
                .collect(),
        ),
        JsonValue::Null => FlagValue::Object(HashMap::new()),
    }
}

fn flattened_to_record(mut fields: serde_json::Map<String, JsonValue>) -> FlagRecord {
    let config_id = fields.remove("config_id").and_then(|v| v.as_str().map(String::from));
    let variation_id = fields
        .remove("variation_id")
        .and_then(|v| v.as_str().map(String::from));
    let experience_id = fields
        .remove("experience_id")
        .and_then(|v| v.as_str().map(String::from));
    let rule_id = fields.remove("rule_id").and_then(|v| v.as_str().map(String::from));
    let version = fields.remove("version").and_then(|v| v.as_i64());
    let priority = fields.remove("priority").and_then(|v| v.as_i64());

    let value = if let Some(explicit) = fields.remove("value") {
        to_flag_value(&explicit)
    } else {
        FlagValue::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, to_flag_value(&v)))
                .collect(),
        )
    };

    FlagRecord {
        value,
        config_id,
        variation_id,
        experience_id,
        rule_id,
        version,
        priority,
    }
}

/// Parse a user-configs response body into a `ConfigMap`. Missing `configs`
/// yields an empty map with a validation warning logged, not an error.
pub fn parse_config_response(body: &[u8]) -> ConfigMap {
    let json: JsonValue = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(error = %err, "user-configs response was not valid JSON");
            return ConfigMap::new();
        }
    };
    if json.get("configs").is_none() {
        tracing::warn!("user-configs response missing `configs` key");
    }
    let flattened = flatten_configs(&json);
    flattened
        .into_iter()
        .map(|(key, value)| {
            let record = match value {
                JsonValue::Object(map) => flattened_to_record(map),
                other => FlagRecord {
                    value: to_flag_value(&other),
                    config_id: None,
                    variation_id: None,
                    experience_id: None,
                    rule_id: None,
                    version: None,
                    priority: None,
                },
            };
            (key, record)
        })
        .collect()
}

/// Validators plus the most recently materialized Config.
struct FetcherState {
    last_modified: Option<String>,
    etag: Option<String>,
    configs: Option<ConfigMap>,
}

pub struct ConfigFetcher {
    transport: Arc<dyn HttpTransport>,
    breakers: CircuitBreakerRegistry,
    client_key: String,
    sdk_settings_url: String,
    user_configs_url: String,
    state: RwLock<FetcherState>,
    offline: std::sync::atomic::AtomicBool,
}

impl ConfigFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        breakers: CircuitBreakerRegistry,
        client_key: impl Into<String>,
        sdk_settings_url: impl Into<String>,
        user_configs_url: impl Into<String>,
    ) -> Self {
        ConfigFetcher {
            transport,
            breakers,
            client_key: client_key.into(),
            sdk_settings_url: sdk_settings_url.into(),
            user_configs_url: user_configs_url.into(),
            state: RwLock::new(FetcherState {
                last_modified: None,
                etag: None,
                configs: None,
            }),
            offline: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn get_configs(&self) -> Result<ConfigMap> {
        self.state
            .read()
            .unwrap()
            .configs
            .clone()
            .ok_or_else(|| Error::internal("no config fetched yet"))
    }

    /// GET the SDK-settings URL with conditional headers. On 304 the
    /// previous pair is returned unchanged; on 200 the new pair replaces it.
    /// Returns `Ok(None)` on 304 (nothing changed, never a refresh trigger).
    pub async fn fetch_metadata(&self) -> Result<Option<SdkSettings>> {
        if self.is_offline() {
            return Err(Error::network("offline mode"));
        }
        let (if_modified_since, if_none_match) = {
            let state = self.state.read().unwrap();
            (state.last_modified.clone(), state.etag.clone())
        };

        let breaker = self.breakers.get_or_create("sdk_settings");
        let transport = self.transport.clone();
        let url = self.sdk_settings_url.clone();
        let result = breaker
            .execute(
                "sdk_settings",
                || async move {
                    let mut headers = HashMap::new();
                    if let Some(lm) = &if_modified_since {
                        headers.insert("If-Modified-Since".to_string(), lm.clone());
                    }
                    if let Some(etag) = &if_none_match {
                        headers.insert("If-None-Match".to_string(), etag.clone());
                    }
                    let response = transport.get(&url, &headers).await?;
                    if response.is_not_modified() {
                        return Ok(None);
                    }
                    if !response.is_success() {
                        return Err(Error::network_status("sdk settings fetch failed", response.status));
                    }
                    let settings: SdkSettings = serde_json::from_slice(&response.body)?;
                    let last_modified = response.header("last-modified").map(String::from);
                    let etag = response.header("etag").map(String::from);
                    Ok(Some((settings, last_modified, etag)))
                },
                None,
            )
            .await?;

        match result {
            None => Ok(None),
            Some((settings, last_modified, etag)) => {
                let mut state = self.state.write().unwrap();
                state.last_modified = last_modified;
                state.etag = etag;
                Ok(Some(settings))
            }
        }
    }

    /// POST the user-configs body. Returns whether the Config actually
    /// changed (false on 304 / no-op).
    pub async fn fetch_config(&self, user: JsonValue) -> Result<bool> {
        if self.is_offline() {
            return Err(Error::network("offline mode"));
        }
        let last_modified = self.state.read().unwrap().last_modified.clone();
        let url = format!(
            "{}?cfenc={}",
            self.user_configs_url,
            urlencode(&self.client_key)
        );
        let breaker = self.breakers.get_or_create("user_configs");
        let transport = self.transport.clone();
        let result = breaker
            .execute(
                "user_configs",
                || async move {
                    let body = serde_json::to_vec(&serde_json::json!({
                        "user": user,
                        "include_only_features_flags": true,
                    }))?;
                    let mut headers = HashMap::new();
                    if let Some(lm) = &last_modified {
                        headers.insert("If-Modified-Since".to_string(), lm.clone());
                    }
                    let response = transport.post(&url, &body, &headers).await?;
                    if response.is_not_modified() {
                        return Ok(None);
                    }
                    if !response.is_success() {
                        return Err(Error::network_status("user configs fetch failed", response.status));
                    }
                    Ok(Some(parse_config_response(&response.body)))
                },
                None,
            )
            .await?;

        match result {
            None => Ok(false),
            Some(configs) => {
                self.state.write().unwrap().configs = Some(configs);
                Ok(true)
            }
        }
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
