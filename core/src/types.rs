//! Core domain types shared across subsystems.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A duck-typed flag value. Coercions at the evaluation boundary return
/// `None` rather than erroring, so callers always fall back to their
/// supplied default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<FlagValue>),
    Object(HashMap<String, FlagValue>),
}

impl FlagValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FlagValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HashMap<String, FlagValue>> {
        match self {
            FlagValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Convert to a generic JSON value, e.g. for the `get_json` evaluation call.
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// A single flattened flag record as stored in the Config map.
///
/// Invariant: `value` is never null. Metadata fields that are absent from
/// the server response are omitted from serialization (never set to a
/// null sentinel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagRecord {
    pub value: FlagValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experience_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

/// Flag key -> flattened record. Cheap to clone: callers that need to hand
/// out an immutable snapshot should wrap this in an `Arc`.
pub type ConfigMap = HashMap<String, FlagRecord>;

/// Cached config payload plus HTTP validators and TTL bookkeeping.
///
/// Invariant: `expires_at == stored_at + ttl_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigCacheEntry {
    pub payload: ConfigMap,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    pub stored_at: u64,
    pub expires_at: u64,
}

/// A unit of work sitting in a `PersistentQueue`.
///
/// Invariant: `retry_count <= max_retries` at rest; an operation that
/// exceeds the bound is dropped rather than persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation<T> {
    pub id: String,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    pub priority: i32,
    pub created_at_ms: i64,
    pub retry_count: u32,
}

/// Process-wide session identity.
///
/// Invariant: `last_active_at_ms >= created_at_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub session_id: String,
    pub created_at_ms: i64,
    pub last_active_at_ms: i64,
    pub app_start_ts_ms: i64,
    pub user_id_hash: Option<String>,
}

/// Reason a session rotated, surfaced to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    MaxDuration,
    Background,
    Restart,
    Auth,
    Manual,
}

/// Circuit breaker state for a single `op_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Connection status surfaced to connection-status listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    Offline,
}

/// Extra info accompanying a connection-status notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at_ms: Option<i64>,
}

/// Foreground/background lifecycle state of the host app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Foreground,
    Background,
}

/// Battery state as reported by the (out-of-scope) platform collector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    pub level: f32,
    pub is_charging: bool,
}

impl BatteryState {
    /// `is_low` is derived, never stored independently, so it can never
    /// drift from `level`/`is_charging`.
    pub fn is_low(&self) -> bool {
        self.level <= 0.15 && !self.is_charging
    }
}

/// Server-supplied SDK settings used for change detection and evaluation gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdkSettings {
    #[serde(default)]
    pub cf_skip_sdk: bool,
    #[serde(default = "default_true")]
    pub cf_account_enabled: bool,
    pub last_modified: Option<String>,
    pub version: Option<String>,
    pub config_version: Option<String>,
    pub hash: Option<String>,
    pub timestamp: Option<i64>,
    /// Anything else the server sends, kept for the structural-diff change
    /// check described in the Config Manager's change detection.
    #[serde(flatten)]
    pub extra: HashMap<String, JsonValue>,
}

fn default_true() -> bool {
    true
}

/// Fixed whitelist of fields compared during SDK-settings change detection,
/// ahead of the structural diff over the rest of the document.
pub const SDK_SETTINGS_WHITELIST: &[&str] =
    &["last_modified", "version", "config_version", "hash", "timestamp"];
