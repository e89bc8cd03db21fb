//! Structured logging setup. Thin wrapper around `tracing`/`tracing-subscriber`
//! plus a correlation id carried through a single fetch/queue-cycle and a
//! redaction pass for fields that should never reach a log sink verbatim.

use std::fmt;

use serde::Serialize;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Identifier correlating the log lines of a single logical operation
/// (one settings check, one queue flush cycle) across component boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Field names that must never appear verbatim in a log line.
const SENSITIVE_FIELDS: &[&str] = &[
    "client_key",
    "cfenc",
    "user_id_hash",
    "password",
    "secret",
    "token",
    "auth",
    "credential",
];

/// Replace the value of any sensitive key in a flat JSON object with a
/// fixed redaction marker. Non-object values and nested structures other
/// than one level of object are passed through unchanged; this mirrors
/// the teacher's heuristic best-effort approach rather than a full
/// recursive scrub, since the call sites in this crate only ever log
/// flat metadata maps.
pub fn redact_fields(mut value: serde_json::Value) -> serde_json::Value {
    if let serde_json::Value::Object(ref mut map) = value {
        for key in SENSITIVE_FIELDS {
            if let Some(slot) = map.get_mut(*key) {
                *slot = serde_json::Value::String("***redacted***".to_string());
            }
        }
    }
    value
}

/// Initialize the global `tracing` subscriber with JSON output and an
/// env-filter driven by `RUST_LOG` (defaulting to `info`).
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn redact_fields_masks_known_sensitive_keys() {
        let value = json!({"client_key": "abc123", "flag": "hero"});
        let redacted = redact_fields(value);
        assert_eq!(redacted["client_key"], json!("***redacted***"));
        assert_eq!(redacted["flag"], json!("hero"));
    }
}
