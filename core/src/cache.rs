//! Two-tier (memory + disk) Config Cache with TTL and stale-while-revalidate.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::clock::Clock;
use crate::error::Result;
use crate::storage::KvStore;
use crate::types::ConfigMap;

const DATA_KEY: &str = "cf_cached_config_data";
const METADATA_KEY: &str = "cf_cached_config_metadata";

/// Policy knobs supplied per `store`/`load` call.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub ttl_seconds: i64,
    pub use_stale_while_revalidate: bool,
    pub persist: bool,
    pub evict_on_restart: bool,
}

impl CachePolicy {
    pub const NO_CACHE: CachePolicy = CachePolicy {
        ttl_seconds: 0,
        use_stale_while_revalidate: false,
        persist: false,
        evict_on_restart: false,
    };
    pub const SHORT_LIVED: CachePolicy = CachePolicy {
        ttl_seconds: 60,
        use_stale_while_revalidate: true,
        persist: true,
        evict_on_restart: false,
    };
    pub const STANDARD: CachePolicy = CachePolicy {
        ttl_seconds: 3_600,
        use_stale_while_revalidate: true,
        persist: true,
        evict_on_restart: false,
    };
    pub const LONG_LIVED: CachePolicy = CachePolicy {
        ttl_seconds: 86_400,
        use_stale_while_revalidate: true,
        persist: true,
        evict_on_restart: false,
    };
    /// Default policy for the Config Manager's own refresh persistence.
    pub const CONFIG_CACHE_DEFAULT: CachePolicy = CachePolicy::LONG_LIVED;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    payload: ConfigMap,
    last_modified: Option<String>,
    etag: Option<String>,
    stored_at_ms: u64,
    expires_at_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PersistedMetadata {
    last_modified: Option<String>,
    etag: Option<String>,
    stored_at_ms: u64,
    expires_at_ms: u64,
}

/// What `load` hands back to the caller.
#[derive(Debug, Clone, Default)]
pub struct CacheLoadResult {
    pub payload: ConfigMap,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    pub found: bool,
}

pub struct ConfigCache {
    memory: RwLock<HashMap<String, MemoryEntry>>,
    disk: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl ConfigCache {
    pub fn new(disk: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        ConfigCache {
            memory: RwLock::new(HashMap::new()),
            disk,
            clock,
        }
    }

    fn data_key(key: &str) -> String {
        format!("{DATA_KEY}:{key}")
    }

    fn metadata_key(key: &str) -> String {
        format!("{METADATA_KEY}:{key}")
    }

    /// `ttl_seconds <= 0` is a no-op, matching the boundary behavior that a
    /// zero TTL means nothing is ever actually cached.
    pub fn store(
        &self,
        key: &str,
        payload: ConfigMap,
        last_modified: Option<String>,
        etag: Option<String>,
        policy: CachePolicy,
    ) -> Result<()> {
        if policy.ttl_seconds <= 0 {
            return Ok(());
        }
        let stored_at_ms = self.clock.now_monotonic_ms();
        let expires_at_ms = stored_at_ms + (policy.ttl_seconds as u64 * 1000);

        let entry = MemoryEntry {
            payload: payload.clone(),
            last_modified: last_modified.clone(),
            etag: etag.clone(),
            stored_at_ms,
            expires_at_ms,
        };
        self.memory
            .write()
            .unwrap()
            .insert(key.to_string(), entry);

        if policy.persist {
            let serialized = serde_json::to_string(&payload)?;
            self.disk.set(&Self::data_key(key), &serialized)?;
            let metadata = PersistedMetadata {
                last_modified,
                etag,
                stored_at_ms,
                expires_at_ms,
            };
            self.disk
                .set(&Self::metadata_key(key), &serde_json::to_string(&metadata)?)?;
        }
        Ok(())
    }

    /// Consult memory first, then disk. Never returns an unexpired-looking
    /// entry whose TTL has actually passed unless `allow_expired` is set.
    pub fn load(&self, key: &str, allow_expired: bool) -> CacheLoadResult {
        let now = self.clock.now_monotonic_ms();

        if let Some(entry) = self.memory.read().unwrap().get(key).cloned() {
            if now < entry.expires_at_ms || allow_expired {
                return CacheLoadResult {
                    payload: entry.payload,
                    last_modified: entry.last_modified,
                    etag: entry.etag,
                    found: true,
                };
            }
        }

        let data = self.disk.get(&Self::data_key(key)).ok().flatten();
        let metadata_raw = self.disk.get(&Self::metadata_key(key)).ok().flatten();

        match (data, metadata_raw) {
            (Some(data_raw), Some(metadata_raw)) => {
                let payload: ConfigMap = match serde_json::from_str(&data_raw) {
                    Ok(p) => p,
                    Err(_) => return self.expired_fallback(key, allow_expired),
                };
                let metadata: PersistedMetadata = match serde_json::from_str(&metadata_raw) {
                    Ok(m) => m,
                    Err(_) => return self.expired_fallback(key, allow_expired),
                };
                if now < metadata.expires_at_ms || allow_expired {
                    self.memory.write().unwrap().insert(
                        key.to_string(),
                        MemoryEntry {
                            payload: payload.clone(),
                            last_modified: metadata.last_modified.clone(),
                            etag: metadata.etag.clone(),
                            stored_at_ms: metadata.stored_at_ms,
                            expires_at_ms: metadata.expires_at_ms,
                        },
                    );
                    CacheLoadResult {
                        payload,
                        last_modified: metadata.last_modified,
                        etag: metadata.etag,
                        found: true,
                    }
                } else {
                    self.expired_fallback(key, allow_expired)
                }
            }
            _ => self.expired_fallback(key, allow_expired),
        }
    }

    /// On a disk miss/error: if `allow_expired`, fall back to the last-known
    /// validators with an empty payload; otherwise return fully empty.
    fn expired_fallback(&self, key: &str, allow_expired: bool) -> CacheLoadResult {
        if !allow_expired {
            return CacheLoadResult::default();
        }
        let metadata_raw = self.disk.get(&Self::metadata_key(key)).ok().flatten();
        let metadata: Option<PersistedMetadata> =
            metadata_raw.and_then(|raw| serde_json::from_str(&raw).ok());
        match metadata {
            Some(m) => CacheLoadResult {
                payload: ConfigMap::new(),
                last_modified: m.last_modified,
                etag: m.etag,
                found: false,
            },
            None => CacheLoadResult::default(),
        }
    }

    pub fn clear(&self) {
        self.memory.write().unwrap().clear();
        // Best-effort: disk keys are not enumerable without a key index;
        // callers that need a hard wipe should remove the well-known keys
        // for any key they tracked themselves.
    }

    pub fn clear_key(&self, key: &str) {
        self.memory.write().unwrap().remove(key);
        let _ = self.disk.remove(&Self::data_key(key));
        let _ = self.disk.remove(&Self::metadata_key(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryKvStore;
    use crate::types::FlagRecord;
    use crate::types::FlagValue;
    use std::time::Duration;

    fn sample_payload() -> ConfigMap {
        let mut map = ConfigMap::new();
        map.insert(
            "hero".to_string(),
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
        map
    }

    #[test]
    fn store_then_load_roundtrips_payload_and_validators() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = ConfigCache::new(Arc::new(MemoryKvStore::default()), clock);
        cache
            .store(
                "k",
                sample_payload(),
                Some("lm".into()),
                Some("etag1".into()),
                CachePolicy::STANDARD,
            )
            .unwrap();
        let result = cache.load("k", false);
        assert!(result.found);
        assert_eq!(result.etag, Some("etag1".into()));
        assert_eq!(result.payload, sample_payload());
    }

    #[test]
    fn ttl_zero_is_a_store_noop() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = ConfigCache::new(Arc::new(MemoryKvStore::default()), clock);
        cache
            .store("k", sample_payload(), None, None, CachePolicy::NO_CACHE)
            .unwrap();
        let result = cache.load("k", false);
        assert!(!result.found);
    }

    #[test]
    fn load_never_returns_expired_payload_unless_allowed() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = ConfigCache::new(Arc::new(MemoryKvStore::default()), clock.clone());
        cache
            .store("k", sample_payload(), None, None, CachePolicy::SHORT_LIVED)
            .unwrap();
        clock.advance(Duration::from_secs(61));
        assert!(!cache.load("k", false).found);
        assert!(cache.load("k", true).found);
    }

    #[test]
    fn disk_hit_repopulates_memory_tier() {
        let clock = Arc::new(ManualClock::new(0));
        let disk = Arc::new(MemoryKvStore::default());
        let cache = ConfigCache::new(disk.clone(), clock.clone());
        cache
            .store("k", sample_payload(), None, Some("e1".into()), CachePolicy::STANDARD)
            .unwrap();
        cache.memory.write().unwrap().clear();
        let result = cache.load("k", false);
        assert!(result.found);
        assert!(cache.memory.read().unwrap().contains_key("k"));
    }
}
