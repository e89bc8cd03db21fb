//! SDK configuration surface: every externally observable knob, grouped
//! into one nested config struct per subsystem.

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::queue::QueueConfig;
use crate::session::SessionConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub connection_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            connection_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub sdk_settings_check_interval_ms: u64,
    pub background_polling_interval_ms: u64,
    pub reduced_polling_interval_ms: u64,
    pub disable_background_polling: bool,
    pub use_reduced_polling_when_battery_low: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            sdk_settings_check_interval_ms: 60_000,
            background_polling_interval_ms: 60_000,
            reduced_polling_interval_ms: 120_000,
            disable_background_polling: false,
            use_reduced_polling_when_battery_low: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub events_queue_size: usize,
    pub summaries_queue_size: usize,
    pub events_flush_time_seconds: u64,
    pub summaries_flush_time_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            events_queue_size: 100,
            summaries_queue_size: 100,
            events_flush_time_seconds: 60,
            summaries_flush_time_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub local_storage_enabled: bool,
    pub config_cache_ttl_seconds: i64,
    pub persist_cache_across_restarts: bool,
    pub use_stale_while_revalidate: bool,
    pub max_cache_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            local_storage_enabled: true,
            config_cache_ttl_seconds: 86_400,
            persist_cache_across_restarts: true,
            use_stale_while_revalidate: true,
            max_cache_size_mb: 10,
        }
    }
}

/// Top-level settings surface passed in by the (out-of-scope) facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkConfig {
    pub client_key: String,
    pub offline_mode: bool,
    pub auto_env_attributes_enabled: bool,

    pub polling: PollingConfig,
    pub network: NetworkConfig,
    pub pipelines: PipelineConfig,
    pub retry: QueueConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub session: SessionConfig,
}

impl SdkConfig {
    pub fn new(client_key: impl Into<String>) -> Self {
        SdkConfig {
            client_key: client_key.into(),
            offline_mode: false,
            auto_env_attributes_enabled: true,
            polling: PollingConfig::default(),
            network: NetworkConfig::default(),
            pipelines: PipelineConfig::default(),
            retry: QueueConfig::default(),
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            session: SessionConfig::default(),
        }
    }
}
