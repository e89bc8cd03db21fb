pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod config_manager;
pub mod error;
pub mod fetcher;
pub mod lifecycle;
pub mod logging;
pub mod pipelines;
pub mod queue;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;

pub use cache::{CacheLoadResult, CachePolicy, ConfigCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, NetworkConfig, PipelineConfig, PollingConfig, SdkConfig};
pub use config_manager::ConfigManager;
pub use error::{Error, Result};
pub use fetcher::ConfigFetcher;
pub use lifecycle::LifecycleCoordinator;
pub use logging::{init_logging, redact_fields, CorrelationId};
pub use pipelines::{EventRecord, FlushPolicy, Pipelines, SummaryRecord};
pub use queue::{PersistentQueue, QueueConfig, QueueProcessor};
pub use session::{SessionConfig, SessionManager};
pub use storage::{FileKvStore, KvStore, MemoryKvStore, QueueFileStore};
pub use transport::{HttpResponse, HttpTransport, OfflineTransport, ReqwestTransport};
pub use types::*;
