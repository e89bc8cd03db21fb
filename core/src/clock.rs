//! Time abstraction: monotonic for timeouts and scheduling, wall-clock for
//! timestamps that get persisted or sent over the wire.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Injectable clock so breaker/queue/session timing tests are deterministic.
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds, suitable only for measuring elapsed time.
    fn now_monotonic_ms(&self) -> u64;
    /// Wall-clock milliseconds since the Unix epoch.
    fn now_wall_ms(&self) -> i64;
}

/// Default clock backed by `Instant`/`SystemTime`.
#[derive(Debug, Default)]
pub struct SystemClock {
    start: OnceLock<Instant>,
}

impl SystemClock {
    fn start(&self) -> Instant {
        *self.start.get_or_init(Instant::now)
    }
}

impl Clock for SystemClock {
    fn now_monotonic_ms(&self) -> u64 {
        self.start().elapsed().as_millis() as u64
    }

    fn now_wall_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Manually-advanced clock for tests. Both monotonic and wall offsets start
/// at zero and only move when `advance` is called.
#[derive(Debug, Default)]
pub struct ManualClock {
    monotonic_ms: AtomicU64,
    wall_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(wall_start_ms: i64) -> Self {
        ManualClock {
            monotonic_ms: AtomicU64::new(0),
            wall_ms: AtomicI64::new(wall_start_ms),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.monotonic_ms
            .fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
        self.wall_ms
            .fetch_add(delta.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_monotonic_ms(&self) -> u64 {
        self.monotonic_ms.load(Ordering::SeqCst)
    }

    fn now_wall_ms(&self) -> i64 {
        self.wall_ms.load(Ordering::SeqCst)
    }
}
