//! Per-`op_key` circuit breaker: closed/open/half-open state machine over
//! atomics, so lookups never block a caller on a different key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::types::CircuitState;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Tunables for a single breaker instance. Shared across all `op_key`s
/// registered against the same `CircuitBreakerRegistry`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout_ms: 30_000,
        }
    }
}

struct BreakerState {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    open_until_ms: AtomicU64,
    half_open_in_flight: AtomicU8,
}

impl BreakerState {
    fn new() -> Self {
        BreakerState {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            open_until_ms: AtomicU64::new(0),
            half_open_in_flight: AtomicU8::new(0),
        }
    }

    fn current(&self) -> CircuitState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.open_until_ms.store(0, Ordering::SeqCst);
        self.half_open_in_flight.store(0, Ordering::SeqCst);
    }
}

/// A single op_key's breaker, callable concurrently from multiple tasks.
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        CircuitBreaker {
            state: Arc::new(BreakerState::new()),
            config,
            clock,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.current()
    }

    /// Whether the underlying call may be attempted right now, and whether
    /// doing so would be the single permitted half-open trial.
    fn admit(&self) -> std::result::Result<bool, ()> {
        let now = self.clock.now_wall_ms() as u64;
        match self.state.state.load(Ordering::SeqCst) {
            STATE_CLOSED => Ok(false),
            STATE_OPEN => {
                if now < self.state.open_until_ms.load(Ordering::SeqCst) {
                    Err(())
                } else {
                    // Transition to half-open; only the caller that wins the
                    // compare_exchange gets to issue the trial call.
                    let _ = self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    self.try_claim_half_open_slot()
                }
            }
            STATE_HALF_OPEN => self.try_claim_half_open_slot(),
            _ => Ok(false),
        }
    }

    fn try_claim_half_open_slot(&self) -> std::result::Result<bool, ()> {
        match self.state.half_open_in_flight.compare_exchange(
            0,
            1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(true),
            Err(_) => Err(()),
        }
    }

    fn on_success(&self, was_half_open_trial: bool) {
        self.state.consecutive_failures.store(0, Ordering::SeqCst);
        self.state.state.store(STATE_CLOSED, Ordering::SeqCst);
        if was_half_open_trial {
            self.state.half_open_in_flight.store(0, Ordering::SeqCst);
        }
    }

    fn on_failure(&self, was_half_open_trial: bool) {
        if was_half_open_trial {
            self.state.half_open_in_flight.store(0, Ordering::SeqCst);
            self.open_now();
            return;
        }
        let failures = self.state.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.failure_threshold {
            self.open_now();
        }
    }

    fn open_now(&self) {
        let now = self.clock.now_wall_ms() as u64;
        self.state
            .open_until_ms
            .store(now + self.config.reset_timeout_ms, Ordering::SeqCst);
        self.state.state.store(STATE_OPEN, Ordering::SeqCst);
    }

    /// Run `f` if the breaker admits the call. If the breaker is open and
    /// `fallback` is supplied, the fallback result is returned without
    /// recording a success or failure (CircuitOpen is neither, per design).
    /// If the breaker is open and no fallback is supplied, returns
    /// `Error::CircuitOpen`.
    pub async fn execute<F, Fut, T>(
        &self,
        op_key: &str,
        f: F,
        fallback: Option<T>,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let trial = match self.admit() {
            Ok(is_trial) => is_trial,
            Err(()) => {
                return match fallback {
                    Some(value) => Ok(value),
                    None => Err(Error::circuit_open(op_key)),
                };
            }
        };

        match f().await {
            Ok(value) => {
                self.on_success(trial);
                Ok(value)
            }
            Err(err) => {
                if err.is_recoverable() {
                    self.on_failure(trial);
                } else if trial {
                    // A non-recoverable error (e.g. `CircuitOpen`/`Cancelled`)
                    // from the trial call still claimed the half-open slot;
                    // release it and pick a definite state, or the breaker
                    // wedges in half-open forever.
                    self.state.half_open_in_flight.store(0, Ordering::SeqCst);
                    self.open_now();
                }
                Err(err)
            }
        }
    }
}

/// Concurrent map of `op_key` to breaker, shared by the Config Fetcher and
/// the Event/Summary pipeline processors.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        CircuitBreakerRegistry {
            inner: Arc::new(Mutex::new(HashMap::new())),
            config,
            clock,
        }
    }

    /// Get or lazily create the breaker for `op_key`.
    pub fn get_or_create(&self, op_key: &str) -> Arc<CircuitBreaker> {
        let mut map = self.inner.lock().unwrap();
        map.entry(op_key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(self.config.clone(), self.clock.clone()))
            })
            .clone()
    }

    pub fn reset(&self, op_key: &str) {
        if let Some(breaker) = self.inner.lock().unwrap().get(op_key) {
            breaker.state.reset();
        }
    }

    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().unwrap();
        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
