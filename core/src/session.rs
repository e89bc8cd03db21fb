//! Session Manager: session id lifecycle with rotation triggers.

use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::clock::Clock;
use crate::types::{AppState, RotationReason, SessionData};

/// Tunables controlling rotation behavior.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    pub max_session_duration_ms: i64,
    pub background_threshold_ms: i64,
    pub min_session_duration_ms: i64,
    pub rotate_on_app_restart: bool,
    pub rotate_on_auth_change: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_session_duration_ms: 3_600_000,
            background_threshold_ms: 900_000,
            min_session_duration_ms: 300_000,
            rotate_on_app_restart: true,
            rotate_on_auth_change: true,
        }
    }
}

/// `Arc`-held (not `Box`-held) so `rotate()` can clone the live set out from
/// under the lock before invoking any of them.
type RotationListener = Arc<dyn Fn(Option<String>, String, RotationReason) + Send + Sync>;

struct Inner {
    session: SessionData,
    backgrounded_at_ms: Option<i64>,
    listeners: Vec<(u64, RotationListener)>,
    next_listener_id: u64,
}

/// Process-wide session identity. Constructed once by the Lifecycle
/// Coordinator and handed out as a cloned `Arc`.
pub struct SessionManager {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    prefix: String,
}

impl SessionManager {
    pub fn new(config: SessionConfig, clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let now = clock.now_wall_ms();
        let session = SessionData {
            session_id: Self::generate_id(&prefix, now),
            created_at_ms: now,
            last_active_at_ms: now,
            app_start_ts_ms: now,
            user_id_hash: None,
        };
        SessionManager {
            config,
            clock,
            inner: Mutex::new(Inner {
                session,
                backgrounded_at_ms: None,
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
            prefix,
        }
    }

    fn generate_id(prefix: &str, now_ms: i64) -> String {
        let random: u32 = rand::thread_rng().gen();
        format!("{prefix}-{now_ms}-{random:08x}")
    }

    pub fn current(&self) -> SessionData {
        self.inner.lock().unwrap().session.clone()
    }

    pub fn session_id(&self) -> String {
        self.inner.lock().unwrap().session.session_id.clone()
    }

    /// Register a rotation listener; returns an id usable with `remove_listener`.
    pub fn add_listener(&self, listener: RotationListener) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.inner.lock().unwrap().listeners.retain(|(lid, _)| *lid != id);
    }

    pub fn touch(&self) {
        let now = self.clock.now_wall_ms();
        self.inner.lock().unwrap().session.last_active_at_ms = now;
    }

    /// Forced rotation always rotates, regardless of `min_session_duration_ms`.
    pub fn force_rotation(&self) {
        self.rotate(RotationReason::Manual);
    }

    pub fn on_app_restart(&self) {
        if self.config.rotate_on_app_restart {
            self.rotate(RotationReason::Restart);
        }
    }

    pub fn on_auth_changed(&self, new_user_id_hash: Option<String>) {
        let changed = {
            let inner = self.inner.lock().unwrap();
            inner.session.user_id_hash != new_user_id_hash
        };
        if changed && self.config.rotate_on_auth_change {
            self.rotate(RotationReason::Auth);
        }
        self.inner.lock().unwrap().session.user_id_hash = new_user_id_hash;
    }

    pub fn on_app_state_changed(&self, state: AppState) {
        let now = self.clock.now_wall_ms();
        match state {
            AppState::Background => {
                self.inner.lock().unwrap().backgrounded_at_ms = Some(now);
            }
            AppState::Foreground => {
                let backgrounded_at = self.inner.lock().unwrap().backgrounded_at_ms.take();
                if let Some(bg_at) = backgrounded_at {
                    if now - bg_at >= self.config.background_threshold_ms
                        && self.session_age_ms(now) >= self.config.min_session_duration_ms
                    {
                        self.rotate(RotationReason::Background);
                    }
                }
                self.check_max_duration(now);
            }
        }
    }

    fn session_age_ms(&self, now: i64) -> i64 {
        now - self.inner.lock().unwrap().session.created_at_ms
    }

    fn check_max_duration(&self, now: i64) {
        let age = self.session_age_ms(now);
        if age >= self.config.max_session_duration_ms
            && age >= self.config.min_session_duration_ms
        {
            self.rotate(RotationReason::MaxDuration);
        }
    }

    fn rotate(&self, reason: RotationReason) {
        let now = self.clock.now_wall_ms();
        let (old_id, new_session, listeners_snapshot) = {
            let mut inner = self.inner.lock().unwrap();
            let old_id = inner.session.session_id.clone();
            let new_id = Self::generate_id(&self.prefix, now);
            inner.session = SessionData {
                session_id: new_id.clone(),
                created_at_ms: now,
                last_active_at_ms: now,
                app_start_ts_ms: inner.session.app_start_ts_ms,
                user_id_hash: inner.session.user_id_hash.clone(),
            };
            let snapshot: Vec<RotationListener> =
                inner.listeners.iter().map(|(_, listener)| listener.clone()).collect();
            (old_id, inner.session.clone(), snapshot)
        };
        // Dispatch outside the lock: the clones above are the copy, the lock
        // guard above is already dropped by the time we get here, this just
        // invokes.
        for listener in &listeners_snapshot {
            listener(Some(old_id.clone()), new_session.session_id.clone(), reason);
        }
    }

    /// Clears listeners and internal timer bookkeeping; does not destroy
    /// the current session id.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.clear();
        inner.backgrounded_at_ms = None;
    }
}
