//! Lifecycle Coordinator: wires app/battery state to polling, offline mode,
//! and the Session Manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config_manager::ConfigManager;
use crate::fetcher::ConfigFetcher;
use crate::pipelines::Pipelines;
use crate::session::SessionManager;
use crate::types::{AppState, BatteryState};

pub struct LifecycleCoordinator {
    config_manager: Arc<ConfigManager>,
    fetcher: Arc<ConfigFetcher>,
    session_manager: Arc<SessionManager>,
    pipelines: Arc<Pipelines>,
    app_launch_count: AtomicU64,
    disable_background_polling: bool,
}

impl LifecycleCoordinator {
    pub fn new(
        config_manager: Arc<ConfigManager>,
        fetcher: Arc<ConfigFetcher>,
        session_manager: Arc<SessionManager>,
        pipelines: Arc<Pipelines>,
        disable_background_polling: bool,
    ) -> Self {
        LifecycleCoordinator {
            config_manager,
            fetcher,
            session_manager,
            pipelines,
            app_launch_count: AtomicU64::new(0),
            disable_background_polling,
        }
    }

    pub fn app_launch_count(&self) -> u64 {
        self.app_launch_count.load(Ordering::SeqCst)
    }

    /// Start the Config Manager's polling loop and both pipelines'
    /// background processing loops. Called once at SDK initialization by
    /// the (out-of-scope) facade.
    pub fn start(&self) {
        self.config_manager.start();
        self.pipelines.start();
    }

    pub fn on_app_state_changed(&self, state: AppState) {
        self.config_manager.on_app_state_changed(state);
        match state {
            AppState::Foreground => {
                self.app_launch_count.fetch_add(1, Ordering::SeqCst);
            }
            AppState::Background => {
                if self.disable_background_polling {
                    self.fetcher.set_offline(true);
                }
            }
        }
        self.session_manager.on_app_state_changed(state);
        if state == AppState::Foreground {
            self.fetcher.set_offline(false);
        }
    }

    pub fn on_battery_state_changed(&self, battery: BatteryState) {
        self.config_manager.on_battery_state_changed(battery);
    }

    /// Best-effort flush of both pipelines; stop timers; clear listeners;
    /// mark uninitialized by shutting down the config manager and session.
    pub async fn shutdown(&self) {
        self.pipelines.shutdown_flush().await;
        self.config_manager.shutdown();
        self.session_manager.shutdown();
    }
}
