use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};

use log::{error, info, warn};
use wg_manager_core::config::{Config, SettingsWatcher};
use wg_manager_core::engine::{Engine, EngineInput};
use wg_manager_core::scheduler::PollScheduler;

use crate::paths::LinuxPaths;

/// Shared application state for the Linux shell.
pub struct AppState {
    pub engine: Engine,
    pub scheduler: PollScheduler,
    pub paths: Arc<LinuxPaths>,
    inbox: Receiver<EngineInput>,
    settings: SettingsWatcher,
}

impl AppState {
    pub fn new() -> Self {
        let paths = Arc::new(LinuxPaths::default());

        let config = match Config::load_with(paths.as_ref()) {
            Ok(config) => {
                info!("Loaded configuration successfully");
                config
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                warn!("Using default configuration");
                Config::default()
            }
        };

        let runner = config.runner();
        let (tx, inbox) = mpsc::channel();
        let mut engine = Engine::new(
            config.gateway(runner.clone()),
            config.observer(runner),
            tx.clone(),
            config.show_notifications,
        );
        engine.start();

        let mut scheduler = PollScheduler::new(tx);
        scheduler.start(config.refresh_interval());
        info!(
            "Polling every {}s via {} {}",
            config.refresh_interval, config.escalation_command, config.helper_path
        );

        let settings = SettingsWatcher::new(paths.as_ref(), config);

        Self {
            engine,
            scheduler,
            paths,
            inbox,
            settings,
        }
    }

    /// Feed pending poll requests and job results into the engine.
    /// Returns true if anything was handled.
    pub fn pump(&mut self) -> bool {
        let mut handled = false;
        while let Ok(input) = self.inbox.try_recv() {
            self.engine.handle(input);
            handled = true;
        }
        handled
    }

    /// Pick up edits to the config file.
    pub fn reload_settings(&mut self) {
        let change = self.settings.check();
        if let Some(interval) = change.refresh_interval {
            self.scheduler.restart(interval);
        }
        if let Some(enabled) = change.show_notifications {
            self.engine.set_notifications(enabled);
        }
    }

    pub fn cleanup(&mut self) {
        self.scheduler.stop();
    }
}
