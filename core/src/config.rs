//! Configuration loading and management.
//! Uses injected `AppPaths` so platform shells control where files live.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::gateway::HelperGateway;
use crate::observer::InterfaceObserver;
use crate::platform::{AppPaths, CommandRunner};
use crate::runner::SystemRunner;

pub const MIN_REFRESH_INTERVAL: u64 = 1;
pub const MAX_REFRESH_INTERVAL: u64 = 30;

fn default_refresh_interval() -> u64 {
    5
}

fn default_show_notifications() -> bool {
    true
}

fn default_helper_path() -> String {
    "/usr/local/bin/wg-manager-helper".to_string()
}

fn default_escalation_command() -> String {
    "pkexec".to_string()
}

fn default_command_timeout() -> u64 {
    120
}

fn default_observer_program() -> String {
    "ip".to_string()
}

fn default_device_type() -> String {
    "wireguard".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Seconds between polls of live interface state.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default = "default_show_notifications")]
    pub show_notifications: bool,
    #[serde(default = "default_helper_path")]
    pub helper_path: String,
    /// Wrapper that authorizes helper calls. Empty runs the helper directly.
    #[serde(default = "default_escalation_command")]
    pub escalation_command: String,
    /// Seconds before a helper or observer call is killed; 0 waits forever.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    #[serde(default = "default_observer_program")]
    pub observer_program: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Config {
    /// Load configuration from the provided paths. Creates a default file if missing.
    pub fn load_with(paths: &dyn AppPaths) -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = paths.config_path();

        if !config_path.exists() {
            info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let default_config = Self::default();
            default_config.save_with(paths)?;
            return Ok(default_config);
        }

        debug!("Loading config from {:?}", config_path);
        let content = fs::read_to_string(&config_path)?;
        let config = Self::parse(&content)?;

        info!(
            "Loaded config: refresh every {}s, notifications {}",
            config.refresh_interval,
            if config.show_notifications { "on" } else { "off" }
        );
        Ok(config)
    }

    /// Parse TOML text, applying defaults and clamping out-of-range values.
    pub fn parse(content: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config: Config = toml::from_str(content)?;
        config.clamp_interval();
        Ok(config)
    }

    /// Save configuration to the provided paths.
    pub fn save_with(&self, paths: &dyn AppPaths) -> Result<(), Box<dyn std::error::Error>> {
        let config_path = paths.config_path();

        // Create the directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        info!("Saved config to {:?}", config_path);
        Ok(())
    }

    fn clamp_interval(&mut self) {
        let clamped = self
            .refresh_interval
            .clamp(MIN_REFRESH_INTERVAL, MAX_REFRESH_INTERVAL);
        if clamped != self.refresh_interval {
            warn!(
                "refresh_interval {} out of range {}..={}, using {}",
                self.refresh_interval, MIN_REFRESH_INTERVAL, MAX_REFRESH_INTERVAL, clamped
            );
            self.refresh_interval = clamped;
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        match self.command_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Return configured PATH or fall back to current process PATH.
    pub fn get_path(&self) -> Option<String> {
        self.path.clone().or_else(|| std::env::var("PATH").ok())
    }

    /// Runner honouring the configured PATH and timeout.
    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::new(SystemRunner::new(self.get_path(), self.command_timeout()))
    }

    pub fn gateway(&self, runner: Arc<dyn CommandRunner>) -> HelperGateway {
        HelperGateway::new(runner, &self.escalation_command, &self.helper_path)
    }

    pub fn observer(&self, runner: Arc<dyn CommandRunner>) -> InterfaceObserver {
        InterfaceObserver::new(runner, &self.observer_program, &self.device_type)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            show_notifications: default_show_notifications(),
            helper_path: default_helper_path(),
            escalation_command: default_escalation_command(),
            command_timeout: default_command_timeout(),
            observer_program: default_observer_program(),
            device_type: default_device_type(),
            path: None,
        }
    }
}

/// Reloads the config file when its modification time changes.
pub struct SettingsWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
    current: Config,
}

/// What changed between two loads of the config file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SettingsChange {
    pub refresh_interval: Option<Duration>,
    pub show_notifications: Option<bool>,
}

impl SettingsChange {
    pub fn is_empty(&self) -> bool {
        self.refresh_interval.is_none() && self.show_notifications.is_none()
    }
}

impl SettingsWatcher {
    pub fn new(paths: &dyn AppPaths, current: Config) -> Self {
        let path = paths.config_path();
        let modified = modified_time(&path);
        Self {
            path,
            modified,
            current,
        }
    }

    pub fn current(&self) -> &Config {
        &self.current
    }

    /// Re-read the file if it changed on disk. Parse errors keep the
    /// previous settings.
    pub fn check(&mut self) -> SettingsChange {
        let modified = modified_time(&self.path);
        if modified == self.modified {
            return SettingsChange::default();
        }
        self.modified = modified;

        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read config {:?}: {}", self.path, e);
                return SettingsChange::default();
            }
        };
        let updated = match Config::parse(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring invalid config {:?}: {}", self.path, e);
                return SettingsChange::default();
            }
        };

        let mut change = SettingsChange::default();
        if updated.refresh_interval != self.current.refresh_interval {
            change.refresh_interval = Some(updated.refresh_interval());
        }
        if updated.show_notifications != self.current.show_notifications {
            change.show_notifications = Some(updated.show_notifications);
        }
        if !change.is_empty() {
            info!("Settings changed: {:?}", change);
        }
        self.current = updated;
        change
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
