//! Timer configuration: file loading and the live settings provider.
//!
//! `TimerConfig` is what lives in `tomate.toml`. `Settings` wraps it for the
//! running daemon: typed `get`/`set` by key plus change observers keyed by
//! setting name, passed explicitly to whoever needs it.

use crate::observer::{ObserverId, ObserverList};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tomate_ipc::SessionKind;
use tracing::warn;

pub const DEFAULT_WORK_TIME: u64 = 25 * 60;
pub const DEFAULT_SHORT_BREAK: u64 = 5 * 60;
pub const DEFAULT_LONG_BREAK: u64 = 15 * 60;
pub const DEFAULT_POMODOROS_BEFORE_LONG_BREAK: u32 = 4;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;
pub const DEFAULT_RETENTION_DAYS: u32 = 90;
pub const DEFAULT_MAX_TICKER_RESTARTS: u32 = 3;

const CONFIG_FILE: &str = "tomate.toml";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown setting: {0}")]
    UnknownKey(String),

    #[error("setting {key} expects a {expected} value")]
    TypeMismatch { key: SettingKey, expected: &'static str },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: SettingKey, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Seconds
    pub work_time: u64,
    pub short_break: u64,
    pub long_break: u64,
    pub pomodoros_before_long_break: u32,
    /// Wait for an explicit start after each interval instead of auto-advancing
    pub manual_session_switch: bool,
    pub notifications_enabled: bool,
    pub tick_interval_ms: u64,
    pub retention_days: u32,
    pub max_ticker_restarts: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            work_time: DEFAULT_WORK_TIME,
            short_break: DEFAULT_SHORT_BREAK,
            long_break: DEFAULT_LONG_BREAK,
            pomodoros_before_long_break: DEFAULT_POMODOROS_BEFORE_LONG_BREAK,
            manual_session_switch: false,
            notifications_enabled: true,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            retention_days: DEFAULT_RETENTION_DAYS,
            max_ticker_restarts: DEFAULT_MAX_TICKER_RESTARTS,
        }
    }
}

impl TimerConfig {
    /// Configured length of an interval of `kind`.
    pub fn duration_for(&self, kind: SessionKind) -> chrono::Duration {
        let seconds = match kind {
            SessionKind::Work => self.work_time,
            SessionKind::ShortBreak => self.short_break,
            SessionKind::LongBreak => self.long_break,
        };
        chrono::Duration::seconds(seconds.min(i64::MAX as u64) as i64)
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms)
    }

    /// Replaces values the engine cannot run with by their defaults.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        for key in SettingKey::ALL {
            if let Err(err) = validate(key, &self.get(key)) {
                warn!(%err, "falling back to default");
                if let Err(err) = self.apply(key, defaults.get(key)) {
                    warn!(%err, "could not restore default");
                }
            }
        }
        self
    }

    pub fn get(&self, key: SettingKey) -> SettingValue {
        match key {
            SettingKey::WorkTime => SettingValue::Number(self.work_time),
            SettingKey::ShortBreak => SettingValue::Number(self.short_break),
            SettingKey::LongBreak => SettingValue::Number(self.long_break),
            SettingKey::PomodorosBeforeLongBreak => {
                SettingValue::Number(u64::from(self.pomodoros_before_long_break))
            }
            SettingKey::ManualSessionSwitch => SettingValue::Flag(self.manual_session_switch),
            SettingKey::NotificationsEnabled => SettingValue::Flag(self.notifications_enabled),
            SettingKey::TickIntervalMs => SettingValue::Number(self.tick_interval_ms),
            SettingKey::RetentionDays => SettingValue::Number(u64::from(self.retention_days)),
            SettingKey::MaxTickerRestarts => {
                SettingValue::Number(u64::from(self.max_ticker_restarts))
            }
        }
    }

    /// Checks and stores a single value.
    pub fn set(&mut self, key: SettingKey, value: SettingValue) -> Result<(), ConfigError> {
        validate(key, &value)?;
        self.apply(key, value)
    }

    fn apply(&mut self, key: SettingKey, value: SettingValue) -> Result<(), ConfigError> {
        match (key, value) {
            (SettingKey::WorkTime, SettingValue::Number(n)) => self.work_time = n,
            (SettingKey::ShortBreak, SettingValue::Number(n)) => self.short_break = n,
            (SettingKey::LongBreak, SettingValue::Number(n)) => self.long_break = n,
            (SettingKey::PomodorosBeforeLongBreak, SettingValue::Number(n)) => {
                self.pomodoros_before_long_break = narrow(key, n)?
            }
            (SettingKey::ManualSessionSwitch, SettingValue::Flag(b)) => {
                self.manual_session_switch = b
            }
            (SettingKey::NotificationsEnabled, SettingValue::Flag(b)) => {
                self.notifications_enabled = b
            }
            (SettingKey::TickIntervalMs, SettingValue::Number(n)) => self.tick_interval_ms = n,
            (SettingKey::RetentionDays, SettingValue::Number(n)) => {
                self.retention_days = narrow(key, n)?
            }
            (SettingKey::MaxTickerRestarts, SettingValue::Number(n)) => {
                self.max_ticker_restarts = narrow(key, n)?
            }
            (key, _) => {
                return Err(ConfigError::TypeMismatch {
                    key,
                    expected: key.expected_type(),
                })
            }
        }
        Ok(())
    }
}

fn narrow(key: SettingKey, n: u64) -> Result<u32, ConfigError> {
    u32::try_from(n).map_err(|_| ConfigError::InvalidValue {
        key,
        message: format!("{n} is out of range"),
    })
}

fn validate(key: SettingKey, value: &SettingValue) -> Result<(), ConfigError> {
    let must_be_positive = matches!(
        key,
        SettingKey::WorkTime
            | SettingKey::ShortBreak
            | SettingKey::LongBreak
            | SettingKey::PomodorosBeforeLongBreak
            | SettingKey::TickIntervalMs
    );
    if must_be_positive && *value == SettingValue::Number(0) {
        return Err(ConfigError::InvalidValue {
            key,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Setting names as they appear in `tomate.toml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    WorkTime,
    ShortBreak,
    LongBreak,
    PomodorosBeforeLongBreak,
    ManualSessionSwitch,
    NotificationsEnabled,
    TickIntervalMs,
    RetentionDays,
    MaxTickerRestarts,
}

impl SettingKey {
    pub const ALL: [SettingKey; 9] = [
        SettingKey::WorkTime,
        SettingKey::ShortBreak,
        SettingKey::LongBreak,
        SettingKey::PomodorosBeforeLongBreak,
        SettingKey::ManualSessionSwitch,
        SettingKey::NotificationsEnabled,
        SettingKey::TickIntervalMs,
        SettingKey::RetentionDays,
        SettingKey::MaxTickerRestarts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::WorkTime => "work_time",
            SettingKey::ShortBreak => "short_break",
            SettingKey::LongBreak => "long_break",
            SettingKey::PomodorosBeforeLongBreak => "pomodoros_before_long_break",
            SettingKey::ManualSessionSwitch => "manual_session_switch",
            SettingKey::NotificationsEnabled => "notifications_enabled",
            SettingKey::TickIntervalMs => "tick_interval_ms",
            SettingKey::RetentionDays => "retention_days",
            SettingKey::MaxTickerRestarts => "max_ticker_restarts",
        }
    }

    fn expected_type(&self) -> &'static str {
        match self {
            SettingKey::ManualSessionSwitch | SettingKey::NotificationsEnabled => "boolean",
            _ => "numeric",
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingValue {
    Number(u64),
    Flag(bool),
}

type ChangeCallback = dyn Fn(SettingKey, &SettingValue) + Send + Sync;

struct KeyedObserver {
    key: SettingKey,
    callback: Box<ChangeCallback>,
}

/// Live configuration shared between the daemon's components.
#[derive(Clone)]
pub struct Settings {
    values: Arc<RwLock<TimerConfig>>,
    observers: Arc<Mutex<ObserverList<KeyedObserver>>>,
}

impl Settings {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            values: Arc::new(RwLock::new(config.sanitized())),
            observers: Arc::new(Mutex::new(ObserverList::new())),
        }
    }

    pub fn get(&self, key: SettingKey) -> SettingValue {
        self.snapshot().get(key)
    }

    pub fn snapshot(&self) -> TimerConfig {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Updates one setting and notifies the observers of that key if it changed.
    pub fn set(&self, key: SettingKey, value: SettingValue) -> Result<(), ConfigError> {
        let changed = {
            let mut values = self
                .values
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let previous = values.get(key);
            values.set(key, value)?;
            previous != value
        };
        if changed {
            self.notify(key, &value);
        }
        Ok(())
    }

    /// Swaps in a whole configuration (e.g. after re-reading the file) and
    /// returns the keys whose values changed.
    pub fn replace(&self, config: TimerConfig) -> Vec<SettingKey> {
        let config = config.sanitized();
        let changed: Vec<SettingKey> = {
            let mut values = self
                .values
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let changed = SettingKey::ALL
                .into_iter()
                .filter(|key| values.get(*key) != config.get(*key))
                .collect();
            *values = config.clone();
            changed
        };
        for key in &changed {
            self.notify(*key, &config.get(*key));
        }
        changed
    }

    pub fn on_change<F>(&self, key: SettingKey, callback: F) -> ObserverId
    where
        F: Fn(SettingKey, &SettingValue) + Send + Sync + 'static,
    {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .add(Arc::new(KeyedObserver {
                key,
                callback: Box::new(callback),
            }))
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
    }

    fn notify(&self, key: SettingKey, value: &SettingValue) {
        // Collected first so callbacks may call back into `Settings`.
        let interested: Vec<Arc<KeyedObserver>> = self
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|observer| observer.key == key)
            .cloned()
            .collect();
        for observer in interested {
            (observer.callback)(key, value);
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(TimerConfig::default())
    }
}

pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "tomate", "Tomate")
        .map(|proj_dirs| proj_dirs.config_dir().join(CONFIG_FILE))
}

pub fn load_config() -> Result<TimerConfig> {
    match config_path() {
        Some(path) => load_config_from(&path),
        None => Ok(TimerConfig::default()),
    }
}

pub fn load_config_from(path: &Path) -> Result<TimerConfig> {
    if !path.exists() {
        return Ok(TimerConfig::default());
    }
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {:?}", path))?;
    let config: TimerConfig = toml::from_str(&config_str)
        .with_context(|| format!("Failed to parse config file at {:?}", path))?;
    Ok(config.sanitized())
}
