//! Configuration loading and management
//!
//! Settings come from a JSON file shared with the configuration tool.
//! The daemon is a background service with nobody to show an error to,
//! so bad values are logged and replaced, never fatal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use evdev::Key;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

use crate::events::{key_from_code, parse_key};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "SUPER_TAP_CONFIG";

/// System-wide config file, checked after all user configs
pub const SYSTEM_CONFIG_PATH: &str = "/etc/super-activity-view/config.json";

const USER_CONFIG_RELATIVE: &str = ".config/super-activity-view/config.json";

pub const DEFAULT_TRIGGER_KEY: Key = Key::KEY_LEFTMETA;
pub const DEFAULT_INJECTION_KEY: Key = Key::KEY_LEFTCTRL;
pub const DEFAULT_TAP_TIMEOUT: f64 = 0.5;
pub const MIN_TAP_TIMEOUT: f64 = 0.05;
pub const MAX_TAP_TIMEOUT: f64 = 2.0;
pub const DEFAULT_HOTPLUG_SETTLE_MS: u64 = 500;

/// Errors reading a config file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Daemon configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Key whose lone tap is detected
    pub trigger_key: Key,

    /// Key emitted on a detected tap
    pub injection_key: Key,

    /// Longest press that still counts as a tap
    pub tap_timeout: Duration,

    /// Delay before opening a hot-plugged device node
    pub hotplug_settle: Duration,

    /// Skip devices on the virtual bus
    pub ignore_virtual_devices: bool,

    /// Skip devices whose name contains any of these
    pub ignored_device_names: Vec<String>,

    /// File the settings came from, if any
    pub source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trigger_key: DEFAULT_TRIGGER_KEY,
            injection_key: DEFAULT_INJECTION_KEY,
            tap_timeout: Duration::from_secs_f64(DEFAULT_TAP_TIMEOUT),
            hotplug_settle: Duration::from_millis(DEFAULT_HOTPLUG_SETTLE_MS),
            ignore_virtual_devices: true,
            ignored_device_names: vec!["Tiling Shell Proxy Device".to_string()],
            source: None,
        }
    }
}

/// A key given either by name or by raw code
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum KeySetting {
    Code(u16),
    Name(String),
}

impl KeySetting {
    fn resolve(&self) -> Option<Key> {
        match self {
            KeySetting::Code(code) => key_from_code(*code),
            KeySetting::Name(name) => parse_key(name),
        }
    }
}

/// On-disk layout; every field optional and individually tolerant
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    #[serde(deserialize_with = "lenient")]
    trigger_key: Option<KeySetting>,
    #[serde(deserialize_with = "lenient")]
    injection_key: Option<KeySetting>,
    #[serde(deserialize_with = "lenient")]
    tap_timeout: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    hotplug_settle_ms: Option<u64>,
    #[serde(deserialize_with = "lenient")]
    ignore_virtual_devices: Option<bool>,
    #[serde(deserialize_with = "lenient")]
    ignored_device_names: Option<Vec<String>>,
}

/// Deserialize a field, treating a wrongly typed value as absent
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => {
            warn!(%value, error = %e, "ignoring malformed configuration value");
            Ok(None)
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, or defaults
    pub fn load() -> Self {
        let home_dirs = std::fs::read_dir("/home")
            .map(|entries| {
                let mut dirs: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
                dirs.sort();
                dirs
            })
            .unwrap_or_default();

        let candidates = search_paths(
            std::env::var_os(CONFIG_ENV).map(PathBuf::from),
            std::env::var_os("HOME").map(PathBuf::from),
            std::env::var("SUDO_USER").ok(),
            &home_dirs,
        );

        let Some(path) = candidates.into_iter().find(|path| path.is_file()) else {
            info!("no config file found, using defaults");
            return Self::default();
        };

        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not load config, using defaults");
                Self::default()
            }
        }
    }

    /// Load and sanitize one config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let mut config = Self::from_json(&text)?;
        config.source = Some(path.to_owned());
        Ok(config)
    }

    /// Parse JSON text, replacing bad values with defaults
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(text)?;
        Ok(Self::from_parts(file))
    }

    fn from_parts(file: ConfigFile) -> Self {
        let defaults = Self::default();

        let trigger_key = resolve_key("trigger_key", file.trigger_key, defaults.trigger_key);
        let injection_key = resolve_key("injection_key", file.injection_key, defaults.injection_key);
        if trigger_key == injection_key {
            warn!(key = ?trigger_key, "trigger and injection keys are the same");
        }

        Self {
            trigger_key,
            injection_key,
            tap_timeout: sanitize_timeout(file.tap_timeout.unwrap_or(DEFAULT_TAP_TIMEOUT)),
            hotplug_settle: file
                .hotplug_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.hotplug_settle),
            ignore_virtual_devices: file
                .ignore_virtual_devices
                .unwrap_or(defaults.ignore_virtual_devices),
            ignored_device_names: file
                .ignored_device_names
                .unwrap_or(defaults.ignored_device_names),
            source: None,
        }
    }
}

fn resolve_key(field: &str, setting: Option<KeySetting>, default: Key) -> Key {
    let Some(setting) = setting else {
        return default;
    };
    setting.resolve().unwrap_or_else(|| {
        warn!(field, ?setting, ?default, "unknown key, using default");
        default
    })
}

/// Clamp a tap timeout in seconds into the supported window
pub fn sanitize_timeout(secs: f64) -> Duration {
    if !secs.is_finite() {
        warn!(secs, "tap_timeout is not a number, using default");
        return Duration::from_secs_f64(DEFAULT_TAP_TIMEOUT);
    }

    let clamped = secs.clamp(MIN_TAP_TIMEOUT, MAX_TAP_TIMEOUT);
    if clamped != secs {
        warn!(requested = secs, used = clamped, "tap_timeout out of range, clamped");
    }
    Duration::from_secs_f64(clamped)
}

/// Config files to try, in priority order
///
/// The daemon usually runs as root under a service manager, so besides
/// its own home it looks in the invoking user's and every user's home.
pub fn search_paths(
    explicit: Option<PathBuf>,
    home: Option<PathBuf>,
    sudo_user: Option<String>,
    home_dirs: &[PathBuf],
) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut push = |path: PathBuf| {
        if !paths.contains(&path) {
            paths.push(path);
        }
    };

    if let Some(path) = explicit {
        push(path);
    }
    if let Some(home) = home.filter(|home| !home.starts_with("/root")) {
        push(home.join(USER_CONFIG_RELATIVE));
    }
    if let Some(user) = sudo_user.filter(|user| !user.is_empty()) {
        push(Path::new("/home").join(user).join(USER_CONFIG_RELATIVE));
    }
    for dir in home_dirs {
        push(dir.join(USER_CONFIG_RELATIVE));
    }
    push(PathBuf::from(SYSTEM_CONFIG_PATH));

    paths
}
