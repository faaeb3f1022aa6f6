use std::{collections::HashSet, fs, path::Path, path::PathBuf};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::error::GpioError;
use crate::header::{self, GPIO_COUNT, HeaderPin};
use crate::sysfs::{DEFAULT_SYSFS_ROOT, Mode};

const DEFAULT_BROADCAST_CAPACITY: usize = 64;
const DEFAULT_EVENT_HISTORY_CAPACITY: usize = 32;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

/// A declared pin, addressed either by kernel line or by header position.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<u8>,
    pub capabilities: HashSet<Mode>,
}

impl PinConfig {
    pub fn resolve_line(&self) -> Result<u32, GpioError> {
        let line = match (self.line, self.header) {
            (Some(line), None) => line,
            (None, Some(position)) => match header::pin_at(position) {
                Some(HeaderPin::Gpio(line)) => line,
                Some(other) => {
                    return Err(GpioError::Config(format!(
                        "{}: header position {position} is {other:?}, not a GPIO line",
                        self.name
                    )));
                }
                None => {
                    return Err(GpioError::Config(format!(
                        "{}: header position {position} does not exist",
                        self.name
                    )));
                }
            },
            _ => {
                return Err(GpioError::Config(format!(
                    "{}: exactly one of 'line' or 'header' must be set",
                    self.name
                )));
            }
        };

        if line >= GPIO_COUNT {
            return Err(GpioError::Config(format!(
                "{}: line {line} is out of range 0..{GPIO_COUNT}",
                self.name
            )));
        }
        Ok(line)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    pub gpios: FxHashMap<u32, PinConfig>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from(DEFAULT_SYSFS_ROOT)
}

fn default_broadcast_capacity() -> usize {
    DEFAULT_BROADCAST_CAPACITY
}

fn default_event_history_capacity() -> usize {
    DEFAULT_EVENT_HISTORY_CAPACITY
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, GpioError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every declared pin resolves to a distinct line.
    pub fn validate(&self) -> Result<(), GpioError> {
        if self.broadcast_capacity == 0 {
            return Err(GpioError::Config(
                "broadcast_capacity must be at least 1".into(),
            ));
        }

        let mut lines = FxHashSet::default();
        for (id, pin) in &self.gpios {
            let line = pin.resolve_line()?;
            if !lines.insert(line) {
                return Err(GpioError::Config(format!(
                    "pin {id} ({}) maps to line {line}, which is already declared",
                    pin.name
                )));
            }
        }
        Ok(())
    }
}
