use log::info;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::GpioError;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Input,
    Output,
}

impl Mode {
    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Mode::Input => "in",
            Mode::Output => "out",
        }
    }

    fn from_sysfs(value: &str) -> Option<Self> {
        match value {
            "in" => Some(Mode::Input),
            // the kernel accepts "high"/"low" as output with an initial level
            "out" | "high" | "low" => Some(Mode::Output),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl Edge {
    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }

    fn from_sysfs(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Edge::None),
            "rising" => Some(Edge::Rising),
            "falling" => Some(Edge::Falling),
            "both" => Some(Edge::Both),
            _ => None,
        }
    }
}

/// File-level access to the kernel sysfs GPIO tree.
#[derive(Debug, Clone)]
pub struct SysfsGateway {
    root: PathBuf,
}

impl Default for SysfsGateway {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl SysfsGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    pub fn direction_path(&self, pin: u32) -> PathBuf {
        self.pin_dir(pin).join("direction")
    }

    pub fn edge_path(&self, pin: u32) -> PathBuf {
        self.pin_dir(pin).join("edge")
    }

    pub fn value_path(&self, pin: u32) -> PathBuf {
        self.pin_dir(pin).join("value")
    }

    pub fn is_exported(&self, pin: u32) -> bool {
        self.pin_dir(pin).exists()
    }

    /// Exports `pin` unless its control directory already exists.
    pub fn export_if_needed(&self, pin: u32) -> Result<PathBuf, GpioError> {
        let dir = self.pin_dir(pin);
        if !dir.exists() {
            write_file(&self.root.join("export"), &pin.to_string())?;
            info!("exported gpio{pin}");
        }
        Ok(dir)
    }

    /// Unexports `pin` unconditionally.
    pub fn unexport(&self, pin: u32) -> Result<(), GpioError> {
        write_file(&self.root.join("unexport"), &pin.to_string())?;
        info!("unexported gpio{pin}");
        Ok(())
    }

    pub fn read_mode(&self, pin: u32) -> Result<Mode, GpioError> {
        read_mode_at(&self.direction_path(pin))
    }

    pub fn write_mode(&self, pin: u32, mode: Mode) -> Result<(), GpioError> {
        write_file(&self.direction_path(pin), mode.as_sysfs())
    }

    pub fn read_edge(&self, pin: u32) -> Result<Edge, GpioError> {
        read_edge_at(&self.edge_path(pin))
    }

    pub fn write_edge(&self, pin: u32, edge: Edge) -> Result<(), GpioError> {
        write_file(&self.edge_path(pin), edge.as_sysfs())
    }
}

pub(crate) fn read_mode_at(path: &Path) -> Result<Mode, GpioError> {
    let raw = read_file(path)?;
    Mode::from_sysfs(&raw)
        .ok_or_else(|| GpioError::InvalidState(format!("unknown direction {raw:?} in {path:?}")))
}

pub(crate) fn read_edge_at(path: &Path) -> Result<Edge, GpioError> {
    let raw = read_file(path)?;
    Edge::from_sysfs(&raw)
        .ok_or_else(|| GpioError::InvalidState(format!("unknown edge {raw:?} in {path:?}")))
}

pub(crate) fn write_file(path: &Path, value: &str) -> Result<(), GpioError> {
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| GpioError::io(format!("open {}", path.display()), e))?;
    file.write_all(value.as_bytes())
        .map_err(|e| GpioError::io(format!("write {}", path.display()), e))
}

pub(crate) fn read_file(path: &Path) -> Result<String, GpioError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| GpioError::io(format!("read {}", path.display()), e))
}
