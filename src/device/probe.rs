use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Directory where the NVIDIA kernel driver lists one entry per GPU.
const NVIDIA_PROC_DIR: &str = "/proc/driver/nvidia/gpus";

/// Details of one detected accelerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceleratorInfo {
    pub index: usize,
    pub name: String,
    /// PCI bus id, when the driver reports it.
    pub bus_id: Option<String>,
}

/// What accelerator hardware the process can use. Detected once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcceleratorCapability {
    NoAccelerator,
    AcceleratorAvailable {
        count: usize,
        info: Vec<AcceleratorInfo>,
    },
}

impl AcceleratorCapability {
    /// Build a capability from a device list; an empty list means no accelerator.
    pub fn from_devices(info: Vec<AcceleratorInfo>) -> Self {
        if info.is_empty() {
            AcceleratorCapability::NoAccelerator
        } else {
            AcceleratorCapability::AcceleratorAvailable {
                count: info.len(),
                info,
            }
        }
    }

    pub fn count(&self) -> usize {
        match self {
            AcceleratorCapability::NoAccelerator => 0,
            AcceleratorCapability::AcceleratorAvailable { count, .. } => *count,
        }
    }

    pub fn is_available(&self) -> bool {
        self.count() > 0
    }
}

/// Feature-detection adapter for accelerator hardware.
///
/// Implementations report failures as a message; the resolver turns them
/// into a CPU fallback plus a warning.
pub trait AcceleratorProbe {
    fn probe(&self) -> Result<AcceleratorCapability, String>;
}

/// Probe returning a fixed capability. Useful for injection and tests.
#[derive(Debug, Clone)]
pub struct StaticProbe(pub AcceleratorCapability);

impl StaticProbe {
    pub fn none() -> Self {
        StaticProbe(AcceleratorCapability::NoAccelerator)
    }

    /// `count` anonymous accelerators.
    pub fn with_count(count: usize) -> Self {
        let info = (0..count)
            .map(|index| AcceleratorInfo {
                index,
                name: format!("accelerator {index}"),
                bus_id: None,
            })
            .collect();
        StaticProbe(AcceleratorCapability::from_devices(info))
    }
}

impl AcceleratorProbe for StaticProbe {
    fn probe(&self) -> Result<AcceleratorCapability, String> {
        Ok(self.0.clone())
    }
}

/// Detects NVIDIA GPUs through the kernel driver's proc entries.
///
/// Honours `CUDA_VISIBLE_DEVICES`: an empty value or `-1` hides every
/// device, a list caps the visible count. On systems without the driver
/// directory this reports [`AcceleratorCapability::NoAccelerator`].
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    root: PathBuf,
    visible_devices: Option<String>,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self {
            root: PathBuf::from(NVIDIA_PROC_DIR),
            visible_devices: std::env::var("CUDA_VISIBLE_DEVICES").ok(),
        }
    }
}

impl SysfsProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe a different driver directory, ignoring the environment.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            visible_devices: None,
        }
    }

    fn visible_limit(&self) -> Option<usize> {
        let raw = self.visible_devices.as_deref()?.trim();
        if raw.is_empty() || raw == "-1" {
            return Some(0);
        }
        Some(raw.split(',').filter(|s| !s.trim().is_empty()).count())
    }
}

impl AcceleratorProbe for SysfsProbe {
    fn probe(&self) -> Result<AcceleratorCapability, String> {
        if !self.root.is_dir() {
            log::debug!("{} not present, assuming no accelerator", self.root.display());
            return Ok(AcceleratorCapability::NoAccelerator);
        }

        let entries = fs::read_dir(&self.root)
            .map_err(|e| format!("cannot read {}: {e}", self.root.display()))?;
        let mut bus_ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        bus_ids.sort_unstable();

        if let Some(limit) = self.visible_limit() {
            bus_ids.truncate(limit);
        }

        let info = bus_ids
            .into_iter()
            .enumerate()
            .map(|(index, bus_id)| AcceleratorInfo {
                index,
                name: read_model_name(&self.root.join(&bus_id))
                    .unwrap_or_else(|| format!("GPU {index}")),
                bus_id: Some(bus_id),
            })
            .collect();

        Ok(AcceleratorCapability::from_devices(info))
    }
}

/// Read the `Model:` line of a driver `information` file.
fn read_model_name(gpu_dir: &Path) -> Option<String> {
    let text = fs::read_to_string(gpu_dir.join("information")).ok()?;
    text.lines()
        .find_map(|line| line.strip_prefix("Model:"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}
