//! Device policy resolution.
//!
//! A device policy is the user-facing string that selects where inference
//! runs, without exposing hardware APIs:
//!
//! | Policy | Meaning |
//! |---|---|
//! | `auto` | First accelerator if one is present, otherwise CPU |
//! | `cpu` | Always CPU |
//! | `accelerator:auto` | Accelerator 0, CPU with a warning if none |
//! | `accelerator:<n>` | Accelerator `n`, CPU with a warning if unusable |
//! | `remote[:variant]` | Delegate to a remote worker; no local device |
//!
//! `cuda` is accepted wherever `accelerator` is (`cuda:auto`, `cuda:1`).
//!
//! Remote policies must be detected with [`is_remote_policy`] before
//! resolving: remote delegation bypasses local device selection entirely.

pub mod probe;
pub mod resolver;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use probe::{AcceleratorCapability, AcceleratorInfo, AcceleratorProbe, StaticProbe, SysfsProbe};
pub use resolver::DeviceResolver;

/// True if the policy delegates synthesis to a remote worker.
pub fn is_remote_policy(policy: &str) -> bool {
    policy.trim().to_ascii_lowercase().starts_with("remote")
}

/// A concrete execution device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Device {
    Cpu,
    Accelerator(usize),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator(index) => write!(f, "accelerator:{index}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        s.strip_prefix("accelerator:")
            .and_then(|index| index.parse().ok())
            .map(Device::Accelerator)
            .ok_or_else(|| format!("not a device id: '{s}'"))
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Why a policy did not resolve to the device it asked for.
///
/// Each cause is a separate variant so callers can tell an unparsable index
/// from a missing accelerator or an index past the last device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceWarning {
    /// Accelerator detection failed at startup.
    ProbeFailed(String),
    /// An accelerator tier was requested but none is present.
    AcceleratorUnavailable { requested: String },
    /// `accelerator:<index>` where the index is not an integer.
    InvalidFormat { policy: String },
    IndexOutOfRange { index: i64, available: usize },
    UnknownPolicy { policy: String },
    /// A remote policy reached local resolution.
    RemotePolicy { policy: String },
}

impl fmt::Display for DeviceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceWarning::ProbeFailed(cause) => {
                write!(f, "Accelerator detection failed ({cause}), falling back to CPU")
            }
            DeviceWarning::AcceleratorUnavailable { requested } => write!(
                f,
                "Accelerator '{requested}' requested but no accelerator is available, falling back to CPU"
            ),
            DeviceWarning::InvalidFormat { policy } => write!(
                f,
                "Invalid accelerator policy format '{policy}', falling back to CPU"
            ),
            DeviceWarning::IndexOutOfRange { index, available } => write!(
                f,
                "Accelerator {index} requested but only {available} accelerator(s) available, falling back to CPU"
            ),
            DeviceWarning::UnknownPolicy { policy } => {
                write!(f, "Unknown device policy '{policy}', falling back to CPU")
            }
            DeviceWarning::RemotePolicy { policy } => write!(
                f,
                "Remote policy '{policy}' has no local device, falling back to CPU"
            ),
        }
    }
}

/// Outcome of resolving a device policy. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDevice {
    /// The normalized policy that was resolved.
    pub policy: String,
    pub resolved: Device,
    /// Which rule produced `resolved`.
    pub reason: String,
    pub warnings: Vec<DeviceWarning>,
}

impl ResolvedDevice {
    /// Warnings rendered as messages, in order.
    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(ToString::to_string).collect()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Log the resolution and every warning.
    pub fn log(&self) {
        log::info!("TTS device: {} ({})", self.resolved, self.reason);
        for warning in &self.warnings {
            log::warn!("TTS device warning: {warning}");
        }
    }
}
