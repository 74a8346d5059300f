use crate::error::{Result, TtsError};

use super::probe::{AcceleratorCapability, AcceleratorProbe};
use super::{is_remote_policy, Device, DeviceWarning, ResolvedDevice};

/// Resolves device policies against a capability snapshot taken at startup.
///
/// [`resolve`](Self::resolve) is total: any detection error or malformed
/// policy degrades to [`Device::Cpu`] with a warning describing the cause.
#[derive(Debug, Clone)]
pub struct DeviceResolver {
    capability: AcceleratorCapability,
    probe_error: Option<String>,
}

impl DeviceResolver {
    /// Run `probe` once and keep the result for the life of the resolver.
    pub fn detect(probe: &dyn AcceleratorProbe) -> Self {
        match probe.probe() {
            Ok(capability) => {
                log::info!("Detected {} accelerator(s)", capability.count());
                Self {
                    capability,
                    probe_error: None,
                }
            }
            Err(cause) => {
                log::warn!("Accelerator detection failed: {cause}");
                Self {
                    capability: AcceleratorCapability::NoAccelerator,
                    probe_error: Some(cause),
                }
            }
        }
    }

    pub fn with_capability(capability: AcceleratorCapability) -> Self {
        Self {
            capability,
            probe_error: None,
        }
    }

    pub fn capability(&self) -> &AcceleratorCapability {
        &self.capability
    }

    /// Devices a policy could resolve to, CPU first.
    pub fn inventory(&self) -> Vec<Device> {
        std::iter::once(Device::Cpu)
            .chain((0..self.capability.count()).map(Device::Accelerator))
            .collect()
    }

    /// Resolve `policy` to a concrete device. Never fails.
    pub fn resolve(&self, policy: &str) -> ResolvedDevice {
        let policy = policy.trim().to_ascii_lowercase();

        if policy == "cpu" {
            return resolved(policy, Device::Cpu, "Explicit CPU policy", Vec::new());
        }

        if is_remote_policy(&policy) {
            let warning = DeviceWarning::RemotePolicy {
                policy: policy.clone(),
            };
            return resolved(policy, Device::Cpu, "Remote policy", vec![warning]);
        }

        let mut warnings: Vec<DeviceWarning> = self
            .probe_error
            .iter()
            .map(|cause| DeviceWarning::ProbeFailed(cause.clone()))
            .collect();

        if policy == "auto" {
            return if self.capability.is_available() {
                resolved(
                    policy,
                    Device::Accelerator(0),
                    "Accelerator available (auto-selected)",
                    warnings,
                )
            } else {
                resolved(
                    policy,
                    Device::Cpu,
                    "No accelerator available (auto-selected CPU)",
                    warnings,
                )
            };
        }

        let Some(index) = accelerator_index(&policy) else {
            warnings.push(DeviceWarning::UnknownPolicy {
                policy: policy.clone(),
            });
            return resolved(policy, Device::Cpu, "Unknown policy", warnings);
        };

        if index == "auto" {
            if !self.capability.is_available() {
                warnings.push(DeviceWarning::AcceleratorUnavailable {
                    requested: policy.clone(),
                });
                return resolved(policy, Device::Cpu, "Accelerator unavailable", warnings);
            }
            return resolved(
                policy,
                Device::Accelerator(0),
                "Accelerator auto-select (device 0)",
                warnings,
            );
        }

        let Ok(index) = index.parse::<i64>() else {
            warnings.push(DeviceWarning::InvalidFormat {
                policy: policy.clone(),
            });
            return resolved(policy, Device::Cpu, "Invalid policy format", warnings);
        };

        if !self.capability.is_available() {
            warnings.push(DeviceWarning::AcceleratorUnavailable {
                requested: policy.clone(),
            });
            return resolved(policy, Device::Cpu, "Accelerator unavailable", warnings);
        }

        let available = self.capability.count();
        match usize::try_from(index) {
            Ok(i) if i < available => {
                let reason = format!("Explicit accelerator {i}");
                resolved(policy, Device::Accelerator(i), reason, warnings)
            }
            _ => {
                warnings.push(DeviceWarning::IndexOutOfRange { index, available });
                let reason = format!("Invalid accelerator index {index}");
                resolved(policy, Device::Cpu, reason, warnings)
            }
        }
    }

    /// Resolve a policy on a code path that needs a physical device.
    ///
    /// Remote policies have no physical device and are rejected.
    pub fn require_local(&self, policy: &str) -> Result<ResolvedDevice> {
        if is_remote_policy(policy) {
            return Err(TtsError::Configuration(format!(
                "device policy '{}' delegates to a remote worker and has no local device",
                policy.trim()
            )));
        }
        Ok(self.resolve(policy))
    }
}

/// The part after `accelerator:` (or `cuda:`), if the policy names an accelerator.
fn accelerator_index(policy: &str) -> Option<&str> {
    ["accelerator:", "cuda:"]
        .iter()
        .find_map(|prefix| policy.strip_prefix(prefix))
        .map(str::trim)
}

fn resolved(
    policy: String,
    device: Device,
    reason: impl Into<String>,
    warnings: Vec<DeviceWarning>,
) -> ResolvedDevice {
    ResolvedDevice {
        policy,
        resolved: device,
        reason: reason.into(),
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::probe::StaticProbe;

    struct FailingProbe;

    impl AcceleratorProbe for FailingProbe {
        fn probe(&self) -> std::result::Result<AcceleratorCapability, String> {
            Err("driver library missing".to_string())
        }
    }

    fn resolver(count: usize) -> DeviceResolver {
        DeviceResolver::detect(&StaticProbe::with_count(count))
    }

    #[test]
    fn test_cpu_is_clean() {
        for count in [0, 2] {
            let r = resolver(count).resolve("cpu");
            assert_eq!(r.resolved, Device::Cpu);
            assert!(r.warnings.is_empty());
        }
        let r = DeviceResolver::detect(&FailingProbe).resolve(" CPU ");
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn test_auto() {
        let r = resolver(2).resolve("auto");
        assert_eq!(r.resolved, Device::Accelerator(0));
        assert!(r.reason.contains("auto-selected"));

        let r = resolver(0).resolve("AUTO");
        assert_eq!(r.resolved, Device::Cpu);
        assert!(r.reason.contains("CPU"));
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn test_accelerator_auto() {
        assert_eq!(resolver(1).resolve("accelerator:auto").resolved, Device::Accelerator(0));

        let r = resolver(0).resolve("accelerator:auto");
        assert_eq!(r.resolved, Device::Cpu);
        assert_eq!(
            r.warnings,
            vec![DeviceWarning::AcceleratorUnavailable {
                requested: "accelerator:auto".to_string()
            }]
        );
        assert!(r.warning_messages()[0].contains("accelerator:auto"));
    }

    #[test]
    fn test_explicit_index() {
        let r = resolver(2).resolve("accelerator:1");
        assert_eq!(r.resolved, Device::Accelerator(1));
        assert!(r.warnings.is_empty());
        assert_eq!(resolver(2).resolve("cuda:1").resolved, Device::Accelerator(1));
    }

    #[test]
    fn test_index_out_of_range() {
        let r = resolver(2).resolve("accelerator:5");
        assert_eq!(r.resolved, Device::Cpu);
        assert_eq!(
            r.warnings,
            vec![DeviceWarning::IndexOutOfRange { index: 5, available: 2 }]
        );
        assert!(r.warning_messages()[0].contains("only 2"));

        let r = resolver(2).resolve("accelerator:-1");
        assert!(matches!(r.warnings[0], DeviceWarning::IndexOutOfRange { index: -1, .. }));
    }

    #[test]
    fn test_distinct_failure_causes() {
        let invalid = resolver(2).resolve("accelerator:first");
        assert!(matches!(invalid.warnings[0], DeviceWarning::InvalidFormat { .. }));

        let unavailable = resolver(0).resolve("accelerator:0");
        assert!(matches!(
            unavailable.warnings[0],
            DeviceWarning::AcceleratorUnavailable { .. }
        ));

        for r in [invalid, unavailable] {
            assert_eq!(r.resolved, Device::Cpu);
            assert_eq!(r.warnings.len(), 1);
        }
    }

    #[test]
    fn test_unknown_policy() {
        let r = resolver(2).resolve("bogus-policy");
        assert_eq!(r.resolved, Device::Cpu);
        assert!(!r.warnings.is_empty());
        assert_eq!(r.reason, "Unknown policy");
    }

    #[test]
    fn test_remote_is_not_a_device() {
        let r = resolver(2).resolve("remote");
        assert_eq!(r.resolved, Device::Cpu);
        assert!(matches!(r.warnings[0], DeviceWarning::RemotePolicy { .. }));

        let err = resolver(2).require_local("remote:gpu").unwrap_err();
        assert!(matches!(err, TtsError::Configuration(_)));
        assert!(resolver(2).require_local("auto").is_ok());
    }

    #[test]
    fn test_probe_failure_degrades_to_cpu() {
        let resolver = DeviceResolver::detect(&FailingProbe);
        let r = resolver.resolve("auto");
        assert_eq!(r.resolved, Device::Cpu);
        assert!(matches!(r.warnings[0], DeviceWarning::ProbeFailed(_)));

        let r = resolver.resolve("accelerator:auto");
        assert_eq!(r.warnings.len(), 2);
    }

    #[test]
    fn test_deterministic_for_any_input() {
        let resolver = resolver(1);
        for policy in ["", " ", "accelerator:", "cuda", "gpu:0", "accelerator:99999999999999999999", "ümlaut"] {
            let first = resolver.resolve(policy);
            assert_eq!(first, resolver.resolve(policy));
            assert_eq!(first.resolved, Device::Cpu);
            assert!(first.has_warnings());
        }
    }

    #[test]
    fn test_inventory() {
        assert_eq!(
            resolver(2).inventory(),
            vec![Device::Cpu, Device::Accelerator(0), Device::Accelerator(1)]
        );
    }
}
