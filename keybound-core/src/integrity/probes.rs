use std::path::{Path, PathBuf};

use super::verdict::ThreatReason;

/// How much weight a probe's signal carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, uniffi::Enum)]
pub enum SignalConfidence {
    /// A positive result alone makes the environment compromised.
    High,
    /// Heuristic; a positive result makes the environment suspect.
    Low,
}

/// Outcome of a single probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The signal is absent.
    Clear,
    /// The signal is present.
    Detected,
    /// The probe could not decide.
    Indeterminate,
}

impl From<bool> for ProbeOutcome {
    fn from(detected: bool) -> Self {
        if detected {
            Self::Detected
        } else {
            Self::Clear
        }
    }
}

/// A compromise signal source.
///
/// Probes run on every evaluation tick and must be cheap. They must not
/// block on user interaction or the network.
pub trait IntegrityProbe: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Reason reported when the probe detects its signal.
    fn reason(&self) -> ThreatReason;

    /// Weight of a positive result.
    fn confidence(&self) -> SignalConfidence {
        SignalConfidence::High
    }

    /// Runs the probe.
    fn detect(&self) -> ProbeOutcome;
}

fn any_exists(paths: &[PathBuf]) -> bool {
    paths
        .iter()
        .any(|path| std::fs::symlink_metadata(path).is_ok())
}

fn default_root_markers() -> Vec<PathBuf> {
    let markers: &[&str] = if cfg!(target_os = "android") {
        &[
            "/system/app/Superuser.apk",
            "/system/xbin/su",
            "/system/bin/su",
            "/sbin/su",
            "/su/bin/su",
            "/data/local/xbin/su",
            "/data/local/bin/su",
            "/data/adb/magisk",
            "/sbin/.magisk",
        ]
    } else if cfg!(target_os = "ios") {
        &[
            "/Applications/Cydia.app",
            "/Applications/Sileo.app",
            "/Library/MobileSubstrate/MobileSubstrate.dylib",
            "/private/var/lib/apt",
            "/var/jb",
            "/etc/apt",
        ]
    } else {
        &[]
    };
    markers.iter().map(PathBuf::from).collect()
}

/// Looks for root and jailbreak artifacts on the filesystem.
#[derive(Debug, Clone)]
pub struct RootMarkerProbe {
    markers: Vec<PathBuf>,
}

impl RootMarkerProbe {
    /// Probe over a custom marker list.
    #[must_use]
    pub fn with_markers(markers: Vec<PathBuf>) -> Self {
        Self { markers }
    }
}

impl Default for RootMarkerProbe {
    fn default() -> Self {
        Self::with_markers(default_root_markers())
    }
}

impl IntegrityProbe for RootMarkerProbe {
    fn name(&self) -> &'static str {
        "root-markers"
    }

    fn reason(&self) -> ThreatReason {
        ThreatReason::Rooted
    }

    fn detect(&self) -> ProbeOutcome {
        any_exists(&self.markers).into()
    }
}

/// Reads `TracerPid` from the process status file.
///
/// Only meaningful where procfs exists. Elsewhere the host reports
/// debugger attachment through
/// [`IntegrityMonitor::report_host_signal`](super::IntegrityMonitor::report_host_signal).
#[derive(Debug, Clone)]
pub struct DebuggerProbe {
    status_path: Option<PathBuf>,
}

impl DebuggerProbe {
    /// Probe over a custom status file.
    #[must_use]
    pub fn with_status_path(path: impl Into<PathBuf>) -> Self {
        Self {
            status_path: Some(path.into()),
        }
    }
}

impl Default for DebuggerProbe {
    fn default() -> Self {
        let status_path = cfg!(any(target_os = "linux", target_os = "android"))
            .then(|| PathBuf::from("/proc/self/status"));
        Self { status_path }
    }
}

/// `TracerPid:\t1234` → `Some(1234)`.
fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

impl IntegrityProbe for DebuggerProbe {
    fn name(&self) -> &'static str {
        "debugger"
    }

    fn reason(&self) -> ThreatReason {
        ThreatReason::DebuggerAttached
    }

    fn detect(&self) -> ProbeOutcome {
        let Some(path) = &self.status_path else {
            return ProbeOutcome::Clear;
        };
        match std::fs::read_to_string(path).ok().as_deref().and_then(tracer_pid) {
            Some(pid) => (pid != 0).into(),
            None => ProbeOutcome::Indeterminate,
        }
    }
}

/// Looks for emulator device nodes and simulator environment markers.
#[derive(Debug, Clone)]
pub struct EmulatorProbe {
    device_markers: Vec<PathBuf>,
    env_markers: Vec<&'static str>,
}

impl EmulatorProbe {
    /// Probe over custom markers.
    #[must_use]
    pub fn with_markers(device_markers: Vec<PathBuf>, env_markers: Vec<&'static str>) -> Self {
        Self {
            device_markers,
            env_markers,
        }
    }
}

impl Default for EmulatorProbe {
    fn default() -> Self {
        let device_markers: &[&str] = if cfg!(target_os = "android") {
            &[
                "/dev/qemu_pipe",
                "/dev/socket/qemud",
                "/dev/goldfish_pipe",
                "/system/lib/libc_malloc_debug_qemu.so",
                "/system/bin/qemu-props",
                "/sys/qemu_trace",
            ]
        } else {
            &[]
        };
        let env_markers: Vec<&'static str> = if cfg!(target_os = "ios") {
            vec!["SIMULATOR_DEVICE_NAME", "SIMULATOR_UDID"]
        } else {
            Vec::new()
        };
        Self::with_markers(
            device_markers.iter().map(PathBuf::from).collect(),
            env_markers,
        )
    }
}

impl IntegrityProbe for EmulatorProbe {
    fn name(&self) -> &'static str {
        "emulator"
    }

    fn reason(&self) -> ThreatReason {
        ThreatReason::Emulator
    }

    fn detect(&self) -> ProbeOutcome {
        let detected = any_exists(&self.device_markers)
            || self
                .env_markers
                .iter()
                .any(|var| std::env::var_os(var).is_some());
        detected.into()
    }
}

/// Checks the CPU flags for a hypervisor bit. Many legitimate devices run
/// under one, so this is only a heuristic.
#[derive(Debug, Clone)]
pub struct HypervisorProbe {
    cpuinfo_path: Option<PathBuf>,
}

impl HypervisorProbe {
    /// Probe over a custom cpuinfo file.
    #[must_use]
    pub fn with_cpuinfo_path(path: impl Into<PathBuf>) -> Self {
        Self {
            cpuinfo_path: Some(path.into()),
        }
    }
}

impl Default for HypervisorProbe {
    fn default() -> Self {
        let cpuinfo_path =
            cfg!(target_os = "android").then(|| PathBuf::from("/proc/cpuinfo"));
        Self { cpuinfo_path }
    }
}

fn has_hypervisor_flag(cpuinfo: &str) -> bool {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("flags") || line.starts_with("Features"))
        .filter_map(|line| line.split_once(':'))
        .any(|(_, flags)| flags.split_whitespace().any(|flag| flag == "hypervisor"))
}

impl IntegrityProbe for HypervisorProbe {
    fn name(&self) -> &'static str {
        "hypervisor"
    }

    fn reason(&self) -> ThreatReason {
        ThreatReason::Emulator
    }

    fn confidence(&self) -> SignalConfidence {
        SignalConfidence::Low
    }

    fn detect(&self) -> ProbeOutcome {
        let Some(path) = &self.cpuinfo_path else {
            return ProbeOutcome::Clear;
        };
        read_optional(path).map_or(ProbeOutcome::Indeterminate, |cpuinfo| {
            has_hypervisor_flag(&cpuinfo).into()
        })
    }
}

fn read_optional(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

/// The probes used on a real device.
#[must_use]
pub fn default_probes() -> Vec<Box<dyn IntegrityProbe>> {
    vec![
        Box::new(RootMarkerProbe::default()),
        Box::new(DebuggerProbe::default()),
        Box::new(EmulatorProbe::default()),
        Box::new(HypervisorProbe::default()),
    ]
}
