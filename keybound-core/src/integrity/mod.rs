//! Runtime integrity assessment.
//!
//! The [`IntegrityMonitor`] ORs the signals of its [`IntegrityProbe`]s into
//! a [`TrustVerdict`]. Each evaluation is independent; a single clean pass
//! after a compromised one returns the verdict to
//! [`TrustLevel::Trusted`].
//!
//! Listeners registered with [`IntegrityMonitor::on_verdict_change`] run
//! synchronously inside the evaluation that produced the change, which is
//! what lets playback tear down key material before the next frame.

mod monitor;
mod probes;
mod verdict;

pub use monitor::{
    IntegrityMonitor, MonitorTask, SubscriptionId, SuspectPolicy, VerdictListener,
    DEFAULT_EVALUATION_INTERVAL,
};
pub use probes::{
    default_probes, DebuggerProbe, EmulatorProbe, HypervisorProbe, IntegrityProbe,
    ProbeOutcome, RootMarkerProbe, SignalConfidence,
};
pub use verdict::{ThreatReason, TrustLevel, TrustVerdict};
