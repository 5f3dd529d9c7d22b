use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::probes::{default_probes, IntegrityProbe, ProbeOutcome, SignalConfidence};
use super::verdict::{ThreatReason, TrustLevel, TrustVerdict};

/// Default interval between background evaluations.
pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(1);

/// What to do when only low-confidence heuristics fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, uniffi::Enum)]
pub enum SuspectPolicy {
    /// Report [`TrustLevel::Suspect`]. Playback is still halted, but the
    /// host can tell heuristics from hard signals.
    #[default]
    Report,
    /// Escalate to [`TrustLevel::Compromised`].
    Conservative,
}

/// Receives verdict changes.
///
/// Called synchronously on the thread that ran the evaluation, before the
/// evaluation returns. Implementations must be quick and must not call back
/// into the monitor.
#[uniffi::export(with_foreign)]
pub trait VerdictListener: Send + Sync {
    /// The verdict changed to `verdict`.
    fn on_verdict_change(&self, verdict: TrustVerdict);
}

/// Identifies a listener registration.
pub type SubscriptionId = u64;

struct Listeners {
    next_id: SubscriptionId,
    entries: Vec<(SubscriptionId, Arc<dyn VerdictListener>)>,
}

/// Continuously assesses the runtime environment and publishes
/// [`TrustVerdict`] changes.
///
/// Reads of the current verdict are lock-free with respect to evaluation:
/// they go through a [`watch`] channel that always holds the latest value.
#[derive(uniffi::Object)]
pub struct IntegrityMonitor {
    probes: Vec<Box<dyn IntegrityProbe>>,
    policy: SuspectPolicy,
    host_signals: Mutex<BTreeSet<ThreatReason>>,
    listeners: Mutex<Listeners>,
    evaluation: Mutex<()>,
    evaluations: AtomicU64,
    verdict: watch::Sender<TrustVerdict>,
}

impl IntegrityMonitor {
    /// Monitor over `probes`. Runs one evaluation before returning so the
    /// initial verdict reflects the environment.
    #[must_use]
    pub fn new(probes: Vec<Box<dyn IntegrityProbe>>, policy: SuspectPolicy) -> Self {
        let (verdict, _) = watch::channel(TrustVerdict::trusted());
        let monitor = Self {
            probes,
            policy,
            host_signals: Mutex::new(BTreeSet::new()),
            listeners: Mutex::new(Listeners {
                next_id: 1,
                entries: Vec::new(),
            }),
            evaluation: Mutex::new(()),
            evaluations: AtomicU64::new(0),
            verdict,
        };
        monitor.evaluate();
        monitor
    }

    /// Receiver that observes every published verdict.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<TrustVerdict> {
        self.verdict.subscribe()
    }

    /// Evaluates every `interval` on the current tokio runtime until the
    /// returned task is dropped or the monitor is.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> MonitorTask {
        let monitor: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.evaluate();
            }
        });
        MonitorTask { handle }
    }

    fn assess(&self) -> TrustVerdict {
        let mut reasons = BTreeSet::new();
        let mut high = false;
        let mut low = false;

        for probe in &self.probes {
            match probe.detect() {
                ProbeOutcome::Clear => {}
                ProbeOutcome::Detected => {
                    reasons.insert(probe.reason());
                    match probe.confidence() {
                        SignalConfidence::High => high = true,
                        SignalConfidence::Low => low = true,
                    }
                }
                ProbeOutcome::Indeterminate => {
                    tracing::debug!("probe {} was indeterminate", probe.name());
                    reasons.insert(ThreatReason::Unknown);
                    low = true;
                }
            }
        }

        {
            let signals = self
                .host_signals
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !signals.is_empty() {
                high = true;
                reasons.extend(signals.iter().copied());
            }
        }

        let level = if high {
            TrustLevel::Compromised
        } else if low {
            match self.policy {
                SuspectPolicy::Report => TrustLevel::Suspect,
                SuspectPolicy::Conservative => TrustLevel::Compromised,
            }
        } else {
            TrustLevel::Trusted
        };
        TrustVerdict::new(level, reasons)
    }
}

#[uniffi::export(async_runtime = "tokio")]
impl IntegrityMonitor {
    /// Monitor over the platform's built-in probes.
    #[uniffi::constructor]
    #[must_use]
    pub fn with_default_probes(policy: SuspectPolicy) -> Self {
        Self::new(default_probes(), policy)
    }

    /// The most recent verdict.
    #[must_use]
    pub fn current_verdict(&self) -> TrustVerdict {
        self.verdict.borrow().clone()
    }

    /// Whether the most recent verdict is [`TrustLevel::Trusted`].
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.verdict.borrow().is_trusted()
    }

    /// Number of evaluations run so far.
    #[must_use]
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// Registers `listener` for verdict changes.
    pub fn on_verdict_change(&self, listener: Arc<dyn VerdictListener>) -> SubscriptionId {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, listener));
        id
    }

    /// Removes a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry, _)| *entry != id);
        listeners.entries.len() != before
    }

    /// Records a signal only the host can observe (screen capture,
    /// platform debugger APIs) and re-evaluates immediately.
    ///
    /// Host signals are high confidence.
    pub fn report_host_signal(&self, reason: ThreatReason, active: bool) -> TrustVerdict {
        {
            let mut signals = self
                .host_signals
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if active {
                signals.insert(reason);
            } else {
                signals.remove(&reason);
            }
        }
        self.evaluate()
    }

    /// Shorthand for reporting [`ThreatReason::ScreenCaptureActive`].
    pub fn report_screen_capture(&self, active: bool) -> TrustVerdict {
        self.report_host_signal(ThreatReason::ScreenCaptureActive, active)
    }

    /// Runs every probe, publishes the verdict and, when it changed,
    /// notifies listeners before returning.
    pub fn evaluate(&self) -> TrustVerdict {
        let _serial = self.evaluation.lock().unwrap_or_else(PoisonError::into_inner);
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let verdict = self.assess();
        let changed = self.verdict.send_if_modified(|current| {
            if *current == verdict {
                false
            } else {
                current.clone_from(&verdict);
                true
            }
        });

        if changed {
            match verdict.level {
                TrustLevel::Trusted => tracing::info!("integrity verdict: trusted"),
                level => tracing::warn!(
                    "integrity verdict: {level:?} ({:?})",
                    verdict.reasons
                ),
            }
            let listeners: Vec<_> = self
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            for listener in listeners {
                listener.on_verdict_change(verdict.clone());
            }
        }
        verdict
    }

    /// Evaluates every `interval` until the returned future is dropped.
    ///
    /// For hosts that drive the monitor from their own task; Rust callers
    /// usually prefer [`Self::spawn`].
    pub async fn run_every(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.evaluate();
        }
    }
}

/// Background evaluation loop started by [`IntegrityMonitor::spawn`].
/// Dropping it stops the loop.
#[derive(Debug)]
pub struct MonitorTask {
    handle: JoinHandle<()>,
}

impl MonitorTask {
    /// Stops the loop.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for MonitorTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
