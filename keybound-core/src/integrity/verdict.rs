use std::collections::BTreeSet;

/// Overall assessment of the runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, uniffi::Enum)]
pub enum TrustLevel {
    /// No compromise signal present. Content keys may be held.
    Trusted,
    /// Only low-confidence heuristics fired.
    Suspect,
    /// At least one high-confidence compromise signal is present.
    Compromised,
}

/// Why a verdict is not [`TrustLevel::Trusted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, uniffi::Enum)]
pub enum ThreatReason {
    /// Root or jailbreak artifacts on the filesystem.
    Rooted,
    /// The process is being traced or debugged.
    DebuggerAttached,
    /// Running on an emulator or simulator.
    Emulator,
    /// The screen is being captured or mirrored.
    ScreenCaptureActive,
    /// A probe could not determine its signal.
    Unknown,
}

/// Result of one integrity evaluation.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct TrustVerdict {
    /// Overall level.
    pub level: TrustLevel,
    /// Signals that contributed, sorted and without duplicates.
    pub reasons: Vec<ThreatReason>,
}

impl TrustVerdict {
    /// A verdict with no signals.
    #[must_use]
    pub const fn trusted() -> Self {
        Self {
            level: TrustLevel::Trusted,
            reasons: Vec::new(),
        }
    }

    /// A verdict at `level` with the given signals.
    #[must_use]
    pub fn new(level: TrustLevel, reasons: impl IntoIterator<Item = ThreatReason>) -> Self {
        let reasons: BTreeSet<_> = reasons.into_iter().collect();
        Self {
            level,
            reasons: reasons.into_iter().collect(),
        }
    }

    /// Whether content keys may exist under this verdict.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.level == TrustLevel::Trusted
    }

    /// Whether `reason` contributed to this verdict.
    #[must_use]
    pub fn has_reason(&self, reason: ThreatReason) -> bool {
        self.reasons.contains(&reason)
    }
}

impl Default for TrustVerdict {
    fn default() -> Self {
        Self::trusted()
    }
}
