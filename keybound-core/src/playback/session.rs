use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use zeroize::Zeroizing;

use super::container::ContainerReader;
use crate::content_key::{ContentKeyUnwrapper, RawContentKey, WrappedContentKey};
use crate::error::{KeyboundError, KeyboundResult};
use crate::integrity::{IntegrityMonitor, SubscriptionId, TrustVerdict, VerdictListener};
use crate::keystore::KeyHandle;

/// Lifecycle of a [`PlaybackSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, uniffi::Enum)]
pub enum PlaybackState {
    /// Container opened, no key yet.
    Idle,
    /// Content key held, not yet decoding.
    KeyLoaded,
    /// Decoding chunks.
    Playing,
    /// Terminal. The key has been destroyed.
    Stopped,
}

/// Why a session entered [`PlaybackState::Stopped`].
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum StopReason {
    /// The integrity verdict left `Trusted`.
    IntegrityViolation {
        /// The verdict that caused the stop.
        verdict: TrustVerdict,
    },
    /// The content key could not be obtained.
    KeyUnavailable,
    /// A chunk failed authentication.
    ContentIntegrity,
    /// The container could not be read.
    SourceError {
        /// Description of the read failure.
        message: String,
    },
    /// Every chunk was delivered.
    EndOfStream,
    /// The host stopped the session.
    Requested,
}

/// Host-side notifications about a session.
#[uniffi::export(with_foreign)]
pub trait PlaybackObserver: Send + Sync {
    /// The session moved to `state`.
    fn on_state_change(&self, state: PlaybackState);

    /// The session stopped. Called once per session, possibly from the
    /// integrity monitor's thread.
    fn on_stopped(&self, reason: StopReason);
}

/// Result of [`PlaybackSession::next_chunk`].
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Decrypted media bytes, zeroed when dropped.
    Data(Zeroizing<Vec<u8>>),
    /// The stream is complete.
    EndOfStream,
    /// Playback was halted; no further data will be produced.
    Halted(StopReason),
}

struct Lifecycle {
    state: PlaybackState,
    stop_reason: Option<StopReason>,
}

/// State shared between the session and its verdict listener.
struct SessionShared {
    halted: AtomicBool,
    key: Mutex<Option<RawContentKey>>,
    lifecycle: Mutex<Lifecycle>,
    observer: Option<Arc<dyn PlaybackObserver>>,
}

impl SessionShared {
    fn state(&self) -> PlaybackState {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    fn transition(&self, state: PlaybackState) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            if lifecycle.state == PlaybackState::Stopped {
                return;
            }
            lifecycle.state = state;
        }
        if let Some(observer) = &self.observer {
            observer.on_state_change(state);
        }
    }

    /// Raises the halt flag, destroys the key, then enters `Stopped`.
    /// Only the first call records a reason and notifies the observer.
    fn halt(&self, reason: StopReason) {
        self.halted.store(true, Ordering::SeqCst);
        drop(
            self.key
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            if lifecycle.state == PlaybackState::Stopped {
                return;
            }
            lifecycle.state = PlaybackState::Stopped;
            lifecycle.stop_reason = Some(reason.clone());
        }
        match &reason {
            StopReason::IntegrityViolation { verdict } => {
                tracing::warn!("playback halted: integrity verdict {:?}", verdict.level);
            }
            StopReason::ContentIntegrity => tracing::error!("playback halted: corrupt content"),
            StopReason::SourceError { message } => {
                tracing::error!("playback halted: unreadable container: {message}");
            }
            _ => tracing::debug!("playback stopped: {reason:?}"),
        }
        if let Some(observer) = &self.observer {
            observer.on_state_change(PlaybackState::Stopped);
            observer.on_stopped(reason);
        }
    }

    fn stop_reason(&self) -> Option<StopReason> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop_reason
            .clone()
    }
}

/// Halts the session it guards when the verdict leaves `Trusted`.
struct SessionGuard {
    shared: Weak<SessionShared>,
}

impl VerdictListener for SessionGuard {
    fn on_verdict_change(&self, verdict: TrustVerdict) {
        if verdict.is_trusted() {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.halt(StopReason::IntegrityViolation { verdict });
        }
    }
}

/// Opens playback sessions gated on the integrity verdict.
pub struct SecurePlaybackController {
    monitor: Arc<IntegrityMonitor>,
    unwrapper: ContentKeyUnwrapper,
    observer: Option<Arc<dyn PlaybackObserver>>,
}

impl SecurePlaybackController {
    /// Controller unwrapping keys with `unwrapper`, gated on `monitor`.
    #[must_use]
    pub const fn new(monitor: Arc<IntegrityMonitor>, unwrapper: ContentKeyUnwrapper) -> Self {
        Self {
            monitor,
            unwrapper,
            observer: None,
        }
    }

    /// Notifies `observer` about every session this controller opens.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn PlaybackObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Opens a session over an encrypted container.
    ///
    /// The session is subscribed to verdict changes from this point on.
    ///
    /// # Errors
    ///
    /// Any error of [`ContainerReader::new`].
    pub fn open<R: Read>(&self, source: R) -> KeyboundResult<PlaybackSession<R>> {
        let reader = ContainerReader::new(source)?;
        let shared = Arc::new(SessionShared {
            halted: AtomicBool::new(false),
            key: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle {
                state: PlaybackState::Idle,
                stop_reason: None,
            }),
            observer: self.observer.clone(),
        });
        let subscription = self.monitor.on_verdict_change(Arc::new(SessionGuard {
            shared: Arc::downgrade(&shared),
        }));
        Ok(PlaybackSession {
            shared,
            reader,
            monitor: Arc::clone(&self.monitor),
            unwrapper: self.unwrapper.clone(),
            subscription,
        })
    }
}

/// Decrypts one container for playback.
///
/// `Idle → KeyLoaded → Playing → Stopped`. Any verdict other than
/// `Trusted` forces `Stopped`, destroying the key before the verdict
/// evaluation that observed it returns. Dropping the session destroys the
/// key as well.
pub struct PlaybackSession<R: Read> {
    shared: Arc<SessionShared>,
    reader: ContainerReader<R>,
    monitor: Arc<IntegrityMonitor>,
    unwrapper: ContentKeyUnwrapper,
    subscription: SubscriptionId,
}

impl<R: Read> PlaybackSession<R> {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    /// Why the session stopped, once it has.
    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.shared.stop_reason()
    }

    /// Whether the session currently holds a content key.
    #[must_use]
    pub fn has_key(&self) -> bool {
        self.shared
            .key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Unwraps `wrapped` with the identity key and loads it.
    ///
    /// # Errors
    ///
    /// Any unwrap error, after which the session is stopped with
    /// [`StopReason::KeyUnavailable`], or [`StopReason::IntegrityViolation`]
    /// if the environment became untrusted meanwhile; otherwise as
    /// [`Self::load_raw_key`]. Dropping the future before it completes
    /// leaves the session `Idle` without a key.
    pub async fn load_key(
        &mut self,
        wrapped: &WrappedContentKey,
        handle: &KeyHandle,
    ) -> KeyboundResult<()> {
        self.expect_state(PlaybackState::Idle)?;
        if let Err(err) = self.check_trusted() {
            self.shared.halt(StopReason::IntegrityViolation {
                verdict: self.monitor.current_verdict(),
            });
            return Err(err);
        }
        match self.unwrapper.unwrap(wrapped, handle).await {
            Ok(key) => self.load_raw_key(key),
            Err(err) => {
                let verdict = self.monitor.current_verdict();
                if verdict.is_trusted() {
                    self.shared.halt(StopReason::KeyUnavailable);
                } else {
                    self.shared.halt(StopReason::IntegrityViolation { verdict });
                }
                Err(err)
            }
        }
    }

    /// Loads an already unwrapped key. `Idle → KeyLoaded`.
    ///
    /// The key is dropped, and the session stopped, if the verdict is not
    /// `Trusted` at the moment it would be stored.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::InvalidState`] outside `Idle` or when the
    /// environment is not trusted, [`KeyboundError::InvalidInput`] if the key
    /// is for another cipher than the container.
    pub fn load_raw_key(&mut self, key: RawContentKey) -> KeyboundResult<()> {
        self.expect_state(PlaybackState::Idle)?;
        if key.algorithm() != self.reader.header().algorithm() {
            self.shared.halt(StopReason::KeyUnavailable);
            return Err(KeyboundError::InvalidInput(format!(
                "content key is for {:?} but the container uses {:?}",
                key.algorithm(),
                self.reader.header().algorithm()
            )));
        }

        {
            let mut slot = self.shared.key.lock().unwrap_or_else(PoisonError::into_inner);
            // Checked under the slot lock: a verdict change either lands
            // before this check or waits for the lock and clears the key.
            if !self.shared.halted.load(Ordering::SeqCst) && self.monitor.is_trusted() {
                *slot = Some(key);
            }
        }

        if self.has_key() {
            self.shared.transition(PlaybackState::KeyLoaded);
            return Ok(());
        }
        let err = self.check_trusted().err().unwrap_or_else(|| {
            KeyboundError::InvalidState("session was stopped while loading the key".to_string())
        });
        self.shared.halt(StopReason::IntegrityViolation {
            verdict: self.monitor.current_verdict(),
        });
        Err(err)
    }

    /// `KeyLoaded → Playing`.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::InvalidState`] in any other state.
    pub fn play(&mut self) -> KeyboundResult<()> {
        self.expect_state(PlaybackState::KeyLoaded)?;
        self.shared.transition(PlaybackState::Playing);
        Ok(())
    }

    /// Decrypts the next chunk.
    ///
    /// A verdict change observed before or during decryption yields
    /// [`ChunkOutcome::Halted`] and discards the chunk.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::ContentIntegrity`] if the container is corrupt, or
    /// [`KeyboundError::Storage`] if it cannot be read; the session is
    /// stopped either way. [`KeyboundError::InvalidState`] before `play`.
    pub fn next_chunk(&mut self) -> KeyboundResult<ChunkOutcome> {
        match self.state() {
            PlaybackState::Playing => {}
            PlaybackState::Stopped => return Ok(self.stopped_outcome()),
            state => {
                return Err(KeyboundError::InvalidState(format!(
                    "cannot decode in state {state:?}"
                )))
            }
        }
        if self.shared.halted.load(Ordering::SeqCst) {
            return Ok(self.stopped_outcome());
        }

        let sealed = match self.reader.next_sealed() {
            Ok(Some(sealed)) => sealed,
            Ok(None) => {
                self.shared.halt(StopReason::EndOfStream);
                return Ok(ChunkOutcome::EndOfStream);
            }
            Err(err) => {
                self.shared.halt(failure_reason(&err));
                return Err(err);
            }
        };

        let opened = {
            let slot = self.shared.key.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(key) => self.reader.open_chunk(key, &sealed),
                None => return Ok(self.stopped_outcome()),
            }
        };

        match opened {
            Ok(_) if self.shared.halted.load(Ordering::SeqCst) => Ok(self.stopped_outcome()),
            Ok(plaintext) => Ok(ChunkOutcome::Data(plaintext)),
            Err(err) => {
                self.shared.halt(failure_reason(&err));
                Err(err)
            }
        }
    }

    /// Stops the session and destroys the key. Idempotent.
    pub fn stop(&mut self) {
        self.shared.halt(StopReason::Requested);
    }

    fn stopped_outcome(&self) -> ChunkOutcome {
        match self.shared.stop_reason() {
            Some(StopReason::EndOfStream) => ChunkOutcome::EndOfStream,
            Some(reason) => ChunkOutcome::Halted(reason),
            None => ChunkOutcome::Halted(StopReason::Requested),
        }
    }

    fn expect_state(&self, expected: PlaybackState) -> KeyboundResult<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(KeyboundError::InvalidState(format!(
                "expected {expected:?}, session is {state:?}"
            )))
        }
    }

    fn check_trusted(&self) -> KeyboundResult<()> {
        let verdict = self.monitor.current_verdict();
        if verdict.is_trusted() {
            Ok(())
        } else {
            Err(KeyboundError::InvalidState(format!(
                "environment is {:?}",
                verdict.level
            )))
        }
    }
}

fn failure_reason(err: &KeyboundError) -> StopReason {
    match err {
        KeyboundError::ContentIntegrity(_) => StopReason::ContentIntegrity,
        other => StopReason::SourceError {
            message: other.to_string(),
        },
    }
}

impl<R: Read> Drop for PlaybackSession<R> {
    fn drop(&mut self) {
        self.monitor.unsubscribe(self.subscription);
        drop(
            self.shared
                .key
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }
}
