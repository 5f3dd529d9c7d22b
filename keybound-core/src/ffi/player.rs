//! Protected playback for Swift and Kotlin.

use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::device::DeviceKeys;
use super::types::{DeviceKeyHandle, MediaChunk};
use crate::content_key::{ContentKeyUnwrapper, WrappedContentKey};
use crate::error::{KeyboundError, KeyboundResult};
use crate::integrity::IntegrityMonitor;
use crate::playback::{
    PlaybackObserver, PlaybackSession, PlaybackState, SecurePlaybackController, StopReason,
};

type MediaSource = Box<dyn Read + Send>;

/// Opens protected sessions over encrypted containers.
///
/// # Example (Kotlin)
///
/// ```kotlin
/// val player = ProtectedPlayer(keys, monitor, observer)
/// val session = player.openFile(path)
/// session.loadKey(grant.wrappedKey, handle)
/// session.play()
/// while (true) {
///     when (val chunk = session.nextChunk()) {
///         is MediaChunk.Data -> decoder.feed(chunk.bytes)
///         else -> break
///     }
/// }
/// ```
#[derive(uniffi::Object)]
pub struct ProtectedPlayer {
    controller: SecurePlaybackController,
}

#[uniffi::export]
impl ProtectedPlayer {
    /// Player unwrapping keys through `keys`, gated on `monitor`.
    #[uniffi::constructor]
    #[must_use]
    pub fn new(
        keys: &DeviceKeys,
        monitor: Arc<IntegrityMonitor>,
        observer: Option<Arc<dyn PlaybackObserver>>,
    ) -> Arc<Self> {
        let unwrapper = ContentKeyUnwrapper::new(keys.manager(), Arc::clone(&monitor));
        let controller = SecurePlaybackController::new(monitor, unwrapper);
        let controller = match observer {
            Some(observer) => controller.with_observer(observer),
            None => controller,
        };
        Arc::new(Self { controller })
    }

    /// Opens the container stored at `path`.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::Storage`] if the file cannot be opened, otherwise as
    /// [`SecurePlaybackController::open`].
    pub fn open_file(&self, path: &str) -> KeyboundResult<Arc<ProtectedSession>> {
        let file = File::open(path)
            .map_err(|err| KeyboundError::Storage(format!("failed to open {path}: {err}")))?;
        self.open(Box::new(BufReader::new(file)))
    }

    /// Opens a container held in memory.
    ///
    /// # Errors
    ///
    /// As [`SecurePlaybackController::open`].
    pub fn open_bytes(&self, container: Vec<u8>) -> KeyboundResult<Arc<ProtectedSession>> {
        self.open(Box::new(Cursor::new(container)))
    }
}

impl ProtectedPlayer {
    fn open(&self, source: MediaSource) -> KeyboundResult<Arc<ProtectedSession>> {
        let session = self.controller.open(source)?;
        Ok(Arc::new(ProtectedSession {
            inner: Mutex::new(session),
        }))
    }
}

/// One playback session. Calls are serialized; a halt caused by the
/// integrity monitor takes effect without waiting for them.
#[derive(uniffi::Object)]
pub struct ProtectedSession {
    inner: Mutex<PlaybackSession<MediaSource>>,
}

#[uniffi::export(async_runtime = "tokio")]
impl ProtectedSession {
    /// Current lifecycle state.
    pub async fn state(&self) -> PlaybackState {
        self.inner.lock().await.state()
    }

    /// Why the session stopped, once it has.
    pub async fn stop_reason(&self) -> Option<StopReason> {
        self.inner.lock().await.stop_reason()
    }

    /// Unwraps `wrapped` with the identity key behind `handle` and loads it.
    ///
    /// # Errors
    ///
    /// As [`PlaybackSession::load_key`].
    pub async fn load_key(
        &self,
        wrapped: &WrappedContentKey,
        handle: &DeviceKeyHandle,
    ) -> KeyboundResult<()> {
        self.inner
            .lock()
            .await
            .load_key(wrapped, handle.inner())
            .await
    }

    /// Starts decoding.
    ///
    /// # Errors
    ///
    /// As [`PlaybackSession::play`].
    pub async fn play(&self) -> KeyboundResult<()> {
        self.inner.lock().await.play()
    }

    /// Decrypts the next chunk.
    ///
    /// # Errors
    ///
    /// As [`PlaybackSession::next_chunk`].
    pub async fn next_chunk(&self) -> KeyboundResult<MediaChunk> {
        Ok(self.inner.lock().await.next_chunk()?.into())
    }

    /// Stops the session and destroys the key.
    pub async fn stop(&self) {
        self.inner.lock().await.stop();
    }
}
