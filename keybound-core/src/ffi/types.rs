//! FFI-safe types returned by the exported objects.

use std::sync::Arc;

use crate::config::{BackendConfig, Environment};
use crate::keystore::{DeviceIdentity, KeyHandle, KeyStorageTier};
use crate::playback::{ChunkOutcome, StopReason};

/// Reference to the identity key held by the host.
///
/// Obtained from [`super::DeviceKeys::ensure_keypair`]; it cannot be forged
/// from foreign code.
#[derive(Debug, uniffi::Object)]
pub struct DeviceKeyHandle {
    inner: KeyHandle,
}

impl DeviceKeyHandle {
    pub(crate) const fn new(inner: KeyHandle) -> Self {
        Self { inner }
    }

    pub(crate) const fn inner(&self) -> &KeyHandle {
        &self.inner
    }
}

#[uniffi::export]
impl DeviceKeyHandle {
    /// Alias of the key inside the key store.
    #[must_use]
    pub fn alias(&self) -> String {
        self.inner.alias().to_string()
    }

    /// Hex-encoded SHA-256 of the public key this handle refers to.
    #[must_use]
    pub fn key_id(&self) -> String {
        self.inner.key_id()
    }
}

/// Snapshot of the installation's identity.
#[derive(Debug, Clone, uniffi::Record)]
pub struct DeviceIdentityInfo {
    /// Handle to the private key.
    pub handle: Arc<DeviceKeyHandle>,
    /// Public key, `SubjectPublicKeyInfo` DER.
    pub public_key: Vec<u8>,
    /// Identifier assigned by the backend; `None` until registered.
    pub device_id: Option<String>,
    /// Unix timestamp (seconds) of key creation.
    pub created_at: u64,
    /// Isolation level of the key store.
    pub storage_tier: KeyStorageTier,
}

impl From<DeviceIdentity> for DeviceIdentityInfo {
    fn from(identity: DeviceIdentity) -> Self {
        Self {
            handle: Arc::new(DeviceKeyHandle::new(identity.handle)),
            public_key: identity.public_key,
            device_id: identity.device_id,
            created_at: identity.created_at,
            storage_tier: identity.storage_tier,
        }
    }
}

/// Result of [`super::ProtectedSession::next_chunk`].
#[derive(Debug, uniffi::Enum)]
pub enum MediaChunk {
    /// Decrypted media bytes. Once handed over, the host owns their lifetime.
    Data {
        /// The chunk's plaintext.
        bytes: Vec<u8>,
    },
    /// The stream is complete.
    EndOfStream,
    /// Playback was halted; no further data will be produced.
    Halted {
        /// Why the session stopped.
        reason: StopReason,
    },
}

impl From<ChunkOutcome> for MediaChunk {
    fn from(outcome: ChunkOutcome) -> Self {
        match outcome {
            ChunkOutcome::Data(mut plaintext) => Self::Data {
                bytes: std::mem::take(&mut *plaintext),
            },
            ChunkOutcome::EndOfStream => Self::EndOfStream,
            ChunkOutcome::Halted(reason) => Self::Halted { reason },
        }
    }
}

/// Backend for `environment`, or the self-hosted `base_url` when given.
pub(crate) fn backend_config(environment: Environment, base_url: Option<&str>) -> BackendConfig {
    base_url.map_or_else(
        || BackendConfig::for_environment(environment),
        BackendConfig::with_base_url,
    )
}
