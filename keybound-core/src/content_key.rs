//! Content key unwrapping.
//!
//! The backend wraps each content item's symmetric key under the device's
//! RSA public key. [`ContentKeyUnwrapper`] recovers it through the
//! [`IdentityKeyManager`] into a [`RawContentKey`] that lives only in memory
//! and is zeroed when dropped. Keys are only released while the
//! [`IntegrityMonitor`] reports a trusted environment.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KeyboundError, KeyboundResult};
use crate::integrity::IntegrityMonitor;
use crate::keystore::{IdentityKeyManager, KeyHandle, WrapAlgorithm};

/// Authenticated cipher protecting the media stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, uniffi::Enum,
)]
pub enum ContentAlgorithm {
    /// AES-128 in GCM mode.
    #[serde(rename = "A128GCM")]
    Aes128Gcm,
    /// AES-256 in GCM mode.
    #[default]
    #[serde(rename = "A256GCM")]
    Aes256Gcm,
    /// XChaCha20-Poly1305.
    #[serde(rename = "XC20P")]
    XChaCha20Poly1305,
}

impl ContentAlgorithm {
    /// Symmetric key width in bytes.
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm | Self::XChaCha20Poly1305 => 32,
        }
    }

    /// Nonce width in bytes.
    #[must_use]
    pub const fn nonce_len(self) -> usize {
        match self {
            Self::Aes128Gcm | Self::Aes256Gcm => 12,
            Self::XChaCha20Poly1305 => 24,
        }
    }

    /// Authentication tag width in bytes.
    #[must_use]
    pub const fn tag_len(self) -> usize {
        match self {
            Self::Aes128Gcm | Self::Aes256Gcm | Self::XChaCha20Poly1305 => 16,
        }
    }

    pub(crate) const fn id(self) -> u8 {
        match self {
            Self::Aes128Gcm => 1,
            Self::Aes256Gcm => 2,
            Self::XChaCha20Poly1305 => 3,
        }
    }

    pub(crate) const fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Aes128Gcm),
            2 => Some(Self::Aes256Gcm),
            3 => Some(Self::XChaCha20Poly1305),
            _ => None,
        }
    }
}

/// A content key encrypted under the device public key, as delivered by the
/// backend. Transient: discard after unwrapping.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct WrappedContentKey {
    /// Asymmetric scheme used to wrap the key.
    pub wrap_algorithm: WrapAlgorithm,
    /// Cipher the unwrapped key is meant for; fixes the expected key width.
    pub content_algorithm: ContentAlgorithm,
    /// Wrapped key bytes.
    pub ciphertext: Vec<u8>,
}

impl WrappedContentKey {
    /// Wraps decoded ciphertext bytes.
    #[must_use]
    pub const fn new(
        wrap_algorithm: WrapAlgorithm,
        content_algorithm: ContentAlgorithm,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            wrap_algorithm,
            content_algorithm,
            ciphertext,
        }
    }

    /// Decodes the base64 blob the backend sends.
    ///
    /// # Errors
    ///
    /// Returns [`KeyboundError::Serialization`] if `encoded` is not valid base64.
    pub fn from_base64(
        wrap_algorithm: WrapAlgorithm,
        content_algorithm: ContentAlgorithm,
        encoded: &str,
    ) -> KeyboundResult<Self> {
        let ciphertext = STANDARD
            .decode(encoded.trim())
            .map_err(|err| KeyboundError::Serialization(format!("invalid wrapped key: {err}")))?;
        Ok(Self::new(wrap_algorithm, content_algorithm, ciphertext))
    }
}

/// Symmetric content key, held only in memory for one playback session.
///
/// # Security
///
/// - The key is zeroized on drop.
/// - It is neither `Clone` nor serializable, and its `Debug` output is redacted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RawContentKey {
    #[zeroize(skip)]
    algorithm: ContentAlgorithm,
    bytes: Vec<u8>,
}

impl RawContentKey {
    /// Takes ownership of `bytes` as a key for `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyboundError::MalformedKey`] if the width does not match
    /// the algorithm. `bytes` is zeroed either way.
    pub fn from_bytes(algorithm: ContentAlgorithm, mut bytes: Vec<u8>) -> KeyboundResult<Self> {
        if bytes.len() != algorithm.key_len() {
            let actual = bytes.len() as u64;
            bytes.zeroize();
            return Err(KeyboundError::MalformedKey {
                expected: algorithm.key_len() as u64,
                actual,
            });
        }
        Ok(Self { algorithm, bytes })
    }

    /// Generates a fresh random key, for packaging content.
    #[must_use]
    pub fn generate(algorithm: ContentAlgorithm) -> Self {
        let mut bytes = vec![0u8; algorithm.key_len()];
        OsRng.fill_bytes(&mut bytes);
        Self { algorithm, bytes }
    }

    /// Cipher this key is for.
    #[must_use]
    pub const fn algorithm(&self) -> ContentAlgorithm {
        self.algorithm
    }
}

impl ExposeSecret<[u8]> for RawContentKey {
    fn expose_secret(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for RawContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawContentKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Asks the user to pass a presence check (biometric or passcode).
#[uniffi::export(with_foreign)]
pub trait UserPresencePrompt: Send + Sync {
    /// Shows the prompt and blocks until it is dismissed. Returns `true` if
    /// the check succeeded.
    fn request_user_presence(&self, reason: String) -> bool;
}

/// Recovers raw content keys through the identity key, gated on the
/// integrity verdict.
#[derive(Clone)]
pub struct ContentKeyUnwrapper {
    manager: Arc<IdentityKeyManager>,
    monitor: Arc<IntegrityMonitor>,
}

impl ContentKeyUnwrapper {
    /// Unwrapper backed by `manager`, releasing keys only while `monitor`
    /// reports a trusted environment.
    #[must_use]
    pub const fn new(manager: Arc<IdentityKeyManager>, monitor: Arc<IntegrityMonitor>) -> Self {
        Self { manager, monitor }
    }

    /// Unwraps `wrapped` with the private key behind `handle`.
    ///
    /// The verdict is checked before the private key is used and again once
    /// it returns; decrypted bytes are zeroed if the environment became
    /// untrusted in between. Dropping the returned future before it
    /// completes leaves no key material behind.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::InvalidState`] if the environment is not trusted,
    /// any error of [`IdentityKeyManager::decrypt`], or
    /// [`KeyboundError::MalformedKey`] if the recovered key does not have the
    /// width `wrapped.content_algorithm` requires.
    pub async fn unwrap(
        &self,
        wrapped: &WrappedContentKey,
        handle: &KeyHandle,
    ) -> KeyboundResult<RawContentKey> {
        self.check_trusted()?;
        let mut decrypted = self
            .manager
            .decrypt(handle, &wrapped.ciphertext, wrapped.wrap_algorithm)
            .await?;
        // `decrypted` is zeroed on drop if this fails
        self.check_trusted()?;
        let key =
            RawContentKey::from_bytes(wrapped.content_algorithm, std::mem::take(&mut *decrypted));
        if let Err(err) = &key {
            tracing::error!("unwrapped content key rejected: {err}");
        }
        key
    }

    /// Like [`Self::unwrap`], but if the key store demands a user-presence
    /// check, shows `prompt` and retries exactly once.
    ///
    /// # Errors
    ///
    /// As [`Self::unwrap`]; [`KeyboundError::AuthenticationRequired`] if the
    /// prompt is declined or the retry is refused again.
    pub async fn unwrap_with_reprompt(
        &self,
        wrapped: &WrappedContentKey,
        handle: &KeyHandle,
        prompt: Arc<dyn UserPresencePrompt>,
    ) -> KeyboundResult<RawContentKey> {
        match self.unwrap(wrapped, handle).await {
            Err(KeyboundError::AuthenticationRequired) => {
                let confirmed = tokio::task::spawn_blocking(move || {
                    prompt.request_user_presence("Unlock protected content".to_string())
                })
                .await
                .map_err(|err| KeyboundError::InvalidState(format!("prompt task failed: {err}")))?;
                if !confirmed {
                    return Err(KeyboundError::AuthenticationRequired);
                }
                self.unwrap(wrapped, handle).await
            }
            result => result,
        }
    }

    fn check_trusted(&self) -> KeyboundResult<()> {
        let verdict = self.monitor.current_verdict();
        if verdict.is_trusted() {
            return Ok(());
        }
        tracing::warn!("content key refused: environment is {:?}", verdict.level);
        Err(KeyboundError::InvalidState(format!(
            "environment is not trusted ({:?})",
            verdict.level
        )))
    }
}

/// Wraps `key` under an RSA public key (`SubjectPublicKeyInfo` DER), as the
/// backend does when issuing a content key to a device.
///
/// # Errors
///
/// Returns [`KeyboundError::InvalidInput`] if the public key cannot be parsed
/// or the key is too long for the padding.
pub fn wrap_content_key(
    public_key_der: &[u8],
    key: &RawContentKey,
    wrap_algorithm: WrapAlgorithm,
) -> KeyboundResult<WrappedContentKey> {
    let public_key = RsaPublicKey::from_public_key_der(public_key_der)
        .map_err(|err| KeyboundError::InvalidInput(format!("invalid public key: {err}")))?;
    let ciphertext = public_key
        .encrypt(&mut OsRng, wrap_algorithm.padding(), key.expose_secret())
        .map_err(|err| KeyboundError::InvalidInput(format!("wrap failed: {err}")))?;
    Ok(WrappedContentKey::new(
        wrap_algorithm,
        key.algorithm(),
        ciphertext,
    ))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::integrity::{SuspectPolicy, ThreatReason};
    use crate::keystore::SoftwareKeyStore;
    use crate::storage::MemoryBlobStore;

    async fn setup() -> (ContentKeyUnwrapper, Arc<IntegrityMonitor>, KeyHandle, Vec<u8>) {
        let monitor = Arc::new(IntegrityMonitor::new(Vec::new(), SuspectPolicy::Report));
        let manager = Arc::new(IdentityKeyManager::new(
            Arc::new(SoftwareKeyStore::new()),
            Arc::new(MemoryBlobStore::new()),
        ));
        let handle = manager.ensure_keypair().await.unwrap();
        let public_key = manager.export_public_key(&handle).await.unwrap();
        (
            ContentKeyUnwrapper::new(manager, Arc::clone(&monitor)),
            monitor,
            handle,
            public_key,
        )
    }

    #[test_case(ContentAlgorithm::Aes128Gcm, WrapAlgorithm::RsaOaepSha256 ; "aes128 oaep256")]
    #[test_case(ContentAlgorithm::Aes256Gcm, WrapAlgorithm::RsaOaepSha256 ; "aes256 oaep256")]
    #[test_case(ContentAlgorithm::XChaCha20Poly1305, WrapAlgorithm::RsaOaepSha1 ; "xchacha oaep1")]
    #[tokio::test]
    async fn test_unwrap_recovers_wrapped_key(
        content_algorithm: ContentAlgorithm,
        wrap_algorithm: WrapAlgorithm,
    ) {
        let (unwrapper, _monitor, handle, public_key) = setup().await;
        let key = RawContentKey::generate(content_algorithm);
        let wrapped = wrap_content_key(&public_key, &key, wrap_algorithm).unwrap();

        assert_ne!(wrapped.ciphertext.as_slice(), key.expose_secret());

        let unwrapped = unwrapper.unwrap(&wrapped, &handle).await.unwrap();
        assert_eq!(unwrapped.expose_secret(), key.expose_secret());
        assert_eq!(unwrapped.algorithm(), content_algorithm);
    }

    #[tokio::test]
    async fn test_wrong_width_is_malformed_key() {
        let (unwrapper, _monitor, handle, public_key) = setup().await;
        let key = RawContentKey::generate(ContentAlgorithm::Aes128Gcm);
        let mut wrapped = wrap_content_key(&public_key, &key, WrapAlgorithm::RsaOaepSha256).unwrap();
        wrapped.content_algorithm = ContentAlgorithm::Aes256Gcm;

        match unwrapper.unwrap(&wrapped, &handle).await {
            Err(KeyboundError::MalformedKey { expected, actual }) => {
                assert_eq!(expected, 32);
                assert_eq!(actual, 16);
            }
            other => panic!("expected MalformedKey, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tampered_wrapped_key_fails() {
        let (unwrapper, _monitor, handle, public_key) = setup().await;
        let key = RawContentKey::generate(ContentAlgorithm::Aes256Gcm);
        let wrapped = wrap_content_key(&public_key, &key, WrapAlgorithm::RsaOaepSha256).unwrap();

        for index in [0, wrapped.ciphertext.len() / 2, wrapped.ciphertext.len() - 1] {
            let mut tampered = wrapped.clone();
            tampered.ciphertext[index] ^= 0x01;
            assert!(matches!(
                unwrapper.unwrap(&tampered, &handle).await,
                Err(KeyboundError::Decryption(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_unwrap_refused_while_untrusted() {
        let (unwrapper, monitor, handle, public_key) = setup().await;
        let key = RawContentKey::generate(ContentAlgorithm::Aes256Gcm);
        let wrapped = wrap_content_key(&public_key, &key, WrapAlgorithm::RsaOaepSha256).unwrap();

        monitor.report_screen_capture(true);
        assert!(matches!(
            unwrapper.unwrap(&wrapped, &handle).await,
            Err(KeyboundError::InvalidState(_))
        ));

        monitor.report_host_signal(ThreatReason::DebuggerAttached, true);
        monitor.report_screen_capture(false);
        assert!(matches!(
            unwrapper.unwrap(&wrapped, &handle).await,
            Err(KeyboundError::InvalidState(_))
        ));

        monitor.report_host_signal(ThreatReason::DebuggerAttached, false);
        let unwrapped = unwrapper.unwrap(&wrapped, &handle).await.unwrap();
        assert_eq!(unwrapped.expose_secret(), key.expose_secret());
    }

    #[test]
    fn test_raw_key_debug_is_redacted() {
        let key = RawContentKey::from_bytes(ContentAlgorithm::Aes128Gcm, vec![0xAB; 16]).unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.to_lowercase().contains("ab, ab"));
    }

    #[test]
    fn test_wrapped_key_from_base64() {
        let wrapped = WrappedContentKey::from_base64(
            WrapAlgorithm::RsaOaepSha256,
            ContentAlgorithm::Aes256Gcm,
            "AQID",
        )
        .unwrap();
        assert_eq!(wrapped.ciphertext, vec![1, 2, 3]);
        assert!(matches!(
            WrappedContentKey::from_base64(
                WrapAlgorithm::RsaOaepSha256,
                ContentAlgorithm::Aes256Gcm,
                "not base64!"
            ),
            Err(KeyboundError::Serialization(_))
        ));
    }

    #[test]
    fn test_algorithm_ids_round_trip() {
        for algorithm in [
            ContentAlgorithm::Aes128Gcm,
            ContentAlgorithm::Aes256Gcm,
            ContentAlgorithm::XChaCha20Poly1305,
        ] {
            assert_eq!(ContentAlgorithm::from_id(algorithm.id()), Some(algorithm));
        }
        assert_eq!(ContentAlgorithm::from_id(0), None);
    }
}
