//! Key store interface implemented by each platform.

use rsa::Oaep;
use serde::{Deserialize, Serialize};

use crate::error::KeyboundResult;

/// Minimum modulus size accepted for the device identity key.
pub const MIN_RSA_KEY_BITS: u32 = 2048;

/// Asymmetric scheme used to wrap a content key under the device public key.
///
/// The identifier travels with every wrapped key and must match the padding
/// the backend used.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, uniffi::Enum,
)]
pub enum WrapAlgorithm {
    /// RSAES-OAEP with SHA-256 and MGF1-SHA-256.
    #[default]
    #[serde(rename = "RSA-OAEP-256")]
    RsaOaepSha256,
    /// RSAES-OAEP with SHA-1 and MGF1-SHA-1, for legacy backends.
    #[serde(rename = "RSA-OAEP")]
    RsaOaepSha1,
}

impl WrapAlgorithm {
    /// JWA name of the algorithm.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RsaOaepSha256 => "RSA-OAEP-256",
            Self::RsaOaepSha1 => "RSA-OAEP",
        }
    }

    pub(crate) fn padding(self) -> Oaep {
        match self {
            Self::RsaOaepSha256 => Oaep::new::<sha2::Sha256>(),
            Self::RsaOaepSha1 => Oaep::new::<sha1::Sha1>(),
        }
    }
}

/// Where the private key lives, from strongest to weakest isolation.
///
/// Reported to the backend as part of the fingerprint so that a software
/// fallback is visible to risk scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, uniffi::Enum)]
pub enum KeyStorageTier {
    /// Dedicated secure element (Android `StrongBox`).
    StrongBox,
    /// Apple Secure Enclave.
    SecureEnclave,
    /// TEE-backed platform keystore (Android Keystore, TPM).
    TrustedExecutionEnvironment,
    /// Process memory. No hardware isolation.
    Software,
}

impl KeyStorageTier {
    /// Whether the private key is isolated from application memory.
    #[must_use]
    pub const fn is_hardware_backed(self) -> bool {
        !matches!(self, Self::Software)
    }

    /// Stable name used in fingerprints and identity records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StrongBox => "strongbox",
            Self::SecureEnclave => "secure_enclave",
            Self::TrustedExecutionEnvironment => "tee",
            Self::Software => "software",
        }
    }
}

/// Access-control policy requested when the identity key is created.
///
/// The private component is always non-exportable; this only tunes the
/// remaining knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Record)]
pub struct KeyAccessPolicy {
    /// RSA modulus size in bits. Must be at least [`MIN_RSA_KEY_BITS`].
    pub key_size_bits: u32,
    /// Require a user-presence check (biometric or passcode) before each
    /// decryption.
    pub require_user_presence: bool,
}

impl Default for KeyAccessPolicy {
    fn default() -> Self {
        Self {
            key_size_bits: MIN_RSA_KEY_BITS,
            require_user_presence: false,
        }
    }
}

/// Hardware-isolated key store holding the device identity keypair.
///
/// Platform implementations should use hardware-backed keystores where available:
/// - iOS: Secure Enclave / Keychain with `kSecAttrAccessibleWhenUnlockedThisDeviceOnly`
/// - Android: Android Keystore (`StrongBox` when present) with `PURPOSE_DECRYPT`
/// - Desktop: TPM-backed key provider
///
/// The API never exposes private key material: keys are referenced by alias
/// and only public keys and decryption results cross this boundary.
///
/// # Security Requirements
///
/// - The private key MUST be generated inside the store and be non-exportable.
/// - The key MUST be bound to the device (not transferable via backup/restore).
/// - [`HardwareKeyStore::storage_tier`] MUST report the real isolation level.
#[uniffi::export(with_foreign)]
pub trait HardwareKeyStore: Send + Sync {
    /// Isolation level this store provides.
    fn storage_tier(&self) -> KeyStorageTier;

    /// Generates an RSA keypair under `alias` and returns the public key as
    /// `SubjectPublicKeyInfo` DER. If a key already exists under `alias` its
    /// public key is returned instead.
    ///
    /// # Errors
    ///
    /// Returns [`KeyboundError::KeyGeneration`](crate::KeyboundError::KeyGeneration)
    /// if secure hardware is unavailable or the policy is refused.
    fn generate_keypair(
        &self,
        alias: String,
        policy: KeyAccessPolicy,
    ) -> KeyboundResult<Vec<u8>>;

    /// Returns the public key (`SubjectPublicKeyInfo` DER) stored under
    /// `alias`, or `None` if no such key exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    fn public_key(&self, alias: String) -> KeyboundResult<Option<Vec<u8>>>;

    /// Decrypts `ciphertext` with the private key stored under `alias`.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if no key exists under `alias`
    /// - `AuthenticationRequired` if a user-presence check was not satisfied
    /// - `Decryption` if the ciphertext does not match the key or padding
    fn decrypt(
        &self,
        alias: String,
        algorithm: WrapAlgorithm,
        ciphertext: Vec<u8>,
    ) -> KeyboundResult<Vec<u8>>;

    /// Deletes the key stored under `alias`. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store refuses the deletion.
    fn delete(&self, alias: String) -> KeyboundResult<()>;
}
