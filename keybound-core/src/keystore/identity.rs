//! Device identity and its persisted record.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::traits::KeyStorageTier;
use crate::error::{KeyboundError, KeyboundResult};

const RECORD_VERSION: u32 = 1;

/// Opaque reference to the identity key inside the key store.
///
/// Carries the key alias and the SHA-256 of the public key it was issued
/// for. A handle whose digest no longer matches the live key is stale.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyHandle {
    alias: String,
    key_id: [u8; 32],
}

impl KeyHandle {
    pub(crate) fn new(alias: &str, public_key: &[u8]) -> Self {
        Self {
            alias: alias.to_string(),
            key_id: key_id(public_key),
        }
    }

    /// Alias of the key inside the key store.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Hex-encoded SHA-256 of the public key this handle refers to.
    #[must_use]
    pub fn key_id(&self) -> String {
        hex::encode(self.key_id)
    }

    /// Whether `public_key` is the key this handle was issued for.
    #[must_use]
    pub fn matches(&self, public_key: &[u8]) -> bool {
        self.key_id[..].ct_eq(&key_id(public_key)[..]).into()
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("alias", &self.alias)
            .field("key_id", &self.key_id())
            .finish()
    }
}

fn key_id(public_key: &[u8]) -> [u8; 32] {
    Sha256::digest(public_key).into()
}

/// The single live identity of this installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Handle to the private key inside the key store.
    pub handle: KeyHandle,
    /// Public key, `SubjectPublicKeyInfo` DER.
    pub public_key: Vec<u8>,
    /// Identifier assigned by the backend; `None` until registration succeeds.
    pub device_id: Option<String>,
    /// Unix timestamp (seconds) of key creation.
    pub created_at: u64,
    /// Isolation level of the key store holding the private key.
    pub storage_tier: KeyStorageTier,
}

impl DeviceIdentity {
    pub(crate) fn new(alias: &str, public_key: Vec<u8>, storage_tier: KeyStorageTier) -> Self {
        Self {
            handle: KeyHandle::new(alias, &public_key),
            public_key,
            device_id: None,
            created_at: now(),
            storage_tier,
        }
    }

    /// Whether the backend has acknowledged this identity.
    #[must_use]
    pub const fn is_registered(&self) -> bool {
        self.device_id.is_some()
    }
}

/// Versioned CBOR envelope persisted through the blob store.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct IdentityRecord {
    pub(crate) version: u32,
    pub(crate) alias: String,
    pub(crate) public_key: Vec<u8>,
    pub(crate) device_id: Option<String>,
    pub(crate) created_at: u64,
    pub(crate) storage_tier: KeyStorageTier,
}

impl IdentityRecord {
    pub(crate) fn from_identity(identity: &DeviceIdentity) -> Self {
        Self {
            version: RECORD_VERSION,
            alias: identity.handle.alias.clone(),
            public_key: identity.public_key.clone(),
            device_id: identity.device_id.clone(),
            created_at: identity.created_at,
            storage_tier: identity.storage_tier,
        }
    }

    pub(crate) fn into_identity(self) -> DeviceIdentity {
        DeviceIdentity {
            handle: KeyHandle::new(&self.alias, &self.public_key),
            public_key: self.public_key,
            device_id: self.device_id,
            created_at: self.created_at,
            storage_tier: self.storage_tier,
        }
    }

    pub(crate) fn serialize(&self) -> KeyboundResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| KeyboundError::Serialization(err.to_string()))?;
        Ok(bytes)
    }

    pub(crate) fn deserialize(bytes: &[u8]) -> KeyboundResult<Self> {
        let record: Self = ciborium::de::from_reader(bytes)
            .map_err(|err| KeyboundError::Serialization(err.to_string()))?;
        if record.version != RECORD_VERSION {
            return Err(KeyboundError::Serialization(format!(
                "unsupported identity record version: {}",
                record.version
            )));
        }
        Ok(record)
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
