//! Identity Key Manager.

use std::sync::Arc;

use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use super::identity::{DeviceIdentity, IdentityRecord, KeyHandle};
use super::traits::{
    HardwareKeyStore, KeyAccessPolicy, KeyStorageTier, WrapAlgorithm, MIN_RSA_KEY_BITS,
};
use crate::error::{KeyboundError, KeyboundResult};
use crate::storage::AtomicBlobStore;

/// Alias of the installation's identity key inside the key store.
pub const IDENTITY_KEY_ALIAS: &str = "keybound.device-identity.v1";

pub(crate) const IDENTITY_RECORD_FILENAME: &str = "device_identity.bin";

/// Owns the installation's [`DeviceIdentity`].
///
/// Every operation is phrased in terms of [`KeyHandle`]s; private key bytes
/// never leave the [`HardwareKeyStore`]. Key-store and blob-store calls run
/// on the blocking pool, so callers are suspended rather than blocked, and
/// dropping any returned future leaves no half-initialized state behind:
/// the identity record is only written after the key exists, and an
/// unrecorded key under [`IDENTITY_KEY_ALIAS`] is adopted on the next call.
pub struct IdentityKeyManager {
    store: Arc<dyn HardwareKeyStore>,
    blobs: Arc<dyn AtomicBlobStore>,
    policy: KeyAccessPolicy,
    identity: Mutex<Option<DeviceIdentity>>,
}

impl IdentityKeyManager {
    /// Creates a manager over the platform key store and blob store.
    #[must_use]
    pub fn new(store: Arc<dyn HardwareKeyStore>, blobs: Arc<dyn AtomicBlobStore>) -> Self {
        Self {
            store,
            blobs,
            policy: KeyAccessPolicy::default(),
            identity: Mutex::new(None),
        }
    }

    /// Overrides the access policy used when the keypair is generated.
    #[must_use]
    pub const fn with_policy(mut self, policy: KeyAccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Isolation level of the underlying key store.
    #[must_use]
    pub fn storage_tier(&self) -> KeyStorageTier {
        self.store.storage_tier()
    }

    /// Returns the handle of the installation's keypair, generating it first
    /// if none exists.
    ///
    /// Concurrent calls are serialized: exactly one keypair is created and
    /// every caller receives an equal handle. If the key store was reset since
    /// the last call, a fresh keypair is generated and the previous
    /// registration is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`KeyboundError::KeyGeneration`] if the key store is unavailable,
    /// refuses the policy, or produces an unusable public key.
    pub async fn ensure_keypair(&self) -> KeyboundResult<KeyHandle> {
        let mut guard = self.identity.lock().await;

        let cached = match guard.clone() {
            Some(identity) => Some(identity),
            None => self.load_record().await?,
        };
        let live = self.live_public_key().await?;

        let identity = match (cached, live) {
            (Some(identity), Some(public_key)) if identity.handle.matches(&public_key) => {
                identity
            }
            (previous, Some(public_key)) => {
                validate_public_key(&public_key)?;
                if previous.is_some() {
                    tracing::warn!("identity key changed outside the manager; adopting it");
                }
                let identity = DeviceIdentity::new(
                    IDENTITY_KEY_ALIAS,
                    public_key,
                    self.store.storage_tier(),
                );
                self.persist(&identity).await?;
                identity
            }
            (previous, None) => {
                if previous.is_some() {
                    tracing::warn!(
                        "identity key missing from key store; previous registration is orphaned"
                    );
                }
                let identity = self.generate().await?;
                self.persist(&identity).await?;
                tracing::info!(
                    "generated device identity key ({})",
                    identity.storage_tier.as_str()
                );
                identity
            }
        };

        let handle = identity.handle.clone();
        *guard = Some(identity);
        drop(guard);
        Ok(handle)
    }

    /// Returns the public key (`SubjectPublicKeyInfo` DER) for `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyboundError::KeyNotFound`] if the key is gone or `handle`
    /// refers to a key that has since been replaced. This is not retried: the
    /// backend's copy of the public key is orphaned and the device must
    /// re-register.
    pub async fn export_public_key(&self, handle: &KeyHandle) -> KeyboundResult<Vec<u8>> {
        let store = Arc::clone(&self.store);
        let alias = handle.alias().to_string();
        let public_key = run_blocking(move || store.public_key(alias)).await?;
        match public_key {
            Some(public_key) if handle.matches(&public_key) => Ok(public_key),
            _ => Err(KeyboundError::key_not_found(handle.alias())),
        }
    }

    /// Decrypts `ciphertext` with the private key behind `handle`.
    ///
    /// The plaintext is returned in a buffer that is zeroed on drop.
    ///
    /// # Errors
    ///
    /// - [`KeyboundError::KeyNotFound`] if the handle is stale or the key is gone
    /// - [`KeyboundError::AuthenticationRequired`] if the key requires a
    ///   user-presence check that was not satisfied; re-prompt and retry once
    /// - [`KeyboundError::Decryption`] on ciphertext/key mismatch
    pub async fn decrypt(
        &self,
        handle: &KeyHandle,
        ciphertext: &[u8],
        algorithm: WrapAlgorithm,
    ) -> KeyboundResult<Zeroizing<Vec<u8>>> {
        self.check_current(handle).await?;

        let store = Arc::clone(&self.store);
        let alias = handle.alias().to_string();
        let ciphertext = ciphertext.to_vec();
        run_blocking(move || store.decrypt(alias, algorithm, ciphertext).map(Zeroizing::new))
            .await
    }

    /// Deletes the keypair and the identity record. Best-effort: failures are
    /// logged, not returned. Used only for user-initiated de-registration.
    pub async fn delete_keypair(&self, handle: &KeyHandle) {
        let mut guard = self.identity.lock().await;

        let store = Arc::clone(&self.store);
        let alias = handle.alias().to_string();
        if let Err(err) = run_blocking(move || store.delete(alias)).await {
            tracing::warn!("failed to delete identity key: {err}");
        }

        let blobs = Arc::clone(&self.blobs);
        if let Err(err) =
            run_blocking(move || blobs.delete(IDENTITY_RECORD_FILENAME.to_string())).await
        {
            tracing::warn!("failed to delete identity record: {err}");
        }

        *guard = None;
        drop(guard);
        tracing::info!("device identity deleted");
    }

    /// Records the backend-assigned device id for the identity behind `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyboundError::KeyNotFound`] if `handle` is stale, or a
    /// storage error if the record cannot be written.
    pub async fn record_device_id(
        &self,
        handle: &KeyHandle,
        device_id: &str,
    ) -> KeyboundResult<DeviceIdentity> {
        if device_id.is_empty() {
            return Err(KeyboundError::InvalidInput("empty device id".to_string()));
        }

        let mut guard = self.identity.lock().await;
        let current = match guard.clone() {
            Some(identity) => Some(identity),
            None => self.load_record().await?,
        };
        let mut identity = match current {
            Some(identity) if &identity.handle == handle => identity,
            _ => return Err(KeyboundError::key_not_found(handle.alias())),
        };

        identity.device_id = Some(device_id.to_string());
        self.persist(&identity).await?;
        *guard = Some(identity.clone());
        drop(guard);
        Ok(identity)
    }

    /// The current identity, if one has been created.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted record cannot be read.
    pub async fn identity(&self) -> KeyboundResult<Option<DeviceIdentity>> {
        let mut guard = self.identity.lock().await;
        if guard.is_none() {
            *guard = self.load_record().await?;
        }
        Ok(guard.clone())
    }

    async fn check_current(&self, handle: &KeyHandle) -> KeyboundResult<()> {
        let mut guard = self.identity.lock().await;
        if guard.is_none() {
            *guard = self.load_record().await?;
        }
        match guard.as_ref() {
            Some(identity) if &identity.handle == handle => Ok(()),
            _ => Err(KeyboundError::key_not_found(handle.alias())),
        }
    }

    async fn live_public_key(&self) -> KeyboundResult<Option<Vec<u8>>> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.public_key(IDENTITY_KEY_ALIAS.to_string())).await
    }

    async fn generate(&self) -> KeyboundResult<DeviceIdentity> {
        if self.policy.key_size_bits < MIN_RSA_KEY_BITS {
            return Err(KeyboundError::KeyGeneration(format!(
                "key size {} below minimum {MIN_RSA_KEY_BITS}",
                self.policy.key_size_bits
            )));
        }

        let store = Arc::clone(&self.store);
        let policy = self.policy;
        let public_key = run_blocking(move || {
            store.generate_keypair(IDENTITY_KEY_ALIAS.to_string(), policy)
        })
        .await?;

        validate_public_key(&public_key)?;
        Ok(DeviceIdentity::new(
            IDENTITY_KEY_ALIAS,
            public_key,
            self.store.storage_tier(),
        ))
    }

    async fn load_record(&self) -> KeyboundResult<Option<DeviceIdentity>> {
        let blobs = Arc::clone(&self.blobs);
        let bytes = run_blocking(move || blobs.read(IDENTITY_RECORD_FILENAME.to_string())).await?;
        bytes
            .map(|bytes| IdentityRecord::deserialize(&bytes).map(IdentityRecord::into_identity))
            .transpose()
    }

    async fn persist(&self, identity: &DeviceIdentity) -> KeyboundResult<()> {
        let bytes = IdentityRecord::from_identity(identity).serialize()?;
        let blobs = Arc::clone(&self.blobs);
        run_blocking(move || blobs.write_atomic(IDENTITY_RECORD_FILENAME.to_string(), bytes))
            .await
    }
}

fn validate_public_key(public_key: &[u8]) -> KeyboundResult<()> {
    let key = RsaPublicKey::from_public_key_der(public_key).map_err(|err| {
        KeyboundError::KeyGeneration(format!("key store returned an invalid public key: {err}"))
    })?;
    let bits = key.size() * 8;
    if bits < MIN_RSA_KEY_BITS as usize {
        return Err(KeyboundError::KeyGeneration(format!(
            "key store returned a {bits}-bit key"
        )));
    }
    Ok(())
}

/// Runs a key-store or blob-store call on the blocking pool.
async fn run_blocking<T, F>(f: F) -> KeyboundResult<T>
where
    F: FnOnce() -> KeyboundResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| KeyboundError::InvalidState(format!("key store task failed: {err}")))?
}
