//! Device identity, registration and key delivery for Swift and Kotlin.

use std::sync::Arc;

use secrecy::SecretString;

use super::types::{backend_config, DeviceIdentityInfo, DeviceKeyHandle};
use crate::config::Environment;
use crate::error::KeyboundResult;
use crate::fingerprint::{FingerprintCollector, PlatformAttributes};
use crate::key_delivery::{ContentKeyClient, ContentKeyGrant};
use crate::keystore::{HardwareKeyStore, IdentityKeyManager, KeyAccessPolicy, KeyStorageTier};
use crate::registration::{DevicePlatform, DeviceRegistrar, RegistrationClient};
use crate::storage::AtomicBlobStore;

/// The installation's identity key.
///
/// Create one per process and share it with [`DeviceRegistration`] and
/// [`super::ProtectedPlayer`].
///
/// # Example (Swift)
///
/// ```swift
/// let keys = DeviceKeys(keyStore: keychain, blobStore: files, policy: policy)
/// let handle = try await keys.ensureKeypair()
/// ```
#[derive(uniffi::Object)]
pub struct DeviceKeys {
    manager: Arc<IdentityKeyManager>,
}

impl DeviceKeys {
    pub(crate) fn manager(&self) -> Arc<IdentityKeyManager> {
        Arc::clone(&self.manager)
    }
}

#[uniffi::export(async_runtime = "tokio")]
impl DeviceKeys {
    /// Identity key kept in `key_store`, its record in `blob_store`.
    #[uniffi::constructor]
    #[must_use]
    pub fn new(
        key_store: Arc<dyn HardwareKeyStore>,
        blob_store: Arc<dyn AtomicBlobStore>,
        policy: KeyAccessPolicy,
    ) -> Arc<Self> {
        let manager = IdentityKeyManager::new(key_store, blob_store).with_policy(policy);
        Arc::new(Self {
            manager: Arc::new(manager),
        })
    }

    /// Isolation level of the key store.
    #[must_use]
    pub fn storage_tier(&self) -> KeyStorageTier {
        self.manager.storage_tier()
    }

    /// Handle of the identity key, generating it on first use.
    ///
    /// # Errors
    ///
    /// As [`IdentityKeyManager::ensure_keypair`].
    pub async fn ensure_keypair(&self) -> KeyboundResult<Arc<DeviceKeyHandle>> {
        let handle = self.manager.ensure_keypair().await?;
        Ok(Arc::new(DeviceKeyHandle::new(handle)))
    }

    /// Public key (`SubjectPublicKeyInfo` DER) behind `handle`.
    ///
    /// # Errors
    ///
    /// As [`IdentityKeyManager::export_public_key`].
    pub async fn export_public_key(&self, handle: &DeviceKeyHandle) -> KeyboundResult<Vec<u8>> {
        self.manager.export_public_key(handle.inner()).await
    }

    /// The current identity, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted record cannot be read.
    pub async fn identity(&self) -> KeyboundResult<Option<DeviceIdentityInfo>> {
        Ok(self.manager.identity().await?.map(DeviceIdentityInfo::from))
    }

    /// Deletes the key and its record. Best-effort.
    pub async fn delete_keypair(&self, handle: &DeviceKeyHandle) {
        self.manager.delete_keypair(handle.inner()).await;
    }
}

/// Registers the identity key with the backend.
#[derive(uniffi::Object)]
pub struct DeviceRegistration {
    registrar: DeviceRegistrar,
}

#[uniffi::export(async_runtime = "tokio")]
impl DeviceRegistration {
    /// Registration against `environment`, or the backend at `base_url`
    /// when given. `attributes` take precedence over what the core detects.
    #[uniffi::constructor]
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        keys: &DeviceKeys,
        environment: Environment,
        base_url: Option<String>,
        platform: DevicePlatform,
        attributes: PlatformAttributes,
    ) -> Arc<Self> {
        let client = RegistrationClient::new(backend_config(environment, base_url.as_deref()))
            .with_device(platform.device_type(), platform);
        let registrar = DeviceRegistrar::new(
            keys.manager(),
            client,
            FingerprintCollector::with_platform(attributes),
        );
        Arc::new(Self { registrar })
    }

    /// SHA-256 digest of the fingerprint sent at registration.
    #[must_use]
    pub fn fingerprint_digest(&self) -> String {
        self.registrar.fingerprint().digest()
    }

    /// Registers the identity key unless it already is.
    ///
    /// # Errors
    ///
    /// As [`DeviceRegistrar::ensure_registered`].
    pub async fn ensure_registered(
        &self,
        device_name: &str,
        auth_token: &str,
    ) -> KeyboundResult<DeviceIdentityInfo> {
        let token = SecretString::from(auth_token.to_string());
        let identity = self.registrar.ensure_registered(device_name, &token).await?;
        Ok(identity.into())
    }

    /// Sends the current fingerprint for the registered device.
    ///
    /// # Errors
    ///
    /// As [`DeviceRegistrar::refresh_fingerprint`].
    pub async fn refresh_fingerprint(&self, auth_token: &str) -> KeyboundResult<()> {
        let token = SecretString::from(auth_token.to_string());
        self.registrar.refresh_fingerprint(&token).await
    }
}

/// Fetches wrapped content keys issued to this device.
#[derive(uniffi::Object)]
pub struct ContentKeys {
    client: ContentKeyClient,
}

#[uniffi::export(async_runtime = "tokio")]
impl ContentKeys {
    /// Client for `environment`, or the backend at `base_url` when given.
    #[uniffi::constructor]
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(environment: Environment, base_url: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            client: ContentKeyClient::new(backend_config(environment, base_url.as_deref())),
        })
    }

    /// Requests the wrapped key for `content_id`.
    ///
    /// # Errors
    ///
    /// As [`ContentKeyClient::fetch`].
    pub async fn fetch(
        &self,
        content_id: u64,
        device_id: &str,
        auth_token: &str,
    ) -> KeyboundResult<ContentKeyGrant> {
        let token = SecretString::from(auth_token.to_string());
        self.client.fetch(content_id, device_id, &token).await
    }
}
