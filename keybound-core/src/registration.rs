//! Device registration with the content backend.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{KeyboundError, KeyboundResult};
use crate::fingerprint::{DeviceFingerprint, FingerprintCollector, KEY_STORAGE_ATTRIBUTE};
use crate::http_request::{error_message, Request};
use crate::keystore::{DeviceIdentity, IdentityKeyManager};

const REGISTER_PATH: &str = "/api/device/register";
const FINGERPRINT_PATH: &str = "/api/device/fingerprint";

/// Device class. The backend allows one registered device per class and
/// account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, uniffi::Enum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Phone or tablet.
    Mobile,
    /// Desktop or laptop.
    Laptop,
}

/// Operating system family reported to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, uniffi::Enum)]
#[serde(rename_all = "lowercase")]
pub enum DevicePlatform {
    /// Android.
    Android,
    /// iOS or iPadOS.
    Ios,
    /// Windows.
    Windows,
    /// macOS.
    Macos,
    /// Linux desktop.
    Linux,
}

impl DevicePlatform {
    /// Platform this binary was built for. Unknown targets report `Linux`.
    #[must_use]
    pub fn current() -> Self {
        match std::env::consts::OS {
            "android" => Self::Android,
            "ios" => Self::Ios,
            "windows" => Self::Windows,
            "macos" => Self::Macos,
            _ => Self::Linux,
        }
    }

    /// Device class usually running this platform.
    #[must_use]
    pub const fn device_type(self) -> DeviceType {
        match self {
            Self::Android | Self::Ios => DeviceType::Mobile,
            Self::Windows | Self::Macos | Self::Linux => DeviceType::Laptop,
        }
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    device_type: DeviceType,
    platform: DevicePlatform,
    device_name: &'a str,
    fingerprint: &'a DeviceFingerprint,
    public_key: String,
}

#[derive(Deserialize, Debug)]
struct RegisterResponse {
    #[serde(default)]
    success: bool,
    device_id: Option<String>,
    message: Option<String>,
}

#[derive(Serialize)]
struct FingerprintRequest<'a> {
    device_id: &'a str,
    fingerprint: &'a DeviceFingerprint,
}

/// Client for the device endpoints of the backend.
pub struct RegistrationClient {
    request: Request,
    device_type: DeviceType,
    platform: DevicePlatform,
}

impl RegistrationClient {
    /// Client for the backend in `config`, describing the current platform.
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        let platform = DevicePlatform::current();
        Self {
            request: Request::new(config),
            device_type: platform.device_type(),
            platform,
        }
    }

    /// Overrides the reported device class and platform.
    #[must_use]
    pub const fn with_device(mut self, device_type: DeviceType, platform: DevicePlatform) -> Self {
        self.device_type = device_type;
        self.platform = platform;
        self
    }

    /// Registers the device and returns the backend-assigned device id.
    ///
    /// `public_key` is the `SubjectPublicKeyInfo` DER of the identity key; it
    /// is sent base64-encoded.
    ///
    /// # Errors
    ///
    /// - [`KeyboundError::RegistrationFailed`] if the backend answers with a
    ///   non-2xx status, `success: false` or no device id.
    /// - [`KeyboundError::Network`] on transport failure. Not retried here.
    pub async fn register(
        &self,
        device_name: &str,
        fingerprint: &DeviceFingerprint,
        public_key: &[u8],
        auth_token: &SecretString,
    ) -> KeyboundResult<String> {
        if device_name.trim().is_empty() {
            return Err(KeyboundError::InvalidInput("empty device name".to_string()));
        }

        let url = self.request.url(REGISTER_PATH);
        let body = RegisterRequest {
            device_type: self.device_type,
            platform: self.platform,
            device_name,
            fingerprint,
            public_key: STANDARD.encode(public_key),
        };
        let builder = self.request.post_authenticated(&url, auth_token)?.json(&body);
        let response = self.request.handle(builder).await?;

        let status = response.status();
        if !status.is_success() {
            let message = error_message(response).await;
            tracing::warn!("device registration refused ({status}): {message}");
            return Err(KeyboundError::RegistrationFailed {
                status: status.as_u16(),
                message,
            });
        }

        let text = response.text().await?;
        let parsed: RegisterResponse = serde_json::from_str(&text).map_err(|err| {
            KeyboundError::Serialization(format!("failed to parse registration response: {err}"))
        })?;

        match parsed.device_id {
            Some(device_id) if parsed.success && !device_id.is_empty() => {
                tracing::info!("device registered");
                Ok(device_id)
            }
            _ => Err(KeyboundError::RegistrationFailed {
                status: status.as_u16(),
                message: parsed
                    .message
                    .unwrap_or_else(|| "registration was not acknowledged".to_string()),
            }),
        }
    }

    /// Sends an updated fingerprint for an already registered device.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::RegistrationFailed`] on a non-2xx answer,
    /// [`KeyboundError::Network`] on transport failure.
    pub async fn refresh_fingerprint(
        &self,
        device_id: &str,
        fingerprint: &DeviceFingerprint,
        auth_token: &SecretString,
    ) -> KeyboundResult<()> {
        let url = self.request.url(FINGERPRINT_PATH);
        let body = FingerprintRequest {
            device_id,
            fingerprint,
        };
        let builder = self.request.post_authenticated(&url, auth_token)?.json(&body);
        let response = self.request.handle(builder).await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(KeyboundError::RegistrationFailed {
                status: status.as_u16(),
                message: error_message(response).await,
            })
        }
    }
}

/// Ties the identity key, the fingerprint and the backend together.
pub struct DeviceRegistrar {
    manager: Arc<IdentityKeyManager>,
    client: RegistrationClient,
    collector: FingerprintCollector,
}

impl DeviceRegistrar {
    /// Registrar over the given parts.
    #[must_use]
    pub const fn new(
        manager: Arc<IdentityKeyManager>,
        client: RegistrationClient,
        collector: FingerprintCollector,
    ) -> Self {
        Self {
            manager,
            client,
            collector,
        }
    }

    /// The fingerprint sent at registration, including the key store tier.
    #[must_use]
    pub fn fingerprint(&self) -> DeviceFingerprint {
        self.collector
            .collect()
            .with_attribute(KEY_STORAGE_ATTRIBUTE, self.manager.storage_tier().as_str())
    }

    /// Makes sure the current identity key is registered.
    ///
    /// Returns the stored identity when it already carries a device id.
    /// Otherwise the key is created if needed and registered; the device id
    /// is recorded only after the backend acknowledged it.
    ///
    /// # Errors
    ///
    /// Any error of [`IdentityKeyManager::ensure_keypair`] or
    /// [`RegistrationClient::register`]. On error no device id is recorded.
    pub async fn ensure_registered(
        &self,
        device_name: &str,
        auth_token: &SecretString,
    ) -> KeyboundResult<DeviceIdentity> {
        let handle = self.manager.ensure_keypair().await?;
        if let Some(identity) = self.manager.identity().await? {
            if identity.handle == handle && identity.is_registered() {
                return Ok(identity);
            }
        }

        let public_key = self.manager.export_public_key(&handle).await?;
        let device_id = self
            .client
            .register(device_name, &self.fingerprint(), &public_key, auth_token)
            .await?;
        self.manager.record_device_id(&handle, &device_id).await
    }

    /// Sends the current fingerprint for the registered device.
    ///
    /// # Errors
    ///
    /// [`KeyboundError::InvalidState`] if the device is not registered,
    /// otherwise as [`RegistrationClient::refresh_fingerprint`].
    pub async fn refresh_fingerprint(&self, auth_token: &SecretString) -> KeyboundResult<()> {
        let device_id = self
            .manager
            .identity()
            .await?
            .and_then(|identity| identity.device_id)
            .ok_or_else(|| KeyboundError::InvalidState("device is not registered".to_string()))?;
        self.client
            .refresh_fingerprint(&device_id, &self.fingerprint(), auth_token)
            .await
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use serde_json::json;

    use super::*;
    use crate::fingerprint::PlatformAttributes;
    use crate::keystore::SoftwareKeyStore;
    use crate::storage::MemoryBlobStore;

    fn token() -> SecretString {
        SecretString::from("test-token".to_string())
    }

    fn client(server: &Server) -> RegistrationClient {
        RegistrationClient::new(BackendConfig::with_base_url(&server.url()))
            .with_device(DeviceType::Mobile, DevicePlatform::Android)
    }

    fn registrar(server: &Server) -> (Arc<IdentityKeyManager>, DeviceRegistrar) {
        let manager = Arc::new(IdentityKeyManager::new(
            Arc::new(SoftwareKeyStore::new()),
            Arc::new(MemoryBlobStore::new()),
        ));
        let collector = FingerprintCollector::with_platform(PlatformAttributes {
            model: Some("Pixel 8".to_string()),
            ..PlatformAttributes::default()
        });
        let registrar = DeviceRegistrar::new(Arc::clone(&manager), client(server), collector);
        (manager, registrar)
    }

    #[tokio::test]
    async fn test_register_success() {
        let mut server = Server::new_async().await;
        let fingerprint = DeviceFingerprint::default().with_attribute("model", "Pixel 8");
        let mock = server
            .mock("POST", "/api/device/register")
            .match_header("authorization", "Bearer test-token")
            .match_body(Matcher::PartialJson(json!({
                "device_type": "mobile",
                "platform": "android",
                "device_name": "My phone",
                "fingerprint": {"model": "Pixel 8"},
                "public_key": "AQID",
            })))
            .with_status(200)
            .with_body(r#"{"success": true, "device_id": "dev-42", "message": "Device registered successfully"}"#)
            .create_async()
            .await;

        let device_id = client(&server)
            .register("My phone", &fingerprint, &[1, 2, 3], &token())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(device_id, "dev-42");
    }

    #[tokio::test]
    async fn test_register_device_limit_is_registration_failure() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/device/register")
            .with_status(400)
            .with_body(r#"{"error": "Mobile device limit reached"}"#)
            .create_async()
            .await;

        let result = client(&server)
            .register("My phone", &DeviceFingerprint::default(), &[1], &token())
            .await;

        mock.assert_async().await;
        match result {
            Err(KeyboundError::RegistrationFailed { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Mobile device limit reached");
            }
            other => panic!("expected RegistrationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_unacknowledged() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/device/register")
            .with_status(200)
            .with_body(r#"{"success": false, "device_id": null, "message": "Invalid token"}"#)
            .create_async()
            .await;

        let result = client(&server)
            .register("My phone", &DeviceFingerprint::default(), &[1], &token())
            .await;

        mock.assert_async().await;
        assert!(matches!(
            result,
            Err(KeyboundError::RegistrationFailed { status: 200, ref message }) if message == "Invalid token"
        ));
    }

    #[tokio::test]
    async fn test_register_empty_device_id_is_failure() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/device/register")
            .with_status(200)
            .with_body(r#"{"success": true, "device_id": ""}"#)
            .create_async()
            .await;

        let result = client(&server)
            .register("My phone", &DeviceFingerprint::default(), &[1], &token())
            .await;
        assert!(matches!(
            result,
            Err(KeyboundError::RegistrationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_empty_name() {
        let server = Server::new_async().await;
        let result = client(&server)
            .register("  ", &DeviceFingerprint::default(), &[1], &token())
            .await;
        assert!(matches!(result, Err(KeyboundError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_registrar_records_device_id_once() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/device/register")
            .match_body(Matcher::PartialJson(json!({
                "fingerprint": {"key_storage": "software", "model": "Pixel 8"},
            })))
            .with_status(200)
            .with_body(r#"{"success": true, "device_id": "dev-7"}"#)
            .expect(1)
            .create_async()
            .await;

        let (manager, registrar) = registrar(&server);
        let identity = registrar.ensure_registered("Phone", &token()).await.unwrap();
        assert_eq!(identity.device_id.as_deref(), Some("dev-7"));

        let again = registrar.ensure_registered("Phone", &token()).await.unwrap();
        assert_eq!(again, identity);
        assert_eq!(manager.identity().await.unwrap(), Some(identity));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_registrar_failure_records_nothing() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/device/register")
            .with_status(401)
            .with_body(r#"{"error": "Invalid or expired token"}"#)
            .create_async()
            .await;

        let (manager, registrar) = registrar(&server);
        let result = registrar.ensure_registered("Phone", &token()).await;
        assert!(matches!(
            result,
            Err(KeyboundError::RegistrationFailed { status: 401, .. })
        ));
        let identity = manager.identity().await.unwrap().unwrap();
        assert!(!identity.is_registered());
    }

    #[tokio::test]
    async fn test_refresh_fingerprint() {
        let mut server = Server::new_async().await;
        let _register = server
            .mock("POST", "/api/device/register")
            .with_status(200)
            .with_body(r#"{"success": true, "device_id": "dev-9"}"#)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/api/device/fingerprint")
            .match_body(Matcher::PartialJson(json!({"device_id": "dev-9"})))
            .with_status(200)
            .with_body(r#"{"device_id": "abc", "fingerprint_collected": true}"#)
            .create_async()
            .await;

        let (_manager, registrar) = registrar(&server);
        assert!(matches!(
            registrar.refresh_fingerprint(&token()).await,
            Err(KeyboundError::InvalidState(_))
        ));

        registrar.ensure_registered("Phone", &token()).await.unwrap();
        registrar.refresh_fingerprint(&token()).await.unwrap();
        refresh.assert_async().await;
    }

    #[test]
    fn test_platform_device_type() {
        assert_eq!(DevicePlatform::Android.device_type(), DeviceType::Mobile);
        assert_eq!(DevicePlatform::Ios.device_type(), DeviceType::Mobile);
        assert_eq!(DevicePlatform::Macos.device_type(), DeviceType::Laptop);
        assert_eq!(
            serde_json::to_value(DevicePlatform::Macos).unwrap(),
            json!("macos")
        );
    }
}
