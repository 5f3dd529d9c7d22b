//! Retrieval of wrapped content keys from the backend.

use secrecy::SecretString;
use serde::Deserialize;

use crate::config::BackendConfig;
use crate::content_key::{ContentAlgorithm, WrappedContentKey};
use crate::error::{KeyboundError, KeyboundResult};
use crate::http_request::{error_message, Request};
use crate::keystore::WrapAlgorithm;

/// A content key issued to this device, with the metadata needed to fetch
/// and play the content.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct ContentKeyGrant {
    /// Backend content identifier.
    pub content_id: u64,
    /// Content key wrapped under the device public key.
    pub wrapped_key: WrappedContentKey,
    /// Where the encrypted container can be downloaded, relative to the
    /// backend base URL or absolute.
    pub download_url: String,
    /// MIME type of the decrypted media.
    pub content_type: Option<String>,
    /// Display title.
    pub title: Option<String>,
}

#[derive(Deserialize)]
struct DownloadResponse {
    #[serde(default)]
    success: bool,
    content_id: Option<u64>,
    encrypted_key: Option<String>,
    download_url: Option<String>,
    content_type: Option<String>,
    title: Option<String>,
    wrap_algorithm: Option<WrapAlgorithm>,
    content_algorithm: Option<ContentAlgorithm>,
    message: Option<String>,
}

/// Client for the content key endpoint.
pub struct ContentKeyClient {
    request: Request,
}

impl ContentKeyClient {
    /// Client for the backend in `config`.
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self {
            request: Request::new(config),
        }
    }

    /// Requests the wrapped key for `content_id` on behalf of `device_id`.
    ///
    /// When the backend does not name the algorithms, RSA-OAEP-256 and
    /// AES-256-GCM are assumed.
    ///
    /// # Errors
    ///
    /// - [`KeyboundError::KeyDeliveryRefused`] on 401, 403 or 404, or when the
    ///   backend answers `success: false`. A revoked or unknown device lands
    ///   here.
    /// - [`KeyboundError::Network`] with the status on any other non-2xx
    ///   answer, and without one on transport failure.
    /// - [`KeyboundError::Serialization`] for an unusable response body.
    pub async fn fetch(
        &self,
        content_id: u64,
        device_id: &str,
        auth_token: &SecretString,
    ) -> KeyboundResult<ContentKeyGrant> {
        if device_id.is_empty() {
            return Err(KeyboundError::InvalidInput("empty device id".to_string()));
        }

        let url = self
            .request
            .url(&format!("/api/content/{content_id}/download"));
        let builder = self
            .request
            .post_authenticated(&url, auth_token)?
            .json(&serde_json::json!({ "device_id": device_id }));
        let response = self.request.handle(builder).await?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => {}
            401 | 403 | 404 => {
                let message = error_message(response).await;
                tracing::warn!("content key refused ({status}): {message}");
                return Err(KeyboundError::KeyDeliveryRefused {
                    status: status.as_u16(),
                    message,
                });
            }
            _ => {
                return Err(KeyboundError::Network {
                    url,
                    status: Some(status.as_u16()),
                    error: error_message(response).await,
                });
            }
        }

        let text = response.text().await?;
        let parsed: DownloadResponse = serde_json::from_str(&text).map_err(|err| {
            KeyboundError::Serialization(format!("failed to parse content key response: {err}"))
        })?;
        if !parsed.success {
            return Err(KeyboundError::KeyDeliveryRefused {
                status: status.as_u16(),
                message: parsed
                    .message
                    .unwrap_or_else(|| "content key was not issued".to_string()),
            });
        }

        let encrypted_key = parsed.encrypted_key.ok_or_else(|| {
            KeyboundError::Serialization("missing encrypted_key in response".to_string())
        })?;
        let wrapped_key = WrappedContentKey::from_base64(
            parsed.wrap_algorithm.unwrap_or_default(),
            parsed.content_algorithm.unwrap_or_default(),
            &encrypted_key,
        )?;

        Ok(ContentKeyGrant {
            content_id: parsed.content_id.unwrap_or(content_id),
            wrapped_key,
            download_url: parsed.download_url.unwrap_or_else(|| {
                format!("/api/content/{content_id}/file?device_id={device_id}")
            }),
            content_type: parsed.content_type,
            title: parsed.title,
        })
    }
}
