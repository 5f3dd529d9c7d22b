use thiserror::Error;

/// Result type for `keybound` operations.
pub type KeyboundResult<T> = Result<T, KeyboundError>;

/// Error outputs from `Keybound`
///
/// Key-store and malformed-key failures indicate a structural mismatch
/// between the client and the backend (typically resolved by re-registering)
/// and are never retried internally. Only [`KeyboundError::Network`] is
/// eligible for a caller-driven retry.
#[derive(Debug, Error, uniffi::Error)]
pub enum KeyboundError {
    /// The key store could not create the identity keypair, either because
    /// secure hardware is unavailable or the requested policy was refused.
    #[error("key_generation_error: {0}")]
    KeyGeneration(String),

    /// The referenced key no longer exists (or the handle is stale). The
    /// backend's record of the public key is orphaned; re-register.
    #[error("key_not_found: {alias}")]
    KeyNotFound {
        /// Alias of the missing key.
        alias: String,
    },

    /// The key's access policy requires a user-presence check that was not
    /// satisfied. Re-prompt and retry exactly once.
    #[error("authentication_required")]
    AuthenticationRequired,

    /// Asymmetric decryption failed (ciphertext/key mismatch or tampering).
    #[error("decryption_error: {0}")]
    Decryption(String),

    /// The unwrapped key does not have the width the content algorithm needs.
    #[error("malformed_key: expected {expected} bytes, got {actual}")]
    MalformedKey {
        /// Key width required by the content algorithm.
        expected: u64,
        /// Key width actually recovered.
        actual: u64,
    },

    /// The backend refused the device registration.
    #[error("registration_failed ({status}): {message}")]
    RegistrationFailed {
        /// HTTP status returned by the backend.
        status: u16,
        /// Backend-provided reason.
        message: String,
    },

    /// Network connection error with details. Retryable by the caller.
    #[error("network_error: {error} (url: {url}, status: {status:?})")]
    Network {
        /// The URL that was requested.
        url: String,
        /// HTTP status when one was received.
        status: Option<u16>,
        /// Transport error description.
        error: String,
    },

    /// An encrypted media chunk failed authentication. Fatal for the session.
    #[error("content_integrity_error: {0}")]
    ContentIntegrity(String),

    /// The backend refused to issue a wrapped content key for this device
    /// (unknown, revoked or unauthorized device).
    #[error("key_delivery_refused ({status}): {message}")]
    KeyDeliveryRefused {
        /// HTTP status returned by the backend.
        status: u16,
        /// Backend-provided reason.
        message: String,
    },

    /// Unexpected error serializing or parsing information.
    #[error("serialization_error: {0}")]
    Serialization(String),

    /// The host blob store failed.
    #[error("storage_error: {0}")]
    Storage(String),

    /// The presented input is not valid for the requested operation.
    #[error("invalid_input: {0}")]
    InvalidInput(String),

    /// The operation is not allowed in the current state.
    #[error("invalid_state: {0}")]
    InvalidState(String),

    /// Unexpected `UniFFI` callback error.
    #[error("unexpected_uniffi_callback_error: {0}")]
    UnexpectedUniFFICallbackError(String),
}

impl KeyboundError {
    /// Whether the caller may retry the failed operation (with backoff).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Whether the error means the device identity must be re-registered.
    #[must_use]
    pub const fn requires_reregistration(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. } | Self::MalformedKey { .. })
    }

    pub(crate) fn key_not_found(alias: impl Into<String>) -> Self {
        Self::KeyNotFound {
            alias: alias.into(),
        }
    }
}

impl From<uniffi::UnexpectedUniFFICallbackError> for KeyboundError {
    fn from(error: uniffi::UnexpectedUniFFICallbackError) -> Self {
        Self::UnexpectedUniFFICallbackError(error.reason)
    }
}

impl From<reqwest::Error> for KeyboundError {
    fn from(error: reqwest::Error) -> Self {
        Self::Network {
            url: error
                .url()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            status: error.status().map(|status| status.as_u16()),
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_retryable() {
        let network = KeyboundError::Network {
            url: "https://example.com".to_string(),
            status: None,
            error: "connection refused".to_string(),
        };
        assert!(network.is_retryable());
        assert!(!KeyboundError::key_not_found("alias").is_retryable());
        assert!(!KeyboundError::AuthenticationRequired.is_retryable());
        assert!(!KeyboundError::MalformedKey {
            expected: 32,
            actual: 16
        }
        .is_retryable());
    }

    #[test]
    fn test_reregistration_errors() {
        assert!(KeyboundError::key_not_found("alias").requires_reregistration());
        assert!(KeyboundError::MalformedKey {
            expected: 32,
            actual: 31
        }
        .requires_reregistration());
        assert!(!KeyboundError::Decryption("bad".to_string()).requires_reregistration());
    }
}
