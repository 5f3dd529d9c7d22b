//! Backend selection.

use std::time::Duration;

use strum::EnumString;

/// Default timeout applied to every backend request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deployment environment of the content backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    /// Staging backend.
    Staging,
    /// Production backend.
    Production,
}

impl Environment {
    /// Base URL of the backend API for this environment.
    #[must_use]
    pub const fn base_url(self) -> &'static str {
        match self {
            Self::Staging => "https://api.stage.keybound.app",
            Self::Production => "https://api.keybound.app",
        }
    }
}

/// Where and how the core talks to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    base_url: String,
    timeout: Duration,
}

impl BackendConfig {
    /// Configuration for one of the hosted environments.
    #[must_use]
    pub fn for_environment(environment: Environment) -> Self {
        Self {
            base_url: environment.base_url().to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Configuration for a self-hosted backend. Trailing slashes are dropped.
    #[must_use]
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the request timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}
