use std::net::IpAddr;

use reqwest::{Method, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretString};

use crate::config::BackendConfig;
use crate::error::KeyboundError;

/// A simple wrapper on an HTTP client for making requests. Sets sensible defaults such as timeouts,
/// user-agent & ensuring HTTPS.
///
/// No retry policy is applied here: transport failures surface as
/// [`KeyboundError::Network`] and the caller decides whether to back off and retry.
///
/// Each API client owns one `Request`, so its connection pool is reused across
/// that client's calls but never shared between tokio runtimes.
pub(crate) struct Request {
    client: reqwest::Client,
    config: BackendConfig,
}

impl Request {
    pub(crate) fn new(config: BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        self.config.endpoint(path)
    }

    /// Creates a request builder with defaults applied.
    ///
    /// Plain HTTP is only accepted for loopback hosts.
    pub(crate) fn req(
        &self,
        method: Method,
        url: &str,
    ) -> Result<RequestBuilder, KeyboundError> {
        let url = Url::parse(url).map_err(|err| {
            KeyboundError::InvalidInput(format!("invalid backend url {url}: {err}"))
        })?;
        if !is_secure_target(&url) {
            return Err(KeyboundError::InvalidInput(format!(
                "refusing non-https backend url: {url}"
            )));
        }

        Ok(self
            .client
            .request(method, url)
            .timeout(self.config.request_timeout())
            .header(
                "User-Agent",
                format!("keybound-core/{}", env!("CARGO_PKG_VERSION")),
            ))
    }

    /// Creates an authenticated POST request builder with defaults applied.
    pub(crate) fn post_authenticated(
        &self,
        url: &str,
        auth_token: &SecretString,
    ) -> Result<RequestBuilder, KeyboundError> {
        Ok(self
            .req(Method::POST, url)?
            .bearer_auth(auth_token.expose_secret()))
    }

    /// Sends the request, mapping transport failures to [`KeyboundError::Network`].
    ///
    /// Non-2xx responses are returned as-is; interpreting them is up to the caller.
    pub(crate) async fn handle(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, KeyboundError> {
        let (client, request) = request_builder.build_split();
        let request = request.map_err(|err| {
            KeyboundError::InvalidInput(format!("request build failed: {err}"))
        })?;
        let url = request.url().to_string();

        client.execute(request).await.map_err(|err| {
            tracing::warn!("request to {url} failed: {err}");
            KeyboundError::Network {
                url,
                status: None,
                error: if err.is_timeout() {
                    format!("request timeout: {err}")
                } else if err.is_connect() {
                    format!("connect error: {err}")
                } else {
                    format!("request failed: {err}")
                },
            }
        })
    }
}

/// Reads the body of a non-2xx response, preferring the backend's JSON
/// `message`/`error` field over the raw text.
pub(crate) async fn error_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .or_else(|| value.get("error"))
                .and_then(|message| message.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| {
            if text.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string()
            } else {
                text
            }
        })
}

/// HTTPS anywhere, plain HTTP only to a loopback host.
fn is_secure_target(url: &Url) -> bool {
    match url.scheme() {
        "https" => true,
        "http" => url.host_str().is_some_and(is_loopback_host),
        _ => false,
    }
}

fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}
