//! HTTP plumbing shared by the metadata-endpoint readers.

use crate::error::{Result, SettingsError};
use fleet_core::ports::Platform;
use fleet_core::settings::{Network, Networks};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
pub const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_TTL_SECONDS: &str = "300";

/// Bounded retry of metadata GETs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

/// GETs against a link-local metadata endpoint.
///
/// Before each fetch the client makes sure at least one interface is
/// configured, since the endpoint is unreachable otherwise. When a token
/// path is set it first asks for a session token and sends it along; a
/// failed token request falls back to plain GETs.
#[derive(Clone)]
pub struct MetadataClient {
    client: Client,
    host: String,
    headers: BTreeMap<String, String>,
    token_path: Option<String>,
    platform: Arc<dyn Platform>,
    retry: RetryPolicy,
}

impl MetadataClient {
    pub fn new(host: impl Into<String>, platform: Arc<dyn Platform>) -> Self {
        Self {
            client: Client::new(),
            host: host.into(),
            headers: BTreeMap::new(),
            token_path: None,
            platform,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_token_path(mut self, token_path: Option<String>) -> Self {
        self.token_path = token_path.filter(|p| !p.is_empty());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> Result<Url> {
        let raw = format!("{}{}", self.host.trim_end_matches('/'), path);
        Url::parse(&raw).map_err(|e| SettingsError::parse(format!("metadata URL '{}'", raw), e))
    }

    fn with_configured_headers(&self, mut request: RequestBuilder) -> RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        request
    }

    /// Configure a DHCP interface when none is configured yet.
    pub async fn ensure_minimal_network(&self) -> Result<()> {
        let interfaces = self
            .platform
            .get_configured_network_interfaces()
            .await
            .map_err(|e| SettingsError::from(e).context("Getting configured network interfaces"))?;
        if !interfaces.is_empty() {
            return Ok(());
        }

        info!("No network interface configured, setting up DHCP");
        let networks = Networks::single("eth0", Network::default_dhcp());
        self.platform
            .setup_networking(&networks)
            .await
            .map_err(|e| SettingsError::from(e).context("Setting up DHCP networking"))
    }

    async fn token(&self) -> Option<String> {
        let path = self.token_path.as_deref()?;
        let url = match self.url(path) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Invalid metadata token path");
                return None;
            }
        };

        let request = self
            .with_configured_headers(self.client.put(url.clone()))
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS);
        match request.send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(token) => Some(token.trim().to_string()),
                Err(e) => {
                    warn!(error = %e, "Reading metadata token, continuing without it");
                    None
                }
            },
            Ok(response) => {
                warn!(status = %response.status(), "Metadata token refused, continuing without it");
                None
            }
            Err(e) => {
                warn!(error = %e, "Requesting metadata token, continuing without it");
                None
            }
        }
    }

    async fn get_once(&self, url: &Url) -> std::result::Result<Vec<u8>, String> {
        let mut request = self.with_configured_headers(self.client.get(url.clone()));
        if let Some(token) = self.token().await {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(format!("unexpected status {}", status));
        }
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(body.to_vec())
    }

    /// GET `path`, retrying per the policy.
    pub async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.ensure_minimal_network().await?;
        let url = self.url(path)?;

        let attempts = self.retry.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.get_once(&url).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    debug!(%url, attempt, error = %e, "Metadata request failed");
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.delay).await;
            }
        }

        Err(SettingsError::Http {
            url: url.to_string(),
            message: last_error,
        })
    }
}
