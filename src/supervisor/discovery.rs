//! HTTP discovery endpoint client.
//!
//! A browser started with `--remote-debugging-port` serves
//! `/json/version` (browser-level WebSocket URL) and `/json/list` (one entry
//! per target). The supervisor uses `/json/version` as its health check.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Per-request timeout for discovery requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Types
// ============================================================================

/// `/json/version` response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VersionInfo {
    /// Browser product and version (`"HeadlessChrome/126.0.6478.126"`).
    #[serde(rename = "Browser", default)]
    pub browser: String,

    /// Protocol version (`"1.3"`).
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: String,

    /// User agent string.
    #[serde(rename = "User-Agent", default)]
    pub user_agent: String,

    /// Browser-level WebSocket endpoint.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
}

/// One `/json/list` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetInfo {
    /// Target id.
    pub id: String,

    /// Target type (`"page"`, `"service_worker"`, ...).
    #[serde(rename = "type")]
    pub target_type: String,

    /// Title.
    #[serde(default)]
    pub title: String,

    /// Current URL.
    #[serde(default)]
    pub url: String,

    /// WebSocket endpoint; absent while another client is attached.
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub web_socket_debugger_url: Option<String>,
}

impl TargetInfo {
    /// Returns `true` for page targets.
    #[inline]
    #[must_use]
    pub fn is_page(&self) -> bool {
        self.target_type == "page"
    }
}

// ============================================================================
// DiscoveryClient
// ============================================================================

/// Client for one browser's discovery endpoint.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    base: String,
    http: reqwest::Client,
}

impl DiscoveryClient {
    /// Creates a client for `http://host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            base: format!("http://{host}:{port}"),
            http,
        })
    }

    /// Returns the endpoint base URL.
    #[inline]
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base);
        trace!(%url, "Discovery request");
        let response = self.http.get(&url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Fetches `/json/version`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the endpoint is unreachable or answers
    /// with an error status or an unexpected body.
    pub async fn version(&self) -> Result<VersionInfo> {
        self.get("/json/version").await
    }

    /// Fetches `/json/list`.
    ///
    /// # Errors
    ///
    /// Same as [`DiscoveryClient::version`].
    pub async fn targets(&self) -> Result<Vec<TargetInfo>> {
        self.get("/json/list").await
    }

    /// Returns the WebSocket URL of the first page target, falling back to
    /// the browser-level endpoint.
    ///
    /// # Errors
    ///
    /// - [`Error::Http`] if the endpoint is unreachable
    /// - [`Error::Protocol`] if neither document yields a URL
    pub async fn page_ws_url(&self) -> Result<String> {
        match self.targets().await {
            Ok(targets) => {
                if let Some(url) = targets
                    .into_iter()
                    .filter(TargetInfo::is_page)
                    .find_map(|target| target.web_socket_debugger_url)
                {
                    return Ok(url);
                }
                debug!(base = %self.base, "No attachable page target, using browser endpoint");
            }
            Err(e) => debug!(base = %self.base, error = %e, "Target list unavailable"),
        }

        let version = self.version().await?;
        if version.web_socket_debugger_url.is_empty() {
            return Err(Error::protocol("discovery endpoint returned no WebSocket URL"));
        }
        Ok(version.web_socket_debugger_url)
    }

    /// Cheap reachability check.
    pub async fn is_healthy(&self) -> bool {
        match self.version().await {
            Ok(_) => true,
            Err(e) => {
                trace!(base = %self.base, error = %e, "Health check failed");
                false
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::{DiscoveryEndpoint, unused_port};

    const WS_URL: &str = "ws://127.0.0.1:9/devtools/page/PAGE1";

    #[test]
    fn test_version_info_deserialize() {
        let info: VersionInfo = serde_json::from_str(
            r#"{"Browser":"Chrome/126.0","Protocol-Version":"1.3","webSocketDebuggerUrl":"ws://x/devtools/browser/1"}"#,
        )
        .expect("parse");
        assert_eq!(info.browser, "Chrome/126.0");
        assert_eq!(info.user_agent, "");
        assert_eq!(info.web_socket_debugger_url, "ws://x/devtools/browser/1");
    }

    #[tokio::test]
    async fn test_version_and_targets() {
        let endpoint = DiscoveryEndpoint::start(WS_URL).await;
        let client = DiscoveryClient::new("127.0.0.1", endpoint.port()).expect("client");

        let version = client.version().await.expect("version");
        assert_eq!(version.protocol_version, "1.3");
        assert_eq!(version.web_socket_debugger_url, WS_URL);

        let targets = client.targets().await.expect("targets");
        assert_eq!(targets.len(), 2);
        assert!(!targets[0].is_page());
        assert!(targets[1].is_page());

        assert!(client.is_healthy().await);
        endpoint.stop();
    }

    #[tokio::test]
    async fn test_page_ws_url_skips_non_page_targets() {
        let endpoint = DiscoveryEndpoint::start(WS_URL).await;
        let client = DiscoveryClient::new("127.0.0.1", endpoint.port()).expect("client");
        assert_eq!(client.page_ws_url().await.expect("url"), WS_URL);
        endpoint.stop();
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let client = DiscoveryClient::new("127.0.0.1", unused_port()).expect("client");
        assert!(!client.is_healthy().await);
        assert!(matches!(client.version().await, Err(Error::Http(_))));
    }
}
