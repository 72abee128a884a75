//! Supervised browser plus its session.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::session::{Session, SessionConfig};
use crate::supervisor::{LaunchOptions, LaunchOutcome, ProcessSupervisor};

use super::builder::BrowserBuilder;

// ============================================================================
// Browser
// ============================================================================

/// A reachable browser endpoint with a connected [`Session`].
///
/// Created by [`Browser::builder`] or [`Browser::launch`]. The process is
/// stopped by [`Browser::close`] only if this instance spawned it.
#[derive(Debug)]
pub struct Browser {
    supervisor: ProcessSupervisor,
    session: Arc<Session>,
    outcome: LaunchOutcome,
    ws_url: String,
}

impl Browser {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> BrowserBuilder {
        BrowserBuilder::new()
    }

    /// Launches (or reuses) the browser, discovers its page endpoint and
    /// connects a session.
    ///
    /// A process spawned here is shut down again if discovery or the
    /// connection fails.
    ///
    /// # Errors
    ///
    /// Any error of [`ProcessSupervisor::launch`],
    /// [`DiscoveryClient::page_ws_url`](crate::DiscoveryClient::page_ws_url)
    /// or [`Session::connect_url`].
    pub async fn launch(options: LaunchOptions, config: SessionConfig) -> Result<Self> {
        Self::launch_with(options, config, false).await
    }

    pub(crate) async fn launch_with(
        options: LaunchOptions,
        config: SessionConfig,
        reclaim_zombies: bool,
    ) -> Result<Self> {
        let supervisor = ProcessSupervisor::new(options)?;

        if reclaim_zombies {
            let reclaimed = supervisor.cleanup_zombies().await?;
            if !reclaimed.is_empty() {
                debug!(count = reclaimed.len(), "Reclaimed stale records before launch");
            }
        }

        let outcome = supervisor.launch().await?;

        match Self::connect(&supervisor, config).await {
            Ok((ws_url, session)) => {
                info!(%ws_url, spawned = outcome.spawned(), "Browser session ready");
                Ok(Self {
                    supervisor,
                    session: Arc::new(session),
                    outcome,
                    ws_url,
                })
            }
            Err(e) => {
                if outcome.spawned()
                    && let Err(shutdown_err) = supervisor.shutdown().await
                {
                    warn!(error = %shutdown_err, "Shutdown after failed connect also failed");
                }
                Err(e)
            }
        }
    }

    async fn connect(
        supervisor: &ProcessSupervisor,
        config: SessionConfig,
    ) -> Result<(String, Session)> {
        let ws_url = supervisor.discovery().page_ws_url().await?;
        let session = Session::connect_url(&ws_url, config).await?;
        Ok((ws_url, session))
    }

    /// Returns the session.
    #[inline]
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Returns the supervisor.
    #[inline]
    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Returns how the endpoint was obtained.
    #[inline]
    #[must_use]
    pub fn outcome(&self) -> &LaunchOutcome {
        &self.outcome
    }

    /// Returns the WebSocket URL the session is connected to.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Closes the session, then stops the browser if this instance spawned it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the process record cannot
    /// be removed.
    pub async fn close(self) -> Result<()> {
        self.session.close().await?;
        if self.supervisor.owns_process() {
            self.supervisor.shutdown().await?;
        } else {
            debug!(port = self.supervisor.options().port, "Leaving reused browser running");
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use crate::test_support::{DiscoveryEndpoint, MockServer, result_for, unused_port};

    #[tokio::test]
    async fn test_launch_reuses_endpoint_and_connects() {
        let dir = TempDir::new().expect("tempdir");
        let server = MockServer::responding(|request| {
            vec![result_for(request, json!({ "product": "HeadlessChrome/126.0" }))]
        })
        .await;
        let endpoint = DiscoveryEndpoint::start(&server.ws_url()).await;

        let browser = Browser::builder()
            .port(endpoint.port())
            .record_dir(dir.path())
            .executable(dir.path().join("missing"))
            .command_timeout(Duration::from_secs(5))
            .launch()
            .await
            .expect("launch");

        assert!(!browser.outcome().spawned());
        assert_eq!(browser.ws_url(), server.ws_url());

        let version = browser
            .session()
            .send("Browser.getVersion", json!({}))
            .await
            .expect("Browser.getVersion");
        assert_eq!(version["product"], "HeadlessChrome/126.0");

        let session = Arc::clone(browser.session());
        browser.close().await.expect("close");
        assert!(!session.is_connected());
        endpoint.stop();
    }

    #[tokio::test]
    async fn test_launch_fails_without_endpoint_or_executable() {
        let dir = TempDir::new().expect("tempdir");
        let err = Browser::builder()
            .port(unused_port())
            .record_dir(dir.path())
            .executable(dir.path().join("missing"))
            .launch()
            .await
            .unwrap_err();
        assert!(err.is_process_error());
    }
}
