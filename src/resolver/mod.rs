//! Provider page → direct media URL.
//!
//! One call runs one headless browser session:
//!
//! 1. launch an isolated browser with the desktop profile
//! 2. open a page and record every media-looking response
//! 3. navigate and wait for the network to settle
//! 4. try to click a play button
//! 5. close the browser, then pick the best candidate
//!
//! Steps 2–4 run under the session budget. Everything between launch and
//! close is best effort; only a failed launch, a page that could not be
//! opened, or an empty candidate list fails the call.

pub mod candidate;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::browser::{BrowserGuard, BrowserLauncher, BrowserSession, ChromeLauncher, NetworkObserver};
use crate::config::ResolverConfig;

pub use candidate::{MediaCandidate, Quality, ResolveResult};

/// Resolver errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Browser session failed: {0}")]
    Session(String),

    #[error("{0}")]
    Resolution(String),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Runs resolve sessions. Holds no per-session state, so one instance can
/// serve concurrent calls.
pub struct Resolver {
    launcher: Arc<dyn BrowserLauncher>,
    config: ResolverConfig,
}

impl Resolver {
    /// Resolver backed by a local Chromium.
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        let launcher = Arc::new(ChromeLauncher::new(config.clone()));
        Self { launcher, config }
    }

    /// Resolver with a custom browser launcher.
    #[must_use]
    pub fn with_launcher(launcher: Arc<dyn BrowserLauncher>, config: ResolverConfig) -> Self {
        Self { launcher, config }
    }

    /// Resolve `provider_url` to a playable stream.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::Launch`] if the browser could not be started
    /// - [`ResolveError::Session`] if no page could be opened in it
    /// - [`ResolveError::Resolution`] if no media response was seen
    #[instrument(skip(self))]
    pub async fn resolve(&self, provider_url: &str) -> Result<ResolveResult> {
        let profile = self.config.profile();
        let session = self
            .launcher
            .launch(&profile)
            .await
            .map_err(|e| ResolveError::Launch(format!("{e:#}")))?;
        let mut guard = BrowserGuard::new(session);

        let observer = NetworkObserver::new();
        let budget = self.config.session_budget();
        let outcome = match guard.session_mut() {
            Some(session) => {
                match tokio::time::timeout(budget, self.observe(session, provider_url, &observer))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!("Session budget ({budget:?}) exhausted, using what was captured");
                        Ok(())
                    }
                }
            }
            None => Err(ResolveError::Session("browser closed before use".to_string())),
        };

        guard.close().await;
        outcome?;

        let candidates = observer.candidates();
        debug!("{} media candidate(s) captured", candidates.len());

        let result = candidate::select(&candidates)
            .ok_or_else(|| ResolveError::Resolution("no media URLs found".to_string()))?;
        info!(
            direct_url = %result.direct_url,
            quality = ?result.quality,
            "Resolved stream"
        );
        Ok(result)
    }

    /// Steps 2–4: open, navigate, settle, click, settle.
    async fn observe(
        &self,
        session: &mut dyn BrowserSession,
        provider_url: &str,
        observer: &NetworkObserver,
    ) -> Result<()> {
        session
            .open_page(observer.clone())
            .await
            .map_err(|e| ResolveError::Session(format!("{e:#}")))?;

        info!("Navigating to {provider_url}");
        if let Err(e) = session
            .navigate(provider_url, self.config.navigation_timeout())
            .await
        {
            warn!("Navigation incomplete, continuing: {e:#}");
        }

        tokio::time::sleep(self.config.settle()).await;

        match tokio::time::timeout(self.config.click_timeout(), session.click_play()).await {
            Ok(Ok(true)) => {
                info!("Clicked play button");
                tokio::time::sleep(self.config.post_click()).await;
            }
            Ok(Ok(false)) => debug!("No play button found"),
            Ok(Err(e)) => warn!("Play button click failed: {e:#}"),
            Err(_) => warn!(
                "Play button lookup timed out after {:?}",
                self.config.click_timeout()
            ),
        }

        tokio::time::sleep(self.config.settle()).await;
        Ok(())
    }
}
