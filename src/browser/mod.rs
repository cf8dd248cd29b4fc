//! Headless browser control.
//!
//! A [`BrowserLauncher`] starts one browser process and hands back a
//! [`BrowserSession`]. The resolver only talks to these traits, so the real
//! Chrome implementation ([`ChromeLauncher`]) can be swapped for a scripted
//! one in tests.
//!
//! Sessions are always held through a [`BrowserGuard`], which owns the
//! handle and is the single place the browser gets closed.

pub mod cdp;
pub mod chrome;
pub mod observer;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::fingerprint::BrowserProfile;

pub use chrome::{ChromeLauncher, ChromeSession};
pub use observer::NetworkObserver;

/// Starts browser processes.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Start one isolated browser using `profile`'s User-Agent and viewport.
    async fn launch(&self, profile: &BrowserProfile) -> Result<Box<dyn BrowserSession>>;
}

/// A running browser process.
#[async_trait]
pub trait BrowserSession: Send {
    /// Open a fresh, isolated page and route its network traffic to
    /// `observer`. Must be called before [`navigate`](Self::navigate).
    async fn open_page(&mut self, observer: NetworkObserver) -> Result<()>;

    /// Navigate the page and wait for the network to go idle, at most
    /// `timeout`.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()>;

    /// Look for a play-button-like element and click it.
    ///
    /// Returns `Ok(false)` when nothing matched.
    async fn click_play(&mut self) -> Result<bool>;

    /// Shut the browser down and release its resources.
    async fn close(&mut self) -> Result<()>;
}

/// Owns a [`BrowserSession`] and guarantees it is closed at most once.
///
/// `close` is idempotent: the handle is taken out before closing, so a
/// second call is a no-op. Dropping a guard that still holds a session
/// (caller cancelled mid-flight) drops the session, and the Chrome session
/// kills its process on drop.
pub struct BrowserGuard {
    session: Option<Box<dyn BrowserSession>>,
}

impl BrowserGuard {
    #[must_use]
    pub fn new(session: Box<dyn BrowserSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// The live session, or `None` once closed.
    pub fn session_mut(&mut self) -> Option<&mut (dyn BrowserSession + 'static)> {
        self.session.as_deref_mut()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Close the browser. Failures are logged, never raised.
    pub async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        match session.close().await {
            Ok(()) => debug!("Browser closed"),
            Err(e) => warn!("Browser close failed: {e:#}"),
        }
    }
}

impl Drop for BrowserGuard {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("Dropping browser session without close");
        }
    }
}
