//! `mediarelay` - media stream resolver and streaming proxy
//!
//! # Features
//!
//! - **Resolver**: loads a provider page in headless Chromium, watches its
//!   network traffic and returns the direct HLS/MP4 URL the player asked for
//! - **Streaming proxy**: range-aware CORS relay that fetches media with
//!   browser-like headers and streams it back unchanged
//! - **Server**: both behind one axum app, deployable together or per role
//!
//! # Example
//!
//! ```rust,no_run
//! use mediarelay::{Config, Resolver};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let resolver = Resolver::new(config.resolver);
//!     let stream = resolver.resolve("https://embed.example/e/42").await?;
//!     println!("{} ({:?})", stream.direct_url, stream.quality);
//!     Ok(())
//! }
//! ```

pub mod browser;
pub mod config;
pub mod fingerprint;
pub mod proxy;
pub mod resolver;
pub mod server;

pub use browser::{BrowserGuard, BrowserLauncher, BrowserSession, ChromeLauncher, NetworkObserver};
pub use config::Config;
pub use fingerprint::{desktop_profile, BrowserProfile};
pub use proxy::{ProxyError, ProxyService};
pub use resolver::{MediaCandidate, Quality, ResolveError, ResolveResult, Resolver};
pub use server::{create_router, start_server, AppContext, ServiceRole};

/// Version of mediarelay
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
