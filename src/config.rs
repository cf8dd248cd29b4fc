//! Service configuration loaded from `~/.config/mediarelay/config.toml`.
//!
//! Every field has a default, so a missing file (or a partial one) is fine.
//! Lookup order: explicit path, `MEDIARELAY_CONFIG`, then the user config
//! directory. `PORT` overrides the bind port.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fingerprint::{desktop_profile, BrowserProfile};

/// Env var naming an explicit config file.
pub const CONFIG_ENV: &str = "MEDIARELAY_CONFIG";

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub resolver: ResolverConfig,
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3001)),
        }
    }
}

/// Headless browser session settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Browser binary. Searched on `PATH` when unset.
    pub chrome_path: Option<PathBuf>,
    /// How long to wait for the DevTools endpoint after spawning.
    pub launch_timeout_ms: u64,
    /// Upper bound on navigate + network idle.
    pub navigation_timeout_ms: u64,
    /// Grace period before and after the play-button click.
    pub settle_ms: u64,
    /// Upper bound on the play-button lookup and click.
    pub click_timeout_ms: u64,
    /// Extra wait after a successful click.
    pub post_click_ms: u64,
    /// Hard ceiling for everything between launch and close.
    pub session_budget_ms: u64,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Appended to the launch flags.
    pub extra_args: Vec<String>,
    /// URL patterns the page is not allowed to load (`*` wildcards).
    pub blocked_url_patterns: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            launch_timeout_ms: 30_000,
            navigation_timeout_ms: 60_000,
            settle_ms: 5_000,
            click_timeout_ms: 3_000,
            post_click_ms: 3_000,
            session_budget_ms: 240_000,
            viewport_width: 1920,
            viewport_height: 1080,
            extra_args: Vec::new(),
            blocked_url_patterns: vec![
                "*doubleclick.net*".to_string(),
                "*googlesyndication.com*".to_string(),
                "*adsystem*".to_string(),
                "*google-analytics.com*".to_string(),
            ],
        }
    }
}

impl ResolverConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn click_timeout(&self) -> Duration {
        Duration::from_millis(self.click_timeout_ms)
    }

    pub fn post_click(&self) -> Duration {
        Duration::from_millis(self.post_click_ms)
    }

    pub fn session_budget(&self) -> Duration {
        Duration::from_millis(self.session_budget_ms)
    }

    /// Desktop profile sized to the configured viewport.
    pub fn profile(&self) -> BrowserProfile {
        desktop_profile().with_viewport(self.viewport_width, self.viewport_height)
    }
}

/// Upstream client settings for the streaming proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub connect_timeout_ms: u64,
    /// Maximum gap between body chunks. There is no total timeout, long
    /// videos stream for as long as the player keeps reading.
    pub read_timeout_ms: u64,
    pub max_redirects: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            read_timeout_ms: 30_000,
            max_redirects: 10,
        }
    }
}

/// Bearer tokens accepted by the resolver entrypoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<ApiToken>,
}

/// A single accepted token and the caller id it identifies.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiToken {
    pub token: String,
    pub caller: String,
}

impl AuthConfig {
    /// Caller id for `token`, if it is one of ours.
    pub fn caller_for(&self, token: &str) -> Option<&str> {
        self.tokens
            .iter()
            .find(|t| !t.token.is_empty() && t.token == token)
            .map(|t| t.caller.as_str())
    }
}

/// Stands in for secrets when a config is displayed.
pub const REDACTED: &str = "<redacted>";

impl Config {
    /// Copy with every bearer token replaced by [`REDACTED`].
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for token in &mut config.auth.tokens {
            token.token = REDACTED.to_string();
        }
        config
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid TOML")
    }

    /// Load from `explicit`, `$MEDIARELAY_CONFIG`, or the default path.
    ///
    /// Returns defaults if the resolved file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if `PORT` is set but not a port number.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(default_path);

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml(&content).with_context(|| format!("in {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port
                .parse()
                .with_context(|| format!("PORT is not a valid port: {port}"))?;
            config.server.bind.set_port(port);
        }

        Ok(config)
    }
}

/// Return the default config file path.
fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mediarelay")
        .join("config.toml")
}
