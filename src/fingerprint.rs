//! Desktop Browser Fingerprint
//!
//! A single fixed Chrome-on-Windows profile shared by the headless resolver
//! (launch User-Agent and viewport) and the streaming proxy (upstream request
//! headers). Media hosts routinely reject requests whose `Referer`/`Origin`
//! do not name their own site, so proxied requests are dressed up as a
//! same-origin fetch issued by a page on the target host.

use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ORIGIN, REFERER, USER_AGENT,
};
use url::Url;

/// Chrome 120 on Windows 10.
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// `Accept-Language` sent on every upstream request.
pub const DESKTOP_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

const DEFAULT_ACCEPT: &str = "*/*";

/// Browser window size in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Browser profile with a realistic desktop fingerprint
#[derive(Debug, Clone)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub accept_language: String,
    pub sec_ch_ua: String,
    pub sec_ch_ua_mobile: String,
    pub sec_ch_ua_platform: String,
    pub viewport: Viewport,
}

/// The fixed desktop Chrome profile.
#[must_use]
pub fn desktop_profile() -> BrowserProfile {
    BrowserProfile {
        user_agent: DESKTOP_USER_AGENT.to_string(),
        accept_language: DESKTOP_ACCEPT_LANGUAGE.to_string(),
        sec_ch_ua: "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\""
            .to_string(),
        sec_ch_ua_mobile: "?0".to_string(),
        sec_ch_ua_platform: "\"Windows\"".to_string(),
        viewport: Viewport::default(),
    }
}

/// `scheme://host[:port]` of `url`, the value a browser puts in `Origin`.
#[must_use]
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

impl BrowserProfile {
    /// Replace the viewport, keeping everything else.
    #[must_use]
    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport = Viewport { width, height };
        self
    }

    /// Headers for a request to `target` that looks like it was issued by a
    /// page on the target's own origin.
    ///
    /// `accept` is the caller's `Accept` header (defaults to `*/*`).
    /// `referer` replaces the synthesized `Referer` and `Origin` when the
    /// host checks for one specific referring site.
    pub fn origin_headers(
        &self,
        target: &Url,
        accept: Option<&HeaderValue>,
        referer: Option<&Url>,
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        headers.insert(
            ACCEPT,
            accept
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_ACCEPT)),
        );
        if let Ok(value) = HeaderValue::from_str(&self.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, value);
        }

        let (referer_value, origin_value) = match referer {
            Some(referer) => (referer.to_string(), origin_of(referer)),
            None => {
                let origin = origin_of(target);
                (format!("{origin}/"), origin)
            }
        };
        if let Ok(value) = HeaderValue::from_str(&referer_value) {
            headers.insert(REFERER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&origin_value) {
            headers.insert(ORIGIN, value);
        }

        // Client hints, Chrome only
        if !self.sec_ch_ua.is_empty() {
            for (name, value) in [
                ("Sec-CH-UA", &self.sec_ch_ua),
                ("Sec-CH-UA-Mobile", &self.sec_ch_ua_mobile),
                ("Sec-CH-UA-Platform", &self.sec_ch_ua_platform),
            ] {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.insert(name, value);
                }
            }
        }

        headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("empty"));
        headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("cors"));
        headers.insert("Sec-Fetch-Site", HeaderValue::from_static("same-origin"));

        headers
    }
}

impl Default for BrowserProfile {
    fn default() -> Self {
        desktop_profile()
    }
}
