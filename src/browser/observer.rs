//! Passive network observer for a resolve session.
//!
//! The browser calls into the observer from its event loop, so both hooks
//! only log and append under a short lock. They never block and never fail.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::resolver::candidate::{is_media_response, MediaCandidate};

/// Collects media candidates in discovery order.
///
/// Cheap to clone; clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct NetworkObserver {
    candidates: Arc<Mutex<Vec<MediaCandidate>>>,
}

impl NetworkObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An outgoing request. Diagnostic only.
    pub fn on_request(&self, url: &str, resource_type: &str) {
        debug!("Request: {resource_type} - {url}");
    }

    /// A response arrived. Records it if it looks like media.
    ///
    /// Header names are lower-cased; when a name repeats the last value wins.
    pub fn on_response<I, K, V>(&self, url: &str, headers: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let headers: std::collections::BTreeMap<String, String> = headers
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
            .collect();
        let mime_type = headers.get("content-type").cloned().unwrap_or_default();

        if !is_media_response(url, &mime_type) {
            return;
        }

        info!("Found media URL: {url} ({mime_type})");
        self.candidates.lock().push(MediaCandidate {
            url: url.to_string(),
            mime_type,
            headers,
        });
    }

    /// Snapshot of everything recorded so far.
    pub fn candidates(&self) -> Vec<MediaCandidate> {
        self.candidates.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.candidates.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.lock().is_empty()
    }
}
