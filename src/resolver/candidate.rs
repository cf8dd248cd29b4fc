//! Media candidates and the heuristics that pick one.

use std::collections::BTreeMap;

use serde::Serialize;
use url::Url;

/// Content types that mark a response as streamable media.
const MEDIA_CONTENT_TYPES: &[&str] = &[
    "video/mp4",
    "application/x-mpegurl",
    "application/vnd.apple.mpegurl",
];

/// Path fragments that mark a response as streamable media.
const MEDIA_PATH_MARKERS: &[&str] = &[".m3u8", ".mp4"];

/// A network response that looked like media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCandidate {
    pub url: String,
    /// `Content-Type` as sent, empty if absent.
    pub mime_type: String,
    /// Response headers, names lower-cased.
    pub headers: BTreeMap<String, String>,
}

/// How the chosen stream is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// HLS manifest.
    Adaptive,
    /// Progressive file.
    Direct,
}

/// The stream picked for a provider page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResult {
    pub direct_url: String,
    pub mime_type: String,
    pub quality: Quality,
    pub headers: BTreeMap<String, String>,
}

impl ResolveResult {
    fn from_candidate(candidate: &MediaCandidate, quality: Quality) -> Self {
        Self {
            direct_url: candidate.url.clone(),
            mime_type: candidate.mime_type.clone(),
            quality,
            headers: candidate.headers.clone(),
        }
    }
}

/// Whether a response qualifies as a candidate.
///
/// Content type is matched case-insensitively. The URL test looks at the
/// path only, so `?next=/a.mp4` on an HTML page does not count; a URL that
/// does not parse is tested whole.
pub fn is_media_response(url: &str, mime_type: &str) -> bool {
    let mime = mime_type.to_ascii_lowercase();
    if MEDIA_CONTENT_TYPES.iter().any(|t| mime.contains(t)) {
        return true;
    }

    let path = Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|_| url.to_ascii_lowercase());
    MEDIA_PATH_MARKERS.iter().any(|m| path.contains(m))
}

fn is_hls(candidate: &MediaCandidate) -> bool {
    candidate.mime_type.to_ascii_lowercase().contains("mpegurl")
        || candidate.url.to_ascii_lowercase().contains(".m3u8")
}

fn is_mp4(candidate: &MediaCandidate) -> bool {
    candidate.mime_type.to_ascii_lowercase().contains("video/mp4")
        || candidate.url.to_ascii_lowercase().contains(".mp4")
}

fn any_media(_: &MediaCandidate) -> bool {
    true
}

/// Preference order. The last rule matches everything, so a non-empty
/// list always yields a result.
const RULES: &[(fn(&MediaCandidate) -> bool, Quality)] = &[
    (is_hls, Quality::Adaptive),
    (is_mp4, Quality::Direct),
    (any_media, Quality::Direct),
];

/// Pick the best candidate: first HLS manifest, else first MP4, else the
/// first thing seen. `None` only for an empty list.
pub fn select(candidates: &[MediaCandidate]) -> Option<ResolveResult> {
    RULES.iter().find_map(|(rule, quality)| {
        candidates
            .iter()
            .find(|c| rule(c))
            .map(|c| ResolveResult::from_candidate(c, *quality))
    })
}
