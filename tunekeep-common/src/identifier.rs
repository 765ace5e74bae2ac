//! Identifier canonicalization
//!
//! Collapses the many link shapes that name the same video into one
//! canonical watch URL so that dedup and ledger membership compare equal.
//! Unrecognized input is returned trimmed, which still gives exact-string
//! dedup.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// Canonical form prefix; the video id is appended
pub const CANONICAL_PREFIX: &str = "https://www.youtube.com/watch?v=";

static VIDEO_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid video id regex"));

/// Path prefixes that carry the id as the following segment
const ID_PATH_PREFIXES: &[&str] = &["shorts", "embed", "live", "v", "e"];

/// Normalize a raw identifier. Total, pure and idempotent.
pub fn canonicalize(raw: &str) -> String {
    let trimmed = raw.trim();
    match video_id(trimmed) {
        Some(id) => format!("{}{}", CANONICAL_PREFIX, id),
        None => trimmed.to_string(),
    }
}

/// Extract the video id from any recognized link shape
pub fn video_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if VIDEO_ID.is_match(raw) {
        return Some(raw.to_string());
    }

    let url = parse_lenient(raw)?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = ["www.", "m.", "music."]
        .iter()
        .find_map(|p| host.strip_prefix(p))
        .unwrap_or(&host)
        .to_string();

    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());

    let candidate = match host.as_str() {
        "youtu.be" => segments.next().map(str::to_string),
        "youtube.com" | "youtube-nocookie.com" => {
            let first = segments.next();
            match first {
                Some("watch") | None => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                Some(prefix) if ID_PATH_PREFIXES.contains(&prefix) => {
                    segments.next().map(str::to_string)
                }
                Some(_) => None,
            }
        }
        _ => None,
    }?;

    VIDEO_ID.is_match(&candidate).then_some(candidate)
}

/// Parse as a URL, accepting scheme-less links like `youtu.be/abc`
fn parse_lenient(raw: &str) -> Option<Url> {
    if raw.is_empty() || raw.contains(char::is_whitespace) {
        return None;
    }
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
        Ok(_) => None,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("https://{}", raw)).ok()
        }
        Err(_) => None,
    }
}
