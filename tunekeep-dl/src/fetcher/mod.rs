//! Media fetcher interface
//!
//! The attempt engine talks to the upstream provider only through
//! [`MediaFetcher`]. The production implementation drives `yt-dlp`
//! ([`ytdlp::YtDlpFetcher`]); tests substitute scripted fetchers.

pub mod ytdlp;

pub use ytdlp::YtDlpFetcher;

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Preferred audio format expression
pub const DEFAULT_FORMAT: &str = "bestaudio[ext=m4a]/bestaudio/best";

/// Extension of the artifacts the fetcher leaves in the output directory
pub const ARTIFACT_EXTENSION: &str = "m4a";

/// Upstream client impersonation profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientVariant {
    Web,
    WebEmbedded,
    Android,
}

impl ClientVariant {
    /// Label passed to the provider's extractor
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientVariant::Web => "web",
            ClientVariant::WebEmbedded => "web_embedded",
            ClientVariant::Android => "android",
        }
    }

    /// Browser-family variants accept a proof-of-origin token
    pub fn accepts_po_token(&self) -> bool {
        self.as_str().starts_with("web")
    }
}

impl fmt::Display for ClientVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variant order when a credential set is in use
pub const CREDENTIALED_PLAN: [ClientVariant; 3] =
    [ClientVariant::Web, ClientVariant::WebEmbedded, ClientVariant::Android];

/// Variant order for anonymous attempts
pub const ANONYMOUS_PLAN: [ClientVariant; 3] =
    [ClientVariant::Android, ClientVariant::Web, ClientVariant::WebEmbedded];

pub fn client_plan(credentialed: bool) -> &'static [ClientVariant] {
    if credentialed {
        &CREDENTIALED_PLAN
    } else {
        &ANONYMOUS_PLAN
    }
}

/// One fetch invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub identifier: String,
    pub credential_file: Option<PathBuf>,
    pub client_variant: ClientVariant,
    pub format_preference: String,
    pub output_dir: PathBuf,
    pub po_token: Option<String>,
}

/// Fetch failure; the message is what failure classification inspects
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Place the resource in `request.output_dir`, or fail with the
    /// provider's error text
    async fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError>;
}

/// Files in `dir` with extension `ext`; unreadable directories give an empty set
pub fn snapshot(dir: &Path, ext: &str) -> HashSet<PathBuf> {
    list_with_extension(dir, ext)
        .into_iter()
        .map(|(path, _)| path)
        .collect()
}

/// Newest file not present in `before`, else the newest file overall
pub fn newest_artifact(before: &HashSet<PathBuf>, dir: &Path, ext: &str) -> Option<PathBuf> {
    let files = list_with_extension(dir, ext);

    let newest = |candidates: Vec<&(PathBuf, SystemTime)>| {
        candidates
            .into_iter()
            .max_by_key(|(_, modified)| *modified)
            .map(|(path, _)| path.clone())
    };

    newest(files.iter().filter(|(p, _)| !before.contains(p)).collect())
        .or_else(|| newest(files.iter().collect()))
}

fn list_with_extension(dir: &Path, ext: &str) -> Vec<(PathBuf, SystemTime)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            let matches = path
                .extension()
                .map(|e| e.eq_ignore_ascii_case(ext))
                .unwrap_or(false);
            if !matches {
                return None;
            }
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((path, modified))
        })
        .collect()
}
