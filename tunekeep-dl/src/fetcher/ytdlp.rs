//! `yt-dlp` subprocess fetcher
//!
//! Runs one `yt-dlp` process per try. Progress output goes to the terminal;
//! stderr is captured so the final `ERROR:` line can be classified.

use super::{FetchError, FetchRequest, MediaFetcher, ARTIFACT_EXTENSION};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

pub const DEFAULT_BINARY: &str = "yt-dlp";

/// Desktop browser User-Agent sent with every request
pub const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) ",
    "AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
);

const RETRIES: u32 = 3;
const FRAGMENT_RETRIES: u32 = 3;
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Lines of stderr kept when no `ERROR:` line is present
const STDERR_TAIL_LINES: usize = 5;

pub struct YtDlpFetcher {
    binary: String,
    cache_dir: PathBuf,
    ffmpeg_location: Option<PathBuf>,
}

impl YtDlpFetcher {
    pub fn new(binary: impl Into<String>, cache_dir: PathBuf) -> Self {
        Self {
            binary: binary.into(),
            cache_dir,
            ffmpeg_location: None,
        }
    }

    pub fn with_ffmpeg_location(mut self, location: Option<PathBuf>) -> Self {
        self.ffmpeg_location = location;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Full argument list for one request
    pub fn build_args(&self, request: &FetchRequest) -> Vec<String> {
        let output = request.output_dir.join(OUTPUT_TEMPLATE);

        let mut args: Vec<String> = vec![
            "-f".into(),
            request.format_preference.clone(),
            "-x".into(),
            "--audio-format".into(),
            ARTIFACT_EXTENSION.into(),
            "--audio-quality".into(),
            "0".into(),
            "-o".into(),
            output.to_string_lossy().into_owned(),
            "--no-playlist".into(),
            "--windows-filenames".into(),
            "--no-check-certificates".into(),
            "--retries".into(),
            RETRIES.to_string(),
            "--fragment-retries".into(),
            FRAGMENT_RETRIES.to_string(),
            "--user-agent".into(),
            USER_AGENT.into(),
            "--force-ipv4".into(),
            "--cache-dir".into(),
            self.cache_dir.to_string_lossy().into_owned(),
        ];

        if let Some(ffmpeg) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".into());
            args.push(ffmpeg.to_string_lossy().into_owned());
        }

        if let Some(cookies) = &request.credential_file {
            args.push("--cookies".into());
            args.push(cookies.to_string_lossy().into_owned());
        }

        let mut extractor = format!("youtube:player_client={}", request.client_variant);
        if let Some(token) = &request.po_token {
            if request.client_variant.accepts_po_token() {
                extractor.push_str(&format!(";po_token=web+{}", token));
            }
        }
        args.push("--extractor-args".into());
        args.push(extractor);

        // Identifiers may start with '-'
        args.push("--".into());
        args.push(request.identifier.clone());
        args
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
        debug!(
            identifier = %request.identifier,
            client = %request.client_variant,
            credentialed = request.credential_file.is_some(),
            "Running yt-dlp"
        );

        let output = Command::new(&self.binary)
            .args(self.build_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    FetchError::new(format!("{} binary not found in PATH", self.binary))
                } else {
                    FetchError::new(format!("Failed to execute {}: {}", self.binary, e))
                }
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| l.starts_with("WARNING:")) {
            debug!(identifier = %request.identifier, "{}", line);
        }

        if output.status.success() {
            return Ok(());
        }

        let message = error_message(&stderr)
            .unwrap_or_else(|| format!("{} exited with {}", self.binary, output.status));
        warn!(
            identifier = %request.identifier,
            client = %request.client_variant,
            "Fetch failed: {}",
            message
        );
        Err(FetchError::new(message))
    }
}

/// Last `ERROR:` line of stderr, or its last few lines when there is none
pub fn error_message(stderr: &str) -> Option<String> {
    if let Some(line) = stderr.lines().rev().find(|l| l.trim_start().starts_with("ERROR:")) {
        return Some(line.trim().to_string());
    }

    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    Some(lines[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{ClientVariant, DEFAULT_FORMAT};

    fn request(variant: ClientVariant, cookies: bool, token: bool) -> FetchRequest {
        FetchRequest {
            identifier: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
            credential_file: cookies.then(|| PathBuf::from("/tmp/ck_0.txt")),
            client_variant: variant,
            format_preference: DEFAULT_FORMAT.to_string(),
            output_dir: PathBuf::from("/data/audio"),
            po_token: token.then(|| "TOKEN".to_string()),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_args_credentialed_web_with_token() {
        let fetcher = YtDlpFetcher::new(DEFAULT_BINARY, PathBuf::from("/data/.ydl_cache"));
        let args = fetcher.build_args(&request(ClientVariant::Web, true, true));

        assert_eq!(value_after(&args, "-f"), Some(DEFAULT_FORMAT));
        assert_eq!(value_after(&args, "--audio-format"), Some("m4a"));
        assert_eq!(value_after(&args, "-o"), Some("/data/audio/%(title)s.%(ext)s"));
        assert_eq!(value_after(&args, "--cookies"), Some("/tmp/ck_0.txt"));
        assert_eq!(value_after(&args, "--cache-dir"), Some("/data/.ydl_cache"));
        assert_eq!(
            value_after(&args, "--extractor-args"),
            Some("youtube:player_client=web;po_token=web+TOKEN")
        );
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(args.contains(&"--force-ipv4".to_string()));
        assert_eq!(args.last().map(String::as_str), Some(
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        ));
        assert!(value_after(&args, "--ffmpeg-location").is_none());
    }

    #[test]
    fn test_args_anonymous_android_ignores_token() {
        let fetcher = YtDlpFetcher::new(DEFAULT_BINARY, PathBuf::from("/c"))
            .with_ffmpeg_location(Some(PathBuf::from("/opt/ffmpeg/bin")));
        let args = fetcher.build_args(&request(ClientVariant::Android, false, true));

        assert!(value_after(&args, "--cookies").is_none());
        assert_eq!(
            value_after(&args, "--extractor-args"),
            Some("youtube:player_client=android")
        );
        assert_eq!(value_after(&args, "--ffmpeg-location"), Some("/opt/ffmpeg/bin"));
    }

    #[test]
    fn test_error_message_picks_last_error_line() {
        let stderr = concat!(
            "WARNING: something\n",
            "ERROR: first\n",
            "noise\n",
            "ERROR: [youtube] x: HTTP Error 403: Forbidden\n",
        );
        assert_eq!(
            error_message(stderr).as_deref(),
            Some("ERROR: [youtube] x: HTTP Error 403: Forbidden")
        );
    }

    #[test]
    fn test_error_message_tail_without_error_line() {
        let stderr = "a\nb\n\nc\nd\ne\nf\n";
        assert_eq!(error_message(stderr).as_deref(), Some("b\nc\nd\ne\nf"));
        assert_eq!(error_message("  \n"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = YtDlpFetcher::new("tunekeep-no-such-binary", dir.path().to_path_buf());
        let err = fetcher
            .fetch(&request(ClientVariant::Web, false, false))
            .await
            .unwrap_err();
        assert!(err.message.contains("not found"));
    }
}
