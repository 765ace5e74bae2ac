//! Run settings resolution for tunekeep-dl
//!
//! Each setting is resolved from up to four tiers, highest first:
//! command line → environment → TOML config → compiled default.
//! When a setting is present in more than one tier a warning names them,
//! and the highest tier wins.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use tunekeep_common::config::{CompiledDefaults, TomlConfig};

pub const ENV_SLEEP_SECONDS: &str = "SLEEP_SECONDS";
pub const ENV_PO_TOKEN: &str = "PO_TOKEN";
pub const ENV_FOLDER_ID: &str = "GDRIVE_FOLDER_ID";
pub const ENV_SA_JSON: &str = "GDRIVE_SA_JSON";
pub const ENV_SA_FILE: &str = "GDRIVE_SA_FILE";
pub const ENV_SHARED_DRIVE: &str = "GDRIVE_SHARED_DRIVE";

/// Sink settings, present only when a target folder is configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSettings {
    pub folder_id: String,
    pub shared: bool,
    pub sync_ledger: bool,
    pub service_account_json: Option<String>,
    pub service_account_file: Option<PathBuf>,
}

/// Validate a configured value (non-empty, non-whitespace)
pub fn is_valid_value(value: &str) -> bool {
    !value.trim().is_empty()
}

/// Pick the first present tier, warning when several are present
fn pick_tier<T>(setting: &str, tiers: Vec<(&'static str, Option<T>)>) -> Option<(T, &'static str)> {
    let present: Vec<&str> = tiers
        .iter()
        .filter(|(_, value)| value.is_some())
        .map(|(source, _)| *source)
        .collect();

    if present.len() > 1 {
        warn!(
            "{} found in multiple sources: {}. Using {} (highest priority).",
            setting,
            present.join(", "),
            present[0]
        );
    }

    tiers
        .into_iter()
        .find_map(|(source, value)| value.map(|v| (v, source)))
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| is_valid_value(v)).map(|v| v.trim().to_string())
}

fn env_flag(name: &str) -> Option<bool> {
    env_value(name).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Seconds to pause between identifiers
///
/// **Priority:** CLI → `SLEEP_SECONDS` → TOML `sleep_seconds` → 8
pub fn resolve_sleep_seconds(cli: Option<u64>, toml_config: &TomlConfig) -> u64 {
    let env = env_value(ENV_SLEEP_SECONDS).and_then(|raw| match raw.parse::<u64>() {
        Ok(secs) => Some(secs),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a whole number of seconds", ENV_SLEEP_SECONDS, raw);
            None
        }
    });

    match pick_tier(
        "Sleep seconds",
        vec![
            ("command line", cli),
            ("environment", env),
            ("TOML", toml_config.sleep_seconds),
        ],
    ) {
        Some((secs, source)) => {
            debug!(seconds = secs, source, "Sleep seconds resolved");
            secs
        }
        None => CompiledDefaults::for_current_platform().sleep_seconds,
    }
}

/// Maximum identifiers per run; `None` means all pending
pub fn resolve_batch_size(cli: Option<usize>, toml_config: &TomlConfig) -> Option<usize> {
    pick_tier(
        "Batch size",
        vec![("command line", cli), ("TOML", toml_config.batch_size)],
    )
    .map(|(size, _)| size)
}

/// Bound on waiting for the ledger lock
pub fn resolve_lock_wait(toml_config: &TomlConfig) -> Duration {
    let ms = toml_config
        .lock_wait_ms
        .unwrap_or_else(|| CompiledDefaults::for_current_platform().lock_wait_ms);
    Duration::from_millis(ms)
}

/// Proof-of-origin token
///
/// **Priority:** `PO_TOKEN` → `po_token.txt` in the root folder
pub fn resolve_po_token(token_file: &Path) -> Option<String> {
    let file_token = match std::fs::read_to_string(token_file) {
        Ok(text) => Some(text.trim().to_string()).filter(|t| is_valid_value(t)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %token_file.display(), "Cannot read PO token file: {}", e);
            None
        }
    };

    let (token, source) = pick_tier(
        "PO token",
        vec![("environment", env_value(ENV_PO_TOKEN)), ("token file", file_token)],
    )?;
    info!("PO token loaded from {}", source);
    Some(token)
}

/// Object-store sink settings; `None` disables the sink
///
/// **Priority:** `GDRIVE_*` environment → TOML `[sink]`
pub fn resolve_sink_settings(toml_config: &TomlConfig) -> Option<SinkSettings> {
    let sink = &toml_config.sink;

    let Some((folder_id, source)) = pick_tier(
        "Drive folder id",
        vec![
            ("environment", env_value(ENV_FOLDER_ID)),
            ("TOML", sink.folder_id.clone().filter(|f| is_valid_value(f))),
        ],
    ) else {
        info!("No upload folder configured, sink disabled");
        return None;
    };
    info!("Upload folder id loaded from {}", source);

    let service_account_file = pick_tier(
        "Service account file",
        vec![
            ("environment", env_value(ENV_SA_FILE).map(PathBuf::from)),
            ("TOML", sink.service_account_file.clone()),
        ],
    )
    .map(|(path, _)| path);

    Some(SinkSettings {
        folder_id,
        shared: env_flag(ENV_SHARED_DRIVE).unwrap_or(sink.shared),
        sync_ledger: sink.sync_ledger,
        service_account_json: env_value(ENV_SA_JSON),
        service_account_file,
    })
}

/// Fetcher binary name or path
pub fn resolve_ytdlp_binary(toml_config: &TomlConfig) -> String {
    toml_config
        .ytdlp_binary
        .clone()
        .filter(|b| is_valid_value(b))
        .unwrap_or_else(|| crate::fetcher::ytdlp::DEFAULT_BINARY.to_string())
}

/// Warn about missing external tools. Never fatal.
pub fn check_external_tools(ytdlp_binary: &str, ffmpeg_location: Option<&Path>) {
    match which::which(ytdlp_binary) {
        Ok(path) => debug!(path = %path.display(), "Found yt-dlp"),
        Err(_) => warn!("{} not found in PATH, every fetch will fail", ytdlp_binary),
    }

    match ffmpeg_location {
        Some(location) if location.exists() => {
            debug!(path = %location.display(), "Using configured ffmpeg location")
        }
        Some(location) => warn!(
            path = %location.display(),
            "Configured ffmpeg location does not exist, audio extraction may fail"
        ),
        None => match which::which("ffmpeg") {
            Ok(path) => debug!(path = %path.display(), "Found ffmpeg"),
            Err(_) => warn!("ffmpeg not found in PATH, audio extraction may fail"),
        },
    }
}
