//! Configuration loading and root folder resolution
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`TUNEKEEP_ROOT_FOLDER`, then `TUNEKEEP_ROOT`)
//! 3. TOML config file (`root_folder` key)
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or unparsable TOML file is never fatal: a warning is logged and
//! compiled defaults are used.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the input identifier list inside the root folder
pub const LINKS_FILE: &str = "links.txt";
/// Default name of the ledger file inside the root folder
pub const DEFAULT_LEDGER_FILE: &str = "dalay.txt";
/// Multi-record credential source inside the root folder
pub const CREDENTIALS_FILE: &str = "cookies_multi.txt";
/// Optional proof-of-origin token file inside the root folder
pub const PO_TOKEN_FILE: &str = "po_token.txt";
/// Output directory for fetched artifacts
pub const OUTPUT_DIR: &str = "audio";
/// Fetcher cache directory
pub const CACHE_DIR: &str = ".ydl_cache";

const ENV_ROOT_FOLDER: &str = "TUNEKEEP_ROOT_FOLDER";
const ENV_ROOT: &str = "TUNEKEEP_ROOT";

/// Compiled-in defaults used when nothing else is configured
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
    pub sleep_seconds: u64,
    pub lock_wait_ms: u64,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        Self {
            root_folder: default_root_folder(),
            log_level: "info".to_string(),
            sleep_seconds: 8,
            lock_wait_ms: 10_000,
        }
    }
}

/// Logging section of the TOML file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Object-store sink section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SinkConfig {
    /// Target folder; the sink is disabled when absent
    pub folder_id: Option<String>,
    /// Folder lives in a shared drive (needs the all-drives request flags)
    #[serde(default)]
    pub shared: bool,
    /// Upload the ledger file itself at the end of each run
    #[serde(default)]
    pub sync_ledger: bool,
    /// Service-account key file
    pub service_account_file: Option<PathBuf>,
}

/// Failure-signature catalogue overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalConfig {
    pub block_phrases: Option<Vec<String>>,
    pub soft_format_phrases: Option<Vec<String>>,
}

/// On-disk TOML configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub sleep_seconds: Option<u64>,
    pub batch_size: Option<usize>,
    pub ledger_file: Option<String>,
    pub lock_wait_ms: Option<u64>,
    pub ytdlp_binary: Option<String>,
    pub ffmpeg_location: Option<PathBuf>,
    // Tables last so the serialized form stays valid TOML
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub signals: SignalConfig,
}

impl TomlConfig {
    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Load the module's config file, falling back to defaults on any failure
    pub fn load_or_default(module_name: &str) -> Self {
        let Some(path) = config_file_path(module_name) else {
            debug!(module = module_name, "No TOML config file found, using defaults");
            return Self::default();
        };

        match Self::from_file(&path) {
            Ok(config) => {
                debug!(path = %path.display(), "Loaded TOML config");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), "Ignoring TOML config: {}", e);
                Self::default()
            }
        }
    }
}

/// Resolves the root folder following the priority order in the module docs
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
        }
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn resolve(&self) -> PathBuf {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        // Priority 2: Environment variables
        for var in [ENV_ROOT_FOLDER, ENV_ROOT] {
            if let Ok(path) = std::env::var(var) {
                if !path.trim().is_empty() {
                    return PathBuf::from(path);
                }
            }
        }

        // Priority 3: TOML config file
        if let Some(config_path) = config_file_path(&self.module_name) {
            match TomlConfig::from_file(&config_path) {
                Ok(config) => {
                    if let Some(root) = config.root_folder {
                        return root;
                    }
                }
                Err(e) => warn!(path = %config_path.display(), "Ignoring TOML config: {}", e),
            }
        }

        // Priority 4: OS-dependent compiled default
        CompiledDefaults::for_current_platform().root_folder
    }
}

/// Creates the root folder layout and knows where each file lives in it
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root: PathBuf,
    ledger_file: String,
}

impl RootFolderInitializer {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            ledger_file: DEFAULT_LEDGER_FILE.to_string(),
        }
    }

    pub fn with_ledger_file(mut self, name: Option<String>) -> Self {
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            self.ledger_file = name;
        }
        self
    }

    /// Create the root folder, the output directory, and empty input/ledger
    /// files. Safe to call repeatedly.
    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.output_dir())?;

        for file in [self.links_path(), self.ledger_path()] {
            if !file.exists() {
                std::fs::write(&file, "")?;
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn links_path(&self) -> PathBuf {
        self.root.join(LINKS_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(&self.ledger_file)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.root.join(CREDENTIALS_FILE)
    }

    pub fn po_token_path(&self) -> PathBuf {
        self.root.join(PO_TOKEN_FILE)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }
}

/// Locate the TOML config for a module
///
/// Linux tries `~/.config/tunekeep/<module>.toml`, `~/.config/tunekeep/config.toml`
/// and then `/etc/tunekeep/config.toml`; other platforms only the user config dir.
pub fn config_file_path(module_name: &str) -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(dir) = dirs::config_dir() {
        let dir = dir.join("tunekeep");
        candidates.push(dir.join(format!("{}.toml", module_name)));
        candidates.push(dir.join("config.toml"));
    }

    if cfg!(target_os = "linux") {
        candidates.push(PathBuf::from("/etc/tunekeep/config.toml"));
    }

    candidates.into_iter().find(|p| p.exists())
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/tunekeep (or /var/lib/tunekeep for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("tunekeep"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/tunekeep"))
    } else if cfg!(target_os = "macos") {
        // ~/Library/Application Support/tunekeep
        dirs::data_dir()
            .map(|d| d.join("tunekeep"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/tunekeep"))
    } else if cfg!(target_os = "windows") {
        // %LOCALAPPDATA%\tunekeep
        dirs::data_local_dir()
            .map(|d| d.join("tunekeep"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\tunekeep"))
    } else {
        PathBuf::from("./tunekeep_data")
    }
}
