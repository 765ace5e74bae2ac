//! Credential pool
//!
//! Loads the multi-record cookie source, normalizes every record to the
//! Netscape tabular cookie-file shape the fetcher consumes, admits only
//! records carrying a login marker, and tracks which set last worked
//! ("stickiness") so it is tried first next time.
//!
//! # Source format
//! Records are separated by a line of five or more `=`. Each record is
//! either Netscape tabular text (7 tab-separated fields per line) or a JSON
//! array of cookie objects as exported by browser extensions.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Any one of these cookie names marks a logged-in session
pub const REQUIRED_MARKERS: &[&str] = &["SAPISID", "__Secure-3PSID", "__Secure-3PAPISID"];

/// Legacy sessions: both names together also count as logged in
const LEGACY_MARKER_PAIR: (&str, &str) = ("SID", "HSID");

const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File";
const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";
const DEFAULT_EXPIRY: i64 = 2_147_483_647;

static RECORD_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*={5,}\s*$").expect("valid separator regex"));

/// Credential pool errors
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Reading the source or materializing a cookie file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of validating one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Names the markers of which none were present
    MissingRequiredFields(Vec<String>),
}

/// One admitted, immutable credential set
#[derive(Debug, Clone)]
pub struct CredentialSet {
    index: usize,
    cookie_file: PathBuf,
}

impl CredentialSet {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Netscape cookie file handed to the fetcher
    pub fn cookie_file(&self) -> &Path {
        &self.cookie_file
    }
}

/// Ordered admitted credential sets plus the sticky preference
#[derive(Debug, Default)]
pub struct CredentialPool {
    sets: Vec<CredentialSet>,
    sticky_index: Option<usize>,
    // Keeps the materialized cookie files alive for the pool's lifetime
    _work_dir: Option<TempDir>,
}

impl CredentialPool {
    /// Pool with no credentials; every attempt is anonymous
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from a source file; a missing file gives an empty pool
    pub fn load_file(path: &Path) -> Result<Self, CredentialError> {
        if !path.exists() {
            debug!(path = %path.display(), "No credential source, using anonymous access");
            return Ok(Self::empty());
        }
        let bytes = std::fs::read(path)?;
        Self::load(&String::from_utf8_lossy(&bytes))
    }

    /// Split, normalize, validate and admit records in source order
    pub fn load(source: &str) -> Result<Self, CredentialError> {
        let mut admitted = Vec::new();

        for (position, part) in RECORD_SEPARATOR.split(source).enumerate() {
            let content = part.trim();
            if content.is_empty() {
                continue;
            }

            let content = if looks_like_netscape(content) {
                content.to_string()
            } else {
                json_to_netscape(content).unwrap_or_else(|| content.to_string())
            };

            match validate_record(&content) {
                Validity::Valid => admitted.push(content),
                Validity::MissingRequiredFields(missing) => {
                    warn!(
                        record = position,
                        missing = ?missing,
                        "Skipping credential record without a login marker"
                    );
                }
            }
        }

        if admitted.is_empty() {
            info!("No valid credential sets, using anonymous access");
            return Ok(Self::empty());
        }

        let work_dir = tempfile::Builder::new().prefix("cookies_sets_").tempdir()?;
        let mut sets = Vec::with_capacity(admitted.len());
        for (index, mut content) in admitted.into_iter().enumerate() {
            if !content.ends_with('\n') {
                content.push('\n');
            }
            let cookie_file = work_dir.path().join(format!("ck_{}.txt", index));
            std::fs::write(&cookie_file, content)?;
            sets.push(CredentialSet { index, cookie_file });
        }

        info!(count = sets.len(), "Credential sets admitted");
        Ok(Self {
            sets,
            sticky_index: None,
            _work_dir: Some(work_dir),
        })
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CredentialSet> {
        self.sets.get(index)
    }

    /// Last set that succeeded, if any
    pub fn sticky_index(&self) -> Option<usize> {
        self.sticky_index
    }

    /// Credential indices to try, starting at the sticky set and wrapping.
    ///
    /// An empty pool yields a single anonymous entry.
    pub fn order_for_attempt(&self) -> Vec<Option<usize>> {
        if self.sets.is_empty() {
            return vec![None];
        }
        let start = self.sticky_index.unwrap_or(0);
        (start..self.sets.len()).chain(0..start).map(Some).collect()
    }

    /// Prefer `index` from now on. Only called after a confirmed success.
    pub fn mark_good(&mut self, index: usize) {
        if index < self.sets.len() {
            self.sticky_index = Some(index);
        } else {
            warn!(index, pool_size = self.sets.len(), "Ignoring out-of-range credential index");
        }
    }
}

/// True when any data line has the 7-field tabular shape with a numeric expiry
pub fn looks_like_netscape(text: &str) -> bool {
    data_lines(text).any(|line| {
        let parts: Vec<&str> = line.split('\t').collect();
        parts.len() == 7 && parts[4].trim().parse::<i64>().is_ok()
    })
}

/// Translate a JSON cookie export into Netscape lines.
///
/// Returns `None` when the text is not a JSON array.
pub fn json_to_netscape(text: &str) -> Option<String> {
    let Ok(Value::Array(cookies)) = serde_json::from_str::<Value>(text) else {
        return None;
    };

    let mut out = vec![NETSCAPE_HEADER.to_string()];
    for cookie in &cookies {
        let field = |key: &str| cookie.get(key).and_then(Value::as_str).unwrap_or_default();

        let domain = field("domain");
        let name = field("name");
        if domain.is_empty() || name.is_empty() {
            continue;
        }
        let path = cookie.get("path").and_then(Value::as_str).unwrap_or("/");
        let secure = cookie.get("secure").and_then(Value::as_bool).unwrap_or(false);
        let expires = cookie
            .get("expirationDate")
            .and_then(Value::as_f64)
            .map(|e| e as i64)
            .unwrap_or(DEFAULT_EXPIRY);

        out.push(
            [
                domain,
                bool_field(domain.starts_with('.')),
                path,
                bool_field(secure),
                &expires.to_string(),
                name,
                field("value"),
            ]
            .join("\t"),
        );
    }
    Some(out.join("\n"))
}

/// Check a normalized record for at least one login marker
pub fn validate_record(content: &str) -> Validity {
    let names: BTreeSet<&str> = data_lines(content)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            (parts.len() == 7).then(|| parts[5])
        })
        .collect();

    let has_marker = REQUIRED_MARKERS.iter().any(|m| names.contains(m))
        || (names.contains(LEGACY_MARKER_PAIR.0) && names.contains(LEGACY_MARKER_PAIR.1));

    if has_marker {
        Validity::Valid
    } else {
        Validity::MissingRequiredFields(REQUIRED_MARKERS.iter().map(|m| m.to_string()).collect())
    }
}

/// Non-blank, non-comment lines; `#HttpOnly_` lines are cookies, not comments
fn data_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().filter_map(|line| {
        if let Some(rest) = line.strip_prefix(HTTP_ONLY_PREFIX) {
            return Some(rest);
        }
        if line.trim().is_empty() || line.starts_with('#') {
            None
        } else {
            Some(line)
        }
    })
}

fn bool_field(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn netscape_record(marker: &str) -> String {
        format!(
            "# Netscape HTTP Cookie File\n.youtube.com\tTRUE\t/\tTRUE\t1999999999\t{}\tvalue123\n",
            marker
        )
    }

    #[test]
    fn test_split_and_admit_in_order() {
        let source = format!(
            "{}\n=====\n{}\n==========\n{}",
            netscape_record("SAPISID"),
            netscape_record("PREF"),
            netscape_record("__Secure-3PSID")
        );
        let pool = CredentialPool::load(&source).unwrap();

        // The middle record has no login marker
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(0).unwrap().index(), 0);
        assert_eq!(pool.get(1).unwrap().index(), 1);

        let second = std::fs::read_to_string(pool.get(1).unwrap().cookie_file()).unwrap();
        assert!(second.contains("__Secure-3PSID"));
    }

    #[test]
    fn test_json_record_is_translated() {
        let json = r#"[
            {"domain": ".youtube.com", "path": "/", "secure": true,
             "expirationDate": 1999999999.5, "name": "SAPISID", "value": "abc"},
            {"domain": "", "name": "ignored", "value": "x"},
            {"domain": "youtube.com", "name": "PREF", "value": "f1"}
        ]"#;

        let text = json_to_netscape(json).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], NETSCAPE_HEADER);
        assert_eq!(lines[1], ".youtube.com\tTRUE\t/\tTRUE\t1999999999\tSAPISID\tabc");
        assert_eq!(lines[2], "youtube.com\tFALSE\t/\tFALSE\t2147483647\tPREF\tf1");
        assert_eq!(lines.len(), 3);

        let pool = CredentialPool::load(json).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_non_json_non_tabular_is_rejected() {
        let pool = CredentialPool::load("just some notes\nwithout cookies").unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_legacy_marker_pair() {
        let record = format!(
            "{}{}",
            netscape_record("SID"),
            ".youtube.com\tTRUE\t/\tFALSE\t1999999999\tHSID\tv\n"
        );
        assert_eq!(validate_record(&record), Validity::Valid);
        assert!(matches!(
            validate_record(&netscape_record("SID")),
            Validity::MissingRequiredFields(_)
        ));
    }

    #[test]
    fn test_http_only_lines_count_as_cookies() {
        let record = "#HttpOnly_.youtube.com\tTRUE\t/\tTRUE\t1999999999\t__Secure-3PSID\tv\n";
        assert!(looks_like_netscape(record));
        assert_eq!(validate_record(record), Validity::Valid);
    }

    #[test]
    fn test_missing_markers_are_named() {
        match validate_record(&netscape_record("PREF")) {
            Validity::MissingRequiredFields(missing) => {
                assert!(missing.contains(&"SAPISID".to_string()));
                assert!(missing.contains(&"__Secure-3PAPISID".to_string()));
            }
            Validity::Valid => panic!("record without markers must be rejected"),
        }
    }

    #[test]
    fn test_empty_pool_is_anonymous() {
        let pool = CredentialPool::empty();
        assert_eq!(pool.order_for_attempt(), vec![None]);
        assert_eq!(pool.sticky_index(), None);
    }

    #[test]
    fn test_order_wraps_from_sticky() {
        let source = (0..4)
            .map(|_| netscape_record("SAPISID"))
            .collect::<Vec<_>>()
            .join("=====\n");
        let mut pool = CredentialPool::load(&source).unwrap();
        assert_eq!(pool.len(), 4);

        assert_eq!(pool.order_for_attempt(), vec![Some(0), Some(1), Some(2), Some(3)]);

        pool.mark_good(2);
        assert_eq!(pool.sticky_index(), Some(2));
        assert_eq!(pool.order_for_attempt(), vec![Some(2), Some(3), Some(0), Some(1)]);
    }

    #[test]
    fn test_mark_good_out_of_range_is_ignored() {
        let mut pool = CredentialPool::load(&netscape_record("SAPISID")).unwrap();
        pool.mark_good(5);
        assert_eq!(pool.sticky_index(), None);
    }

    #[test]
    fn test_missing_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let pool = CredentialPool::load_file(&dir.path().join("cookies_multi.txt")).unwrap();
        assert!(pool.is_empty());
    }
}
