//! Durable, deduplicating record of processed identifiers
//!
//! # File format
//! UTF-8, one canonical identifier per line, `#` comment lines ignored.
//! Only newline-terminated lines are entries; a trailing fragment left by
//! an interrupted append is ignored and cut off by the next append.
//! Between reconciliations the file is an append-only log in completion
//! order; after [`Ledger::reconcile`] it follows the input list order.
//!
//! # Concurrency
//! Overlapping runs may share one ledger file. Appends and reconciliation
//! take an exclusive advisory lock on a sibling `<ledger>.lock` file, so
//! the lock survives the atomic rename that reconciliation performs.
//! Lock acquisition is bounded: after `lock_wait` the operation proceeds
//! unlocked with a warning rather than stalling the run.
//!
//! The API is synchronous and may sleep while polling for the lock; async
//! callers should run it via `tokio::task::block_in_place` or similar.

use crate::identifier::canonicalize;
use crate::input::clean_lines;
use crate::{Error, Result};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Ledger tuning knobs
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Upper bound on waiting for the cross-process lock
    pub lock_wait: Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(10),
        }
    }
}

/// Result of [`Ledger::append`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new line was written and flushed
    Appended,
    /// An equal entry already existed on disk (no write)
    AlreadyPresent,
}

/// Result of [`Ledger::reconcile`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries kept (present in the input list)
    pub kept: usize,
    /// Done entries dropped because the input list no longer names them
    pub dropped: usize,
}

/// Durable set of processed canonical identifiers
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    lock_path: PathBuf,
    options: LedgerOptions,
    done: HashSet<String>,
    order: Vec<String>,
}

impl Ledger {
    /// Open (creating if absent) the ledger at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, LedgerOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: LedgerOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            File::create(&path)?;
        }

        let mut ledger = Self {
            lock_path: lock_path_for(&path),
            path,
            options,
            done: HashSet::new(),
            order: Vec::new(),
        };

        for entry in read_entries(&ledger.path)? {
            ledger.remember(entry);
        }

        debug!(
            path = %ledger.path.display(),
            entries = ledger.order.len(),
            "Ledger loaded"
        );
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Membership against entries loaded at open plus those appended since
    pub fn contains(&self, id: &str) -> bool {
        self.done.contains(&canonicalize(id))
    }

    /// Entries in load/append order (input order after reconcile)
    pub fn entries(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Idempotently record `id` as done.
    ///
    /// Under the lock the current file is re-read so that an entry written
    /// by another process is not duplicated. The line is written with a
    /// single write and flushed to stable storage before the lock drops.
    pub fn append(&mut self, id: &str) -> Result<AppendOutcome> {
        let id = canonicalize(id);
        if id.is_empty() {
            return Err(Error::InvalidInput("empty identifier".to_string()));
        }

        let _lock = LedgerLock::acquire(&self.lock_path, self.options.lock_wait);

        let current = read_raw(&self.path)?;
        let kept_len = complete_len(&current);
        let on_disk = clean_lines(&String::from_utf8_lossy(&current[..kept_len]))
            .into_iter()
            .any(|e| canonicalize(&e) == id);
        if on_disk {
            debug!(id = %id, "Ledger already contains entry");
            self.remember(id);
            return Ok(AppendOutcome::AlreadyPresent);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        // A crash mid-append can leave an unterminated fragment. It is not an
        // entry, so cut it off before writing.
        if kept_len < current.len() {
            warn!(
                path = %self.path.display(),
                fragment = %String::from_utf8_lossy(&current[kept_len..]),
                "Ledger ends with a partial line, discarding it"
            );
            file.set_len(kept_len as u64)?;
        }

        let mut line = String::with_capacity(id.len() + 1);
        line.push_str(&id);
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        self.remember(id);
        Ok(AppendOutcome::Appended)
    }

    /// Rewrite the ledger as the subsequence of `all_ids` already done.
    ///
    /// The result is deduplicated, in `all_ids` order, and written to a
    /// temp file that atomically replaces the ledger only on success.
    pub fn reconcile<S: AsRef<str>>(&mut self, all_ids: &[S]) -> Result<ReconcileReport> {
        let _lock = LedgerLock::acquire(&self.lock_path, self.options.lock_wait);

        let mut done = self.done.clone();
        done.extend(read_entries(&self.path)?);

        let mut seen = HashSet::new();
        let kept: Vec<String> = all_ids
            .iter()
            .map(|raw| canonicalize(raw.as_ref()))
            .filter(|id| done.contains(id) && seen.insert(id.clone()))
            .collect();

        let mut content = String::new();
        for id in &kept {
            content.push_str(id);
            content.push('\n');
        }
        write_atomically(&self.path, content.as_bytes())?;

        let report = ReconcileReport {
            kept: kept.len(),
            dropped: done.len().saturating_sub(kept.len()),
        };

        self.done = kept.iter().cloned().collect();
        self.order = kept;

        info!(
            path = %self.path.display(),
            kept = report.kept,
            dropped = report.dropped,
            "Ledger reconciled"
        );
        Ok(report)
    }

    fn remember(&mut self, id: String) {
        if self.done.insert(id.clone()) {
            self.order.push(id);
        }
    }
}

/// Exclusive advisory lock, released on drop
struct LedgerLock {
    file: Option<File>,
}

impl LedgerLock {
    /// Poll for the lock with backoff; give up after `wait` and run unlocked.
    fn acquire(path: &Path, wait: Duration) -> Self {
        let file = match OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
        {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    "Cannot open ledger lock file, continuing unlocked: {}",
                    e
                );
                return Self { file: None };
            }
        };

        let start = Instant::now();
        let mut backoff_ms = 10u64;

        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Self { file: Some(file) },
                Err(e) if is_contended(&e) && start.elapsed() < wait => {
                    debug!(backoff_ms, "Ledger locked by another process, waiting");
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms = (backoff_ms * 2).min(250);
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        waited_ms = start.elapsed().as_millis(),
                        "Ledger lock unavailable, continuing unlocked: {}",
                        e
                    );
                    return Self { file: None };
                }
            }
        }
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = FileExt::unlock(file);
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn read_raw(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Length of the prefix of `raw` that ends with its last newline
fn complete_len(raw: &[u8]) -> usize {
    raw.iter().rposition(|b| *b == b'\n').map_or(0, |end| end + 1)
}

/// Entries on disk; an unterminated trailing line is not one
fn read_entries(path: &Path) -> Result<Vec<String>> {
    let raw = read_raw(path)?;
    Ok(clean_lines(&String::from_utf8_lossy(&raw[..complete_len(&raw)]))
        .iter()
        .map(|line| canonicalize(line))
        .collect())
}

/// Write to a sibling temp file, fsync, then rename over `path`
fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".ledger-")
        .suffix(".tmp")
        .tempfile_in(&dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| Error::Ledger(format!("replace {} failed: {}", path.display(), e.error)))?;
    Ok(())
}
