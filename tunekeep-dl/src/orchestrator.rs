//! Run orchestration
//!
//! One run: compute the pending work list, attempt each identifier in
//! order, deliver successes to the sink, and only then commit them to the
//! ledger. The ledger is reconciled against the input list at the end of
//! every run, whatever the individual outcomes were.

use crate::attempt::FetchEngine;
use crate::fetcher::MediaFetcher;
use crate::sink::{Sink, UpsertAction};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tokio::runtime::RuntimeFlavor;
use tracing::{info, warn};
use tunekeep_common::{canonicalize, Ledger, ReconcileReport};

/// Per-run settings
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Pause between identifiers (not after the last one)
    pub pace: Duration,
    /// Process at most this many pending identifiers
    pub batch_size: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            pace: Duration::from_secs(8),
            batch_size: None,
        }
    }
}

/// One object delivered to the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub name: String,
    pub action: UpsertAction,
    pub remote_id: String,
}

/// End-of-run report
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_inputs: usize,
    pub already_done: usize,
    pub pending: usize,
    /// Fetched, delivered and committed
    pub succeeded: Vec<String>,
    /// `(identifier, reason)` for identifiers every credential/variant failed on
    pub failed: Vec<(String, String)>,
    pub uploaded: Vec<UploadRecord>,
    /// `(identifier, reason)` fetched but not delivered; retried next run
    pub deferred: Vec<(String, String)>,
    pub reconcile: Option<ReconcileReport>,
}

impl RunSummary {
    /// Print the end-of-run summary
    pub fn log(&self) {
        let elapsed = self.finished_at - self.started_at;
        info!(
            total = self.total_inputs,
            already_done = self.already_done,
            pending = self.pending,
            succeeded = self.succeeded.len(),
            failed = self.failed.len(),
            deferred = self.deferred.len(),
            uploaded = self.uploaded.len(),
            elapsed_secs = elapsed.num_seconds(),
            "Run finished"
        );

        for upload in &self.uploaded {
            info!(
                name = %upload.name,
                action = %upload.action,
                id = %upload.remote_id,
                "Uploaded"
            );
        }
        for (id, reason) in &self.failed {
            warn!(identifier = %id, "Failed: {}", reason);
        }
        for (id, reason) in &self.deferred {
            warn!(identifier = %id, "Not delivered, will retry next run: {}", reason);
        }
        if let Some(report) = &self.reconcile {
            info!(kept = report.kept, dropped = report.dropped, "Ledger state");
        }
    }
}

/// Canonical identifiers not yet done, deduplicated, in input order
pub fn pending_work<S: AsRef<str>>(
    all_ids: &[S],
    ledger: &Ledger,
    batch_size: Option<usize>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut pending: Vec<String> = all_ids
        .iter()
        .map(|raw| canonicalize(raw.as_ref()))
        .filter(|id| !id.is_empty() && !ledger.contains(id) && seen.insert(id.clone()))
        .collect();

    if let Some(limit) = batch_size {
        pending.truncate(limit);
    }
    pending
}

pub struct Orchestrator<F: MediaFetcher> {
    engine: FetchEngine<F>,
    ledger: Ledger,
    sink: Option<Sink>,
    options: RunOptions,
}

impl<F: MediaFetcher> Orchestrator<F> {
    pub fn new(
        engine: FetchEngine<F>,
        ledger: Ledger,
        sink: Option<Sink>,
        options: RunOptions,
    ) -> Self {
        Self {
            engine,
            ledger,
            sink,
            options,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn engine(&self) -> &FetchEngine<F> {
        &self.engine
    }

    /// Process every pending identifier of `all_ids`
    pub async fn run<S: AsRef<str>>(&mut self, all_ids: &[S]) -> RunSummary {
        let started_at = Utc::now();
        let work = pending_work(all_ids, &self.ledger, self.options.batch_size);

        let already_done = {
            let mut distinct = HashSet::new();
            all_ids
                .iter()
                .map(|raw| canonicalize(raw.as_ref()))
                .filter(|id| distinct.insert(id.clone()) && self.ledger.contains(id))
                .count()
        };

        info!(
            total = all_ids.len(),
            done = already_done,
            pending = work.len(),
            "Starting run"
        );

        let mut summary = RunSummary {
            started_at,
            finished_at: started_at,
            total_inputs: all_ids.len(),
            already_done,
            pending: work.len(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            uploaded: Vec::new(),
            deferred: Vec::new(),
            reconcile: None,
        };

        for (position, id) in work.iter().enumerate() {
            info!(identifier = %id, position = position + 1, of = work.len(), "Processing");

            let outcome = self.engine.attempt(id).await;
            if !outcome.ok {
                let reason = outcome
                    .error
                    .unwrap_or_else(|| crate::attempt::EXHAUSTED_MESSAGE.to_string());
                summary.failed.push((id.clone(), reason));
            } else if let Some(sink) = &self.sink {
                match outcome.artifact.as_deref().filter(|p| p.is_file()) {
                    Some(artifact) => match sink.deliver(artifact).await {
                        Ok((name, remote_id, action)) => {
                            summary.uploaded.push(UploadRecord {
                                name,
                                action,
                                remote_id,
                            });
                            commit(&mut self.ledger, id, &mut summary);
                        }
                        Err(e) => {
                            warn!(identifier = %id, "Upload failed, not marking done: {}", e);
                            summary.deferred.push((id.clone(), e.to_string()));
                        }
                    },
                    None => {
                        warn!(identifier = %id, "Fetch reported success but left no artifact");
                        summary.deferred.push((id.clone(), "no artifact to deliver".to_string()));
                    }
                }
            } else {
                commit(&mut self.ledger, id, &mut summary);
            }

            if position + 1 < work.len() && !self.options.pace.is_zero() {
                info!(seconds = self.options.pace.as_secs_f64(), "Pausing before next identifier");
                tokio::time::sleep(self.options.pace).await;
            }
        }

        let ledger = &mut self.ledger;
        match off_runtime(|| ledger.reconcile(all_ids)) {
            Ok(report) => summary.reconcile = Some(report),
            Err(e) => warn!("Ledger reconcile failed: {}", e),
        }

        let ledger_sink = self
            .sink
            .as_ref()
            .filter(|s| s.sync_ledger() && s.is_available());
        if let Some(sink) = ledger_sink {
            match sink.deliver(self.ledger.path()).await {
                Ok((name, remote_id, action)) => summary.uploaded.push(UploadRecord {
                    name,
                    action,
                    remote_id,
                }),
                Err(e) => warn!("Ledger sync to sink failed: {}", e),
            }
        }

        summary.finished_at = Utc::now();
        summary
    }
}

/// Run blocking ledger I/O (which may wait on the cross-process lock) without
/// stalling other tasks on a multi-threaded runtime
fn off_runtime<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn commit(ledger: &mut Ledger, id: &str, summary: &mut RunSummary) {
    if let Err(e) = off_runtime(|| ledger.append(id)) {
        warn!(identifier = %id, "Ledger append failed, will be retried next run: {}", e);
    }
    summary.succeeded.push(id.to_string());
}
