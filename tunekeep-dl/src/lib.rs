//! tunekeep-dl library interface
//!
//! Credential-rotating fetch engine, remote sink, and the run orchestrator
//! that ties them to the ledger from `tunekeep-common`. Exposed as a library
//! for integration testing.

pub mod attempt;
pub mod config;
pub mod credentials;
pub mod fetcher;
pub mod orchestrator;
pub mod rotation;
pub mod sink;

pub use attempt::{AttemptOutcome, AttemptRecord, AttemptState, FetchEngine};
pub use credentials::{CredentialError, CredentialPool, CredentialSet};
pub use fetcher::{ClientVariant, FetchError, FetchRequest, MediaFetcher, YtDlpFetcher};
pub use orchestrator::{pending_work, Orchestrator, RunOptions, RunSummary, UploadRecord};
pub use rotation::{FailureSignal, RotationDecision, SignalCatalogue};
pub use sink::{
    upsert, Container, DriveStore, ObjectStore, RemoteObject, Sink, SinkError, UpsertAction,
};
