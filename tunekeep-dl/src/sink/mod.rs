//! Remote object-store sink
//!
//! Delivers fetched artifacts to a remote container with name-keyed upsert
//! semantics: an existing object with the same name is overwritten, never
//! duplicated. [`drive::DriveStore`] is the Google Drive implementation.

pub mod drive;

pub use drive::DriveStore;

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Sink errors
#[derive(Debug, Error)]
pub enum SinkError {
    /// Credentials missing, malformed or refused
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Request could not be sent or no response arrived
    #[error("Network error: {0}")]
    Network(String),

    /// Remote returned a non-success status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Response body did not have the expected shape
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Local artifact could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sink configured but not usable this run
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Target folder. Shared-drive folders need the all-drives request flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Container {
    Default(String),
    Shared(String),
}

impl Container {
    pub fn new(folder_id: impl Into<String>, shared: bool) -> Self {
        if shared {
            Container::Shared(folder_id.into())
        } else {
            Container::Default(folder_id.into())
        }
    }

    pub fn folder_id(&self) -> &str {
        match self {
            Container::Default(id) | Container::Shared(id) => id,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Container::Shared(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    Updated,
}

impl fmt::Display for UpsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpsertAction::Created => "created",
            UpsertAction::Updated => "updated",
        })
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Non-trashed objects in `container` named exactly `name`
    async fn list(&self, name: &str, container: &Container) -> Result<Vec<RemoteObject>, SinkError>;

    /// Upload `content` as a new object; returns its id
    async fn create(
        &self,
        content: &Path,
        name: &str,
        container: &Container,
    ) -> Result<String, SinkError>;

    /// Replace the content of object `id`; returns its id
    async fn update(
        &self,
        id: &str,
        content: &Path,
        container: &Container,
    ) -> Result<String, SinkError>;
}

/// Update the first object named `target_name`, or create one
pub async fn upsert(
    store: &dyn ObjectStore,
    artifact: &Path,
    target_name: &str,
    container: &Container,
) -> Result<(String, UpsertAction), SinkError> {
    let existing = store.list(target_name, container).await?;

    match existing.first() {
        Some(object) => {
            debug!(name = target_name, id = %object.id, "Updating existing object");
            let id = store.update(&object.id, artifact, container).await?;
            Ok((id, UpsertAction::Updated))
        }
        None => {
            debug!(name = target_name, "Creating object");
            let id = store.create(artifact, target_name, container).await?;
            Ok((id, UpsertAction::Created))
        }
    }
}

/// A configured sink: store plus target container, possibly unavailable
pub struct Sink {
    store: Option<Box<dyn ObjectStore>>,
    container: Container,
    sync_ledger: bool,
    unavailable_reason: Option<String>,
}

impl Sink {
    pub fn new(store: Box<dyn ObjectStore>, container: Container) -> Self {
        Self {
            store: Some(store),
            container,
            sync_ledger: false,
            unavailable_reason: None,
        }
    }

    /// Configured but unusable; every upload fails with [`SinkError::Unavailable`]
    pub fn unavailable(container: Container, reason: impl Into<String>) -> Self {
        Self {
            store: None,
            container,
            sync_ledger: false,
            unavailable_reason: Some(reason.into()),
        }
    }

    pub fn with_sync_ledger(mut self, sync_ledger: bool) -> Self {
        self.sync_ledger = sync_ledger;
        self
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn sync_ledger(&self) -> bool {
        self.sync_ledger
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    /// Upsert a local file under its own file name
    pub async fn deliver(&self, path: &Path) -> Result<(String, String, UpsertAction), SinkError> {
        let Some(store) = &self.store else {
            return Err(SinkError::Unavailable(
                self.unavailable_reason.clone().unwrap_or_default(),
            ));
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SinkError::Parse(format!("No file name in {}", path.display())))?;

        let (id, action) = upsert(store.as_ref(), path, &name, &self.container).await?;
        info!(name = %name, id = %id, action = %action, "Uploaded");
        Ok((name, id, action))
    }
}
