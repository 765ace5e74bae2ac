//! Shared test doubles: a rule-driven fetcher and an in-memory object store

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tunekeep_dl::{
    ClientVariant, Container, CredentialPool, FetchError, FetchRequest, MediaFetcher, ObjectStore,
    RemoteObject, SinkError,
};

/// `(credential index, variant)` of one fetch call
pub type Call = (Option<usize>, ClientVariant);

type Rule = dyn Fn(&FetchRequest, Option<usize>) -> Result<(), String> + Send + Sync;

/// Fetcher whose reply is decided by a closure over the request and the
/// credential index. Successful fetches drop `<video id>.m4a` in the output dir.
#[derive(Clone)]
pub struct RuleFetcher {
    rule: Arc<Rule>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl RuleFetcher {
    pub fn new(
        rule: impl Fn(&FetchRequest, Option<usize>) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            rule: Arc::new(rule),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(|_, _| Ok(()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl MediaFetcher for RuleFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
        let credential = request.credential_file.as_deref().and_then(credential_index);
        self.calls.lock().unwrap().push((credential, request.client_variant));

        (self.rule)(request, credential).map_err(FetchError::new)?;

        let stem = request
            .identifier
            .rsplit('=')
            .next()
            .unwrap_or("artifact")
            .to_string();
        std::fs::write(request.output_dir.join(format!("{}.m4a", stem)), b"audio").unwrap();
        Ok(())
    }
}

/// Index encoded in a materialized `ck_<n>.txt` cookie file name
pub fn credential_index(path: &Path) -> Option<usize> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("ck_")?
        .parse()
        .ok()
}

/// Pool of `n` valid credential sets
pub fn pool_of(n: usize) -> CredentialPool {
    if n == 0 {
        return CredentialPool::empty();
    }
    let record = concat!(
        "# Netscape HTTP Cookie File\n",
        ".youtube.com\tTRUE\t/\tTRUE\t1999999999\tSAPISID\tsecret\n",
    );
    CredentialPool::load(&vec![record; n].join("=====\n")).unwrap()
}

/// In-memory store; `fail_uploads` makes create/update fail
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub objects: Arc<Mutex<Vec<RemoteObject>>>,
    pub fail_uploads: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn failing() -> Self {
        let store = Self::default();
        *store.fail_uploads.lock().unwrap() = true;
        store
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail_uploads.lock().unwrap() = failing;
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().iter().map(|o| o.name.clone()).collect()
    }

    fn check(&self) -> Result<(), SinkError> {
        if *self.fail_uploads.lock().unwrap() {
            return Err(SinkError::Http {
                status: 503,
                body: "backend unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(
        &self,
        name: &str,
        _container: &Container,
    ) -> Result<Vec<RemoteObject>, SinkError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.name == name)
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        _content: &Path,
        name: &str,
        _container: &Container,
    ) -> Result<String, SinkError> {
        self.check()?;
        let mut objects = self.objects.lock().unwrap();
        let id = format!("obj-{}", objects.len());
        objects.push(RemoteObject {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn update(
        &self,
        id: &str,
        _content: &Path,
        _container: &Container,
    ) -> Result<String, SinkError> {
        self.check()?;
        Ok(id.to_string())
    }
}
