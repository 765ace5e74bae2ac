//! Fetch attempt state machine
//!
//! For one identifier, walks the credential order from the pool and, per
//! credential, the client-variant plan, until a fetch succeeds or every
//! combination is used up:
//!
//! ```text
//! Pending -> Trying(cred, variant) -> Success
//!                                  -> SoftRetry -> Trying(cred, next variant)
//!                                  -> Rotate    -> Trying(next cred, first variant)
//!                    (plan exhausted)           -> Abandoned
//! ```
//!
//! The engine never touches the ledger. Committing is the orchestrator's job.

use crate::credentials::CredentialPool;
use crate::fetcher::{
    client_plan, newest_artifact, snapshot, ClientVariant, FetchRequest, MediaFetcher,
    ARTIFACT_EXTENSION, DEFAULT_FORMAT,
};
use crate::rotation::{decide, FailureSignal, RotationDecision, SignalCatalogue};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Reported when every credential/variant pairing failed without a message
pub const EXHAUSTED_MESSAGE: &str = "Blocked/failed on all credential sets/clients.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Trying {
        credential: Option<usize>,
        variant: ClientVariant,
    },
    Success,
    /// Same credential, next variant
    SoftRetry,
    /// Next credential
    Rotate,
    Abandoned,
}

/// One fetch try within an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub credential: Option<usize>,
    pub variant: ClientVariant,
    /// `Success`, `SoftRetry` or `Rotate`
    pub outcome: AttemptState,
    pub signal: Option<FailureSignal>,
    pub error: Option<String>,
}

/// Result of [`FetchEngine::attempt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub ok: bool,
    pub error: Option<String>,
    pub artifact: Option<PathBuf>,
}

pub struct FetchEngine<F: MediaFetcher> {
    fetcher: F,
    pool: CredentialPool,
    catalogue: SignalCatalogue,
    output_dir: PathBuf,
    po_token: Option<String>,
    state: AttemptState,
    last_attempts: Vec<AttemptRecord>,
}

impl<F: MediaFetcher> FetchEngine<F> {
    pub fn new(fetcher: F, pool: CredentialPool, output_dir: PathBuf) -> Self {
        Self {
            fetcher,
            pool,
            catalogue: SignalCatalogue::default(),
            output_dir,
            po_token: None,
            state: AttemptState::Pending,
            last_attempts: Vec::new(),
        }
    }

    pub fn with_catalogue(mut self, catalogue: SignalCatalogue) -> Self {
        self.catalogue = catalogue;
        self
    }

    pub fn with_po_token(mut self, token: Option<String>) -> Self {
        self.po_token = token;
        self
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Terminal state of the most recent attempt
    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Every try made by the most recent attempt, in order
    pub fn last_attempts(&self) -> &[AttemptRecord] {
        &self.last_attempts
    }

    /// Fetch one identifier, rotating credentials and client variants
    pub async fn attempt(&mut self, identifier: &str) -> AttemptOutcome {
        self.last_attempts.clear();
        self.transition(identifier, AttemptState::Pending);

        let mut last_error: Option<String> = None;

        for credential in self.pool.order_for_attempt() {
            let credential_file = credential
                .and_then(|i| self.pool.get(i))
                .map(|set| set.cookie_file().to_path_buf());

            match credential {
                Some(index) => info!(identifier, credential = index, "Trying credential set"),
                None => info!(identifier, "Trying anonymous access"),
            }

            for &variant in client_plan(credential.is_some()) {
                self.transition(identifier, AttemptState::Trying { credential, variant });

                let before = snapshot(&self.output_dir, ARTIFACT_EXTENSION);
                let request = FetchRequest {
                    identifier: identifier.to_string(),
                    credential_file: credential_file.clone(),
                    client_variant: variant,
                    format_preference: DEFAULT_FORMAT.to_string(),
                    output_dir: self.output_dir.clone(),
                    po_token: self.po_token.clone(),
                };

                match self.fetcher.fetch(&request).await {
                    Ok(()) => {
                        let artifact =
                            newest_artifact(&before, &self.output_dir, ARTIFACT_EXTENSION);
                        if let Some(index) = credential {
                            self.pool.mark_good(index);
                        }
                        self.last_attempts.push(AttemptRecord {
                            credential,
                            variant,
                            outcome: AttemptState::Success,
                            signal: None,
                            error: None,
                        });
                        self.transition(identifier, AttemptState::Success);
                        info!(
                            identifier,
                            credential = ?credential,
                            client = %variant,
                            artifact = ?artifact,
                            "Fetch succeeded"
                        );
                        return AttemptOutcome {
                            ok: true,
                            error: None,
                            artifact,
                        };
                    }
                    Err(e) => {
                        let signal = self.catalogue.classify(&e.message);
                        let next = match decide(signal, credential.is_some()) {
                            RotationDecision::NextVariant => AttemptState::SoftRetry,
                            RotationDecision::NextCredential => AttemptState::Rotate,
                        };
                        self.last_attempts.push(AttemptRecord {
                            credential,
                            variant,
                            outcome: next,
                            signal: Some(signal),
                            error: Some(e.message.clone()),
                        });
                        if !e.message.trim().is_empty() {
                            last_error = Some(e.message);
                        }
                        self.transition(identifier, next);

                        if next == AttemptState::Rotate {
                            warn!(
                                identifier,
                                credential = ?credential,
                                client = %variant,
                                "Credential set blocked, rotating"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.transition(identifier, AttemptState::Abandoned);
        let error = last_error.unwrap_or_else(|| EXHAUSTED_MESSAGE.to_string());
        warn!(identifier, tries = self.last_attempts.len(), "Giving up: {}", error);

        AttemptOutcome {
            ok: false,
            error: Some(error),
            artifact: None,
        }
    }

    fn transition(&mut self, identifier: &str, next: AttemptState) {
        debug!(identifier, from = ?self.state, to = ?next, "Attempt state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies from a script; runs out into success
    struct ScriptedFetcher {
        replies: Mutex<VecDeque<Result<(), FetchError>>>,
        seen: Mutex<Vec<FetchRequest>>,
    }

    impl ScriptedFetcher {
        fn new(replies: Vec<Result<(), &str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map_err(FetchError::new))
                        .collect(),
                ),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MediaFetcher for ScriptedFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
            self.seen.lock().unwrap().push(request.clone());
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Ok(()));
            if reply.is_ok() {
                std::fs::write(request.output_dir.join("Track.m4a"), b"audio").unwrap();
            }
            reply
        }
    }

    fn pool_of(n: usize) -> CredentialPool {
        let record = ".youtube.com\tTRUE\t/\tTRUE\t1999999999\tSAPISID\tv\n";
        let source = vec![record; n].join("=====\n");
        CredentialPool::load(&source).unwrap()
    }

    #[tokio::test]
    async fn test_anonymous_success_first_try() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FetchEngine::new(
            ScriptedFetcher::new(vec![Ok(())]),
            CredentialPool::empty(),
            dir.path().to_path_buf(),
        );

        let outcome = engine.attempt("id").await;
        assert!(outcome.ok);
        assert_eq!(outcome.artifact, Some(dir.path().join("Track.m4a")));
        assert_eq!(engine.state(), AttemptState::Success);

        let seen = engine.fetcher().seen.lock().unwrap();
        assert_eq!(seen[0].client_variant, ClientVariant::Android);
        assert!(seen[0].credential_file.is_none());
    }

    #[tokio::test]
    async fn test_soft_format_moves_to_next_variant() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FetchEngine::new(
            ScriptedFetcher::new(vec![Err("ERROR: Requested format is not available"), Ok(())]),
            pool_of(2),
            dir.path().to_path_buf(),
        );

        let outcome = engine.attempt("id").await;
        assert!(outcome.ok);

        let records = engine.last_attempts();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, AttemptState::SoftRetry);
        assert_eq!(records[0].signal, Some(FailureSignal::SoftFormat));
        assert_eq!(
            (records[1].credential, records[1].variant),
            (Some(0), ClientVariant::WebEmbedded)
        );
        assert_eq!(engine.pool().sticky_index(), Some(0));
    }

    #[tokio::test]
    async fn test_block_rotates_credential_and_sticks() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FetchEngine::new(
            ScriptedFetcher::new(vec![Err("ERROR: HTTP Error 429: Too Many Requests"), Ok(())]),
            pool_of(3),
            dir.path().to_path_buf(),
        );

        assert!(engine.attempt("id").await.ok);

        let records = engine.last_attempts();
        assert_eq!(records[0].outcome, AttemptState::Rotate);
        assert_eq!((records[1].credential, records[1].variant), (Some(1), ClientVariant::Web));
        assert_eq!(engine.pool().sticky_index(), Some(1));

        // Next attempt starts at the sticky set
        assert!(engine.attempt("id2").await.ok);
        assert_eq!(engine.last_attempts()[0].credential, Some(1));
    }

    #[tokio::test]
    async fn test_anonymous_block_moves_to_next_variant() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FetchEngine::new(
            ScriptedFetcher::new(vec![Err("HTTP Error 403: Forbidden"), Ok(())]),
            CredentialPool::empty(),
            dir.path().to_path_buf(),
        );

        assert!(engine.attempt("id").await.ok);
        let records = engine.last_attempts();
        assert_eq!(records[0].outcome, AttemptState::SoftRetry);
        assert_eq!(records[1].variant, ClientVariant::Web);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let replies = vec![
            Err("ERROR: Sign in to confirm you're not a bot"),
            Err("ERROR: Sign in to confirm you're not a bot"),
        ];
        let mut engine = FetchEngine::new(
            ScriptedFetcher::new(replies),
            pool_of(2),
            dir.path().to_path_buf(),
        );

        let outcome = engine.attempt("id").await;
        assert!(!outcome.ok);
        assert_eq!(outcome.artifact, None);
        assert_eq!(
            outcome.error.as_deref(),
            Some("ERROR: Sign in to confirm you're not a bot")
        );
        assert_eq!(engine.state(), AttemptState::Abandoned);
        assert_eq!(engine.last_attempts().len(), 2);
        assert_eq!(engine.pool().sticky_index(), None);
    }

    #[tokio::test]
    async fn test_po_token_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FetchEngine::new(
            ScriptedFetcher::new(vec![Ok(())]),
            pool_of(1),
            dir.path().to_path_buf(),
        )
        .with_po_token(Some("tok".to_string()));

        engine.attempt("id").await;
        let seen = engine.fetcher().seen.lock().unwrap();
        assert_eq!(seen[0].po_token.as_deref(), Some("tok"));
        assert!(seen[0].credential_file.is_some());
    }
}
