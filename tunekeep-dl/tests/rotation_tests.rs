//! Credential rotation and stickiness through the fetch engine

mod helpers;

use helpers::{pool_of, RuleFetcher};
use tempfile::TempDir;
use tunekeep_dl::attempt::EXHAUSTED_MESSAGE;
use tunekeep_dl::{AttemptState, ClientVariant, FailureSignal, FetchEngine};

const ID: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

/// Only credential set `good` can fetch; every other set is blocked
fn only_set(good: usize) -> RuleFetcher {
    RuleFetcher::new(move |_, credential| {
        if credential == Some(good) {
            Ok(())
        } else {
            Err("ERROR: HTTP Error 403: Forbidden".to_string())
        }
    })
}

#[tokio::test]
async fn test_sticky_set_tried_first_then_wraps() {
    let temp = TempDir::new().unwrap();
    let n = 5;
    let k = 3;

    let fetcher = only_set(k);
    let mut pool = pool_of(n);
    pool.mark_good(k - 1);
    assert_eq!(pool.order_for_attempt()[1], Some(k));

    let mut engine = FetchEngine::new(fetcher.clone(), pool, temp.path().to_path_buf());
    assert!(engine.attempt(ID).await.ok);

    // Sticky set k-1 blocked, set k second
    let tried: Vec<_> = fetcher.calls().iter().map(|(c, _)| *c).collect();
    assert_eq!(tried, vec![Some(k - 1), Some(k)]);
    assert_eq!(engine.pool().sticky_index(), Some(k));

    // The next attempt starts with k
    fetcher.clear_calls();
    assert!(engine.attempt(ID).await.ok);
    assert_eq!(fetcher.calls(), vec![(Some(k), ClientVariant::Web)]);
}

#[tokio::test]
async fn test_block_skips_remaining_variants() {
    let temp = TempDir::new().unwrap();
    let fetcher = only_set(99);
    let mut engine = FetchEngine::new(fetcher.clone(), pool_of(3), temp.path().to_path_buf());

    let outcome = engine.attempt(ID).await;
    assert!(!outcome.ok);

    // One try per credential set, never a second variant
    assert_eq!(
        fetcher.calls(),
        vec![
            (Some(0), ClientVariant::Web),
            (Some(1), ClientVariant::Web),
            (Some(2), ClientVariant::Web),
        ]
    );
    assert!(engine
        .last_attempts()
        .iter()
        .all(|r| r.outcome == AttemptState::Rotate && r.signal == Some(FailureSignal::Block)));
    assert_eq!(engine.state(), AttemptState::Abandoned);
}

#[tokio::test]
async fn test_soft_format_exhausts_variants_before_rotating() {
    let temp = TempDir::new().unwrap();
    let fetcher = RuleFetcher::new(|_, credential| match credential {
        Some(0) => Err("ERROR: Only images are available for download".to_string()),
        _ => Ok(()),
    });
    let mut engine = FetchEngine::new(fetcher.clone(), pool_of(2), temp.path().to_path_buf());

    assert!(engine.attempt(ID).await.ok);
    assert_eq!(
        fetcher.calls(),
        vec![
            (Some(0), ClientVariant::Web),
            (Some(0), ClientVariant::WebEmbedded),
            (Some(0), ClientVariant::Android),
            (Some(1), ClientVariant::Web),
        ]
    );
    assert_eq!(engine.pool().sticky_index(), Some(1));
}

#[tokio::test]
async fn test_other_error_tries_every_variant_before_rotating() {
    let temp = TempDir::new().unwrap();
    let fetcher = RuleFetcher::new(|_, credential| match credential {
        Some(0) => Err("ERROR: Unable to extract title".to_string()),
        _ => Ok(()),
    });
    let mut engine = FetchEngine::new(fetcher.clone(), pool_of(2), temp.path().to_path_buf());

    assert!(engine.attempt(ID).await.ok);
    assert_eq!(
        fetcher.calls(),
        vec![
            (Some(0), ClientVariant::Web),
            (Some(0), ClientVariant::WebEmbedded),
            (Some(0), ClientVariant::Android),
            (Some(1), ClientVariant::Web),
        ]
    );
    assert!(engine.last_attempts()[..3]
        .iter()
        .all(|r| r.signal == Some(FailureSignal::Other)));
    assert_eq!(engine.pool().sticky_index(), Some(1));
}

#[tokio::test]
async fn test_anonymous_plan_order_and_exhaustion() {
    let temp = TempDir::new().unwrap();
    let fetcher = RuleFetcher::new(|_, _| Err(String::new()));
    let mut engine = FetchEngine::new(fetcher.clone(), pool_of(0), temp.path().to_path_buf());

    let outcome = engine.attempt(ID).await;
    assert!(!outcome.ok);
    assert_eq!(
        fetcher.calls(),
        vec![
            (None, ClientVariant::Android),
            (None, ClientVariant::Web),
            (None, ClientVariant::WebEmbedded),
        ]
    );
    // No usable message from any try
    assert_eq!(outcome.error.as_deref(), Some(EXHAUSTED_MESSAGE));
}

#[tokio::test]
async fn test_failure_leaves_stickiness_unchanged() {
    let temp = TempDir::new().unwrap();
    let mut pool = pool_of(3);
    pool.mark_good(2);

    let mut engine = FetchEngine::new(only_set(99), pool, temp.path().to_path_buf());
    assert!(!engine.attempt(ID).await.ok);
    assert_eq!(engine.pool().sticky_index(), Some(2));
}
