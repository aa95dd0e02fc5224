//! Addon pipeline behaviour through a live session: retry, cache,
//! validation and prompt rewriting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::ScriptedProvider;
use metered::addons::validator::ValidationMode;
use metered::addons::whitespace::MinimizeOptions;
use metered::addons::{
    CacheAddon, MetricsAddon, ResponseValidatorAddon, RetryAddon, WhitespaceMinimizerAddon,
};
use metered::{ChatParams, ErrorKind, ProviderError, ResponseCache, RetryPolicy, Session};

fn started(provider: Arc<ScriptedProvider>, budget: Option<f64>) -> Session {
    let session = Session::new(provider, "small", budget);
    session.start().unwrap();
    session
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_retry_gives_up_after_max_retries() {
    let provider =
        Arc::new(ScriptedProvider::new().failing(ProviderError::Timeout("upstream".into())));
    let retry = Arc::new(RetryAddon::new(RetryPolicy::new().with_max_retries(3)));
    let session = started(provider.clone(), Some(1.0));
    session.add_addon(retry.clone());

    let err = session.chat("hello").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // One initial call plus three retries.
    assert_eq!(provider.calls(), 4);
    let gaps = provider.gaps();
    assert_eq!(gaps.len(), 3);
    assert!(gaps.windows(2).all(|w| w[0] <= w[1]), "{gaps:?}");
    assert!(gaps[0] >= Duration::from_millis(500));
    assert!(gaps.iter().all(|gap| *gap <= Duration::from_secs(60)));

    let stats = retry.stats();
    assert_eq!(stats.total_retries, 3);
    assert_eq!(stats.exhausted, 1);

    // Failed attempts hold nothing and cost nothing.
    assert_eq!(session.cost(), 0.0);
    assert_eq!(session.governor().open_reservations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_beyond_default_attempt_floor() {
    let provider =
        Arc::new(ScriptedProvider::new().failing(ProviderError::Timeout("upstream".into())));
    let policy = RetryPolicy::new()
        .with_max_retries(12)
        .with_initial_delay(Duration::ZERO)
        .with_jitter(false);
    let retry = Arc::new(RetryAddon::new(policy));
    let session = started(provider.clone(), None);
    session.add_addon(retry.clone());
    assert_eq!(session.attempt_limit(), 13);

    let err = session.chat("hello").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(provider.calls(), 13);
    assert_eq!(retry.stats().total_retries, 12);
    assert_eq!(retry.stats().exhausted, 1);
}

#[test]
fn test_attempt_cap_below_retry_budget_is_rejected() {
    let provider = Arc::new(ScriptedProvider::new());
    let retry = || Arc::new(RetryAddon::new(RetryPolicy::new().with_max_retries(12)));

    let err = Session::builder(provider.clone(), "small")
        .addon(retry())
        .max_attempts(10)
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let session = Session::builder(provider, "small")
        .addon(retry())
        .max_attempts(13)
        .build()
        .unwrap();
    assert_eq!(session.attempt_limit(), 13);
}

#[tokio::test(start_paused = true)]
async fn test_retry_honours_retry_after() {
    let provider = Arc::new(ScriptedProvider::new().failing_first(
        2,
        ProviderError::RateLimited {
            retry_after: Some(Duration::from_millis(250)),
        },
    ));
    let retry = Arc::new(RetryAddon::new(RetryPolicy::new()));
    let session = started(provider.clone(), None);
    session.add_addon(retry.clone());

    let response = session.chat("hello").await.unwrap();
    assert_eq!(response.content, "ok");
    assert_eq!(provider.calls(), 3);
    for gap in provider.gaps() {
        assert!(gap >= Duration::from_millis(250));
        assert!(gap < Duration::from_millis(260));
    }
    assert_eq!(retry.stats().successful_retries, 1);
    assert_eq!(session.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failures_are_not_retried() {
    let provider =
        Arc::new(ScriptedProvider::new().failing(ProviderError::ModelNotFound("small".into())));
    let session = started(provider.clone(), None);
    session.add_addon(Arc::new(RetryAddon::new(RetryPolicy::new())));

    let err = session.chat("hello").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModelNotFound);
    assert_eq!(provider.calls(), 1);
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_identical_requests_hit_the_provider_once() {
    let provider = Arc::new(ScriptedProvider::new().with_content("cached answer"));
    let cache = Arc::new(CacheAddon::new(10, None));
    let session = started(provider.clone(), Some(1.0));
    session.add_addon(cache.clone());

    let first = session.chat("What is 2+2?").await.unwrap();
    let second = session.chat("What is 2+2?").await.unwrap();

    assert_eq!(provider.calls(), 1);
    assert!(!first.is_intercepted());
    assert!(second.is_intercepted());
    assert_eq!(second.content, "cached answer");
    assert_eq!(second.cost, 0.0);
    assert_eq!(session.cost(), first.cost);
    assert_eq!(session.records().len(), 1);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_cache_ahead_of_prompt_rewriting_still_hits() {
    let provider = Arc::new(ScriptedProvider::new());
    let cache = Arc::new(CacheAddon::new(10, None));
    let session = started(provider.clone(), None);
    session.add_addon(cache.clone());
    session.add_addon(Arc::new(WhitespaceMinimizerAddon::default()));

    let first = session.chat("hello    world").await.unwrap();
    let second = session.chat("hello    world").await.unwrap();

    assert!(!first.is_intercepted());
    assert!(second.is_intercepted());
    assert_eq!(provider.calls(), 1);
    assert_eq!(provider.prompts(), ["hello world"]);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.size, 1);
}

#[tokio::test]
async fn test_different_parameters_miss_the_cache() {
    let provider = Arc::new(ScriptedProvider::new());
    let session = started(provider.clone(), None);
    session.add_addon(Arc::new(CacheAddon::new(10, None)));

    session.chat("same prompt").await.unwrap();
    session
        .chat_with("same prompt", ChatParams::default().with_temperature(0.2))
        .await
        .unwrap();
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_shared_store_stays_bounded() {
    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(ResponseCache::new(2, None));
    let first = started(provider.clone(), None);
    let second = started(provider.clone(), None);
    first.add_addon(Arc::new(CacheAddon::shared(store.clone())));
    second.add_addon(Arc::new(CacheAddon::shared(store.clone())));

    for i in 0..5 {
        first.chat(format!("prompt {i}")).await.unwrap();
    }
    assert_eq!(store.len(), 2);
    assert_eq!(store.stats().evictions, 3);

    // The most recent entry is visible to the other session.
    let hit = second.chat("prompt 4").await.unwrap();
    assert!(hit.is_intercepted());
    assert_eq!(provider.calls(), 5);
}

// ---------------------------------------------------------------------------
// Validation and rewriting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rejected_responses_are_not_cached() {
    let provider = Arc::new(ScriptedProvider::new().with_content("   "));
    let session = started(provider.clone(), Some(1.0));
    session.add_addon(Arc::new(ResponseValidatorAddon::non_empty(
        ValidationMode::Strict,
    )));
    session.add_addon(Arc::new(CacheAddon::new(10, None)));

    for _ in 0..2 {
        let err = session.chat("say something").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }
    assert_eq!(provider.calls(), 2);
    // The provider was paid even though the response was rejected.
    assert_eq!(session.records().len(), 2);
    assert!(session.records().iter().all(|record| !record.success));
    let summary = session.summary();
    assert_eq!(summary.request_count, 2);
    assert_eq!(summary.successful_requests, 0);
    assert!(summary.total_cost > 0.0);
}

#[tokio::test]
async fn test_auto_retried_rejection_keeps_one_failed_record() {
    let provider = Arc::new(ScriptedProvider::new().with_content(""));
    let session = started(provider.clone(), None);
    session.add_addon(Arc::new(
        ResponseValidatorAddon::non_empty(ValidationMode::AutoRetry).with_max_retries(1),
    ));

    assert!(session.chat("say something").await.is_err());
    assert_eq!(provider.calls(), 2);
    let flags: Vec<_> = session.records().iter().map(|r| r.success).collect();
    assert_eq!(flags, [false, false]);
}

#[tokio::test]
async fn test_minimizer_rewrites_the_sent_prompt() {
    let provider = Arc::new(ScriptedProvider::new());
    let session = started(provider.clone(), None);
    session.add_addon(Arc::new(WhitespaceMinimizerAddon::new(
        MinimizeOptions::default(),
    )));

    let original = "hello      world\n\n\n\n\nbye   now";
    session.chat(original).await.unwrap();

    let sent = provider.prompts();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].len() < original.len());
    assert!(sent[0].starts_with("hello world"));
    assert!(sent[0].ends_with("bye now"));
}

#[tokio::test]
async fn test_metrics_see_cached_and_failed_requests() {
    let provider = Arc::new(ScriptedProvider::new().failing_first(
        1,
        ProviderError::ModelNotFound("small".into()),
    ));
    let metrics = Arc::new(MetricsAddon::new());
    let session = started(provider, None);
    session.add_addon(Arc::new(CacheAddon::new(10, None)));
    session.add_addon(metrics.clone());

    assert!(session.chat("a").await.is_err());
    session.chat("a").await.unwrap();
    session.chat("a").await.unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.errors_seen, 1);
    assert_eq!(snapshot.responses, 2);
    assert_eq!(snapshot.from_provider, 1);
    assert_eq!(snapshot.intercepted, 1);
}
