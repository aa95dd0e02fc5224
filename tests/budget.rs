//! Budget admission and alerting through a live session.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::ScriptedProvider;
use metered::{AlertEvent, ErrorKind, Session};

fn counter() -> (
    Arc<AtomicUsize>,
    impl Fn(&AlertEvent) -> anyhow::Result<()> + Send + Sync + 'static,
) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    (count, move |_event: &AlertEvent| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_cannot_both_claim_the_budget() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_estimate(0.07)
            .with_actual_costs([0.07])
            .with_latency(Duration::from_millis(50)),
    );
    let session = Session::new(provider.clone(), "small", Some(0.10));
    session.start().unwrap();

    let (first, second) = tokio::join!(session.chat("first"), session.chat("second"));

    let (ok, denied): (Vec<_>, Vec<_>) = [first, second].into_iter().partition(Result::is_ok);
    assert_eq!(ok.len(), 1);
    assert_eq!(denied.len(), 1);
    let err = denied.into_iter().next().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BudgetExceeded);

    // The refused request never reached the provider.
    assert_eq!(provider.calls(), 1);
    assert!((session.cost() - 0.07).abs() < 1e-12);
    assert_eq!(session.governor().open_reservations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_admissions_respect_the_ceiling() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_estimate(0.01)
            .with_actual_costs(std::iter::repeat_n(0.01, 20))
            .with_latency(Duration::from_millis(5)),
    );
    let session = Arc::new(Session::new(provider.clone(), "small", Some(0.105)));
    session.start().unwrap();

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let session = session.clone();
            tokio::spawn(async move { session.chat(format!("request {i}")).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(err) => assert_eq!(err.kind(), ErrorKind::BudgetExceeded),
        }
    }

    assert_eq!(admitted, 10);
    assert_eq!(provider.calls(), 10);
    assert!(session.cost() <= 0.105);
    assert_eq!(session.governor().open_reservations(), 0);
}

#[tokio::test]
async fn test_alerts_fire_once_per_threshold() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_estimate(0.01)
            .with_actual_costs([0.6, 0.25, 0.0]),
    );
    let (half, on_half) = counter();
    let (most, on_most) = counter();
    let session = Session::builder(provider, "small")
        .budget(Some(1.0))
        .alert(0.5, on_half)
        .alert(0.8, on_most)
        .build()
        .unwrap();
    session.start().unwrap();

    session.chat("one").await.unwrap();
    assert!((session.usage_ratio() - 0.6).abs() < 1e-12);
    assert_eq!(half.load(Ordering::SeqCst), 1);
    assert_eq!(most.load(Ordering::SeqCst), 0);

    session.chat("two").await.unwrap();
    assert!((session.usage_ratio() - 0.85).abs() < 1e-12);
    assert_eq!(half.load(Ordering::SeqCst), 1);
    assert_eq!(most.load(Ordering::SeqCst), 1);

    session.chat("three").await.unwrap();
    assert_eq!(half.load(Ordering::SeqCst), 1);
    assert_eq!(most.load(Ordering::SeqCst), 1);
    assert_eq!(session.alerts().triggered(), vec![0.5, 0.8]);
}

#[tokio::test]
async fn test_failing_alert_callback_does_not_fail_the_request() {
    let provider = Arc::new(ScriptedProvider::new().with_actual_costs([0.9]));
    let session = Session::builder(provider, "small")
        .budget(Some(1.0))
        .alert(0.5, |_event: &AlertEvent| anyhow::bail!("pager offline"))
        .build()
        .unwrap();
    session.start().unwrap();

    let response = session.chat("hello").await.unwrap();
    assert!((response.cost - 0.9).abs() < 1e-12);
    assert_eq!(session.alerts().triggered(), vec![0.5]);
}

#[tokio::test]
async fn test_overshoot_blocks_further_admissions() {
    // Estimates undershoot: the first call settles above the ceiling.
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_estimate(0.01)
            .with_actual_costs([0.2]),
    );
    let session = Session::new(provider.clone(), "small", Some(0.1));
    session.start().unwrap();

    session.chat("expensive").await.unwrap();
    assert!(session.governor().is_over_budget());
    assert!((session.cost() - 0.2).abs() < 1e-12);

    let err = session.chat("next").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BudgetExceeded);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_unlimited_session_admits_everything() {
    let provider = Arc::new(ScriptedProvider::new().with_estimate(1_000.0));
    let session = Session::new(provider.clone(), "small", None);
    session.start().unwrap();

    for i in 0..3 {
        session.chat(format!("prompt {i}")).await.unwrap();
    }
    assert_eq!(provider.calls(), 3);
    assert_eq!(session.budget_remaining(), None);
    assert_eq!(session.usage_ratio(), 0.0);
}

#[tokio::test]
async fn test_unlimited_session_never_alerts() {
    let provider = Arc::new(ScriptedProvider::new());
    let (fired, callback) = counter();
    let session = Session::builder(provider, "small")
        .alert(0.0, callback)
        .build()
        .unwrap();
    session.start().unwrap();

    session.chat("one").await.unwrap();
    session.chat("two").await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(session.alerts().triggered().is_empty());
}
