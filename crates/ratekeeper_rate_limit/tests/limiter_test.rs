//! End-to-end tests for the unified rate limiter and its retry/fallback
//! state machine.

use async_trait::async_trait;
use parking_lot::Mutex;
use ratekeeper_core::{
    Clock, ErrorClass, LimitKey, LimitType, LlmRequest, ManualClock, RateLimitConfig,
    RequestExecutor,
};
use ratekeeper_error::{
    ProviderError, RateLimitErrorKind, RatekeeperErrorKind, RatekeeperResult, StateError,
};
use ratekeeper_providers::{AzureAdapter, FallbackHeuristic, TokenEstimator};
use ratekeeper_rate_limit::{
    BackendGuard, DeploymentConfig, DeploymentMapper, FibonacciBackoff, FileFormat,
    InMemoryBackend, InMemorySink, ParallelCoordinator, PersistenceSink, ProviderLimits,
    QuotaLimit, RatekeeperConfig, StateBackend, UnifiedRateLimiter,
};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Default)]
struct ScriptedExecutor {
    script: Mutex<HashMap<String, VecDeque<Result<Value, ProviderError>>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn then(self, target: &str, result: Result<Value, ProviderError>) -> Self {
        self.script
            .lock()
            .entry(target.to_string())
            .or_default()
            .push_back(result);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RequestExecutor for ScriptedExecutor {
    async fn execute(&self, target: &str, _request: &LlmRequest) -> Result<Value, ProviderError> {
        self.calls.lock().push(target.to_string());
        self.script
            .lock()
            .get_mut(target)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(usage(40, 60)))
    }
}

fn usage(prompt: u64, completion: u64) -> Value {
    json!({
        "choices": [{"message": {"content": "ok"}}],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        }
    })
}

fn throttled(retry_after: &str) -> Result<Value, ProviderError> {
    Err(ProviderError::new("Too many requests")
        .with_status(429)
        .with_header("retry-after", retry_after))
}

fn unavailable() -> Result<Value, ProviderError> {
    Err(ProviderError::new("Service unavailable").with_status(503))
}

fn out_of_quota() -> Result<Value, ProviderError> {
    Err(ProviderError::new("InsufficientQuota: monthly token quota exceeded").with_status(403))
}

fn azure_limits() -> ProviderLimits {
    ProviderLimits::default()
        .with_limits(
            "default",
            vec![
                RateLimitConfig::new(LimitType::Rpm, 100.0).unwrap(),
                RateLimitConfig::new(LimitType::Tpm, 100_000.0).unwrap(),
                RateLimitConfig::new(LimitType::Concurrent, 1.0).unwrap(),
            ],
        )
        .with_quota("a", QuotaLimit::new(10_000))
        .with_quota("b", QuotaLimit::new(10_000))
        .with_quota("c", QuotaLimit::new(10_000))
        .with_quota("solo", QuotaLimit::new(1_000))
        .with_deployments(
            DeploymentMapper::new(vec![
                DeploymentConfig::new("a").with_model_name("gpt-4").with_fallback("b"),
                DeploymentConfig::new("b").with_model_name("gpt-4").with_fallback("c"),
                DeploymentConfig::new("c").with_model_name("gpt-4"),
            ])
            .unwrap(),
        )
        .with_backoff(Arc::new(FibonacciBackoff::default().with_max_retries(3)))
}

fn adapter() -> Arc<AzureAdapter> {
    Arc::new(AzureAdapter::with_estimator(TokenEstimator::heuristic_only(
        FallbackHeuristic::WordCount,
    )))
}

fn limiter(clock: &ManualClock) -> UnifiedRateLimiter {
    UnifiedRateLimiter::builder()
        .enabled(true)
        .provider("azure", azure_limits())
        .adapter(adapter())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap()
}

fn request(target: &str) -> LlmRequest {
    LlmRequest::new("azure", target, "summarise the quarterly report").with_max_completion_tokens(50)
}

#[tokio::test]
async fn test_preflight_quota_rejection_never_calls_executor() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);
    limiter.quotas().track_usage("azure", "solo", 950).unwrap();

    let err = limiter.acquire("azure", "solo", 100, None).await.unwrap_err();
    assert!(err.is_quota_exhausted(), "{}", err);

    let executor = ScriptedExecutor::default();
    let err = limiter.execute(&request("solo"), &executor).await.unwrap_err();
    assert!(err.is_quota_exhausted(), "{}", err);
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_record_usage_reconciles_estimate() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);

    let permit = limiter.acquire("azure", "a", 500, None).await.unwrap();
    assert!(permit.is_tracked());
    let snapshot = limiter.record_usage(permit, 200).unwrap().unwrap();
    assert_eq!(*snapshot.cumulative_tokens(), 200);

    let tpm = RateLimitConfig::new(LimitType::Tpm, 100_000.0).unwrap();
    let used = limiter
        .windows()
        .current_usage(&LimitKey::new("azure", "a", LimitType::Tpm), &tpm)
        .unwrap();
    assert_eq!(used, 200);
}

#[tokio::test]
async fn test_execute_success_charges_reported_usage() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);
    let executor = ScriptedExecutor::default().then("solo", Ok(usage(30, 90)));

    let outcome = limiter.execute(&request("solo"), &executor).await.unwrap();
    assert_eq!(outcome.target(), "solo");
    assert_eq!(*outcome.tokens(), 120);
    assert_eq!(*outcome.attempts(), 1);
    assert_eq!(*outcome.fallbacks(), 0);
    assert_eq!(outcome.usage().unwrap().total_tokens(), &120);
    assert_eq!(limiter.quota_status("azure", "solo").unwrap().percentage(), &12.0);
}

#[tokio::test]
async fn test_throttle_waits_for_retry_after_then_succeeds() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);
    let executor = ScriptedExecutor::default().then("a", throttled("7"));

    let start = clock.now();
    let outcome = limiter.execute(&request("a"), &executor).await.unwrap();
    assert_eq!(*outcome.attempts(), 2);
    assert_eq!(outcome.target(), "a");
    assert_eq!(clock.now() - start, chrono::Duration::seconds(7));
}

#[tokio::test]
async fn test_transient_failures_exhaust_backoff() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);
    let mut executor = ScriptedExecutor::default();
    for _ in 0..10 {
        executor = executor.then("a", unavailable());
    }

    let err = limiter.execute(&request("a"), &executor).await.unwrap_err();
    match err.as_rate_limit().map(|e| e.kind()) {
        Some(RateLimitErrorKind::BackoffExhausted { attempts, .. }) => assert_eq!(*attempts, 4),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(executor.calls().len(), 4);
    assert!(err.is_limit_failure());
}

#[tokio::test]
async fn test_fatal_error_propagates_without_retry() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);
    let executor = ScriptedExecutor::default().then(
        "a",
        Err(ProviderError::new("Invalid API key").with_status(401)),
    );

    let err = limiter.execute(&request("a"), &executor).await.unwrap_err();
    match err.kind() {
        RatekeeperErrorKind::Provider(e) => assert_eq!(e.status, Some(401)),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(executor.calls(), vec!["a"]);
}

#[tokio::test]
async fn test_quota_exhaustion_falls_back_to_next_deployment() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);
    let executor = ScriptedExecutor::default().then("a", out_of_quota());

    let outcome = limiter.execute(&request("a"), &executor).await.unwrap();
    assert_eq!(outcome.target(), "b");
    assert_eq!(*outcome.fallbacks(), 1);
    assert_eq!(executor.calls(), vec!["a", "b"]);

    // The provider-reported exhaustion sticks for the period.
    assert!(*limiter.quota_status("azure", "a").unwrap().exhausted());
    let executor = ScriptedExecutor::default();
    let outcome = limiter.execute(&request("a"), &executor).await.unwrap();
    assert_eq!(outcome.target(), "b");
    assert_eq!(executor.calls(), vec!["b"]);
}

#[tokio::test]
async fn test_exhausted_chain_fails_with_quota_error() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);
    let executor = ScriptedExecutor::default()
        .then("a", out_of_quota())
        .then("b", out_of_quota())
        .then("c", out_of_quota());

    let err = limiter.execute(&request("a"), &executor).await.unwrap_err();
    assert!(err.is_quota_exhausted(), "{}", err);
    match err.as_rate_limit().map(|e| e.kind()) {
        Some(RateLimitErrorKind::QuotaExhausted { target, chain, .. }) => {
            assert_eq!(target, "a");
            assert_eq!(chain, &vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(executor.calls(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_dropped_permit_releases_concurrency_slot() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);

    let permit = limiter.acquire("azure", "c", 10, None).await.unwrap();
    drop(permit);
    let permit = limiter
        .acquire("azure", "c", 10, Some(Duration::ZERO))
        .await
        .unwrap();

    // Slot still held: a zero timeout refuses instead of waiting.
    let err = limiter
        .acquire("azure", "c", 10, Some(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(err.is_rate_limited());
    limiter
        .record_failure(permit, &ProviderError::new("timeout"))
        .unwrap();
    limiter
        .acquire("azure", "c", 10, Some(Duration::ZERO))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_record_failure_classifies_and_marks_quota() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);

    let permit = limiter.acquire("azure", "b", 10, None).await.unwrap();
    let class = limiter
        .record_failure(permit, &out_of_quota().unwrap_err())
        .unwrap();
    assert_eq!(class, ErrorClass::QuotaExhausted);
    assert!(limiter.acquire("azure", "b", 10, None).await.unwrap_err().is_quota_exhausted());
}

#[test]
fn test_backoff_delay_prefers_retry_after() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);

    assert_eq!(
        limiter.get_backoff_delay("azure", 6, None).unwrap(),
        Duration::from_secs(8)
    );
    let err = throttled("3").unwrap_err();
    assert_eq!(
        limiter.get_backoff_delay("azure", 6, Some(&err)).unwrap(),
        Duration::from_secs(3)
    );
    assert!(limiter.should_retry("azure", 0, &err).unwrap());
    assert!(!limiter.should_retry("azure", 3, &err).unwrap());
}

#[test]
fn test_unknown_provider_is_a_typed_error() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock);
    let err = limiter.acquire_blocking("nope", "x", 1, None).unwrap_err();
    assert!(matches!(
        err.as_rate_limit().map(|e| e.kind()),
        Some(RateLimitErrorKind::UnknownProvider(_))
    ));
}

#[test]
fn test_disabled_limiter_admits_everything() {
    let clock = ManualClock::default();
    let limiter = UnifiedRateLimiter::builder()
        .provider(
            "azure",
            ProviderLimits::default()
                .with_limits("default", vec![RateLimitConfig::new(LimitType::Rpm, 1.0).unwrap()]),
        )
        .adapter(adapter())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    assert!(!limiter.is_enabled());

    for _ in 0..5 {
        let permit = limiter.acquire_blocking("azure", "a", 10, None).unwrap();
        assert!(!permit.is_tracked());
        assert!(limiter.record_usage(permit, 10).unwrap().is_none());
    }
}

#[test]
fn test_blocking_acquire_from_threads() {
    let limiter = Arc::new(
        UnifiedRateLimiter::builder()
            .enabled(true)
            .provider(
                "azure",
                ProviderLimits::default().with_limits(
                    "default",
                    vec![
                        RateLimitConfig::new(LimitType::Rpm, 5.0)
                            .unwrap()
                            .with_window(Duration::from_millis(200)),
                    ],
                ),
            )
            .adapter(adapter())
            .build()
            .unwrap(),
    );

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            std::thread::spawn(move || {
                let permit = limiter.acquire_blocking("azure", "a", 10, None).unwrap();
                limiter.record_usage(permit, 10).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[tokio::test]
async fn test_shutdown_persists_and_new_limiter_restores() {
    let clock = ManualClock::default();
    let sink: Arc<dyn PersistenceSink> = Arc::new(InMemorySink::new());
    let build = || {
        UnifiedRateLimiter::builder()
            .enabled(true)
            .provider("azure", azure_limits())
            .adapter(adapter())
            .clock(Arc::new(clock.clone()))
            .sink(Arc::clone(&sink))
            .build()
            .unwrap()
    };

    let first = build();
    let permit = first.acquire("azure", "solo", 10, None).await.unwrap();
    first.record_usage(permit, 250).unwrap();
    assert_eq!(first.shutdown().await.unwrap(), 1);

    let second = build();
    assert_eq!(*second.quota_status("azure", "solo").unwrap().cumulative_tokens(), 250);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_persistence_task() {
    let sink = Arc::new(InMemorySink::new());
    let limiter = UnifiedRateLimiter::builder()
        .enabled(true)
        .provider("azure", azure_limits())
        .adapter(adapter())
        .sink(sink.clone())
        .persist_interval(Duration::from_secs(30))
        .build()
        .unwrap();

    assert!(limiter.start_persistence());
    assert!(!limiter.start_persistence());

    let permit = limiter.acquire("azure", "solo", 10, None).await.unwrap();
    limiter.record_usage(permit, 100).unwrap();
    assert!(sink.load_all().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(sink.load_all().unwrap().len(), 1);

    limiter.shutdown().await.unwrap();
}

#[test]
fn test_limiters_sharing_state_dir_share_limits() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
system:
  rate_limiting:
    enabled: true
    state_dir: {}
providers:
  azure:
    rate_limits:
      default: {{ rpm: 2 }}
"#,
        dir.path().join("shared").display()
    );
    let config = RatekeeperConfig::parse(&yaml, FileFormat::Yaml).unwrap();
    let clock = ManualClock::default();
    let build = || {
        UnifiedRateLimiter::builder()
            .config(config.clone())
            .adapter(adapter())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap()
    };
    let worker_a = build();
    let worker_b = build();

    let zero = Some(Duration::ZERO);
    let p1 = worker_a.acquire_blocking("azure", "gpt-4", 1, zero).unwrap();
    let p2 = worker_b.acquire_blocking("azure", "gpt-4", 1, zero).unwrap();
    assert!(worker_a.acquire_blocking("azure", "gpt-4", 1, zero).unwrap_err().is_rate_limited());
    worker_a.record_usage(p1, 1).unwrap();
    worker_b.record_usage(p2, 1).unwrap();
}

/// Backend whose writes to token-window keys can be made to fail.
#[derive(Debug, Default)]
struct FailingTokenWrites {
    inner: InMemoryBackend,
    failing: AtomicBool,
}

impl StateBackend for FailingTokenWrites {
    fn lock(&self, key: &str) -> RatekeeperResult<BackendGuard> {
        self.inner.lock(key)
    }

    fn load(&self, key: &str) -> RatekeeperResult<Option<Value>> {
        self.inner.load(key)
    }

    fn store(&self, key: &str, value: &Value) -> RatekeeperResult<()> {
        if self.failing.load(Ordering::SeqCst) && key.ends_with("/TPM") {
            return Err(StateError::io(key, "disk full").into());
        }
        self.inner.store(key, value)
    }
}

#[tokio::test]
async fn test_failed_usage_write_still_frees_concurrency_slot() {
    let clock = ManualClock::default();
    let backend = Arc::new(FailingTokenWrites::default());
    let limiter = UnifiedRateLimiter::builder()
        .enabled(true)
        .provider("azure", azure_limits())
        .adapter(adapter())
        .clock(Arc::new(clock.clone()))
        .coordinator(ParallelCoordinator::new(backend.clone()))
        .build()
        .unwrap();

    let permit = limiter.acquire("azure", "solo", 10, None).await.unwrap();
    backend.failing.store(true, Ordering::SeqCst);
    assert!(limiter.record_usage(permit, 12).is_err());
    backend.failing.store(false, Ordering::SeqCst);

    let concurrent = RateLimitConfig::new(LimitType::Concurrent, 1.0).unwrap();
    let in_flight = limiter
        .windows()
        .current_usage(&LimitKey::new("azure", "solo", LimitType::Concurrent), &concurrent)
        .unwrap();
    assert_eq!(in_flight, 0);
    assert_eq!(*limiter.quota_status("azure", "solo").unwrap().cumulative_tokens(), 12);

    limiter
        .acquire("azure", "solo", 10, Some(Duration::ZERO))
        .await
        .unwrap();
}
