//! Tests for the operator-facing log events: quota threshold alerts and
//! retry backoff.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ratekeeper_core::{LimitType, LlmRequest, ManualClock, RateLimitConfig, RequestExecutor};
use ratekeeper_error::ProviderError;
use ratekeeper_providers::{AzureAdapter, FallbackHeuristic, TokenEstimator};
use ratekeeper_rate_limit::{
    ParallelCoordinator, ProviderLimits, QuotaLimit, QuotaTracker, UnifiedRateLimiter,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{Layer, Registry};

#[derive(Debug, Clone)]
struct Captured {
    level: Level,
    fields: HashMap<String, String>,
}

impl Captured {
    fn message(&self) -> &str {
        self.fields.get("message").map(String::as_str).unwrap_or("")
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Default)]
struct FieldRecorder(HashMap<String, String>);

impl Visit for FieldRecorder {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{:?}", value));
    }
}

#[derive(Clone, Default)]
struct CaptureLayer {
    events: Arc<Mutex<Vec<Captured>>>,
}

impl CaptureLayer {
    fn events(&self) -> Vec<Captured> {
        self.events.lock().clone()
    }

    fn with_message(&self, message: &str) -> Vec<Captured> {
        self.events()
            .into_iter()
            .filter(|e| e.message().starts_with(message))
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut recorder = FieldRecorder::default();
        event.record(&mut recorder);
        self.events.lock().push(Captured {
            level: *event.metadata().level(),
            fields: recorder.0,
        });
    }
}

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn capture() -> (CaptureLayer, tracing::subscriber::DefaultGuard) {
    let layer = CaptureLayer::default();
    let guard = tracing::subscriber::set_default(Registry::default().with(layer.clone()));
    (layer, guard)
}

#[test]
fn test_each_quota_threshold_logs_once() {
    let (logs, _guard) = capture();
    let clock = ManualClock::new(at("2024-05-10T12:00:00Z"));
    let quotas = QuotaTracker::new(ParallelCoordinator::in_memory(), Arc::new(clock.clone()))
        .with_limit("azure", "gpt4-east", QuotaLimit::new(1000));

    quotas.track_usage("azure", "gpt4-east", 790).unwrap();
    assert!(logs.with_message("Quota").is_empty());

    // 79% -> 85% crosses 80 only.
    quotas.track_usage("azure", "gpt4-east", 60).unwrap();
    // 85% -> 96% crosses 90 and the blocking 95 in one step.
    quotas.track_usage("azure", "gpt4-east", 110).unwrap();
    // Already past every threshold.
    quotas.track_usage("azure", "gpt4-east", 20).unwrap();
    quotas.track_usage("azure", "gpt4-east", 20).unwrap();

    let alerts = logs.with_message("Quota alert threshold crossed");
    let thresholds: Vec<&str> = alerts.iter().filter_map(|e| e.field("threshold")).collect();
    assert_eq!(thresholds, vec!["80", "90"]);
    assert!(alerts.iter().all(|e| e.level == Level::WARN));
    assert_eq!(alerts[0].field("target"), Some("gpt4-east"));
    assert_eq!(alerts[0].field("percentage"), Some("85"));

    let blocking = logs.with_message("Quota blocking threshold reached");
    assert_eq!(blocking.len(), 1);
    assert_eq!(blocking[0].level, Level::ERROR);
    assert_eq!(blocking[0].field("threshold"), Some("95"));
    assert_eq!(blocking[0].field("provider"), Some("azure"));
}

#[test]
fn test_threshold_alerts_repeat_after_period_reset() {
    let (logs, _guard) = capture();
    let clock = ManualClock::new(at("2024-05-30T12:00:00Z"));
    let quotas = QuotaTracker::new(ParallelCoordinator::in_memory(), Arc::new(clock.clone()))
        .with_limit("azure", "gpt4-east", QuotaLimit::new(1000));

    quotas.track_usage("azure", "gpt4-east", 820).unwrap();
    clock.set(at("2024-06-01T00:00:01Z"));
    quotas.track_usage("azure", "gpt4-east", 820).unwrap();

    assert_eq!(logs.with_message("Quota alert threshold crossed").len(), 2);
}

struct ThrottledOnce {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl RequestExecutor for ThrottledOnce {
    async fn execute(&self, _target: &str, _request: &LlmRequest) -> Result<Value, ProviderError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ProviderError::new("Too many requests")
                .with_status(429)
                .with_header("retry-after", "7"));
        }
        Ok(json!({
            "choices": [{"message": {"content": "ok"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }))
    }
}

#[tokio::test]
async fn test_backoff_logs_delay_and_cause() {
    let (logs, _guard) = capture();
    let clock = ManualClock::default();
    let limiter = UnifiedRateLimiter::builder()
        .enabled(true)
        .provider(
            "azure",
            ProviderLimits::default().with_limits(
                "default",
                vec![RateLimitConfig::new(LimitType::Rpm, 100.0).unwrap()],
            ),
        )
        .adapter(Arc::new(AzureAdapter::with_estimator(
            TokenEstimator::heuristic_only(FallbackHeuristic::WordCount),
        )))
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let executor = ThrottledOnce {
        calls: AtomicUsize::new(0),
    };

    let request = LlmRequest::new("azure", "gpt4-east", "hello there");
    let outcome = limiter.execute(&request, &executor).await.unwrap();
    assert_eq!(*outcome.attempts(), 2);

    let backoffs = logs.with_message("Backing off before retry");
    assert_eq!(backoffs.len(), 1);
    let event = &backoffs[0];
    assert_eq!(event.level, Level::WARN);
    assert_eq!(event.field("delay_ms"), Some("7000"));
    assert_eq!(event.field("target"), Some("gpt4-east"));
    assert!(
        event.field("cause").is_some_and(|c| c.contains("Too many requests")),
        "{:?}",
        event
    );
}
