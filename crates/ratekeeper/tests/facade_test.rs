//! Tests for the convenience constructors of the facade crate.

use async_trait::async_trait;
use ratekeeper::{
    FileFormat, LlmRequest, ProviderError, RatekeeperConfig, RequestExecutor, builder_from_config,
    limiter_from_config,
};
use serde_json::{Value, json};
use std::time::Duration;

struct EchoExecutor;

#[async_trait]
impl RequestExecutor for EchoExecutor {
    async fn execute(&self, target: &str, _request: &LlmRequest) -> Result<Value, ProviderError> {
        Ok(json!({
            "model": target,
            "usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}
        }))
    }
}

const CONFIG: &str = r#"
system:
  rate_limiting:
    enabled: true
    acquire_timeout_seconds: 5
providers:
  openai:
    rate_limits:
      default: { rpm: 60, tpm: 90000 }
      gpt-4: { rpm: 2, tpm_quota: 1000 }
    backoff:
      strategy: exponential
      base_delay: 1.0
      max_delay: 8.0
      jitter: false
"#;

fn config() -> RatekeeperConfig {
    RatekeeperConfig::parse(CONFIG, FileFormat::Yaml).unwrap()
}

#[test]
fn test_every_builtin_provider_has_an_adapter() {
    let limiter = limiter_from_config(RatekeeperConfig::default()).unwrap();
    assert!(!limiter.is_enabled());
    for provider in ["openai", "azure", "huggingface", "rest"] {
        assert!(limiter.limits(provider).is_ok(), "{}", provider);
    }
    assert!(limiter.limits("anthropic-direct").is_err());
}

#[tokio::test]
async fn test_execute_through_default_adapters() {
    let limiter = limiter_from_config(config()).unwrap();
    let request = LlmRequest::new("openai", "gpt-4", "What is a sliding window?");

    let outcome = limiter.execute(&request, &EchoExecutor).await.unwrap();
    assert_eq!(outcome.target(), "gpt-4");
    assert_eq!(*outcome.tokens(), 42);

    let status = limiter.quota_status("openai", "gpt-4").unwrap();
    assert_eq!(*status.cumulative_tokens(), 42);
    assert_eq!(*status.limit(), Some(1000));
}

#[tokio::test]
async fn test_configured_rpm_applies_through_facade() {
    let limiter = limiter_from_config(config()).unwrap();
    let zero = Some(Duration::ZERO);

    for _ in 0..2 {
        let permit = limiter.acquire("openai", "gpt-4", 10, zero).await.unwrap();
        limiter.record_usage(permit, 10).unwrap();
    }
    let err = limiter.acquire("openai", "gpt-4", 10, zero).await.unwrap_err();
    assert!(err.is_rate_limited());

    assert_eq!(
        limiter.get_backoff_delay("openai", 2, None).unwrap(),
        Duration::from_secs(4)
    );
}

#[tokio::test]
async fn test_builder_from_config_persists_to_sink_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quota.json");
    let limiter = builder_from_config(config())
        .sink(std::sync::Arc::new(ratekeeper::JsonFileSink::new(&path)))
        .build()
        .unwrap();

    let permit = limiter.acquire("openai", "gpt-4", 10, None).await.unwrap();
    limiter.record_usage(permit, 300).unwrap();
    assert_eq!(limiter.shutdown().await.unwrap(), 1);

    let restored = builder_from_config(config())
        .sink(std::sync::Arc::new(ratekeeper::JsonFileSink::new(&path)))
        .build()
        .unwrap();
    assert_eq!(
        *restored.quota_status("openai", "gpt-4").unwrap().cumulative_tokens(),
        300
    );
}
