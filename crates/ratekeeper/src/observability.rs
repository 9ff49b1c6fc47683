//! Logging and tracing setup for applications embedding Ratekeeper.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter`, a text or
//! JSON `fmt` layer, and optionally an OpenTelemetry bridge exporting spans
//! to stdout. Every limiter decision (admission waits, backoff sleeps, quota
//! alerts) is then visible through the usual `RUST_LOG` controls.

use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use ratekeeper_error::{ConfigError, RatekeeperResult};
use std::env;
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Configuration for logging and OpenTelemetry export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// Service name for telemetry attribution
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Filter used when `RUST_LOG` is unset (e.g. "info", "ratekeeper=debug")
    pub log_level: String,
    /// Emit JSON log lines instead of text
    pub json_logs: bool,
    /// Export spans to stdout through OpenTelemetry
    pub otel_stdout: bool,
}

impl ObservabilityConfig {
    /// Create a configuration for `service_name`.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            json_logs: false,
            otel_stdout: true,
        }
    }

    /// Set the service version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    /// Set the fallback log filter.
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Enable JSON-formatted logs.
    pub fn with_json_logs(mut self, enabled: bool) -> Self {
        self.json_logs = enabled;
        self
    }

    /// Enable or disable the stdout span exporter.
    pub fn with_otel_stdout(mut self, enabled: bool) -> Self {
        self.otel_stdout = enabled;
        self
    }

    fn filter(&self) -> RatekeeperResult<EnvFilter> {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .map_err(|e| {
                ConfigError::new(format!("Invalid log filter '{}': {}", self.log_level, e)).into()
            })
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"))
    }
}

/// Initialise logging and tracing with the default configuration.
///
/// # Errors
///
/// Returns a configuration error if the log filter is invalid or a global
/// subscriber is already installed.
pub fn init_observability() -> RatekeeperResult<()> {
    init_observability_with_config(ObservabilityConfig::default())
}

/// Initialise logging and tracing.
///
/// # Errors
///
/// Returns a configuration error if the log filter is invalid or a global
/// subscriber is already installed.
pub fn init_observability_with_config(config: ObservabilityConfig) -> RatekeeperResult<()> {
    let env_filter = config.filter()?;

    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_level(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .boxed()
    };

    let provider = config.otel_stdout.then(|| {
        let resource = Resource::builder()
            .with_service_name(config.service_name.clone())
            .with_attributes(vec![KeyValue::new(
                "service.version",
                config.service_version.clone(),
            )])
            .build();
        SdkTracerProvider::builder()
            .with_simple_exporter(SpanExporter::default())
            .with_resource(resource)
            .build()
    });
    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| ConfigError::new(format!("Failed to install tracing subscriber: {}", e)))?;

    // Registered only once the subscriber is in place.
    if let Some(provider) = provider {
        global::set_tracer_provider(provider.clone());
        let _ = TRACER_PROVIDER.set(provider);
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        json = config.json_logs,
        otel = config.otel_stdout,
        "Observability initialised"
    );
    Ok(())
}

/// Flush and shut down the span exporter, if one was installed.
pub fn shutdown_observability() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Failed to shut down tracer provider: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = ObservabilityConfig::new("worker")
            .with_version("9.9.9")
            .with_log_level("ratekeeper=debug")
            .with_json_logs(true)
            .with_otel_stdout(false);
        assert_eq!(config.service_name, "worker");
        assert_eq!(config.service_version, "9.9.9");
        assert_eq!(config.log_level, "ratekeeper=debug");
        assert!(config.json_logs);
        assert!(!config.otel_stdout);
    }

    #[test]
    fn test_refused_init_leaves_tracer_provider_unset() {
        // The only test in this binary that installs a global subscriber.
        init_observability_with_config(ObservabilityConfig::new("first").with_otel_stdout(false))
            .unwrap();

        let err =
            init_observability_with_config(ObservabilityConfig::new("second").with_otel_stdout(true))
                .unwrap_err();
        assert!(err.to_string().contains("tracing subscriber"), "{}", err);
        assert!(TRACER_PROVIDER.get().is_none());
    }

    #[test]
    fn test_default_uses_package_name() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.service_name, "ratekeeper");
        assert!(config.otel_stdout);
    }
}
