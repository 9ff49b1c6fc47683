//! Configuration loading and validation.
//!
//! Configuration is layered with the `config` crate:
//! - Bundled defaults (include_str! from ratekeeper.yaml; rate limiting off)
//! - User config in ~/.config/ratekeeper/ratekeeper.{yaml,json,toml}
//! - User config in the current directory (./ratekeeper.{yaml,json,toml})
//!
//! The merged document is checked against a bundled draft-07 JSON Schema
//! before it is deserialised, then semantic checks (timezones, threshold
//! order, fallback chains) run while building [`ProviderLimits`]. Every
//! failure is a [`ConfigError`] raised at load time.

use crate::{
    BackoffStrategy, DEFAULT_MAX_RETRIES, DEFAULT_TARGET, DeploymentConfig, DeploymentMapper,
    ExponentialBackoff, FibonacciBackoff, LinearBackoff, QuotaLimit, QuotaPolicy,
};
use config::{Config, File, FileFormat};
use ratekeeper_core::{LimitType, RateLimitConfig};
use ratekeeper_error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const DEFAULT_CONFIG: &str = include_str!("../../../ratekeeper.yaml");
const SCHEMA: &str = include_str!("../schema/ratekeeper.schema.json");

/// Providers with a built-in adapter. Others are ignored with a warning.
pub const KNOWN_PROVIDERS: [&str; 4] = ["openai", "azure", "huggingface", "rest"];

static SCHEMA_VALUE: LazyLock<Result<Value, String>> =
    LazyLock::new(|| serde_json::from_str(SCHEMA).map_err(|e| e.to_string()));

/// Limits for one model, deployment or the provider default.
///
/// Fields left out inherit from the provider's `default` entry.
///
/// # Example
///
/// ```yaml
/// rate_limits:
///   default: { rpm: 60, tpm: 90000 }
///   gpt-4: { rpm: 10, burst_allowance: 1.2 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct LimitSpec {
    /// Requests per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<f64>,
    /// Tokens per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<f64>,
    /// Requests per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rps: Option<f64>,
    /// Requests per day
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpd: Option<f64>,
    /// Cumulative tokens per quota period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm_quota: Option<f64>,
    /// Requests in flight at once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent: Option<f64>,
    /// Override the window of every windowed limit in this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<f64>,
    /// Headroom factor (>= 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_allowance: Option<f64>,
}

impl LimitSpec {
    /// `self` with unset fields taken from `base`.
    pub fn or(&self, base: &LimitSpec) -> LimitSpec {
        LimitSpec {
            rpm: self.rpm.or(base.rpm),
            tpm: self.tpm.or(base.tpm),
            rps: self.rps.or(base.rps),
            rpd: self.rpd.or(base.rpd),
            tpm_quota: self.tpm_quota.or(base.tpm_quota),
            concurrent: self.concurrent.or(base.concurrent),
            window_seconds: self.window_seconds.or(base.window_seconds),
            burst_allowance: self.burst_allowance.or(base.burst_allowance),
        }
    }

    fn from_deployment(deployment: &DeploymentConfig) -> LimitSpec {
        LimitSpec {
            rpm: *deployment.rpm_quota(),
            rps: *deployment.rps_limit(),
            tpm_quota: deployment.tpm_quota().map(|t| t as f64),
            ..LimitSpec::default()
        }
    }

    /// Short-window and concurrency limits (everything but `tpm_quota`).
    ///
    /// # Errors
    ///
    /// Returns an error for non-positive limits or a burst allowance below 1.0.
    pub fn window_limits(&self) -> Result<Vec<RateLimitConfig>, ConfigError> {
        let window = match self.window_seconds {
            Some(secs) if !(secs.is_finite() && secs > 0.0) => {
                return Err(ConfigError::new(format!(
                    "window_seconds must be positive, got {}",
                    secs
                )));
            }
            Some(secs) => Some(Duration::try_from_secs_f64(secs).map_err(|e| {
                ConfigError::new(format!("window_seconds {} is out of range: {}", secs, e))
            })?),
            None => None,
        };
        let burst = self.burst_allowance.unwrap_or(1.0);

        [
            (LimitType::Rpm, self.rpm),
            (LimitType::Tpm, self.tpm),
            (LimitType::Rps, self.rps),
            (LimitType::Rpd, self.rpd),
            (LimitType::Concurrent, self.concurrent),
        ]
        .into_iter()
        .filter_map(|(limit_type, value)| value.map(|v| (limit_type, v)))
        .map(|(limit_type, value)| {
            let config = RateLimitConfig::new(limit_type, value)?.with_burst_allowance(burst)?;
            Ok(match window {
                Some(window) => config.with_window(window),
                None => config,
            })
        })
        .collect()
    }
}

/// Retry strategy name.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackoffKind {
    /// Fibonacci sequence of seconds
    #[default]
    Fibonacci,
    /// Doubling delays with optional jitter
    Exponential,
    /// Evenly growing delays
    Linear,
}

/// Per-provider retry configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BackoffConfig {
    /// Strategy to use
    #[serde(default)]
    pub strategy: BackoffKind,
    /// Fibonacci cap in seconds (default 70)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    /// Exponential/linear base delay in seconds (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay: Option<f64>,
    /// Exponential/linear cap in seconds (default 60)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<f64>,
    /// Retry budget (default 5)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Exponential jitter (default on)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
}

fn seconds(value: Option<f64>, default: f64) -> Duration {
    Duration::try_from_secs_f64(value.unwrap_or(default)).unwrap_or(Duration::from_secs_f64(default))
}

impl BackoffConfig {
    /// Build the configured strategy.
    pub fn build(&self) -> Arc<dyn BackoffStrategy> {
        let max_retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        match self.strategy {
            BackoffKind::Fibonacci => Arc::new(
                FibonacciBackoff::new(seconds(self.max_value, 70.0)).with_max_retries(max_retries),
            ),
            BackoffKind::Exponential => Arc::new(
                ExponentialBackoff::new(seconds(self.base_delay, 1.0), seconds(self.max_delay, 60.0))
                    .with_jitter(self.jitter.unwrap_or(true))
                    .with_max_retries(max_retries),
            ),
            BackoffKind::Linear => Arc::new(
                LinearBackoff::new(seconds(self.base_delay, 1.0), seconds(self.max_delay, 60.0))
                    .with_max_retries(max_retries),
            ),
        }
    }
}

/// Quota period semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResetKind {
    /// Reset on a fixed day of the month
    #[default]
    Calendar,
    /// Fixed-length windows
    Rolling,
}

fn default_reset_day() -> u32 {
    1
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_rolling_days() -> u32 {
    30
}

fn default_thresholds() -> Vec<f64> {
    crate::DEFAULT_ALERT_THRESHOLDS.to_vec()
}

/// Per-provider quota period configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QuotaConfig {
    /// Calendar or rolling periods
    #[serde(default)]
    pub reset: ResetKind,
    /// Day of month calendar periods start (1 to 28)
    #[serde(default = "default_reset_day")]
    pub reset_day: u32,
    /// Timezone for calendar periods
    #[serde(default = "default_timezone")]
    pub reset_timezone: String,
    /// Length of rolling periods in days
    #[serde(default = "default_rolling_days")]
    pub rolling_days: u32,
    /// Ascending alert thresholds in percent; the last one blocks
    #[serde(default = "default_thresholds")]
    pub alert_thresholds: Vec<f64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            reset: ResetKind::default(),
            reset_day: default_reset_day(),
            reset_timezone: default_timezone(),
            rolling_days: default_rolling_days(),
            alert_thresholds: default_thresholds(),
        }
    }
}

impl QuotaConfig {
    fn policy(&self, reset_day: u32, reset_timezone: &str) -> Result<QuotaPolicy, ConfigError> {
        match self.reset {
            ResetKind::Calendar => QuotaPolicy::calendar(reset_day, reset_timezone),
            ResetKind::Rolling => QuotaPolicy::rolling(self.rolling_days),
        }
    }
}

/// Configuration for one provider.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Limits keyed by model/deployment name or `default`
    #[serde(default)]
    pub rate_limits: BTreeMap<String, LimitSpec>,
    /// Retry strategy
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Quota periods and alerting
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Deployments keyed by name
    #[serde(default)]
    pub deployments: BTreeMap<String, DeploymentConfig>,
}

/// Periodic quota persistence.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PersistenceConfig {
    /// JSON file holding quota state
    pub path: PathBuf,
    /// Seconds between writes
    #[serde(default = "default_persist_interval")]
    pub interval_seconds: u64,
}

fn default_persist_interval() -> u64 {
    300
}

/// `system.rate_limiting` block.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RateLimitingConfig {
    /// Master switch (off by default)
    #[serde(default)]
    pub enabled: bool,
    /// Default bound on how long `acquire` may wait
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_seconds: Option<f64>,
    /// Quota persistence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceConfig>,
    /// Directory for state shared between processes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl RateLimitingConfig {
    /// Default acquire timeout.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_seconds
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// `system` block.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SystemConfig {
    /// Rate limiting settings
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Resolved, validated limits of one provider.
#[derive(Debug, Clone)]
pub struct ProviderLimits {
    windows: BTreeMap<String, Vec<RateLimitConfig>>,
    quotas: BTreeMap<String, QuotaLimit>,
    backoff: Arc<dyn BackoffStrategy>,
    deployments: DeploymentMapper,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            windows: BTreeMap::new(),
            quotas: BTreeMap::new(),
            backoff: BackoffConfig::default().build(),
            deployments: DeploymentMapper::default(),
        }
    }
}

impl ProviderLimits {
    /// Window and concurrency limits for `target`, falling back to the
    /// provider default.
    pub fn limits_for(&self, target: &str) -> &[RateLimitConfig] {
        self.windows
            .get(target)
            .or_else(|| self.windows.get(DEFAULT_TARGET))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Quota limits keyed by target (`default` applies to every target).
    pub fn quotas(&self) -> &BTreeMap<String, QuotaLimit> {
        &self.quotas
    }

    /// Retry strategy.
    pub fn backoff(&self) -> &Arc<dyn BackoffStrategy> {
        &self.backoff
    }

    /// Deployments and fallback chains.
    pub fn deployments(&self) -> &DeploymentMapper {
        &self.deployments
    }

    /// Replace the limits of `target`.
    pub fn with_limits(mut self, target: impl Into<String>, limits: Vec<RateLimitConfig>) -> Self {
        self.windows.insert(target.into(), limits);
        self
    }

    /// Set the quota of `target`.
    pub fn with_quota(mut self, target: impl Into<String>, quota: QuotaLimit) -> Self {
        self.quotas.insert(target.into(), quota);
        self
    }

    /// Replace the retry strategy.
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the deployment map.
    pub fn with_deployments(mut self, deployments: DeploymentMapper) -> Self {
        self.deployments = deployments;
        self
    }
}

impl ProviderConfig {
    /// Validate and resolve this provider's limits.
    ///
    /// Layering per target: `rate_limits.default`, then the deployment's own
    /// quotas, then an explicit `rate_limits.<target>` entry.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid limits, unknown timezones, bad
    /// thresholds, missing fallbacks or cyclic fallback chains.
    pub fn resolve(&self) -> Result<ProviderLimits, ConfigError> {
        let deployments = DeploymentMapper::new(
            self.deployments
                .iter()
                .map(|(name, deployment)| deployment.clone().named(name)),
        )?;

        let base = self.rate_limits.get(DEFAULT_TARGET).cloned().unwrap_or_default();
        let mut specs: BTreeMap<String, LimitSpec> = BTreeMap::new();
        for deployment in deployments.deployments() {
            let own = self
                .rate_limits
                .get(deployment.name())
                .cloned()
                .unwrap_or_default();
            specs.insert(
                deployment.name().clone(),
                own.or(&LimitSpec::from_deployment(deployment)).or(&base),
            );
        }
        for (target, spec) in &self.rate_limits {
            specs
                .entry(target.clone())
                .or_insert_with(|| if target == DEFAULT_TARGET { spec.clone() } else { spec.or(&base) });
        }

        let default_policy = self.quota.policy(self.quota.reset_day, &self.quota.reset_timezone)?;
        let mut windows = BTreeMap::new();
        let mut quotas = BTreeMap::new();
        for (target, spec) in specs {
            windows.insert(target.clone(), spec.window_limits()?);
            if let Some(tokens) = spec.tpm_quota {
                if tokens.fract() != 0.0 {
                    return Err(ConfigError::new(format!(
                        "tpm_quota for {} must be a whole number of tokens, got {}",
                        target, tokens
                    )));
                }
                let limit = RateLimitConfig::new(LimitType::TpmQuota, tokens)?;
                let policy = match deployments.resolve(&target) {
                    Some(d) if d.reset_day().is_some() || d.reset_timezone().is_some() => {
                        self.quota.policy(
                            d.reset_day().unwrap_or(self.quota.reset_day),
                            d.reset_timezone().as_deref().unwrap_or(&self.quota.reset_timezone),
                        )?
                    }
                    _ => default_policy,
                };
                let quota = QuotaLimit::new(*limit.limit_value() as u64)
                    .with_policy(policy)
                    .with_thresholds(self.quota.alert_thresholds.clone())?;
                quotas.insert(target, quota);
            }
        }

        Ok(ProviderLimits {
            windows,
            quotas,
            backoff: self.backoff.build(),
            deployments,
        })
    }
}

/// Top-level Ratekeeper configuration.
///
/// # Example
///
/// ```no_run
/// use ratekeeper_rate_limit::RatekeeperConfig;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RatekeeperConfig::load()?;
/// if config.system.rate_limiting.enabled {
///     let limits = config.provider_limits()?;
///     println!("{} providers configured", limits.len());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RatekeeperConfig {
    /// System-wide settings
    #[serde(default)]
    pub system: SystemConfig,
    /// Provider settings keyed by provider name
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl RatekeeperConfig {
    /// Load configuration with precedence: current dir > home dir > bundled defaults.
    ///
    /// User config files are optional and skipped if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be parsed or the merged document is
    /// invalid.
    #[instrument]
    pub fn load() -> Result<Self, ConfigError> {
        debug!("Loading configuration with precedence: current dir > home dir > bundled defaults");

        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Yaml));

        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("ratekeeper").join("ratekeeper");
            builder = builder.add_source(File::with_name(&user.to_string_lossy()).required(false));
        }

        builder = builder.add_source(File::with_name("ratekeeper").required(false));

        let config = builder
            .build()
            .map_err(|e| ConfigError::new(format!("Failed to build configuration: {}", e)))?;
        Self::from_config(config)
    }

    /// Load configuration from a single file (YAML, JSON or TOML by
    /// extension), without bundled defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        debug!("Loading configuration from file");
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .map_err(|e| {
                ConfigError::new(format!(
                    "Failed to read configuration from {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;
        Self::from_config(config)
    }

    /// Parse configuration text in `format`.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or is invalid.
    pub fn parse(text: &str, format: FileFormat) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(text, format))
            .build()
            .map_err(|e| ConfigError::new(format!("Failed to parse configuration: {}", e)))?;
        Self::from_config(config)
    }

    fn from_config(config: Config) -> Result<Self, ConfigError> {
        let document: Value = config
            .try_deserialize()
            .map_err(|e| ConfigError::new(format!("Failed to parse configuration: {}", e)))?;
        Self::from_value(document)
    }

    /// Validate a JSON document against the schema and deserialise it.
    ///
    /// # Errors
    ///
    /// Returns an error listing every schema violation, or a
    /// deserialisation error.
    pub fn from_value(document: Value) -> Result<Self, ConfigError> {
        validate_schema(&document)?;
        let config: RatekeeperConfig = serde_json::from_value(document)
            .map_err(|e| ConfigError::new(format!("Failed to parse configuration: {}", e)))?;
        config.warn_unknown_providers();
        Ok(config)
    }

    fn warn_unknown_providers(&self) {
        for name in self.providers.keys() {
            if !KNOWN_PROVIDERS.contains(&name.as_str()) {
                warn!(provider = %name, "Ignoring configuration for unknown provider");
            }
        }
    }

    /// Validated limits of every known provider.
    ///
    /// # Errors
    ///
    /// Returns the first semantic validation failure.
    #[instrument(skip(self))]
    pub fn provider_limits(&self) -> Result<BTreeMap<String, ProviderLimits>, ConfigError> {
        self.providers
            .iter()
            .filter(|(name, _)| KNOWN_PROVIDERS.contains(&name.as_str()))
            .map(|(name, provider)| {
                provider
                    .resolve()
                    .map(|limits| (name.clone(), limits))
                    .map_err(|e| ConfigError::new(format!("providers.{}: {}", name, e.message)))
            })
            .collect()
    }
}

fn validate_schema(document: &Value) -> Result<(), ConfigError> {
    let schema = SCHEMA_VALUE
        .as_ref()
        .map_err(|e| ConfigError::new(format!("Bundled schema is invalid JSON: {}", e)))?;
    let validator = jsonschema::draft7::new(schema)
        .map_err(|e| ConfigError::new(format!("Bundled schema is invalid: {}", e)))?;

    let problems: Vec<String> = validator
        .iter_errors(document)
        .map(|error| format!("{}: {}", error.instance_path, error))
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::new(format!(
            "Configuration failed schema validation: {}",
            problems.join("; ")
        )))
    }
}
