//! Logical target to deployment resolution and fallback chains.

use ratekeeper_error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, instrument};

/// A concrete deployment of a model.
///
/// # Example
///
/// ```yaml
/// gpt4-east:
///   model_name: gpt-4
///   region: eastus
///   tpm_quota: 1000000
///   rpm_quota: 600
///   fallback_to: gpt4-west
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters)]
pub struct DeploymentConfig {
    /// Deployment name (the map key in configuration)
    #[serde(default)]
    name: String,
    /// Model served by the deployment, used for token estimation
    #[serde(default)]
    model_name: Option<String>,
    /// Hosting region
    #[serde(default)]
    region: Option<String>,
    /// Cumulative tokens per quota period
    #[serde(default)]
    tpm_quota: Option<u64>,
    /// Requests per minute
    #[serde(default)]
    rpm_quota: Option<f64>,
    /// Requests per second
    #[serde(default)]
    rps_limit: Option<f64>,
    /// Deployment to try when this one's quota is spent
    #[serde(default)]
    fallback_to: Option<String>,
    /// Day of month the quota resets (provider setting when unset)
    #[serde(default)]
    reset_day: Option<u32>,
    /// Timezone the reset day is evaluated in (provider setting when unset)
    #[serde(default)]
    reset_timezone: Option<String>,
}

impl DeploymentConfig {
    /// A deployment with no limits and no fallback.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_name: None,
            region: None,
            tpm_quota: None,
            rpm_quota: None,
            rps_limit: None,
            fallback_to: None,
            reset_day: None,
            reset_timezone: None,
        }
    }

    /// Set the served model.
    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    /// Set the region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the period token quota.
    pub fn with_tpm_quota(mut self, tokens: u64) -> Self {
        self.tpm_quota = Some(tokens);
        self
    }

    /// Set the requests-per-minute limit.
    pub fn with_rpm_quota(mut self, rpm: f64) -> Self {
        self.rpm_quota = Some(rpm);
        self
    }

    /// Set the requests-per-second limit.
    pub fn with_rps_limit(mut self, rps: f64) -> Self {
        self.rps_limit = Some(rps);
        self
    }

    /// Set the fallback deployment.
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback_to = Some(fallback.into());
        self
    }

    /// Set the quota reset day and timezone.
    pub fn with_reset(mut self, reset_day: u32, reset_timezone: impl Into<String>) -> Self {
        self.reset_day = Some(reset_day);
        self.reset_timezone = Some(reset_timezone.into());
        self
    }

    pub(crate) fn named(mut self, name: &str) -> Self {
        if self.name.is_empty() {
            self.name = name.to_string();
        }
        self
    }
}

/// Resolves deployments and their fallback chains.
///
/// Fallback chains are checked when the mapper is built: every `fallback_to`
/// must name a known deployment and no chain may loop.
///
/// # Example
///
/// ```
/// use ratekeeper_rate_limit::{DeploymentConfig, DeploymentMapper};
///
/// let mapper = DeploymentMapper::new(vec![
///     DeploymentConfig::new("a").with_fallback("b"),
///     DeploymentConfig::new("b"),
/// ])?;
/// assert_eq!(mapper.fallback_chain("a"), vec!["a", "b"]);
///
/// let cyclic = DeploymentMapper::new(vec![
///     DeploymentConfig::new("a").with_fallback("b"),
///     DeploymentConfig::new("b").with_fallback("a"),
/// ]);
/// assert!(cyclic.is_err());
/// # Ok::<(), ratekeeper_error::ConfigError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentMapper {
    deployments: BTreeMap<String, DeploymentConfig>,
}

impl DeploymentMapper {
    /// Build and validate a mapper.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate names, a `fallback_to` naming an unknown
    /// deployment, or a cyclic fallback chain.
    #[instrument(skip(deployments))]
    pub fn new(deployments: impl IntoIterator<Item = DeploymentConfig>) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for deployment in deployments {
            let name = deployment.name.clone();
            if map.insert(name.clone(), deployment).is_some() {
                return Err(ConfigError::new(format!("Duplicate deployment '{}'", name)));
            }
        }

        for deployment in map.values() {
            if let Some(fallback) = &deployment.fallback_to {
                if !map.contains_key(fallback) {
                    return Err(ConfigError::new(format!(
                        "Deployment '{}' falls back to unknown deployment '{}'",
                        deployment.name, fallback
                    )));
                }
            }
        }

        for start in map.keys() {
            let mut seen = HashSet::new();
            let mut path = vec![start.as_str()];
            let mut current = start.as_str();
            seen.insert(current);
            while let Some(next) = map.get(current).and_then(|d| d.fallback_to.as_deref()) {
                path.push(next);
                if !seen.insert(next) {
                    return Err(ConfigError::new(format!(
                        "Cyclic fallback chain: {}",
                        path.join(" -> ")
                    )));
                }
                current = next;
            }
        }

        debug!(count = map.len(), "Deployment map validated");
        Ok(Self { deployments: map })
    }

    /// Configuration of `name`, if it is a known deployment.
    pub fn resolve(&self, name: &str) -> Option<&DeploymentConfig> {
        self.deployments.get(name)
    }

    /// `name` followed by its fallbacks in order. Unknown names have no
    /// fallbacks.
    pub fn fallback_chain(&self, name: &str) -> Vec<String> {
        let mut chain = vec![name.to_string()];
        let mut current = name;
        while let Some(next) = self
            .deployments
            .get(current)
            .and_then(|d| d.fallback_to.as_deref())
        {
            chain.push(next.to_string());
            current = next;
        }
        chain
    }

    /// Model to estimate tokens with for `target`.
    pub fn model_for<'a>(&'a self, target: &'a str) -> &'a str {
        self.resolve(target)
            .and_then(|d| d.model_name.as_deref())
            .unwrap_or(target)
    }

    /// All deployments, by name.
    pub fn deployments(&self) -> impl Iterator<Item = &DeploymentConfig> {
        self.deployments.values()
    }

    /// Whether no deployments are configured.
    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }
}
