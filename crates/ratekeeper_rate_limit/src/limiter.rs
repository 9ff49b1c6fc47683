//! Unified rate limiter: quota pre-flight, window admission, usage
//! accounting and the retry/fallback state machine.
//!
//! ```text
//! ESTIMATE -> ACQUIRE -> EXECUTE -> RECORD_USAGE
//!               ^          |
//!               |          +-- throttle/transient --> BACKOFF --> ACQUIRE
//!               |          +-- quota exhausted ----> FALLBACK --> ESTIMATE (next target)
//!               |          +-- fatal --------------> FAIL
//!               +-- quota exhausted ----------------> FALLBACK
//! ```
//!
//! Locks are never held across the provider call: [`UnifiedRateLimiter::acquire`]
//! returns a [`Permit`] once admitted, the caller executes the request, then
//! reports it with [`UnifiedRateLimiter::record_usage`] or
//! [`UnifiedRateLimiter::record_failure`].

use crate::{
    BackoffState, FileBackend, JsonFileSink, ParallelCoordinator, PersistenceSink, ProviderLimits,
    QuotaSnapshot, QuotaTracker, RatekeeperConfig, SlidingWindowLimiter, WindowRequest,
};
use parking_lot::Mutex;
use ratekeeper_core::{
    Clock, ErrorClass, LimitKey, LimitType, LlmRequest, ProviderAdapter, RequestExecutor,
    SystemClock, TokenUsage,
};
use ratekeeper_error::{
    ProviderError, RateLimitError, RateLimitErrorKind, RatekeeperError, RatekeeperResult,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default interval between quota state writes.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(300);

/// Admission granted by [`UnifiedRateLimiter::acquire`].
///
/// Report the outcome with `record_usage` or `record_failure`. A permit
/// dropped without a report gives back its concurrency slot and logs a
/// warning; the quota is not charged.
#[derive(Debug)]
pub struct Permit {
    id: Uuid,
    provider: String,
    target: String,
    estimated_tokens: u64,
    token_keys: Vec<LimitKey>,
    concurrent: Option<(LimitKey, u64)>,
    windows: Option<SlidingWindowLimiter>,
    settled: bool,
}

impl Permit {
    fn untracked(provider: &str, target: &str, estimated_tokens: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            target: target.to_string(),
            estimated_tokens,
            token_keys: Vec::new(),
            concurrent: None,
            windows: None,
            settled: false,
        }
    }

    /// Identifier shared by every window entry of this admission.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Provider name.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Model or deployment admitted against.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Tokens charged at admission.
    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_tokens
    }

    /// Whether limits were enforced (false when rate limiting is disabled).
    pub fn is_tracked(&self) -> bool {
        self.windows.is_some()
    }

    fn release_concurrent(&mut self) -> RatekeeperResult<()> {
        if let (Some(windows), Some((key, cost))) = (&self.windows, &self.concurrent) {
            windows.release(key, *cost)?;
        }
        self.concurrent = None;
        Ok(())
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.settled || self.windows.is_none() {
            return;
        }
        warn!(
            provider = %self.provider,
            target = %self.target,
            id = %self.id,
            "Permit dropped without record_usage or record_failure; quota not charged"
        );
        if let Err(e) = self.release_concurrent() {
            error!(error = %e, "Failed to release concurrency slot");
        }
    }
}

/// Result of [`UnifiedRateLimiter::execute`].
#[derive(Debug, Clone, PartialEq, derive_getters::Getters)]
pub struct ExecutionOutcome {
    /// Target that served the request (differs from the requested one after
    /// a fallback)
    target: String,
    /// Provider response
    response: Value,
    /// Usage reported by the provider, if any
    usage: Option<TokenUsage>,
    /// Tokens charged (reported total, or the estimate)
    tokens: u64,
    /// Provider calls made, across all targets
    attempts: u32,
    /// Fallback steps taken
    fallbacks: u32,
}

enum Phase {
    Estimate,
    Acquire,
    Execute(Permit),
    RecordUsage(Permit, Value),
    Backoff { delay: Duration, cause: String },
    Fallback,
    Fail(RatekeeperError),
}

struct PersistenceTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Single entry point for rate limiting across providers.
///
/// # Example
///
/// ```no_run
/// use ratekeeper_rate_limit::{RatekeeperConfig, UnifiedRateLimiter};
///
/// # async fn run(adapter: std::sync::Arc<dyn ratekeeper_core::ProviderAdapter>) -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = UnifiedRateLimiter::builder()
///     .config(RatekeeperConfig::load()?)
///     .adapter(adapter)
///     .build()?;
///
/// let permit = limiter.acquire("openai", "gpt-4", 1200, None).await?;
/// // ... call the provider ...
/// limiter.record_usage(permit, 1350)?;
/// # Ok(())
/// # }
/// ```
pub struct UnifiedRateLimiter {
    enabled: bool,
    providers: BTreeMap<String, ProviderLimits>,
    fallback_limits: ProviderLimits,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    windows: SlidingWindowLimiter,
    quotas: QuotaTracker,
    clock: Arc<dyn Clock>,
    acquire_timeout: Option<Duration>,
    sink: Option<Arc<dyn PersistenceSink>>,
    persist_interval: Duration,
    persistence: Mutex<Option<PersistenceTask>>,
}

impl std::fmt::Debug for UnifiedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedRateLimiter")
            .field("enabled", &self.enabled)
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .field("acquire_timeout", &self.acquire_timeout)
            .field("sink", &self.sink)
            .finish()
    }
}

impl UnifiedRateLimiter {
    /// Start building a limiter.
    pub fn builder() -> UnifiedRateLimiterBuilder {
        UnifiedRateLimiterBuilder::default()
    }

    /// Whether limits are enforced.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The quota tracker.
    pub fn quotas(&self) -> &QuotaTracker {
        &self.quotas
    }

    /// The window limiter.
    pub fn windows(&self) -> &SlidingWindowLimiter {
        &self.windows
    }

    fn adapter(&self, provider: &str) -> RatekeeperResult<&Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).ok_or_else(|| {
            RateLimitError::new(RateLimitErrorKind::UnknownProvider(provider.to_string())).into()
        })
    }

    /// Resolved limits of `provider`. Providers with an adapter but no
    /// configuration have no limits and the default retry strategy.
    ///
    /// # Errors
    ///
    /// Returns `UnknownProvider` if no adapter is registered for `provider`.
    pub fn limits(&self, provider: &str) -> RatekeeperResult<&ProviderLimits> {
        self.adapter(provider)?;
        Ok(self.providers.get(provider).unwrap_or(&self.fallback_limits))
    }

    fn window_requests(limits: &ProviderLimits, provider: &str, target: &str, tokens: u64) -> Vec<WindowRequest> {
        limits
            .limits_for(target)
            .iter()
            .map(|config| {
                WindowRequest::new(LimitKey::new(provider, target, *config.limit_type()), *config, tokens)
            })
            .collect()
    }

    fn preflight(&self, provider: &str, target: &str, tokens: u64) -> RatekeeperResult<Vec<WindowRequest>> {
        let limits = self.limits(provider)?;
        if self.quotas.would_exceed(provider, target, tokens)? {
            info!(provider, target, tokens, "Quota would be exceeded; refusing admission");
            return Err(RateLimitError::new(RateLimitErrorKind::QuotaExhausted {
                provider: provider.to_string(),
                target: target.to_string(),
                chain: vec![target.to_string()],
            })
            .into());
        }
        Ok(Self::window_requests(limits, provider, target, tokens))
    }

    fn permit(&self, provider: &str, target: &str, tokens: u64, id: Uuid, requests: &[WindowRequest]) -> Permit {
        let token_keys = requests
            .iter()
            .filter(|r| *r.config.limit_type() == LimitType::Tpm)
            .map(|r| r.key.clone())
            .collect();
        let concurrent = requests
            .iter()
            .find(|r| *r.config.limit_type() == LimitType::Concurrent)
            .map(|r| (r.key.clone(), r.cost));
        Permit {
            id,
            provider: provider.to_string(),
            target: target.to_string(),
            estimated_tokens: tokens,
            token_keys,
            concurrent,
            windows: Some(self.windows.clone()),
            settled: false,
        }
    }

    /// Wait for admission of a request estimated at `estimated_tokens`.
    ///
    /// `timeout` defaults to `system.rate_limiting.acquire_timeout_seconds`.
    ///
    /// # Errors
    ///
    /// - `QuotaExhausted` if the target's quota would be overrun or is blocked
    /// - `RateLimitExceeded` if the wait outlasts the timeout, or the request
    ///   is larger than a limit's capacity
    /// - `UnknownProvider` if no adapter is registered
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        provider: &str,
        target: &str,
        estimated_tokens: u64,
        timeout: Option<Duration>,
    ) -> RatekeeperResult<Permit> {
        if !self.enabled {
            return Ok(Permit::untracked(provider, target, estimated_tokens));
        }
        let requests = self.preflight(provider, target, estimated_tokens)?;
        let id = Uuid::new_v4();
        self.windows
            .acquire(&requests, id, timeout.or(self.acquire_timeout))
            .await?;
        debug!("Admitted");
        Ok(self.permit(provider, target, estimated_tokens, id, &requests))
    }

    /// Blocking version of [`acquire`](Self::acquire) for OS threads.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire).
    #[instrument(skip(self))]
    pub fn acquire_blocking(
        &self,
        provider: &str,
        target: &str,
        estimated_tokens: u64,
        timeout: Option<Duration>,
    ) -> RatekeeperResult<Permit> {
        if !self.enabled {
            return Ok(Permit::untracked(provider, target, estimated_tokens));
        }
        let requests = self.preflight(provider, target, estimated_tokens)?;
        let id = Uuid::new_v4();
        self.windows
            .acquire_blocking(&requests, id, timeout.or(self.acquire_timeout))?;
        debug!("Admitted");
        Ok(self.permit(provider, target, estimated_tokens, id, &requests))
    }

    /// Report a completed request that used `tokens_used` tokens.
    ///
    /// The token-window entry made at admission is replaced with the actual
    /// count, the quota is charged and the concurrency slot released.
    ///
    /// # Errors
    ///
    /// Returns a state error if shared state cannot be updated.
    #[instrument(skip(self, permit), fields(provider = %permit.provider, target = %permit.target))]
    pub fn record_usage(&self, mut permit: Permit, tokens_used: u64) -> RatekeeperResult<Option<QuotaSnapshot>> {
        let Some(windows) = permit.windows.clone() else {
            permit.settled = true;
            return Ok(None);
        };
        // Unsettled until the slot is back, so Drop retries a failed release.
        permit.release_concurrent()?;
        permit.settled = true;

        let charged = self
            .quotas
            .track_usage(&permit.provider, &permit.target, tokens_used);
        for key in &permit.token_keys {
            if !windows.amend(key, permit.id, tokens_used)? {
                debug!(%key, "Token window entry already expired");
            }
        }
        charged
    }

    /// Report a failed request. Returns the adapter's classification.
    ///
    /// A quota-exhausted failure marks the target spent for the rest of the
    /// period.
    ///
    /// # Errors
    ///
    /// Returns `UnknownProvider` or a state error.
    #[instrument(skip(self, permit, error), fields(provider = %permit.provider, target = %permit.target, %error))]
    pub fn record_failure(&self, mut permit: Permit, error: &ProviderError) -> RatekeeperResult<ErrorClass> {
        permit.release_concurrent()?;
        permit.settled = true;
        let class = self.adapter(&permit.provider)?.classify_error(error);
        debug!(%class, "Classified provider failure");
        if class == ErrorClass::QuotaExhausted && self.enabled {
            self.quotas.mark_exhausted(&permit.provider, &permit.target)?;
        }
        Ok(class)
    }

    /// Delay before retry `attempt` (0-based) of a request to `provider`.
    ///
    /// A `Retry-After` carried by `error` overrides the strategy.
    ///
    /// # Errors
    ///
    /// Returns `UnknownProvider` if no adapter is registered.
    pub fn get_backoff_delay(
        &self,
        provider: &str,
        attempt: u32,
        error: Option<&ProviderError>,
    ) -> RatekeeperResult<Duration> {
        let adapter = self.adapter(provider)?;
        let info = error.map(|e| adapter.extract_rate_limit_info(e));
        Ok(self.limits(provider)?.backoff().get_delay(attempt, info.as_ref()))
    }

    /// Whether a failure after `attempt` retries should be retried.
    ///
    /// # Errors
    ///
    /// Returns `UnknownProvider` if no adapter is registered.
    pub fn should_retry(&self, provider: &str, attempt: u32, error: &ProviderError) -> RatekeeperResult<bool> {
        let class = self.adapter(provider)?.classify_error(error);
        Ok(self.limits(provider)?.backoff().should_retry(attempt, class))
    }

    /// Current quota of `target`.
    ///
    /// # Errors
    ///
    /// Returns a state error if shared state cannot be read.
    pub fn quota_status(&self, provider: &str, target: &str) -> RatekeeperResult<QuotaSnapshot> {
        self.quotas.snapshot(provider, target)
    }

    /// Run `request` through the full state machine, calling `executor`
    /// once admitted.
    ///
    /// Throttling and transient failures are retried with the provider's
    /// backoff strategy; a spent quota moves to the next deployment in the
    /// fallback chain; fatal errors propagate immediately.
    ///
    /// # Errors
    ///
    /// - `QuotaExhausted` when no target in the fallback chain has quota left
    /// - `BackoffExhausted` when retries are used up
    /// - `RateLimitExceeded` when admission times out
    /// - the provider error itself when it is fatal
    #[instrument(skip(self, request, executor), fields(provider = %request.provider, target = %request.target))]
    pub async fn execute(
        &self,
        request: &LlmRequest,
        executor: &dyn RequestExecutor,
    ) -> RatekeeperResult<ExecutionOutcome> {
        let provider = request.provider.as_str();
        let adapter = self.adapter(provider)?.clone();
        let limits = self.limits(provider)?;
        let chain = limits.deployments().fallback_chain(&request.target);

        let mut position = 0usize;
        let mut estimate = 0u64;
        let mut attempts = 0u32;
        let mut fallbacks = 0u32;
        let mut backoff = BackoffState::new(limits.backoff().clone());
        let mut phase = Phase::Estimate;

        loop {
            let target = chain.get(position).map(String::as_str).unwrap_or_default();
            phase = match phase {
                Phase::Estimate => {
                    let model = limits.deployments().model_for(target);
                    estimate = adapter.estimate_request(request, model);
                    debug!(target, model, estimate, "Estimated request tokens");
                    Phase::Acquire
                }
                Phase::Acquire => match self.acquire(provider, target, estimate, None).await {
                    Ok(permit) => Phase::Execute(permit),
                    Err(e) if e.is_quota_exhausted() => Phase::Fallback,
                    Err(e) => Phase::Fail(e),
                },
                Phase::Execute(permit) => {
                    attempts += 1;
                    match executor.execute(target, request).await {
                        Ok(response) => Phase::RecordUsage(permit, response),
                        Err(error) => match self.record_failure(permit, &error)? {
                            ErrorClass::QuotaExhausted => Phase::Fallback,
                            ErrorClass::Fatal => Phase::Fail(error.into()),
                            class => {
                                let info = adapter.extract_rate_limit_info(&error);
                                match backoff.next_delay(class, Some(&info)) {
                                    Some(delay) => Phase::Backoff {
                                        delay,
                                        cause: error.to_string(),
                                    },
                                    None => Phase::Fail(
                                        RateLimitError::new(RateLimitErrorKind::BackoffExhausted {
                                            attempts,
                                            last_error: error.to_string(),
                                        })
                                        .into(),
                                    ),
                                }
                            }
                        },
                    }
                }
                Phase::Backoff { delay, cause } => {
                    warn!(
                        provider,
                        target,
                        attempt = backoff.attempt_count(),
                        delay_ms = delay.as_millis() as u64,
                        cause = %cause,
                        "Backing off before retry"
                    );
                    self.clock.sleep(delay).await;
                    Phase::Acquire
                }
                Phase::Fallback => {
                    position += 1;
                    match chain.get(position) {
                        Some(next) => {
                            fallbacks += 1;
                            info!(provider, from = target, to = %next, "Quota exhausted; falling back");
                            backoff = BackoffState::new(limits.backoff().clone());
                            Phase::Estimate
                        }
                        None => Phase::Fail(
                            RateLimitError::new(RateLimitErrorKind::QuotaExhausted {
                                provider: provider.to_string(),
                                target: request.target.clone(),
                                chain: chain.clone(),
                            })
                            .into(),
                        ),
                    }
                }
                Phase::RecordUsage(permit, response) => {
                    let usage = adapter.extract_usage(&response);
                    let tokens = usage.map_or(estimate, |u| *u.total_tokens());
                    self.record_usage(permit, tokens)?;
                    debug!(target, tokens, attempts, fallbacks, "Request completed");
                    return Ok(ExecutionOutcome {
                        target: target.to_string(),
                        response,
                        usage,
                        tokens,
                        attempts,
                        fallbacks,
                    });
                }
                Phase::Fail(e) => {
                    warn!(provider, target, attempts, fallbacks, error = %e, "Request failed");
                    return Err(e);
                }
            };
        }
    }

    /// Write quota state to the configured sink now.
    ///
    /// Returns the number of targets written (0 without a sink).
    ///
    /// # Errors
    ///
    /// Returns a state error if the sink fails.
    pub fn persist(&self) -> RatekeeperResult<usize> {
        match &self.sink {
            Some(sink) => self.quotas.persist(sink.as_ref()),
            None => Ok(0),
        }
    }

    /// Spawn a task that persists quota state on the configured interval.
    ///
    /// Returns false if there is no sink or the task is already running.
    /// Must be called within a Tokio runtime.
    #[instrument(skip(self))]
    pub fn start_persistence(&self) -> bool {
        let Some(sink) = self.sink.clone() else {
            return false;
        };
        let mut slot = self.persistence.lock();
        if slot.is_some() {
            return false;
        }

        let quotas = self.quotas.clone();
        let interval = self.persist_interval;
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = quotas.persist(sink.as_ref()) {
                            warn!(error = %e, "Periodic quota persistence failed");
                        }
                    }
                    _ = &mut stopped => break,
                }
            }
        });
        info!(interval_secs = interval.as_secs(), "Started quota persistence");
        *slot = Some(PersistenceTask { stop, handle });
        true
    }

    /// Stop periodic persistence and flush quota state.
    ///
    /// # Errors
    ///
    /// Returns a state error if the final write fails.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> RatekeeperResult<usize> {
        let task = self.persistence.lock().take();
        if let Some(task) = task {
            let _ = task.stop.send(());
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Persistence task ended abnormally");
            }
        }
        let written = self.persist()?;
        info!(written, "Rate limiter shut down");
        Ok(written)
    }
}

/// Builder for [`UnifiedRateLimiter`].
#[derive(Default)]
pub struct UnifiedRateLimiterBuilder {
    config: Option<RatekeeperConfig>,
    providers: BTreeMap<String, ProviderLimits>,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    clock: Option<Arc<dyn Clock>>,
    coordinator: Option<ParallelCoordinator>,
    sink: Option<Arc<dyn PersistenceSink>>,
    enabled: Option<bool>,
    acquire_timeout: Option<Duration>,
    persist_interval: Option<Duration>,
}

impl UnifiedRateLimiterBuilder {
    /// Take limits, timeouts, persistence and shared-state settings from
    /// `config`.
    pub fn config(mut self, config: RatekeeperConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set limits for `provider` directly (overrides configuration).
    pub fn provider(mut self, provider: impl Into<String>, limits: ProviderLimits) -> Self {
        self.providers.insert(provider.into(), limits);
        self
    }

    /// Register an adapter under its provider name.
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Register several adapters.
    pub fn adapters(mut self, adapters: impl IntoIterator<Item = Arc<dyn ProviderAdapter>>) -> Self {
        self.adapters.extend(adapters);
        self
    }

    /// Use `clock` instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share state through `coordinator` (overrides `state_dir`).
    pub fn coordinator(mut self, coordinator: ParallelCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Persist quota state to `sink` (overrides `persistence.path`).
    pub fn sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Force limits on or off (overrides `enabled`).
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Default acquire timeout (overrides `acquire_timeout_seconds`).
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Interval of the persistence task (overrides `interval_seconds`).
    pub fn persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = Some(interval);
        self
    }

    /// Validate configuration and build the limiter. Persisted quota state is
    /// restored from the sink, if any.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid limits or fallback chains,
    /// or a state error if the state directory or sink cannot be used.
    #[instrument(skip(self))]
    pub fn build(self) -> RatekeeperResult<UnifiedRateLimiter> {
        let config = self.config.unwrap_or_default();
        let system = &config.system.rate_limiting;

        let mut providers = config.provider_limits()?;
        providers.extend(self.providers);

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let coordinator = match (self.coordinator, &system.state_dir) {
            (Some(coordinator), _) => coordinator,
            (None, Some(dir)) => ParallelCoordinator::new(Arc::new(FileBackend::new(dir)?)),
            (None, None) => ParallelCoordinator::in_memory(),
        };
        let sink = self.sink.or_else(|| {
            system
                .persistence
                .as_ref()
                .map(|p| Arc::new(JsonFileSink::new(p.path.clone())) as Arc<dyn PersistenceSink>)
        });
        let persist_interval = self
            .persist_interval
            .or_else(|| {
                system
                    .persistence
                    .as_ref()
                    .map(|p| Duration::from_secs(p.interval_seconds))
            })
            .unwrap_or(DEFAULT_PERSIST_INTERVAL);

        let mut quotas = QuotaTracker::new(coordinator.clone(), clock.clone());
        for (provider, limits) in &providers {
            for (target, quota) in limits.quotas() {
                quotas = quotas.with_limit(provider.clone(), target.clone(), quota.clone());
            }
        }
        if let Some(sink) = &sink {
            let restored = quotas.restore(sink.as_ref())?;
            debug!(restored, "Restored quota state");
        }

        let adapters: HashMap<String, Arc<dyn ProviderAdapter>> = self
            .adapters
            .into_iter()
            .map(|adapter| (adapter.provider_name().to_string(), adapter))
            .collect();
        for provider in providers.keys() {
            if !adapters.contains_key(provider) {
                warn!(provider = %provider, "No adapter registered for configured provider");
            }
        }

        let enabled = self.enabled.unwrap_or(system.enabled);
        info!(enabled, providers = providers.len(), adapters = adapters.len(), "Rate limiter ready");

        Ok(UnifiedRateLimiter {
            enabled,
            providers,
            fallback_limits: ProviderLimits::default(),
            adapters,
            windows: SlidingWindowLimiter::new(coordinator, clock.clone()),
            quotas,
            clock,
            acquire_timeout: self.acquire_timeout.or_else(|| system.acquire_timeout()),
            sink,
            persist_interval,
            persistence: Mutex::new(None),
        })
    }
}
