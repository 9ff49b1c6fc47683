//! Long-period cumulative token quotas.
//!
//! A quota is tracked per `(provider, target)` and belongs to a period
//! derived from a [`QuotaPolicy`]. When the current period id differs from
//! the stored one, the counter is archived and reset to zero under the key's
//! lock, so every process sees the reset at the same boundary.
//!
//! Alert thresholds (percent of the limit) are logged as they are crossed.
//! Reaching the highest threshold blocks new admissions for the target until
//! the period rolls over.

use crate::{ParallelCoordinator, PersistedBlob, PersistenceSink};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use ratekeeper_core::{Clock, LimitKey, LimitType};
use ratekeeper_error::{ConfigError, RatekeeperResult, StateError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Default alert thresholds, in percent. The last one blocks admissions.
pub const DEFAULT_ALERT_THRESHOLDS: [f64; 3] = [80.0, 90.0, 95.0];

/// Closed periods kept per target.
pub const HISTORY_LEN: usize = 12;

/// Rate-limit table key that applies to every target of a provider.
pub const DEFAULT_TARGET: &str = "default";

/// How quota periods are delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPolicy {
    /// Reset on `reset_day` of every month, midnight in `timezone`.
    Calendar {
        /// Day of month the period starts (1 to 28)
        reset_day: u32,
        /// Timezone the reset day is evaluated in
        timezone: Tz,
    },
    /// Consecutive fixed-length windows counted from the Unix epoch.
    Rolling {
        /// Window length in days
        days: u32,
    },
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        QuotaPolicy::Calendar {
            reset_day: 1,
            timezone: Tz::UTC,
        }
    }
}

impl QuotaPolicy {
    /// Calendar policy, validating the reset day and timezone name.
    ///
    /// # Errors
    ///
    /// Returns an error if `reset_day` is outside 1 to 28 or the timezone is
    /// unknown.
    #[track_caller]
    pub fn calendar(reset_day: u32, timezone: &str) -> Result<Self, ConfigError> {
        if !(1..=28).contains(&reset_day) {
            return Err(ConfigError::new(format!(
                "reset_day must be between 1 and 28, got {}",
                reset_day
            )));
        }
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| ConfigError::new(format!("Unknown reset_timezone '{}'", timezone)))?;
        Ok(QuotaPolicy::Calendar { reset_day, timezone })
    }

    /// Rolling policy.
    ///
    /// # Errors
    ///
    /// Returns an error if `days` is zero.
    #[track_caller]
    pub fn rolling(days: u32) -> Result<Self, ConfigError> {
        if days == 0 {
            return Err(ConfigError::new("rolling_days must be positive"));
        }
        Ok(QuotaPolicy::Rolling { days })
    }

    fn calendar_month(now: DateTime<Utc>, reset_day: u32, timezone: Tz) -> (i32, u32) {
        let local = now.with_timezone(&timezone);
        let (year, month) = (local.year(), local.month());
        if local.day() >= reset_day {
            (year, month)
        } else if month == 1 {
            (year - 1, 12)
        } else {
            (year, month - 1)
        }
    }

    fn rolling_index(now: DateTime<Utc>, days: u32) -> i64 {
        now.timestamp().div_euclid(i64::from(days) * 86_400)
    }

    /// Identifier of the period containing `now`.
    ///
    /// Calendar periods are named `YYYY-MM` after the month they start in;
    /// rolling periods are `rolling-<days>d-<index>`.
    pub fn period_id(&self, now: DateTime<Utc>) -> String {
        match *self {
            QuotaPolicy::Calendar { reset_day, timezone } => {
                let (year, month) = Self::calendar_month(now, reset_day, timezone);
                format!("{:04}-{:02}", year, month)
            }
            QuotaPolicy::Rolling { days } => {
                format!("rolling-{}d-{}", days, Self::rolling_index(now, days))
            }
        }
    }

    /// Start of the period containing `now`.
    pub fn period_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            QuotaPolicy::Calendar { reset_day, timezone } => {
                let (year, month) = Self::calendar_month(now, reset_day, timezone);
                timezone
                    .with_ymd_and_hms(year, month, reset_day, 0, 0, 0)
                    .earliest()
                    .map(|start| start.with_timezone(&Utc))
                    .unwrap_or(now)
            }
            QuotaPolicy::Rolling { days } => {
                let secs = Self::rolling_index(now, days) * i64::from(days) * 86_400;
                DateTime::from_timestamp(secs, 0).unwrap_or(now)
            }
        }
    }
}

/// Quota configuration for one target.
#[derive(Debug, Clone, PartialEq, derive_getters::Getters)]
pub struct QuotaLimit {
    /// Tokens allowed per period
    limit: u64,
    /// Period boundaries
    policy: QuotaPolicy,
    /// Ascending alert thresholds in percent
    thresholds: Vec<f64>,
}

impl QuotaLimit {
    /// A calendar-month quota of `limit` tokens resetting on the 1st (UTC)
    /// with the default thresholds.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            policy: QuotaPolicy::default(),
            thresholds: DEFAULT_ALERT_THRESHOLDS.to_vec(),
        }
    }

    /// Use a different period policy.
    pub fn with_policy(mut self, policy: QuotaPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Use different alert thresholds.
    ///
    /// # Errors
    ///
    /// Returns an error unless the thresholds are non-empty, strictly
    /// ascending and within (0, 100].
    #[track_caller]
    pub fn with_thresholds(mut self, thresholds: Vec<f64>) -> Result<Self, ConfigError> {
        if thresholds.is_empty() {
            return Err(ConfigError::new("alert_thresholds must not be empty"));
        }
        if thresholds.iter().any(|t| !(*t > 0.0 && *t <= 100.0)) {
            return Err(ConfigError::new(format!(
                "alert_thresholds must be within (0, 100], got {:?}",
                thresholds
            )));
        }
        if thresholds.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::new(format!(
                "alert_thresholds must be strictly ascending, got {:?}",
                thresholds
            )));
        }
        self.thresholds = thresholds;
        Ok(self)
    }

    /// Threshold at which admissions are blocked.
    pub fn block_threshold(&self) -> f64 {
        self.thresholds.last().copied().unwrap_or(100.0)
    }

    fn percentage(&self, tokens: u64) -> f64 {
        if self.limit == 0 {
            return 100.0;
        }
        tokens as f64 * 100.0 / self.limit as f64
    }
}

/// Totals of a closed period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaPeriod {
    /// Period identifier
    pub period_id: String,
    /// Tokens used in the period
    pub cumulative_tokens: u64,
    /// Whether the provider reported the quota spent
    #[serde(default)]
    pub exhausted: bool,
}

/// Shared quota state of one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, derive_getters::Getters)]
pub struct QuotaState {
    /// Provider name
    provider: String,
    /// Model or deployment name
    target: String,
    /// Current period
    period_id: String,
    /// Tokens used so far this period
    cumulative_tokens: u64,
    /// When the current period started
    last_reset: DateTime<Utc>,
    /// Marked spent by the provider for the rest of the period
    #[serde(default)]
    exhausted: bool,
    /// Most recent closed periods, oldest first
    #[serde(default)]
    history: Vec<QuotaPeriod>,
}

impl QuotaState {
    fn archive(&mut self, period: QuotaPeriod) {
        if period.period_id.is_empty() || self.history.iter().any(|p| p.period_id == period.period_id) {
            return;
        }
        self.history.push(period);
        if self.history.len() > HISTORY_LEN {
            let excess = self.history.len() - HISTORY_LEN;
            self.history.drain(..excess);
        }
    }

    /// Move to `period_id`, archiving the previous period. Returns the
    /// closed period if a rollover happened.
    fn roll_to(
        &mut self,
        provider: &str,
        target: &str,
        period_id: &str,
        start: DateTime<Utc>,
    ) -> Option<QuotaPeriod> {
        if self.period_id == period_id {
            return None;
        }
        let closed = QuotaPeriod {
            period_id: std::mem::take(&mut self.period_id),
            cumulative_tokens: self.cumulative_tokens,
            exhausted: self.exhausted,
        };
        self.archive(closed.clone());
        self.provider = provider.to_string();
        self.target = target.to_string();
        self.period_id = period_id.to_string();
        self.cumulative_tokens = 0;
        self.exhausted = false;
        self.last_reset = start;
        (!closed.period_id.is_empty()).then_some(closed)
    }

    /// Fold a persisted state into this one (already on the current period).
    fn absorb(&mut self, persisted: QuotaState) {
        for period in persisted.history {
            self.archive(period);
        }
        if persisted.period_id == self.period_id {
            self.cumulative_tokens = self.cumulative_tokens.max(persisted.cumulative_tokens);
            self.exhausted |= persisted.exhausted;
        } else {
            self.archive(QuotaPeriod {
                period_id: persisted.period_id,
                cumulative_tokens: persisted.cumulative_tokens,
                exhausted: persisted.exhausted,
            });
        }
    }
}

/// Point-in-time view of a target's quota.
#[derive(Debug, Clone, PartialEq, Serialize, derive_getters::Getters)]
pub struct QuotaSnapshot {
    /// Provider name
    provider: String,
    /// Model or deployment name
    target: String,
    /// Current period
    period_id: String,
    /// Tokens used this period
    cumulative_tokens: u64,
    /// Configured limit, if any
    limit: Option<u64>,
    /// Percent of the limit used (0 when unlimited)
    percentage: f64,
    /// Whether new admissions are refused
    blocked: bool,
    /// Whether the provider reported the quota spent
    exhausted: bool,
}

/// Tracks cumulative token quotas over shared state.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    coordinator: ParallelCoordinator,
    clock: Arc<dyn Clock>,
    limits: HashMap<(String, String), QuotaLimit>,
    default_policy: QuotaPolicy,
    touched: Arc<Mutex<BTreeSet<(String, String)>>>,
}

impl QuotaTracker {
    /// Create a tracker with no limits.
    pub fn new(coordinator: ParallelCoordinator, clock: Arc<dyn Clock>) -> Self {
        Self {
            coordinator,
            clock,
            limits: HashMap::new(),
            default_policy: QuotaPolicy::default(),
            touched: Arc::default(),
        }
    }

    /// Add a limit for `target` (or every target, with [`DEFAULT_TARGET`]).
    pub fn with_limit(
        mut self,
        provider: impl Into<String>,
        target: impl Into<String>,
        limit: QuotaLimit,
    ) -> Self {
        self.limits.insert((provider.into(), target.into()), limit);
        self
    }

    /// Limit applying to `target`, falling back to the provider default.
    pub fn limit_for(&self, provider: &str, target: &str) -> Option<&QuotaLimit> {
        self.limits
            .get(&(provider.to_string(), target.to_string()))
            .or_else(|| self.limits.get(&(provider.to_string(), DEFAULT_TARGET.to_string())))
    }

    fn state_key(provider: &str, target: &str) -> String {
        ParallelCoordinator::state_key(&LimitKey::new(provider, target, LimitType::TpmQuota))
    }

    fn update<R>(
        &self,
        provider: &str,
        target: &str,
        f: impl FnOnce(&mut QuotaState, Option<&QuotaLimit>) -> R,
    ) -> RatekeeperResult<R> {
        let limit = self.limit_for(provider, target);
        let policy = limit.map_or(&self.default_policy, |l| &l.policy);
        let now = self.clock.now();
        let period_id = policy.period_id(now);
        let start = policy.period_start(now);

        let (closed, result) = self.coordinator.with_state(
            &Self::state_key(provider, target),
            |state: &mut QuotaState| {
                let closed = state.roll_to(provider, target, &period_id, start);
                (closed, f(state, limit))
            },
        )?;

        if let Some(closed) = closed {
            info!(
                provider,
                target,
                previous = %closed.period_id,
                previous_tokens = closed.cumulative_tokens,
                period = %period_id,
                "Quota period rolled over"
            );
        }
        Ok(result)
    }

    fn touch(&self, provider: &str, target: &str) {
        self.touched
            .lock()
            .insert((provider.to_string(), target.to_string()));
    }

    fn snapshot_of(state: &QuotaState, limit: Option<&QuotaLimit>) -> QuotaSnapshot {
        let percentage = limit.map_or(0.0, |l| l.percentage(state.cumulative_tokens));
        let blocked = state.exhausted || limit.is_some_and(|l| percentage >= l.block_threshold());
        QuotaSnapshot {
            provider: state.provider.clone(),
            target: state.target.clone(),
            period_id: state.period_id.clone(),
            cumulative_tokens: state.cumulative_tokens,
            limit: limit.map(|l| l.limit),
            percentage,
            blocked,
            exhausted: state.exhausted,
        }
    }

    /// Charge `tokens` to `target`'s quota and log any threshold crossed.
    ///
    /// Targets without a configured quota are not tracked; `None` is
    /// returned for them.
    ///
    /// # Errors
    ///
    /// Returns a state error if shared state cannot be accessed.
    #[instrument(skip(self))]
    pub fn track_usage(
        &self,
        provider: &str,
        target: &str,
        tokens: u64,
    ) -> RatekeeperResult<Option<QuotaSnapshot>> {
        let Some(limit) = self.limit_for(provider, target) else {
            return Ok(None);
        };

        let (before, snapshot) = self.update(provider, target, |state, limit| {
            let before = state.cumulative_tokens;
            state.cumulative_tokens = state.cumulative_tokens.saturating_add(tokens);
            (before, Self::snapshot_of(state, limit))
        })?;
        self.touch(provider, target);

        let before_pct = limit.percentage(before);
        let after_pct = snapshot.percentage;
        let block = limit.block_threshold();
        for threshold in limit.thresholds.iter().copied() {
            if before_pct < threshold && after_pct >= threshold {
                if threshold >= block {
                    error!(
                        provider,
                        target,
                        percentage = after_pct,
                        threshold,
                        "Quota blocking threshold reached; new requests are refused until reset"
                    );
                } else {
                    warn!(
                        provider,
                        target,
                        percentage = after_pct,
                        threshold,
                        "Quota alert threshold crossed"
                    );
                }
            }
        }
        Ok(Some(snapshot))
    }

    /// Percent of `target`'s quota used this period (0 when unlimited).
    ///
    /// # Errors
    ///
    /// Returns a state error if shared state cannot be accessed.
    #[instrument(skip(self))]
    pub fn get_percentage(&self, provider: &str, target: &str) -> RatekeeperResult<f64> {
        Ok(self.snapshot(provider, target)?.percentage)
    }

    /// Whether admitting `tokens` more would overrun `target`'s quota, or
    /// the target is already blocked.
    ///
    /// # Errors
    ///
    /// Returns a state error if shared state cannot be accessed.
    #[instrument(skip(self))]
    pub fn would_exceed(&self, provider: &str, target: &str, tokens: u64) -> RatekeeperResult<bool> {
        self.update(provider, target, |state, limit| {
            if state.exhausted {
                return true;
            }
            match limit {
                Some(limit) => {
                    state.cumulative_tokens.saturating_add(tokens) > limit.limit
                        || limit.percentage(state.cumulative_tokens) >= limit.block_threshold()
                }
                None => false,
            }
        })
    }

    /// Record that the provider reported `target`'s quota spent. Later
    /// checks refuse the target until the period rolls over.
    ///
    /// # Errors
    ///
    /// Returns a state error if shared state cannot be accessed.
    #[instrument(skip(self))]
    pub fn mark_exhausted(&self, provider: &str, target: &str) -> RatekeeperResult<()> {
        self.update(provider, target, |state, _| state.exhausted = true)?;
        self.touch(provider, target);
        warn!(provider, target, "Quota marked exhausted for the current period");
        Ok(())
    }

    /// Current view of `target`'s quota.
    ///
    /// # Errors
    ///
    /// Returns a state error if shared state cannot be accessed.
    pub fn snapshot(&self, provider: &str, target: &str) -> RatekeeperResult<QuotaSnapshot> {
        self.update(provider, target, |state, limit| Self::snapshot_of(state, limit))
    }

    /// Full state of `target`, including archived periods.
    ///
    /// # Errors
    ///
    /// Returns a state error if shared state cannot be accessed.
    pub fn state(&self, provider: &str, target: &str) -> RatekeeperResult<QuotaState> {
        self.update(provider, target, |state, _| state.clone())
    }

    /// Write the state of every target this tracker has charged to `sink`.
    ///
    /// Returns the number of blobs written.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or the sink fails.
    #[instrument(skip(self, sink))]
    pub fn persist(&self, sink: &dyn PersistenceSink) -> RatekeeperResult<usize> {
        let targets: Vec<(String, String)> = self.touched.lock().iter().cloned().collect();
        let mut blobs = Vec::with_capacity(targets.len());
        for (provider, target) in targets {
            let state = self.state(&provider, &target)?;
            let value = serde_json::to_value(&state)
                .map_err(|e| StateError::serialization(Self::state_key(&provider, &target), e))?;
            blobs.push(PersistedBlob {
                provider,
                target,
                period_id: state.period_id,
                state: value,
            });
        }
        if !blobs.is_empty() {
            sink.store(&blobs)?;
        }
        debug!(count = blobs.len(), "Persisted quota states");
        Ok(blobs.len())
    }

    /// Load persisted state from `sink`, reconciling it against the current
    /// period: blobs from a stale period are archived, current ones are
    /// merged (keeping the larger counter).
    ///
    /// Returns the number of blobs applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink fails or a blob cannot be decoded.
    #[instrument(skip(self, sink))]
    pub fn restore(&self, sink: &dyn PersistenceSink) -> RatekeeperResult<usize> {
        let blobs = sink.load_all()?;
        let count = blobs.len();
        for blob in blobs {
            let key = Self::state_key(&blob.provider, &blob.target);
            let persisted: QuotaState =
                serde_json::from_value(blob.state).map_err(|e| StateError::serialization(key, e))?;
            let stale = self.update(&blob.provider, &blob.target, |state, _| {
                let stale = persisted.period_id != state.period_id;
                state.absorb(persisted);
                stale
            })?;
            self.touch(&blob.provider, &blob.target);
            debug!(
                provider = %blob.provider,
                target = %blob.target,
                period = %blob.period_id,
                stale,
                "Restored quota state"
            );
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_calendar_period_before_reset_day_belongs_to_previous_month() {
        let policy = QuotaPolicy::calendar(15, "UTC").unwrap();
        assert_eq!(policy.period_id(at("2024-03-14T23:59:59Z")), "2024-02");
        assert_eq!(policy.period_id(at("2024-03-15T00:00:00Z")), "2024-03");
        assert_eq!(policy.period_id(at("2024-01-02T00:00:00Z")), "2023-12");
        assert_eq!(
            policy.period_start(at("2024-03-20T08:00:00Z")),
            at("2024-03-15T00:00:00Z")
        );
    }

    #[test]
    fn test_calendar_period_uses_reset_timezone() {
        let policy = QuotaPolicy::calendar(1, "America/New_York").unwrap();
        // 03:00 UTC on the 1st is still the previous evening in New York.
        assert_eq!(policy.period_id(at("2024-06-01T03:00:00Z")), "2024-05");
        assert_eq!(policy.period_id(at("2024-06-01T05:00:00Z")), "2024-06");
    }

    #[test]
    fn test_rolling_periods_are_fixed_length() {
        let policy = QuotaPolicy::rolling(30).unwrap();
        let start = policy.period_start(at("2024-06-10T12:00:00Z"));
        let next = start + chrono::Duration::days(30);
        assert_eq!(policy.period_id(start), policy.period_id(at("2024-06-10T12:00:00Z")));
        assert_ne!(policy.period_id(start), policy.period_id(next));
    }

    #[test]
    fn test_policy_validation() {
        assert!(QuotaPolicy::calendar(0, "UTC").is_err());
        assert!(QuotaPolicy::calendar(29, "UTC").is_err());
        assert!(QuotaPolicy::calendar(1, "Mars/Olympus").is_err());
        assert!(QuotaPolicy::rolling(0).is_err());
    }

    #[test]
    fn test_threshold_validation() {
        let limit = QuotaLimit::new(1000);
        assert!(limit.clone().with_thresholds(vec![]).is_err());
        assert!(limit.clone().with_thresholds(vec![90.0, 80.0]).is_err());
        assert!(limit.clone().with_thresholds(vec![50.0, 120.0]).is_err());
        let ok = limit.with_thresholds(vec![50.0, 75.0]).unwrap();
        assert_eq!(ok.block_threshold(), 75.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = QuotaState::default();
        for month in 0..20 {
            state.roll_to("azure", "gpt-4", &format!("p{}", month), Utc::now());
        }
        assert_eq!(state.history.len(), HISTORY_LEN);
        assert_eq!(state.history.last().unwrap().period_id, "p18");
    }
}
