//! Sliding-window admission control.
//!
//! Each [`LimitKey`] owns a time-ordered list of [`UsageRecord`]s. On every
//! check, entries older than the window are dropped first, then the new cost
//! is compared against `limit_value * burst_allowance`. Concurrency limits
//! keep an in-flight counter instead of a window.
//!
//! Admission over several limits (RPM and TPM of the same target, say) is
//! all-or-nothing: every key is checked under its lock and entries are only
//! appended when all of them admit.

use crate::ParallelCoordinator;
use chrono::{DateTime, Utc};
use ratekeeper_core::{Clock, LimitKey, LimitType, RateLimitConfig, UsageRecord};
use ratekeeper_error::{RateLimitError, RateLimitErrorKind, RatekeeperResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

/// Poll interval while waiting for a concurrency slot.
pub const CONCURRENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const MIN_WAIT: Duration = Duration::from_millis(1);

/// Shared state of one limit key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    /// Admitted requests still inside the window, oldest first
    #[serde(default)]
    pub entries: VecDeque<UsageRecord>,
    /// Requests currently holding a concurrency slot
    #[serde(default)]
    pub in_flight: u64,
}

impl WindowState {
    /// Drop entries that are no longer inside `window` at `now`.
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let Ok(window) = chrono::Duration::from_std(window) else {
            return;
        };
        while self
            .entries
            .front()
            .is_some_and(|entry| now - entry.timestamp >= window)
        {
            self.entries.pop_front();
        }
    }

    /// Total cost currently charged to the window.
    pub fn used(&self) -> u64 {
        self.entries.iter().map(|entry| entry.cost).sum()
    }

    /// How long until `cost` more fits under `config`, or `None` if it fits now.
    ///
    /// Assumes [`prune`](Self::prune) has run at `now`.
    pub fn wait_for(&self, config: &RateLimitConfig, cost: u64, now: DateTime<Utc>) -> Option<Duration> {
        let capacity = config.capacity();
        if *config.limit_type() == LimitType::Concurrent {
            return ((self.in_flight + cost) as f64 > capacity).then_some(CONCURRENT_POLL_INTERVAL);
        }

        let used = self.used();
        if ((used + cost) as f64) <= capacity {
            return None;
        }

        // Find the entry whose expiry frees enough room.
        let mut freed = 0u64;
        for entry in &self.entries {
            freed += entry.cost;
            if ((used - freed + cost) as f64) <= capacity {
                let age = (now - entry.timestamp).to_std().unwrap_or(Duration::ZERO);
                return Some(config.window().saturating_sub(age).max(MIN_WAIT));
            }
        }
        Some((*config.window()).max(MIN_WAIT))
    }
}

/// One limit a request must pass, with the cost charged against it.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRequest {
    /// Limit identity
    pub key: LimitKey,
    /// Limit definition
    pub config: RateLimitConfig,
    /// Cost of this request against the limit
    pub cost: u64,
}

impl WindowRequest {
    /// Build a request whose cost follows the limit type (1 per request, or
    /// `tokens` for token limits).
    pub fn new(key: LimitKey, config: RateLimitConfig, tokens: u64) -> Self {
        let cost = config.limit_type().cost_for(tokens);
        Self { key, config, cost }
    }
}

/// Outcome of a non-blocking admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted and recorded
    Admitted,
    /// Not admitted; retry after this long
    Wait(Duration),
}

/// Per-key sliding-window limiter over shared state.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    coordinator: ParallelCoordinator,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a limiter over `coordinator`'s state, reading time from `clock`.
    pub fn new(coordinator: ParallelCoordinator, clock: Arc<dyn Clock>) -> Self {
        Self { coordinator, clock }
    }

    /// Check every limit in `requests` and, if all admit, record the request
    /// under `id`.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitExceeded` if a single request costs more than a
    /// limit's capacity (it could never be admitted), or a state error.
    #[instrument(skip(self, requests), fields(limits = requests.len(), %id))]
    pub fn try_acquire(&self, requests: &[WindowRequest], id: Uuid) -> RatekeeperResult<Admission> {
        for request in requests {
            if request.cost as f64 > request.config.capacity() {
                return Err(RateLimitError::new(RateLimitErrorKind::RateLimitExceeded(format!(
                    "{} request cost {} exceeds capacity {}",
                    request.key,
                    request.cost,
                    request.config.capacity()
                )))
                .into());
            }
        }

        let keys: Vec<String> = requests
            .iter()
            .map(|request| ParallelCoordinator::state_key(&request.key))
            .collect();
        let now = self.clock.now();

        let admission = self.coordinator.with_states(&keys, |states: &mut [WindowState]| {
            let mut wait: Option<Duration> = None;
            for (request, state) in requests.iter().zip(states.iter_mut()) {
                state.prune(now, *request.config.window());
                if let Some(needed) = state.wait_for(&request.config, request.cost, now) {
                    trace!(key = %request.key, wait_ms = needed.as_millis() as u64, "Limit full");
                    wait = Some(wait.map_or(needed, |w| w.max(needed)));
                }
            }
            if let Some(wait) = wait {
                return Admission::Wait(wait);
            }

            for (request, state) in requests.iter().zip(states.iter_mut()) {
                if *request.config.limit_type() == LimitType::Concurrent {
                    state.in_flight += request.cost;
                } else {
                    state.entries.push_back(UsageRecord {
                        id,
                        timestamp: now,
                        cost: request.cost,
                        provider: request.key.provider.clone(),
                        target: request.key.target.clone(),
                    });
                }
            }
            Admission::Admitted
        })?;

        Ok(admission)
    }

    /// Wait until every limit in `requests` admits, then record the request.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitExceeded` if the wait would outlast `timeout`.
    #[instrument(skip(self, requests), fields(limits = requests.len(), %id))]
    pub async fn acquire(
        &self,
        requests: &[WindowRequest],
        id: Uuid,
        timeout: Option<Duration>,
    ) -> RatekeeperResult<()> {
        let deadline = timeout.map(|t| self.deadline(t));
        loop {
            match self.try_acquire(requests, id)? {
                Admission::Admitted => return Ok(()),
                Admission::Wait(wait) => {
                    self.check_deadline(requests, deadline, wait)?;
                    debug!(wait_ms = wait.as_millis() as u64, "Waiting for window capacity");
                    self.clock.sleep(wait).await;
                }
            }
        }
    }

    /// Blocking version of [`acquire`](Self::acquire) for OS threads.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitExceeded` if the wait would outlast `timeout`.
    #[instrument(skip(self, requests), fields(limits = requests.len(), %id))]
    pub fn acquire_blocking(
        &self,
        requests: &[WindowRequest],
        id: Uuid,
        timeout: Option<Duration>,
    ) -> RatekeeperResult<()> {
        let deadline = timeout.map(|t| self.deadline(t));
        loop {
            match self.try_acquire(requests, id)? {
                Admission::Admitted => return Ok(()),
                Admission::Wait(wait) => {
                    self.check_deadline(requests, deadline, wait)?;
                    debug!(wait_ms = wait.as_millis() as u64, "Blocking for window capacity");
                    self.clock.sleep_blocking(wait);
                }
            }
        }
    }

    /// Replace the cost recorded for request `id` under `key`.
    ///
    /// Returns whether a matching entry was still in the window.
    ///
    /// # Errors
    ///
    /// Returns a state error if shared state cannot be accessed.
    #[instrument(skip(self), fields(%key))]
    pub fn amend(&self, key: &LimitKey, id: Uuid, cost: u64) -> RatekeeperResult<bool> {
        let state_key = ParallelCoordinator::state_key(key);
        self.coordinator.with_state(&state_key, |state: &mut WindowState| {
            match state.entries.iter_mut().find(|entry| entry.id == id) {
                Some(entry) => {
                    trace!(from = entry.cost, to = cost, "Reconciling window entry");
                    entry.cost = cost;
                    true
                }
                None => false,
            }
        })
    }

    /// Give back `cost` concurrency slots under `key`.
    ///
    /// # Errors
    ///
    /// Returns a state error if shared state cannot be accessed.
    #[instrument(skip(self), fields(%key))]
    pub fn release(&self, key: &LimitKey, cost: u64) -> RatekeeperResult<()> {
        let state_key = ParallelCoordinator::state_key(key);
        self.coordinator.with_state(&state_key, |state: &mut WindowState| {
            state.in_flight = state.in_flight.saturating_sub(cost);
        })
    }

    /// Cost currently charged under `key` (window total, or in-flight count
    /// for concurrency limits).
    ///
    /// # Errors
    ///
    /// Returns a state error if shared state cannot be accessed.
    pub fn current_usage(&self, key: &LimitKey, config: &RateLimitConfig) -> RatekeeperResult<u64> {
        let state_key = ParallelCoordinator::state_key(key);
        let now = self.clock.now();
        self.coordinator.with_state(&state_key, |state: &mut WindowState| {
            if *config.limit_type() == LimitType::Concurrent {
                state.in_flight
            } else {
                state.prune(now, *config.window());
                state.used()
            }
        })
    }

    fn deadline(&self, timeout: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_add_signed(t))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn check_deadline(
        &self,
        requests: &[WindowRequest],
        deadline: Option<DateTime<Utc>>,
        wait: Duration,
    ) -> RatekeeperResult<()> {
        let Some(deadline) = deadline else {
            return Ok(());
        };
        let remaining = (deadline - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        if wait > remaining {
            let keys: Vec<String> = requests.iter().map(|r| r.key.to_string()).collect();
            debug!(
                wait_ms = wait.as_millis() as u64,
                remaining_ms = remaining.as_millis() as u64,
                "Acquire timed out"
            );
            return Err(RateLimitError::new(RateLimitErrorKind::RateLimitExceeded(format!(
                "{} would exceed limit: wait of {:?} outlasts timeout",
                keys.join(", "),
                wait
            )))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: DateTime<Utc>, cost: u64) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            timestamp: ts,
            cost,
            provider: "openai".into(),
            target: "gpt-4".into(),
        }
    }

    #[test]
    fn test_prune_drops_entries_at_window_edge() {
        let now = Utc::now();
        let mut state = WindowState::default();
        state.entries.push_back(record(now - chrono::Duration::seconds(60), 1));
        state.entries.push_back(record(now - chrono::Duration::seconds(59), 1));
        state.prune(now, Duration::from_secs(60));
        assert_eq!(state.entries.len(), 1);
    }

    #[test]
    fn test_wait_counts_from_entry_that_frees_room() {
        let now = Utc::now();
        let config = RateLimitConfig::new(LimitType::Tpm, 100.0).unwrap();
        let mut state = WindowState::default();
        state.entries.push_back(record(now - chrono::Duration::seconds(50), 30));
        state.entries.push_back(record(now - chrono::Duration::seconds(20), 60));

        // 90 used; 50 more needs both entries gone, so wait for the second.
        let wait = state.wait_for(&config, 50, now).unwrap();
        assert_eq!(wait, Duration::from_secs(40));

        // 20 more only needs the first to expire.
        let wait = state.wait_for(&config, 20, now).unwrap();
        assert_eq!(wait, Duration::from_secs(10));

        assert!(state.wait_for(&config, 10, now).is_none());
    }

    #[test]
    fn test_concurrent_limit_uses_in_flight_counter() {
        let config = RateLimitConfig::new(LimitType::Concurrent, 2.0).unwrap();
        let mut state = WindowState::default();
        let now = Utc::now();
        assert!(state.wait_for(&config, 1, now).is_none());
        state.in_flight = 2;
        assert_eq!(state.wait_for(&config, 1, now), Some(CONCURRENT_POLL_INTERVAL));
    }
}
