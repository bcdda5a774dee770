//! Request guard: pre-flight admission checks and debouncing.
//!
//! The guard rejects calls that are too short, repeat a recent prompt,
//! exceed the per-minute rate, would blow the trailing hourly cost
//! ceiling, or duplicate a prompt already in flight.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::cache::normalize;
use crate::clock::{system_clock, ClockFn};
use crate::error::Result;
use crate::pricing;
use crate::tokens::estimate_tokens;

/// Guard configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Identical prompts within this window are rejected
    pub debounce_ms: u64,
    /// Allowed requests in any trailing minute
    pub max_requests_per_minute: u32,
    /// Dollar ceiling for the trailing hour
    pub max_cost_per_hour: f64,
    /// Minimum prompt length in characters
    pub min_input_length: usize,
    /// Reject a prompt already being processed
    pub deduplicate_in_flight: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            max_requests_per_minute: 60,
            max_cost_per_hour: 10.0,
            min_input_length: 0,
            deduplicate_in_flight: true,
        }
    }
}

/// Result of a guard check.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub estimated_cost: f64,
}

/// Guard counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardStats {
    pub requests_last_minute: usize,
    pub cost_last_hour: f64,
    pub in_flight: usize,
    pub total_allowed: u64,
    pub total_blocked: u64,
}

#[derive(Default)]
struct GuardState {
    /// Last time each normalized prompt passed a check
    last_seen: HashMap<String, DateTime<Utc>>,
    /// Timestamps of allowed requests, pruned to the trailing minute
    request_times: VecDeque<DateTime<Utc>>,
    /// (timestamp, cost) of completed requests, pruned to the trailing hour
    cost_records: VecDeque<(DateTime<Utc>, f64)>,
    /// Normalized prompts currently being processed
    in_flight: HashSet<String>,
    total_allowed: u64,
    total_blocked: u64,
}

/// Pre-flight admission guard.
pub struct RequestGuard {
    config: GuardConfig,
    state: Mutex<GuardState>,
    clock: ClockFn,
}

impl RequestGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GuardState::default()),
            clock: system_clock(),
        }
    }

    pub(crate) fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }

    fn prune(state: &mut GuardState, now: DateTime<Utc>) {
        let minute_ago = now - Duration::minutes(1);
        while state
            .request_times
            .front()
            .is_some_and(|t| *t <= minute_ago)
        {
            state.request_times.pop_front();
        }

        let hour_ago = now - Duration::hours(1);
        while state
            .cost_records
            .front()
            .is_some_and(|(t, _)| *t <= hour_ago)
        {
            state.cost_records.pop_front();
        }
    }

    /// Check a prompt for admission. A passing check is counted toward the
    /// per-minute rate and the debounce history.
    pub fn check(
        &self,
        prompt: &str,
        expected_output_tokens: Option<u64>,
        model: Option<&str>,
    ) -> GuardCheck {
        let estimated_cost = model
            .map(|m| {
                pricing::cost(
                    m,
                    estimate_tokens(prompt) as u64,
                    expected_output_tokens.unwrap_or(0),
                )
            })
            .unwrap_or(0.0);

        let now = (self.clock)();
        let normalized = normalize(prompt);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut state, now);

        let reason = self.rejection_reason(&state, prompt, &normalized, estimated_cost, now);
        if let Some(reason) = reason {
            state.total_blocked += 1;
            tracing::debug!(%reason, "request guard rejected");
            return GuardCheck {
                allowed: false,
                reason: Some(reason),
                estimated_cost,
            };
        }

        state.last_seen.insert(normalized, now);
        state.request_times.push_back(now);
        state.total_allowed += 1;

        GuardCheck {
            allowed: true,
            reason: None,
            estimated_cost,
        }
    }

    fn rejection_reason(
        &self,
        state: &GuardState,
        prompt: &str,
        normalized: &str,
        estimated_cost: f64,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let length = prompt.chars().count();
        if length < self.config.min_input_length {
            return Some(format!(
                "Input too short: {} chars (minimum {})",
                length, self.config.min_input_length
            ));
        }

        let debounce = Duration::milliseconds(self.config.debounce_ms as i64);
        if state
            .last_seen
            .get(normalized)
            .is_some_and(|last| now - *last < debounce)
        {
            return Some(format!(
                "Debounced: identical prompt within {}ms",
                self.config.debounce_ms
            ));
        }

        if state.request_times.len() >= self.config.max_requests_per_minute as usize {
            return Some(format!(
                "Rate limit: {} requests in the last minute (max {})",
                state.request_times.len(),
                self.config.max_requests_per_minute
            ));
        }

        let hour_cost: f64 = state.cost_records.iter().map(|(_, c)| c).sum();
        if hour_cost + estimated_cost > self.config.max_cost_per_hour {
            return Some(format!(
                "Hourly cost ceiling: ${:.4} spent + ${:.4} estimated exceeds ${:.4}",
                hour_cost, estimated_cost, self.config.max_cost_per_hour
            ));
        }

        if self.config.deduplicate_in_flight && state.in_flight.contains(normalized) {
            return Some("Duplicate request already in flight".to_string());
        }

        None
    }

    /// Mark a prompt as in flight.
    pub fn start_request(&self, prompt: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight.insert(normalize(prompt));
    }

    /// Clear a prompt's in-flight mark and record its spend against the
    /// hourly ceiling.
    pub fn complete_request(
        &self,
        prompt: &str,
        input_tokens: u64,
        output_tokens: u64,
        model: Option<&str>,
    ) {
        let now = (self.clock)();
        let cost = model
            .map(|m| pricing::cost(m, input_tokens, output_tokens))
            .unwrap_or(0.0);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight.remove(&normalize(prompt));
        if cost > 0.0 {
            state.cost_records.push_back((now, cost));
        }
    }

    /// Current counters.
    pub fn stats(&self) -> GuardStats {
        let now = (self.clock)();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut state, now);
        GuardStats {
            requests_last_minute: state.request_times.len(),
            cost_last_hour: state.cost_records.iter().map(|(_, c)| c).sum(),
            in_flight: state.in_flight.len(),
            total_allowed: state.total_allowed,
            total_blocked: state.total_blocked,
        }
    }

    /// A debouncer using this guard's configured window.
    pub fn debouncer(&self) -> Debouncer {
        Debouncer::new(std::time::Duration::from_millis(self.config.debounce_ms))
    }
}

struct DebounceState {
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
}

/// Trailing-edge debouncer.
///
/// Each call supersedes any pending one: the superseded call resolves
/// promptly with `None` (never hangs), and only the surviving call runs
/// its closure — so a closure error can only surface on the survivor.
#[derive(Clone)]
pub struct Debouncer {
    window: std::time::Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(DebounceState {
                generation: 0,
                cancel: None,
            })),
        }
    }

    /// Run `f` unless a later call arrives within the window.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (tx, rx) = oneshot::channel();
        let my_generation = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.generation += 1;
            if let Some(previous) = state.cancel.take() {
                let _ = previous.send(());
            }
            state.cancel = Some(tx);
            state.generation
        };

        tokio::select! {
            _ = rx => return Ok(None),
            _ = tokio::time::sleep(self.window) => {}
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.generation != my_generation {
                return Ok(None);
            }
            state.cancel = None;
        }

        f().await.map(Some)
    }
}
