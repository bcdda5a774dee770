//! Cost circuit breaker.
//!
//! Spend records accumulate in a bounded ring buffer; window aggregates
//! (session, trailing hour, day, month) are computed lazily at check time.
//! Pairing `check` with `record_spend` is the pipeline's responsibility —
//! the breaker itself is not transactional with the model call.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::clock::{system_clock, ClockFn};
use crate::persist::KvStore;
use crate::pricing;
use std::sync::Arc;

/// Ring buffer capacity for spend records.
const RING_CAPACITY: usize = 10_000;

/// Aggregation window for spend limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerWindow {
    Session,
    Hour,
    Day,
    Month,
}

impl BreakerWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    const ALL: [BreakerWindow; 4] = [Self::Session, Self::Hour, Self::Day, Self::Month];
}

impl std::fmt::Display for BreakerWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-window dollar limits. Unset windows are unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerLimits {
    pub per_session: Option<f64>,
    pub per_hour: Option<f64>,
    pub per_day: Option<f64>,
    pub per_month: Option<f64>,
}

impl BreakerLimits {
    pub fn is_empty(&self) -> bool {
        self.per_session.is_none()
            && self.per_hour.is_none()
            && self.per_day.is_none()
            && self.per_month.is_none()
    }

    fn for_window(&self, window: BreakerWindow) -> Option<f64> {
        match window {
            BreakerWindow::Session => self.per_session,
            BreakerWindow::Hour => self.per_hour,
            BreakerWindow::Day => self.per_day,
            BreakerWindow::Month => self.per_month,
        }
    }
}

/// What to do when a window limit would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BreakerAction {
    /// Emit a warning event but admit the request
    Warn,
    /// Deny the request
    #[default]
    Stop,
}

/// Breaker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub limits: BreakerLimits,
    pub action: BreakerAction,
    pub persist: bool,
}

/// One recorded spend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendRecord {
    pub cost: f64,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerDecision {
    pub allowed: bool,
    /// First window whose limit the projection crossed
    pub window: Option<BreakerWindow>,
    pub reason: Option<String>,
    /// Estimated cost of the checked call
    pub estimated_cost: f64,
    /// Projected spend in the offending window
    pub projected: f64,
    /// Limit of the offending window
    pub limit: Option<f64>,
}

/// Spend and headroom for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStatus {
    pub window: BreakerWindow,
    pub spend: f64,
    pub limit: Option<f64>,
    pub remaining: Option<f64>,
    pub tripped: bool,
}

struct BreakerState {
    records: VecDeque<SpendRecord>,
    /// Running session total, immune to ring eviction
    session_spend: f64,
}

/// Windowed cost circuit breaker.
pub struct CostBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    store: Option<Arc<dyn KvStore>>,
    clock: ClockFn,
}

impl CostBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                records: VecDeque::new(),
                session_spend: 0.0,
            }),
            store: None,
            clock: system_clock(),
        }
    }

    /// Attach a persistent store for spend records.
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub(crate) fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }

    /// Configured response to a crossed limit.
    pub fn action(&self) -> BreakerAction {
        self.config.action
    }

    fn window_spend(state: &BreakerState, window: BreakerWindow, now: DateTime<Utc>) -> f64 {
        let horizon = match window {
            BreakerWindow::Session => return state.session_spend,
            BreakerWindow::Hour => now - Duration::hours(1),
            BreakerWindow::Day => now - Duration::days(1),
            BreakerWindow::Month => now - Duration::days(30),
        };
        state
            .records
            .iter()
            .rev()
            .take_while(|r| r.timestamp > horizon)
            .map(|r| r.cost)
            .sum()
    }

    /// Check whether a call with the given token shape fits every
    /// configured window. Allowed iff `spend + estimate < limit` for each.
    pub fn check(
        &self,
        model: &str,
        estimated_input_tokens: u64,
        expected_output_tokens: u64,
    ) -> BreakerDecision {
        let estimated_cost = pricing::cost(model, estimated_input_tokens, expected_output_tokens);
        let now = (self.clock)();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        for window in BreakerWindow::ALL {
            let Some(limit) = self.config.limits.for_window(window) else {
                continue;
            };
            let spend = Self::window_spend(&state, window, now);
            let projected = spend + estimated_cost;
            if projected >= limit {
                tracing::warn!(%window, projected, limit, "breaker limit reached");
                return BreakerDecision {
                    allowed: false,
                    window: Some(window),
                    reason: Some(format!(
                        "{} spend ${:.6} + estimated ${:.6} reaches limit ${:.6}",
                        window, spend, estimated_cost, limit
                    )),
                    estimated_cost,
                    projected,
                    limit: Some(limit),
                };
            }
        }

        BreakerDecision {
            allowed: true,
            window: None,
            reason: None,
            estimated_cost,
            projected: 0.0,
            limit: None,
        }
    }

    /// Record an actual spend, advancing every window aggregate.
    pub fn record_spend(&self, cost: f64, model: &str) {
        let now = (self.clock)();
        let records_snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.session_spend += cost;
            state.records.push_back(SpendRecord {
                cost,
                model: model.to_string(),
                timestamp: now,
            });
            while state.records.len() > RING_CAPACITY {
                state.records.pop_front();
            }
            if self.config.persist && self.store.is_some() {
                Some(state.records.iter().cloned().collect::<Vec<_>>())
            } else {
                None
            }
        };

        // Persistence is best-effort and never blocks the caller.
        if let (Some(records), Some(store)) = (records_snapshot, self.store.clone()) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    match serde_json::to_string(&records) {
                        Ok(json) => {
                            if let Err(err) = store.set("breaker:spend", &json).await {
                                tracing::debug!(%err, "breaker persist failed");
                            }
                        }
                        Err(err) => tracing::debug!(%err, "breaker records serialize failed"),
                    }
                });
            }
        }
    }

    /// Reload persisted spend records into the hour/day/month windows. The
    /// session window always starts fresh. A failed load starts from zero.
    pub async fn hydrate(&self) {
        if !self.config.persist {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let records = match store.get("breaker:spend").await {
            Ok(Some(json)) => match serde_json::from_str::<Vec<SpendRecord>>(&json) {
                Ok(records) => records,
                Err(err) => {
                    tracing::debug!(%err, "breaker hydrate failed, starting empty");
                    return;
                }
            },
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(%err, "breaker hydrate failed, starting empty");
                return;
            }
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.records = records.into();
        while state.records.len() > RING_CAPACITY {
            state.records.pop_front();
        }
    }

    /// Per-window spend, remaining headroom, and tripped flags.
    pub fn status(&self) -> Vec<WindowStatus> {
        let now = (self.clock)();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        BreakerWindow::ALL
            .into_iter()
            .map(|window| {
                let spend = Self::window_spend(&state, window, now);
                let limit = self.config.limits.for_window(window);
                WindowStatus {
                    window,
                    spend,
                    limit,
                    remaining: limit.map(|l| (l - spend).max(0.0)),
                    tripped: limit.is_some_and(|l| spend >= l),
                }
            })
            .collect()
    }

    /// Total spend recorded this session.
    pub fn session_spend(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .session_spend
    }
}
