//! Per-user spend budgets with synchronous in-flight reservations.
//!
//! Admission eagerly reserves the estimated cost against the user's
//! budget; settlement replaces the reservation with the actual cost. A
//! request that fails on any path must release its reservation exactly
//! once — the pipeline guarantees the pairing.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::clock::{system_clock, ClockFn};
use crate::error::BlockCode;
use crate::events::{ShieldEvent, ShieldEvents};
use crate::persist::KvStore;
use crate::pricing;

/// Maximum users tracked in memory; overflow evicts first-seen users.
const MAX_TRACKED_USERS: usize = 5_000;
/// Maximum spend records across all users; overflow evicts oldest-first.
const MAX_RECORDS: usize = 50_000;
/// Maximum retained warning-dedup entries.
const MAX_WARNING_ENTRIES: usize = 500;
/// Warning entries older than this are evicted before FIFO order applies.
const WARNING_MAX_AGE_HOURS: i64 = 24;
/// Re-warn for the same (user, limit) at most once per hour.
const WARNING_DEDUPE_HOURS: i64 = 1;
/// Utilization fraction at which a warning fires.
const WARNING_THRESHOLD: f64 = 0.8;

/// Dollar limits for one user. A limit of zero means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBudget {
    pub daily: f64,
    pub monthly: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

impl UserBudget {
    pub fn new(daily: f64, monthly: f64) -> Self {
        Self {
            daily,
            monthly,
            tier: None,
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }
}

/// Budget configuration: per-user limits, a default, and tier pinning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetsConfig {
    /// Specific per-user budgets; take precedence over the default
    pub users: HashMap<String, UserBudget>,
    /// Fallback budget for users without a specific one
    pub default_budget: Option<UserBudget>,
    /// Tier name to pinned model id
    pub tier_models: HashMap<String, String>,
    /// Persist spend records through the configured store
    pub persist: bool,
}

/// One recorded user spend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSpendRecord {
    pub user_id: String,
    pub cost: f64,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

/// Spend over the trailing daily/monthly windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpendWindows {
    pub daily: f64,
    pub monthly: f64,
}

/// Remaining headroom per window; `None` when the window is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RemainingBudget {
    pub daily: Option<f64>,
    pub monthly: Option<f64>,
}

/// Utilization per window, capped at 999 to avoid infinities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentUsed {
    pub daily: f64,
    pub monthly: f64,
}

/// Full budget picture for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBudgetStatus {
    pub user_id: String,
    pub limits: Option<UserBudget>,
    pub spend: SpendWindows,
    pub inflight: f64,
    pub remaining: RemainingBudget,
    pub percent_used: PercentUsed,
    pub is_over_budget: bool,
    pub tier: Option<String>,
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub code: Option<BlockCode>,
    pub reason: Option<String>,
    /// Amount reserved in-flight on admission; zero when denied
    pub reserved: f64,
    pub status: UserBudgetStatus,
}

#[derive(Default)]
struct UserState {
    records: VecDeque<UserSpendRecord>,
    inflight: f64,
}

#[derive(Default)]
struct BudgetState {
    users: HashMap<String, UserState>,
    /// First-seen order for user-cap eviction
    user_order: VecDeque<String>,
    /// Per-record user ids in insertion order, for global FIFO eviction
    record_order: VecDeque<String>,
    total_records: usize,
    warnings: HashMap<(String, String), DateTime<Utc>>,
    warning_order: VecDeque<(String, String)>,
}

/// Tracks spend, reservations, and limits per user.
pub struct UserBudgetManager {
    config: BudgetsConfig,
    state: Mutex<BudgetState>,
    events: Arc<ShieldEvents>,
    store: Option<Arc<dyn KvStore>>,
    clock: ClockFn,
}

impl UserBudgetManager {
    pub fn new(config: BudgetsConfig, events: Arc<ShieldEvents>) -> Self {
        Self {
            config,
            state: Mutex::new(BudgetState::default()),
            events,
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

    /// Resolve the limits that apply to a user: specific, then default,
    /// then unlimited.
    fn limits_for(&self, user_id: &str) -> Option<UserBudget> {
        self.config
            .users
            .get(user_id)
            .cloned()
            .or_else(|| self.config.default_budget.clone())
    }

    fn window_spend(state: &UserState, now: DateTime<Utc>) -> SpendWindows {
        let day_horizon = now - Duration::hours(24);
        let month_horizon = now - Duration::days(30);
        let mut windows = SpendWindows::default();
        for record in state.records.iter().rev() {
            if record.timestamp <= month_horizon {
                break;
            }
            windows.monthly += record.cost;
            if record.timestamp > day_horizon {
                windows.daily += record.cost;
            }
        }
        windows
    }

    fn ensure_user(state: &mut BudgetState, user_id: &str) {
        if state.users.contains_key(user_id) {
            return;
        }
        while state.users.len() >= MAX_TRACKED_USERS {
            let Some(evicted) = state.user_order.pop_front() else {
                break;
            };
            if let Some(gone) = state.users.remove(&evicted) {
                state.total_records -= gone.records.len();
            }
        }
        state.users.insert(user_id.to_string(), UserState::default());
        state.user_order.push_back(user_id.to_string());
    }

    fn evict_records_over_cap(state: &mut BudgetState) {
        while state.total_records > MAX_RECORDS {
            let Some(owner) = state.record_order.pop_front() else {
                break;
            };
            // Stale order entries (user already evicted) are skipped; the
            // count was already adjusted when the user went away.
            if let Some(user) = state.users.get_mut(&owner) {
                if user.records.pop_front().is_some() {
                    state.total_records -= 1;
                }
            }
        }
    }

    fn build_status(
        user_id: &str,
        limits: Option<&UserBudget>,
        spend: SpendWindows,
        inflight: f64,
    ) -> UserBudgetStatus {
        let percent = |spent: f64, limit: f64| -> f64 {
            if limit > 0.0 {
                ((spent / limit) * 100.0).min(999.0)
            } else {
                0.0
            }
        };

        let (remaining, percent_used, is_over_budget) = match limits {
            Some(limits) => {
                let remaining = RemainingBudget {
                    daily: (limits.daily > 0.0).then(|| (limits.daily - spend.daily).max(0.0)),
                    monthly: (limits.monthly > 0.0)
                        .then(|| (limits.monthly - spend.monthly).max(0.0)),
                };
                let percent_used = PercentUsed {
                    daily: percent(spend.daily, limits.daily),
                    monthly: percent(spend.monthly, limits.monthly),
                };
                let over = (limits.daily > 0.0 && spend.daily + inflight >= limits.daily)
                    || (limits.monthly > 0.0 && spend.monthly + inflight >= limits.monthly);
                (remaining, percent_used, over)
            }
            None => (RemainingBudget::default(), PercentUsed::default(), false),
        };

        UserBudgetStatus {
            user_id: user_id.to_string(),
            limits: limits.cloned(),
            spend,
            inflight,
            remaining,
            percent_used,
            is_over_budget,
            tier: limits.and_then(|l| l.tier.clone()),
        }
    }

    /// Record a warning for (user, limit) unless one fired recently.
    /// Returns the event to emit once the state lock is released.
    fn maybe_warn(
        state: &mut BudgetState,
        user_id: &str,
        limit_type: &str,
        percent_used: f64,
        now: DateTime<Utc>,
    ) -> Option<ShieldEvent> {
        let key = (user_id.to_string(), limit_type.to_string());
        let dedupe = Duration::hours(WARNING_DEDUPE_HOURS);
        if state
            .warnings
            .get(&key)
            .is_some_and(|last| now - *last < dedupe)
        {
            return None;
        }

        // Bound the warning map: evict aged entries first, then FIFO.
        if state.warnings.len() >= MAX_WARNING_ENTRIES {
            let age_horizon = now - Duration::hours(WARNING_MAX_AGE_HOURS);
            let aged: Vec<(String, String)> = state
                .warnings
                .iter()
                .filter(|(_, last)| **last < age_horizon)
                .map(|(k, _)| k.clone())
                .collect();
            if aged.is_empty() {
                while state.warnings.len() >= MAX_WARNING_ENTRIES {
                    let Some(oldest) = state.warning_order.pop_front() else {
                        break;
                    };
                    state.warnings.remove(&oldest);
                }
            } else {
                for key in aged {
                    state.warnings.remove(&key);
                    state.warning_order.retain(|k| *k != key);
                }
            }
        }

        state.warnings.insert(key.clone(), now);
        state.warning_order.push_back(key);

        Some(ShieldEvent::UserBudgetWarning {
            user_id: user_id.to_string(),
            limit_type: limit_type.to_string(),
            percent_used,
        })
    }

    /// Check admission for a call and, when admitted, synchronously reserve
    /// the estimated cost in-flight.
    pub fn check(
        &self,
        user_id: &str,
        model: &str,
        estimated_input_tokens: u64,
        expected_output_tokens: u64,
    ) -> BudgetCheck {
        let estimate = pricing::cost(model, estimated_input_tokens, expected_output_tokens);
        let limits = self.limits_for(user_id);
        let now = (self.clock)();

        // Events are collected under the lock and emitted after it drops so
        // a subscriber may call back into the manager.
        let mut deferred: Option<ShieldEvent> = None;

        let check = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            Self::ensure_user(&mut state, user_id);
            let user = state.users.get(user_id).expect("user ensured above");
            let spend = Self::window_spend(user, now);
            let inflight = user.inflight;

            let denial = limits.as_ref().and_then(|limits| {
                if limits.daily > 0.0 && spend.daily + inflight + estimate > limits.daily {
                    Some((
                        BlockCode::BudgetDailyExceeded,
                        "daily",
                        spend.daily,
                        limits.daily,
                    ))
                } else if limits.monthly > 0.0
                    && spend.monthly + inflight + estimate > limits.monthly
                {
                    Some((
                        BlockCode::BudgetMonthlyExceeded,
                        "monthly",
                        spend.monthly,
                        limits.monthly,
                    ))
                } else {
                    None
                }
            });

            if let Some((code, limit_type, spent, limit)) = denial {
                let reason = format!(
                    "{} budget for {}: spent ${:.6} + inflight ${:.6} + estimated ${:.6} exceeds ${:.6}",
                    limit_type, user_id, spent, inflight, estimate, limit
                );
                tracing::warn!(user_id, limit_type, "user budget exceeded");
                deferred = Some(ShieldEvent::UserBudgetExceeded {
                    user_id: user_id.to_string(),
                    limit_type: limit_type.to_string(),
                    message: reason.clone(),
                });
                let status = Self::build_status(user_id, limits.as_ref(), spend, inflight);
                BudgetCheck {
                    allowed: false,
                    code: Some(code),
                    reason: Some(reason),
                    reserved: 0.0,
                    status,
                }
            } else {
                // Approaching-limit warnings fire on admission.
                if let Some(limits) = &limits {
                    if limits.daily > 0.0
                        && (spend.daily + inflight + estimate) / limits.daily >= WARNING_THRESHOLD
                    {
                        let percent =
                            ((spend.daily + inflight + estimate) / limits.daily * 100.0).min(999.0);
                        deferred = Self::maybe_warn(&mut state, user_id, "daily", percent, now);
                    } else if limits.monthly > 0.0
                        && (spend.monthly + inflight + estimate) / limits.monthly
                            >= WARNING_THRESHOLD
                    {
                        let percent = ((spend.monthly + inflight + estimate) / limits.monthly
                            * 100.0)
                            .min(999.0);
                        deferred = Self::maybe_warn(&mut state, user_id, "monthly", percent, now);
                    }
                }

                let user = state.users.get_mut(user_id).expect("user ensured above");
                user.inflight += estimate;
                let status = Self::build_status(user_id, limits.as_ref(), spend, user.inflight);

                BudgetCheck {
                    allowed: true,
                    code: None,
                    reason: None,
                    reserved: estimate,
                    status,
                }
            }
        };

        if let Some(event) = deferred {
            self.events.emit(event);
        }
        check
    }

    /// Settle a call: release the reservation and record the actual cost.
    /// A zero cost is valid — it releases the reservation without recording
    /// a charge.
    pub fn record_spend(&self, user_id: &str, actual_cost: f64, model: &str, reserved: f64) {
        let now = (self.clock)();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            Self::ensure_user(&mut state, user_id);

            let user = state.users.get_mut(user_id).expect("user ensured above");
            user.inflight = (user.inflight - reserved).max(0.0);

            if actual_cost > 0.0 {
                user.records.push_back(UserSpendRecord {
                    user_id: user_id.to_string(),
                    cost: actual_cost,
                    model: model.to_string(),
                    timestamp: now,
                });
                state.record_order.push_back(user_id.to_string());
                state.total_records += 1;
                Self::evict_records_over_cap(&mut state);
            }
        }

        if actual_cost > 0.0 {
            self.events.emit(ShieldEvent::UserBudgetSpend {
                user_id: user_id.to_string(),
                cost: actual_cost,
                model: model.to_string(),
            });
            self.persist_user(user_id);
        }
    }

    /// Release a reservation without recording any spend. Used on pre-call
    /// and mid-call failures.
    pub fn release_inflight(&self, user_id: &str, amount: f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(user) = state.users.get_mut(user_id) {
            user.inflight = (user.inflight - amount).max(0.0);
        }
    }

    /// The model pinned to this user's tier, if tier mapping is configured.
    pub fn model_for_user(&self, user_id: &str) -> Option<String> {
        let tier = self.limits_for(user_id)?.tier?;
        self.config.tier_models.get(&tier).cloned()
    }

    /// Current spend, reservations, and headroom for a user.
    pub fn status(&self, user_id: &str) -> UserBudgetStatus {
        let limits = self.limits_for(user_id);
        let now = (self.clock)();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (spend, inflight) = state
            .users
            .get(user_id)
            .map(|u| (Self::window_spend(u, now), u.inflight))
            .unwrap_or_default();
        Self::build_status(user_id, limits.as_ref(), spend, inflight)
    }

    /// Current in-flight reservation total for a user.
    pub fn inflight(&self, user_id: &str) -> f64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.users.get(user_id).map(|u| u.inflight).unwrap_or(0.0)
    }

    fn persist_user(&self, user_id: &str) {
        if !self.config.persist {
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };
        let records: Vec<UserSpendRecord> = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.users.get(user_id) {
                Some(user) => user.records.iter().cloned().collect(),
                None => return,
            }
        };
        let key = format!("budget:user:{user_id}");
        // Writes are best-effort and never block settlement.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match serde_json::to_string(&records) {
                    Ok(json) => {
                        if let Err(err) = store.set(&key, &json).await {
                            tracing::debug!(%err, "budget persist failed");
                        }
                    }
                    Err(err) => tracing::debug!(%err, "budget records serialize failed"),
                }
            });
        }
    }

    /// Reload persisted spend records. A hydrate failure starts from zero.
    pub async fn hydrate(&self) {
        if !self.config.persist {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };

        let keys = match store.keys("budget:user:").await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::debug!(%err, "budget hydrate failed, starting empty");
                return;
            }
        };

        for key in keys {
            let Ok(Some(json)) = store.get(&key).await else {
                continue;
            };
            let Ok(records) = serde_json::from_str::<Vec<UserSpendRecord>>(&json) else {
                continue;
            };
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            for record in records {
                Self::ensure_user(&mut state, &record.user_id);
                state.record_order.push_back(record.user_id.clone());
                state.total_records += 1;
                state
                    .users
                    .get_mut(&record.user_id)
                    .expect("user ensured above")
                    .records
                    .push_back(record);
            }
            Self::evict_records_over_cap(&mut state);
        }
    }
}
