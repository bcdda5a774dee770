//! Shield configuration.
//!
//! Every option is validated at construction time; an invalid value is
//! reported with a path-qualified message and nothing is initialized.

use std::sync::Arc;

use crate::breaker::BreakerConfig;
use crate::budget::{BudgetsConfig, UserBudgetStatus};
use crate::cache::CacheConfig;
use crate::error::{BlockCode, Error, Result};
use crate::guard::GuardConfig;
use crate::ledger::LedgerConfig;
use crate::persist::KvStore;
use crate::prefix::PrefixConfig;
use crate::router::RouterConfig;

/// Which pipeline stages are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModulesConfig {
    pub guard: bool,
    pub cache: bool,
    pub context: bool,
    pub router: bool,
    pub prefix: bool,
    pub ledger: bool,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            guard: true,
            cache: true,
            context: true,
            router: false,
            prefix: true,
            ledger: true,
        }
    }
}

/// Context trimming configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
    /// Input-token ceiling; trimming is skipped when unset
    pub max_input_tokens: Option<usize>,
    /// Tokens reserved for the model's output
    pub reserve_for_output: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: None,
            reserve_for_output: 1_000,
        }
    }
}

/// Details handed to the blocked callback.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedInfo {
    pub code: BlockCode,
    pub reason: String,
    pub estimated_cost: f64,
}

/// Per-call usage handed to the usage callback at settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub saved: f64,
}

pub type BlockedCallback = Arc<dyn Fn(&BlockedInfo) + Send + Sync>;
pub type UsageCallback = Arc<dyn Fn(&UsageReport) + Send + Sync>;
pub type BudgetCallback = Arc<dyn Fn(&UserBudgetStatus) + Send + Sync>;
/// Resolves the current user id. An `Err` or empty id blocks the request
/// with `BUDGET_USER_ID_INVALID`.
pub type UserIdResolver = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// User-budget configuration: the id resolver, the budget table, and
/// optional callbacks.
#[derive(Clone)]
pub struct UserBudgetConfig {
    pub get_user_id: UserIdResolver,
    pub budgets: BudgetsConfig,
    pub on_budget_exceeded: Option<BudgetCallback>,
    pub on_budget_warning: Option<BudgetCallback>,
}

impl UserBudgetConfig {
    pub fn new(get_user_id: UserIdResolver, budgets: BudgetsConfig) -> Self {
        Self {
            get_user_id,
            budgets,
            on_budget_exceeded: None,
            on_budget_warning: None,
        }
    }
}

impl std::fmt::Debug for UserBudgetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserBudgetConfig")
            .field("budgets", &self.budgets)
            .finish_non_exhaustive()
    }
}

/// Full shield configuration.
#[derive(Clone, Default)]
pub struct ShieldConfig {
    pub modules: ModulesConfig,
    pub guard: GuardConfig,
    pub cache: CacheConfig,
    pub context: ContextConfig,
    pub router: RouterConfig,
    pub prefix: PrefixConfig,
    pub ledger: LedgerConfig,
    pub breaker: Option<BreakerConfig>,
    pub user_budget: Option<UserBudgetConfig>,
    /// Pluggable persistence substrate, required by any `persist` flag
    pub store: Option<Arc<dyn KvStore>>,
    pub on_blocked: Option<BlockedCallback>,
    pub on_usage: Option<UsageCallback>,
}

impl std::fmt::Debug for ShieldConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShieldConfig")
            .field("modules", &self.modules)
            .field("guard", &self.guard)
            .field("cache", &self.cache)
            .field("context", &self.context)
            .field("router", &self.router)
            .field("prefix", &self.prefix)
            .field("ledger", &self.ledger)
            .field("breaker", &self.breaker)
            .field("user_budget", &self.user_budget)
            .finish_non_exhaustive()
    }
}

impl ShieldConfig {
    /// Validate every section. Returns the first violation found, with a
    /// path-qualified message.
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_entries == 0 {
            return Err(Error::config("cache.max_entries: must be greater than zero"));
        }
        if self.cache.ttl_ms == 0 {
            return Err(Error::config("cache.ttl_ms: must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(Error::config(
                "cache.similarity_threshold: must be within 0.0..=1.0",
            ));
        }
        if self.cache.persist && self.store.is_none() {
            return Err(Error::config("cache.persist: requires a store"));
        }

        if self.guard.max_requests_per_minute == 0 {
            return Err(Error::config(
                "guard.max_requests_per_minute: must be greater than zero",
            ));
        }
        if self.guard.max_cost_per_hour < 0.0 {
            return Err(Error::config("guard.max_cost_per_hour: must not be negative"));
        }

        if let Some(max) = self.context.max_input_tokens {
            if max <= self.context.reserve_for_output {
                return Err(Error::config(
                    "context.max_input_tokens: must exceed context.reserve_for_output",
                ));
            }
        }

        if self.modules.router {
            if self.router.tiers.is_empty() {
                return Err(Error::config(
                    "router.tiers: must not be empty when modules.router is enabled",
                ));
            }
            for (i, tier) in self.router.tiers.iter().enumerate() {
                if tier.model_id.is_empty() {
                    return Err(Error::config(format!(
                        "router.tiers[{i}].model_id: must not be empty"
                    )));
                }
            }
        }

        if self.ledger.persist && self.store.is_none() {
            return Err(Error::config("ledger.persist: requires a store"));
        }

        if let Some(breaker) = &self.breaker {
            if breaker.limits.is_empty() {
                return Err(Error::config(
                    "breaker.limits: at least one window limit must be set",
                ));
            }
            for (path, limit) in [
                ("per_session", breaker.limits.per_session),
                ("per_hour", breaker.limits.per_hour),
                ("per_day", breaker.limits.per_day),
                ("per_month", breaker.limits.per_month),
            ] {
                if limit.is_some_and(|l| l < 0.0) {
                    return Err(Error::config(format!(
                        "breaker.limits.{path}: must not be negative"
                    )));
                }
            }
            if breaker.persist && self.store.is_none() {
                return Err(Error::config("breaker.persist: requires a store"));
            }
        }

        if let Some(user_budget) = &self.user_budget {
            Self::validate_budgets(&user_budget.budgets)?;
            if user_budget.budgets.persist && self.store.is_none() {
                return Err(Error::config("user_budget.budgets.persist: requires a store"));
            }
        }

        Ok(())
    }

    fn validate_budgets(budgets: &BudgetsConfig) -> Result<()> {
        for (user_id, budget) in &budgets.users {
            if budget.daily < 0.0 {
                return Err(Error::config(format!(
                    "user_budget.budgets.users.{user_id}.daily: must not be negative"
                )));
            }
            if budget.monthly < 0.0 {
                return Err(Error::config(format!(
                    "user_budget.budgets.users.{user_id}.monthly: must not be negative"
                )));
            }
        }
        if let Some(default) = &budgets.default_budget {
            if default.daily < 0.0 || default.monthly < 0.0 {
                return Err(Error::config(
                    "user_budget.budgets.default_budget: limits must not be negative",
                ));
            }
        }
        for (tier, model) in &budgets.tier_models {
            if model.is_empty() {
                return Err(Error::config(format!(
                    "user_budget.budgets.tier_models.{tier}: model id must not be empty"
                )));
            }
        }
        Ok(())
    }
}
