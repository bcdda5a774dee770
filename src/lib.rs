//! # tokenshield
//!
//! A client-side cost and quota control plane that sits between an
//! application and its LLM providers. Every model call is intercepted,
//! classified, optionally served from cache or routed to a cheaper model,
//! trimmed to budget, checked against cost ceilings, and accounted for —
//! before any outbound request is made. The actual call stays with the
//! caller as a closure; this crate never talks to a provider itself.
//!
//! ## Core Components
//!
//! - **Pipeline**: the [`Shield`] orchestrator (`transform_params`,
//!   `wrap_generate`, `wrap_stream`)
//! - **Cache**: exact + similarity response cache with TTL and LRU bounds
//! - **Breaker / Budgets**: windowed spend limits and per-user budgets
//!   with in-flight reservations
//! - **Ledger / Events**: spend and savings accounting with typed
//!   lifecycle events
//!
//! ## Example
//!
//! ```rust,ignore
//! use tokenshield::{GenerateParams, PromptMessage, Role, Shield, ShieldConfig};
//!
//! let shield = Shield::new(ShieldConfig::default())?;
//!
//! let params = GenerateParams::new(
//!     "gpt-4o-mini",
//!     vec![PromptMessage::text(Role::User, "What is TypeScript?")],
//! );
//! let request = shield.transform_params(params).await?;
//! let result = shield
//!     .wrap_generate(request, || async { my_provider_call().await })
//!     .await?;
//! println!("{}", result.text);
//! ```

pub mod breaker;
pub mod budget;
pub mod cache;
pub(crate) mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod ledger;
pub mod persist;
pub mod pipeline;
pub mod prefix;
pub mod pricing;
pub mod router;
pub mod stream;
pub mod tokens;
pub mod trim;
pub mod types;

// Re-exports for convenience
pub use breaker::{
    BreakerAction, BreakerConfig, BreakerDecision, BreakerLimits, BreakerWindow, CostBreaker,
    SpendRecord, WindowStatus,
};
pub use budget::{
    BudgetCheck, BudgetsConfig, PercentUsed, RemainingBudget, SpendWindows, UserBudget,
    UserBudgetManager, UserBudgetStatus, UserSpendRecord,
};
pub use cache::{
    CacheConfig, CacheEntry, CacheHit, CacheStats, EncodingStrategy, MatchType, ResponseCache,
};
pub use config::{
    BlockedCallback, BlockedInfo, BudgetCallback, ContextConfig, ModulesConfig, ShieldConfig,
    UsageCallback, UsageReport, UserBudgetConfig, UserIdResolver,
};
pub use error::{BlockCode, Error, Result};
pub use events::{LoggedEvent, ShieldEvent, ShieldEvents};
pub use guard::{Debouncer, GuardCheck, GuardConfig, GuardStats, RequestGuard};
pub use ledger::{CostLedger, LedgerConfig, LedgerEntry, LedgerSummary, ModelUsage, SavingsBreakdown};
pub use persist::{KvStore, MemoryStore, SqliteStore};
pub use pipeline::{GenerateParams, Shield, ShieldRequest, ShieldStream};
pub use prefix::{PrefixConfig, PrefixMarker, PrefixOptimizer, PrefixProvider};
pub use pricing::{ModelPrice, ModelTier};
pub use router::{ComplexityScorer, ModelRouter, RouteDecision, RouterConfig, RouterTier};
pub use stream::{StreamLiveUsage, StreamTokenTracker, StreamUsage};
pub use tokens::{estimate_chat, estimate_tokens, TokenCounter};
pub use trim::{ContextTrimmer, TrimBudget, TrimResult};
pub use types::{
    expand_messages, extract_system, flatten_prompt, last_user_text, FinishReason, GenerateResult,
    Message, PromptMessage, PromptPart, Role, StreamChunk, SystemSplit, Usage,
};
