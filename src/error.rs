//! Error types for tokenshield.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using tokenshield's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable reason codes carried by [`Error::Blocked`].
///
/// These codes are the contract exposed to callers; everything else about a
/// denial (the offending window, the measured spend) lives in the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockCode {
    /// A cost circuit-breaker window limit would be exceeded
    BreakerSessionLimit,
    /// The user-id resolver returned an empty id or failed
    BudgetUserIdInvalid,
    /// The user's daily budget would be exceeded
    BudgetDailyExceeded,
    /// The user's monthly budget would be exceeded
    BudgetMonthlyExceeded,
    /// The request guard rejected the call (debounce, rate, cost, dedup)
    GuardRateLimit,
}

impl BlockCode {
    /// The stable string form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BreakerSessionLimit => "BREAKER_SESSION_LIMIT",
            Self::BudgetUserIdInvalid => "BUDGET_USER_ID_INVALID",
            Self::BudgetDailyExceeded => "BUDGET_DAILY_EXCEEDED",
            Self::BudgetMonthlyExceeded => "BUDGET_MONTHLY_EXCEEDED",
            Self::GuardRateLimit => "GUARD_RATE_LIMIT",
        }
    }
}

impl std::fmt::Display for BlockCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur during shield operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A request was denied before the model call was made
    #[error("{code}: {message}")]
    Blocked { code: BlockCode, message: String },

    /// Configuration error, reported at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error surfaced verbatim from the caller-supplied model function
    #[error("Provider error: {0}")]
    Provider(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a blocked error with a stable reason code.
    pub fn blocked(code: BlockCode, message: impl Into<String>) -> Self {
        Self::Blocked {
            code,
            message: message.into(),
        }
    }

    /// Create a configuration error with a path-qualified message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Wrap a provider error for verbatim surfacing.
    pub fn provider(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Provider(Box::new(source))
    }

    /// Check whether this is an admission denial.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// The reason code if this is an admission denial.
    pub fn block_code(&self) -> Option<BlockCode> {
        match self {
            Self::Blocked { code, .. } => Some(*code),
            _ => None,
        }
    }
}
