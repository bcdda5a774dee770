//! Typed lifecycle events.
//!
//! Every stage of the pipeline publishes a [`ShieldEvent`] describing what
//! it did and what it saved. The bus is per-[`Shield`](crate::Shield)
//! instance, never process-global: two shields in one process observe only
//! their own traffic. Emission is best-effort; a panicking subscriber never
//! fails the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::cache::MatchType;
use crate::clock::{system_clock, ClockFn};

/// Maximum retained entries in the in-memory event log.
const EVENT_LOG_CAP: usize = 500;

/// A lifecycle event emitted by the pipeline or one of its components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum ShieldEvent {
    RequestBlocked {
        reason: String,
        estimated_cost: f64,
    },
    RequestAllowed {
        prompt: String,
        model: String,
    },
    CacheHit {
        match_type: MatchType,
        similarity: f64,
        saved_cost: f64,
    },
    CacheMiss {
        prompt: String,
    },
    CacheStore {
        model: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    ContextTrimmed {
        original_tokens: usize,
        trimmed_tokens: usize,
        saved_tokens: usize,
    },
    RouterDowngraded {
        original_model: String,
        selected_model: String,
        complexity: u32,
        saved_cost: f64,
    },
    LedgerEntry {
        model: String,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
        saved: f64,
    },
    BreakerWarning {
        window: String,
        spend: f64,
        limit: f64,
    },
    BreakerTripped {
        window: String,
        spend: f64,
        limit: f64,
    },
    UserBudgetWarning {
        user_id: String,
        limit_type: String,
        percent_used: f64,
    },
    UserBudgetExceeded {
        user_id: String,
        limit_type: String,
        message: String,
    },
    UserBudgetSpend {
        user_id: String,
        cost: f64,
        model: String,
    },
    StreamChunk {
        output_tokens: u64,
        estimated_cost: f64,
    },
    StreamComplete {
        input_tokens: u64,
        output_tokens: u64,
        total_cost: f64,
    },
    StreamAbort {
        output_tokens: u64,
        estimated_cost: f64,
    },
}

impl ShieldEvent {
    /// The topic string for this event.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::RequestBlocked { .. } => "request:blocked",
            Self::RequestAllowed { .. } => "request:allowed",
            Self::CacheHit { .. } => "cache:hit",
            Self::CacheMiss { .. } => "cache:miss",
            Self::CacheStore { .. } => "cache:store",
            Self::ContextTrimmed { .. } => "context:trimmed",
            Self::RouterDowngraded { .. } => "router:downgraded",
            Self::LedgerEntry { .. } => "ledger:entry",
            Self::BreakerWarning { .. } => "breaker:warning",
            Self::BreakerTripped { .. } => "breaker:tripped",
            Self::UserBudgetWarning { .. } => "userBudget:warning",
            Self::UserBudgetExceeded { .. } => "userBudget:exceeded",
            Self::UserBudgetSpend { .. } => "userBudget:spend",
            Self::StreamChunk { .. } => "stream:chunk",
            Self::StreamComplete { .. } => "stream:complete",
            Self::StreamAbort { .. } => "stream:abort",
        }
    }
}

/// An event plus the time it was emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub event: ShieldEvent,
    pub timestamp: DateTime<Utc>,
}

type Subscriber = Arc<dyn Fn(&ShieldEvent) + Send + Sync>;

struct BusState {
    subscribers: Vec<(u64, Subscriber)>,
    next_id: u64,
    log: VecDeque<LoggedEvent>,
}

/// Per-shield publish/subscribe bus with a bounded event log.
pub struct ShieldEvents {
    state: Mutex<BusState>,
    clock: ClockFn,
}

impl ShieldEvents {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub(crate) fn with_clock(clock: ClockFn) -> Self {
        Self {
            state: Mutex::new(BusState {
                subscribers: Vec::new(),
                next_id: 0,
                log: VecDeque::new(),
            }),
            clock,
        }
    }

    /// Register a subscriber. Returns an id usable with [`unsubscribe`].
    ///
    /// [`unsubscribe`]: Self::unsubscribe
    pub fn subscribe(&self, f: impl Fn(&ShieldEvent) + Send + Sync + 'static) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push((id, Arc::new(f)));
        id
    }

    /// Remove a subscriber by id.
    pub fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.subscribers.retain(|(sid, _)| *sid != id);
    }

    /// Publish an event to all subscribers and the bounded log.
    ///
    /// A subscriber panic is caught and ignored; emission can never fail a
    /// request.
    pub fn emit(&self, event: ShieldEvent) {
        tracing::debug!(topic = event.topic(), "shield event");

        // Subscribers run outside the lock so they may call back into the
        // bus.
        let subscribers: Vec<Subscriber> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.log.push_back(LoggedEvent {
                event: event.clone(),
                timestamp: (self.clock)(),
            });
            while state.log.len() > EVENT_LOG_CAP {
                state.log.pop_front();
            }
            state.subscribers.iter().map(|(_, s)| Arc::clone(s)).collect()
        };

        for subscriber in subscribers {
            let _ = catch_unwind(AssertUnwindSafe(|| subscriber(&event)));
        }
    }

    /// Snapshot of the retained event log, oldest first.
    pub fn recent(&self) -> Vec<LoggedEvent> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.log.iter().cloned().collect()
    }

    /// Clear the retained event log.
    pub fn clear_log(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.log.clear();
    }
}

impl Default for ShieldEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShieldEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ShieldEvents")
            .field("subscribers", &state.subscribers.len())
            .field("logged", &state.log.len())
            .finish()
    }
}
