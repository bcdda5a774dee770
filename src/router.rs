//! Complexity scoring and cost-aware model routing.
//!
//! Simple prompts are routed to the cheapest configured tier whose
//! capability ceiling covers the prompt's complexity score; anything at or
//! above the cutover threshold keeps the caller's model.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::pricing;

/// Score contribution caps. The total is clamped to 100.
const LENGTH_MAX: u32 = 30;
const REASONING_PER_CLASS: u32 = 8;
const SUBTASK_PER_ITEM: u32 = 5;
const SUBTASK_MAX: u32 = 20;
const STRUCTURE_POINTS: u32 = 10;

static REASONING_CLASSES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(prove|derive|deduce|reason|step[\s-]?by[\s-]?step|think\s+through)\b",
        r"(?i)\b(analy[sz]e|evaluate|compare|contrast|assess|weigh)\b",
        r"(?i)\b(why|explain|justify|walk\s+me\s+through)\b",
        r"(?i)\b(design|architect|plan|devise|strategy)\b",
        r"(?i)\b(optimi[sz]e|improve|refactor|debug|diagnose)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid regex"))
    .collect()
});

static SUBTASK_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:\d+[.)]|[-*])\s+").expect("invalid regex")
});

static STRUCTURE_CUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(json|yaml|xml|csv|schema|table|markdown)\b|```|\bformat\s+(as|in)\b")
        .expect("invalid regex")
});

/// Maps a prompt to a complexity score in `[0, 100]`.
///
/// The score is additive over prompt length, reasoning-keyword classes,
/// enumerated sub-tasks, and structured-output cues, so adding any of
/// those to a prompt never lowers it:
///
/// ```text
/// score = min(100, min(30, chars/40)
///              + 8 * matched_reasoning_classes      (max 40)
///              + 5 * (subtask_markers - 1)          (max 20)
///              + 10 if structured-output cue)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityScorer;

impl ComplexityScorer {
    /// Score a prompt.
    pub fn score(prompt: &str) -> u32 {
        let length_pts = ((prompt.chars().count() / 40) as u32).min(LENGTH_MAX);

        let reasoning_pts = REASONING_CLASSES
            .iter()
            .filter(|class| class.is_match(prompt))
            .count() as u32
            * REASONING_PER_CLASS;

        let markers = SUBTASK_MARKER.find_iter(prompt).count() as u32;
        let subtask_pts = (SUBTASK_PER_ITEM * markers.saturating_sub(1)).min(SUBTASK_MAX);

        let structure_pts = if STRUCTURE_CUE.is_match(prompt) {
            STRUCTURE_POINTS
        } else {
            0
        };

        (length_pts + reasoning_pts + subtask_pts + structure_pts).min(100)
    }
}

/// One routing tier: a model and the highest complexity it should handle.
/// Tiers are configured in ascending price order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterTier {
    pub model_id: String,
    pub max_complexity: u32,
}

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Candidate tiers, cheapest first
    pub tiers: Vec<RouterTier>,
    /// At or above this score, the caller's model is kept
    pub complexity_threshold: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tiers: Vec::new(),
            complexity_threshold: 50,
        }
    }
}

/// Outcome of a routing pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    /// Model to use
    pub model: String,
    /// Complexity score of the prompt
    pub complexity: u32,
    /// Whether a cheaper tier was selected
    pub downgraded: bool,
    /// Dollars saved versus the caller's model, never negative
    pub saved_cost: f64,
}

/// Routes prompts to the cheapest tier that can handle them.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    config: RouterConfig,
}

impl ModelRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Pick a model for `prompt`, given the caller's model and the token
    /// shape of the call.
    pub fn route(
        &self,
        prompt: &str,
        original_model: &str,
        input_tokens: u64,
        reserved_output_tokens: u64,
    ) -> RouteDecision {
        let complexity = ComplexityScorer::score(prompt);

        let keep = RouteDecision {
            model: original_model.to_string(),
            complexity,
            downgraded: false,
            saved_cost: 0.0,
        };

        if complexity >= self.config.complexity_threshold {
            return keep;
        }

        let Some(tier) = self
            .config
            .tiers
            .iter()
            .find(|t| t.max_complexity >= complexity)
        else {
            return keep;
        };

        if tier.model_id == original_model {
            return keep;
        }

        let original_cost = pricing::cost(original_model, input_tokens, reserved_output_tokens);
        let routed_cost = pricing::cost(&tier.model_id, input_tokens, reserved_output_tokens);
        let saved_cost = (original_cost - routed_cost).max(0.0);

        RouteDecision {
            model: tier.model_id.clone(),
            complexity,
            downgraded: true,
            saved_cost,
        }
    }
}
