//! Static model pricing table.
//!
//! Prices are USD per million tokens. Unknown model ids are treated as
//! zero-cost by every dependent function so the pipeline never aborts on a
//! model that shipped after this table was written.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Price tier used by the router and user-budget tier pinning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Most capable, highest cost
    Flagship = 0,
    /// Balanced capability and cost
    Balanced = 1,
    /// Fast and cheap
    Fast = 2,
}

/// Pricing and capacity data for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Input cost per million tokens (USD)
    pub input_per_m: f64,
    /// Output cost per million tokens (USD)
    pub output_per_m: f64,
    /// Discounted rate for provider-cached input tokens, when the provider
    /// supports prompt caching for this model
    pub cached_input_per_m: Option<f64>,
    /// Maximum context window (tokens)
    pub context_window: u32,
    /// Tier classification
    pub tier: ModelTier,
}

impl ModelPrice {
    const fn new(
        input_per_m: f64,
        output_per_m: f64,
        cached_input_per_m: Option<f64>,
        context_window: u32,
        tier: ModelTier,
    ) -> Self {
        Self {
            input_per_m,
            output_per_m,
            cached_input_per_m,
            context_window,
            tier,
        }
    }
}

static PRICING: LazyLock<HashMap<&'static str, ModelPrice>> = LazyLock::new(|| {
    use ModelTier::*;
    HashMap::from([
        // OpenAI
        ("gpt-4o", ModelPrice::new(2.5, 10.0, Some(1.25), 128_000, Balanced)),
        ("gpt-4o-mini", ModelPrice::new(0.15, 0.60, Some(0.075), 128_000, Fast)),
        ("gpt-4-turbo", ModelPrice::new(10.0, 30.0, None, 128_000, Flagship)),
        ("gpt-3.5-turbo", ModelPrice::new(0.50, 1.50, None, 16_385, Fast)),
        ("o1", ModelPrice::new(15.0, 60.0, Some(7.5), 200_000, Flagship)),
        ("o1-mini", ModelPrice::new(1.1, 4.4, Some(0.55), 128_000, Balanced)),
        // Anthropic
        ("claude-3-opus-20240229", ModelPrice::new(15.0, 75.0, Some(1.5), 200_000, Flagship)),
        ("claude-3-5-sonnet-20241022", ModelPrice::new(3.0, 15.0, Some(0.30), 200_000, Balanced)),
        ("claude-3-5-haiku-20241022", ModelPrice::new(0.80, 4.0, Some(0.08), 200_000, Fast)),
        // Google
        ("gemini-1.5-pro", ModelPrice::new(1.25, 5.0, Some(0.3125), 2_000_000, Balanced)),
        ("gemini-1.5-flash", ModelPrice::new(0.075, 0.30, Some(0.01875), 1_000_000, Fast)),
        ("gemini-2.0-flash", ModelPrice::new(0.10, 0.40, Some(0.025), 1_000_000, Fast)),
    ])
});

/// Look up pricing for a model id. Returns `None` for unknown ids.
pub fn price_for(model: &str) -> Option<&'static ModelPrice> {
    PRICING.get(model)
}

/// Dollar cost of a call. Unknown models cost zero.
pub fn cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    match price_for(model) {
        Some(price) => {
            (input_tokens as f64 / 1_000_000.0) * price.input_per_m
                + (output_tokens as f64 / 1_000_000.0) * price.output_per_m
        }
        None => 0.0,
    }
}

/// Dollar cost of the input side only. Unknown models cost zero.
pub fn input_cost(model: &str, input_tokens: u64) -> f64 {
    match price_for(model) {
        Some(price) => (input_tokens as f64 / 1_000_000.0) * price.input_per_m,
        None => 0.0,
    }
}

/// Context window for a model, if known.
pub fn context_window(model: &str) -> Option<u32> {
    price_for(model).map(|p| p.context_window)
}

/// Dollars saved per million input tokens served from the provider cache,
/// when the model has a cached-input rate.
pub fn cached_input_saving_per_m(model: &str) -> Option<f64> {
    let price = price_for(model)?;
    let cached = price.cached_input_per_m?;
    Some((price.input_per_m - cached).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_cost() {
        // 1M input + 500k output on claude-3-5-sonnet:
        // 1.0 * $3 + 0.5 * $15 = $10.5
        let c = cost("claude-3-5-sonnet-20241022", 1_000_000, 500_000);
        assert!((c - 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_is_zero_cost() {
        assert_eq!(cost("gpt-99-ultra", 1_000_000, 1_000_000), 0.0);
        assert_eq!(input_cost("gpt-99-ultra", 1_000_000), 0.0);
        assert!(price_for("gpt-99-ultra").is_none());
        assert!(cached_input_saving_per_m("gpt-99-ultra").is_none());
    }

    #[test]
    fn test_cached_input_saving() {
        // gpt-4o: $2.5 input, $1.25 cached => $1.25 saved per M
        let saved = cached_input_saving_per_m("gpt-4o").unwrap();
        assert!((saved - 1.25).abs() < 1e-9);

        // gpt-4-turbo has no cached rate
        assert!(cached_input_saving_per_m("gpt-4-turbo").is_none());
    }

    #[test]
    fn test_context_window() {
        assert_eq!(context_window("gpt-4o"), Some(128_000));
        assert_eq!(context_window("gemini-1.5-pro"), Some(2_000_000));
        assert_eq!(context_window("unknown"), None);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(ModelTier::Flagship < ModelTier::Balanced);
        assert!(ModelTier::Balanced < ModelTier::Fast);
    }
}
