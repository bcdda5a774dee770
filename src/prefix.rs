//! Stable-prefix detection for provider-side prompt caching.
//!
//! Providers that discount cached input tokens only reuse a prompt prefix
//! that is byte-identical across calls. The optimizer remembers the
//! message hashes of the previous call and marks the longest leading run
//! that has not changed, so the caller can attach the provider's cache
//! marker at that boundary.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::pricing;
use crate::tokens::TokenCounter;
use crate::types::Message;

/// Which provider's cache-marker dialect to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrefixProvider {
    OpenAI,
    Anthropic,
    Google,
    /// Derive the provider from the model id
    #[default]
    Auto,
}

/// Prefix optimizer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PrefixConfig {
    pub provider: PrefixProvider,
}

/// Marker describing the stable prefix of the current call. Opaque to the
/// pipeline; the caller forwards it to the provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixMarker {
    /// Provider dialect the marker targets
    pub provider: String,
    /// Number of leading messages stable since the previous call
    pub stable_messages: usize,
    /// Token count of the stable prefix
    pub stable_tokens: usize,
    /// Estimated dollars saved by the provider's cached-input rate
    pub estimated_savings: f64,
}

/// Tracks message stability across calls and emits cache markers.
pub struct PrefixOptimizer {
    config: PrefixConfig,
    last_hashes: Mutex<Vec<u64>>,
}

impl PrefixOptimizer {
    pub fn new(config: PrefixConfig) -> Self {
        Self {
            config,
            last_hashes: Mutex::new(Vec::new()),
        }
    }

    fn message_hash(message: &Message) -> u64 {
        let mut hasher = DefaultHasher::new();
        message.role.to_string().hash(&mut hasher);
        message.content.hash(&mut hasher);
        hasher.finish()
    }

    fn provider_for(&self, model: &str) -> &'static str {
        match self.config.provider {
            PrefixProvider::OpenAI => "openai",
            PrefixProvider::Anthropic => "anthropic",
            PrefixProvider::Google => "google",
            PrefixProvider::Auto => {
                if model.starts_with("claude") {
                    "anthropic"
                } else if model.starts_with("gemini") {
                    "google"
                } else {
                    "openai"
                }
            }
        }
    }

    /// Compare this call's messages against the previous call and emit a
    /// marker for the stable prefix. Returns `None` on the first call, when
    /// nothing is stable, or when the model has no cached-input discount.
    pub fn optimize(
        &self,
        messages: &[Message],
        model: &str,
        counter: &TokenCounter,
    ) -> Option<PrefixMarker> {
        let hashes: Vec<u64> = messages.iter().map(Self::message_hash).collect();

        let previous = {
            let mut last = self.last_hashes.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *last, hashes.clone())
        };

        let stable_messages = hashes
            .iter()
            .zip(previous.iter())
            .take_while(|(a, b)| a == b)
            .count();
        if stable_messages == 0 {
            return None;
        }

        let saving_per_m = pricing::cached_input_saving_per_m(model)?;

        let stable_tokens: usize = messages[..stable_messages]
            .iter()
            .map(|m| counter.count_message(m))
            .sum();
        let estimated_savings = (stable_tokens as f64 / 1_000_000.0) * saving_per_m;

        Some(PrefixMarker {
            provider: self.provider_for(model).to_string(),
            stable_messages,
            stable_tokens,
            estimated_savings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(question: &str) -> Vec<Message> {
        vec![
            Message::system("You are a support assistant for Acme Corp."),
            Message::user("Here is our deployment guide: step one, step two."),
            Message::user(question),
        ]
    }

    #[test]
    fn test_first_call_emits_nothing() {
        let optimizer = PrefixOptimizer::new(PrefixConfig::default());
        let counter = TokenCounter::for_model("gpt-4o");
        assert!(optimizer
            .optimize(&conversation("How do I deploy?"), "gpt-4o", &counter)
            .is_none());
    }

    #[test]
    fn test_stable_prefix_detected_on_second_call() {
        let optimizer = PrefixOptimizer::new(PrefixConfig::default());
        let counter = TokenCounter::for_model("gpt-4o");

        optimizer.optimize(&conversation("How do I deploy?"), "gpt-4o", &counter);
        let marker = optimizer
            .optimize(&conversation("How do I roll back?"), "gpt-4o", &counter)
            .expect("expected marker");

        // The two leading messages are unchanged; only the question moved.
        assert_eq!(marker.stable_messages, 2);
        assert!(marker.stable_tokens > 0);
        assert!(marker.estimated_savings > 0.0);
        assert_eq!(marker.provider, "openai");
    }

    #[test]
    fn test_no_marker_without_cached_input_discount() {
        let optimizer = PrefixOptimizer::new(PrefixConfig::default());
        // gpt-4-turbo carries no cached-input rate in the table.
        let counter = TokenCounter::for_model("gpt-4-turbo");

        optimizer.optimize(&conversation("q1"), "gpt-4-turbo", &counter);
        assert!(optimizer
            .optimize(&conversation("q2"), "gpt-4-turbo", &counter)
            .is_none());
    }

    #[test]
    fn test_changed_head_resets_stability() {
        let optimizer = PrefixOptimizer::new(PrefixConfig::default());
        let counter = TokenCounter::for_model("gpt-4o");

        optimizer.optimize(&conversation("q1"), "gpt-4o", &counter);

        let mut changed = conversation("q2");
        changed[0].content = "You are a different assistant.".to_string();
        assert!(optimizer.optimize(&changed, "gpt-4o", &counter).is_none());
    }

    #[test]
    fn test_auto_provider_resolution() {
        let optimizer = PrefixOptimizer::new(PrefixConfig::default());
        let counter = TokenCounter::for_model("claude-3-5-sonnet-20241022");

        optimizer.optimize(&conversation("q1"), "claude-3-5-sonnet-20241022", &counter);
        let marker = optimizer
            .optimize(&conversation("q2"), "claude-3-5-sonnet-20241022", &counter)
            .unwrap();
        assert_eq!(marker.provider, "anthropic");
    }

    #[test]
    fn test_explicit_provider_wins_over_auto() {
        let optimizer = PrefixOptimizer::new(PrefixConfig {
            provider: PrefixProvider::Google,
        });
        let counter = TokenCounter::for_model("gpt-4o");

        optimizer.optimize(&conversation("q1"), "gpt-4o", &counter);
        let marker = optimizer
            .optimize(&conversation("q2"), "gpt-4o", &counter)
            .unwrap();
        assert_eq!(marker.provider, "google");
    }
}
