//! Context trimming: fit a message sequence into an input-token budget.
//!
//! The first system message and the final turn are preserved whenever
//! possible; intermediate turns are evicted oldest-first. Only when the
//! preserved messages alone exceed the budget is their content truncated,
//! proceeding right-to-left.

use crate::tokens::{TokenCounter, PRIMING_TOKENS};
use crate::types::Message;

/// Input-token budget for trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimBudget {
    /// Total context window to fit within
    pub max_context_tokens: usize,
    /// Tokens held back for the model's output
    pub reserved_for_output: usize,
}

impl TrimBudget {
    /// Tokens available for input after the output reservation.
    pub fn input_allowance(&self) -> usize {
        self.max_context_tokens.saturating_sub(self.reserved_for_output)
    }
}

/// Result of a trim pass.
#[derive(Debug, Clone, PartialEq)]
pub struct TrimResult {
    /// The trimmed sequence, never exceeding the input allowance
    pub messages: Vec<Message>,
    /// Tokens removed relative to the original sequence
    pub evicted_tokens: usize,
}

/// Fits message sequences to a token budget.
#[derive(Debug, Clone)]
pub struct ContextTrimmer {
    counter: TokenCounter,
}

impl ContextTrimmer {
    pub fn new(counter: TokenCounter) -> Self {
        Self { counter }
    }

    /// Trim `messages` to fit `budget`.
    pub fn trim(&self, messages: &[Message], budget: &TrimBudget) -> TrimResult {
        let allowance = budget.input_allowance();
        let original_total = self.counter.count_chat(messages);

        if messages.is_empty() || original_total <= allowance {
            return TrimResult {
                messages: messages.to_vec(),
                evicted_tokens: 0,
            };
        }

        let first_system = messages.iter().position(|m| m.role == crate::types::Role::System);
        let last = messages.len() - 1;

        // Evict intermediates oldest-first until the sequence fits.
        let mut kept: Vec<(usize, Message)> =
            messages.iter().cloned().enumerate().collect();
        loop {
            let current: Vec<Message> = kept.iter().map(|(_, m)| m.clone()).collect();
            let current_total = self.counter.count_chat(&current);
            if current_total <= allowance {
                return TrimResult {
                    messages: current,
                    evicted_tokens: original_total - current_total,
                };
            }

            let evictable = kept
                .iter()
                .position(|(idx, _)| Some(*idx) != first_system && *idx != last);
            match evictable {
                Some(pos) => {
                    kept.remove(pos);
                }
                None => break,
            }
        }

        // Only the preserved messages remain and they still exceed the
        // allowance: truncate content right-to-left.
        let preserved: Vec<Message> = kept.into_iter().map(|(_, m)| m).collect();
        let truncated = self.truncate_preserved(preserved, allowance);
        let final_total = self.counter.count_chat(&truncated);

        TrimResult {
            messages: truncated,
            evicted_tokens: original_total.saturating_sub(final_total),
        }
    }

    fn message_overhead(&self, message: &Message) -> usize {
        let empty = Message {
            role: message.role,
            content: String::new(),
            name: message.name.clone(),
        };
        self.counter.count_message(&empty)
    }

    fn truncate_preserved(&self, mut preserved: Vec<Message>, allowance: usize) -> Vec<Message> {
        // If even the framing of two messages cannot fit, keep only the
        // final turn.
        let overhead: usize =
            preserved.iter().map(|m| self.message_overhead(m)).sum::<usize>() + PRIMING_TOKENS;
        if preserved.len() > 1 && overhead > allowance {
            preserved = vec![preserved.pop().expect("preserved is non-empty")];
        }

        let fixed: usize =
            preserved.iter().map(|m| self.message_overhead(m)).sum::<usize>() + PRIMING_TOKENS;
        let mut available = allowance.saturating_sub(fixed);

        for message in preserved.iter_mut().rev() {
            let content_tokens = self.counter.count(&message.content);
            if content_tokens <= available {
                available -= content_tokens;
            } else {
                let (kept, _) = self.counter.truncate_to(&message.content, available);
                message.content = kept;
                available = 0;
            }
        }

        preserved
    }
}
