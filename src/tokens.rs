//! Token counting.
//!
//! Exact counts use a BPE tokenizer that reproduces OpenAI `prompt_tokens`
//! for OpenAI models; other providers are counted with the same encoder at
//! a documented ~10% error. A char-based heuristic is available for hot
//! paths where an exact count is not worth the encode.

use std::sync::{Arc, LazyLock};
use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use crate::types::Message;

/// Fixed per-message overhead tokens for chat-format counting.
pub(crate) const PER_MESSAGE_OVERHEAD: usize = 4;
/// Tokens added once per chat sequence for reply priming.
pub(crate) const PRIMING_TOKENS: usize = 3;

static CL100K: LazyLock<Arc<CoreBPE>> =
    LazyLock::new(|| Arc::new(cl100k_base().expect("embedded cl100k_base encoding")));

static O200K: LazyLock<Arc<CoreBPE>> =
    LazyLock::new(|| Arc::new(o200k_base().expect("embedded o200k_base encoding")));

fn encoder_for(model: &str) -> Arc<CoreBPE> {
    // gpt-4o and the o-series moved to o200k_base; everything else
    // (including non-OpenAI models, which we approximate) uses cl100k_base.
    if model.starts_with("gpt-4o") || model.starts_with("o1") || model.starts_with("o3") {
        Arc::clone(&O200K)
    } else {
        Arc::clone(&CL100K)
    }
}

/// Exact BPE token counter for one model's encoding.
#[derive(Clone)]
pub struct TokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TokenCounter {
    /// Create a counter using the encoding for the given model id.
    /// Unknown ids fall back to cl100k_base.
    pub fn for_model(model: &str) -> Self {
        Self {
            bpe: encoder_for(model),
        }
    }

    /// Exact token count of a text.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_ordinary(text).len()
    }

    /// Exact token count of one chat message including framing overhead:
    /// 4 tokens plus role tokens plus optional name tokens.
    pub fn count_message(&self, message: &Message) -> usize {
        let mut tokens = PER_MESSAGE_OVERHEAD + self.count(&message.role.to_string());
        tokens += self.count(&message.content);
        if let Some(name) = &message.name {
            tokens += self.count(name);
        }
        tokens
    }

    /// Exact token count of a chat sequence, including per-message overhead
    /// and reply priming.
    pub fn count_chat(&self, messages: &[Message]) -> usize {
        if messages.is_empty() {
            return 0;
        }
        messages
            .iter()
            .map(|m| self.count_message(m))
            .sum::<usize>()
            + PRIMING_TOKENS
    }

    /// Truncate `text` to at most `budget` tokens.
    ///
    /// Returns the kept text and the number of tokens cut. When a token
    /// boundary splits a multi-byte character, the cut widens until the
    /// remainder decodes cleanly.
    pub fn truncate_to(&self, text: &str, budget: usize) -> (String, usize) {
        let tokens = self.bpe.encode_ordinary(text);
        if tokens.len() <= budget {
            return (text.to_string(), 0);
        }

        let mut keep = budget;
        loop {
            if keep == 0 {
                return (String::new(), tokens.len());
            }
            match self.bpe.decode(tokens[..keep].to_vec()) {
                Ok(kept) => return (kept, tokens.len() - keep),
                Err(_) => keep -= 1,
            }
        }
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter").finish_non_exhaustive()
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' | '\u{3040}'..='\u{30FF}' | '\u{AC00}'..='\u{D7AF}')
}

/// Fast token estimate without encoding: 4 chars/token for Latin-range
/// text, 1.5 chars/token for CJK ranges.
pub fn estimate_tokens(text: &str) -> usize {
    let mut latin = 0usize;
    let mut cjk = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            latin += 1;
        }
    }
    ((latin as f64 / 4.0) + (cjk as f64 / 1.5)).ceil() as usize
}

/// Fast token estimate of a chat sequence, with the same per-message
/// overhead formula as the exact counter.
pub fn estimate_chat(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }
    messages
        .iter()
        .map(|m| {
            PER_MESSAGE_OVERHEAD
                + 1 // role
                + estimate_tokens(&m.content)
                + m.name.as_deref().map(estimate_tokens).unwrap_or(0)
        })
        .sum::<usize>()
        + PRIMING_TOKENS
}
