//! Streaming response accounting.
//!
//! The tracker counts output tokens as chunks arrive and produces one
//! authoritative usage record whether the stream finishes, errors, or is
//! cancelled mid-read. Settlement is idempotent: the first `finish` or
//! `abort` freezes the record and later calls return it unchanged.

use serde::{Deserialize, Serialize};

use crate::pricing;
use crate::tokens::TokenCounter;

/// Final usage of a settled stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Live usage of an in-progress stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamLiveUsage {
    pub output_tokens: u64,
    pub estimated_cost: f64,
}

/// Incremental token accountant for one stream.
#[derive(Debug)]
pub struct StreamTokenTracker {
    model: String,
    counter: TokenCounter,
    input_tokens: u64,
    output_tokens: u64,
    text: String,
    settled: Option<StreamUsage>,
}

impl StreamTokenTracker {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let counter = TokenCounter::for_model(&model);
        Self {
            model,
            counter,
            input_tokens: 0,
            output_tokens: 0,
            text: String::new(),
            settled: None,
        }
    }

    /// Record the input-token count of the prompt that opened the stream.
    pub fn set_input_tokens(&mut self, input_tokens: u64) {
        self.input_tokens = input_tokens;
    }

    /// Count one chunk of output. Returns the running output total.
    ///
    /// Chunks are counted independently; across token boundaries the sum
    /// can differ from a whole-text count by a token or two, which is
    /// acceptable for live accounting.
    pub fn add_chunk(&mut self, text: &str) -> u64 {
        if self.settled.is_none() {
            self.output_tokens += self.counter.count(text) as u64;
            self.text.push_str(text);
        }
        self.output_tokens
    }

    fn settle(&mut self) -> StreamUsage {
        *self.settled.get_or_insert(StreamUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        })
    }

    /// Settle the stream after a normal end.
    pub fn finish(&mut self) -> StreamUsage {
        self.settle()
    }

    /// Settle the stream after an error or consumer cancellation. The
    /// tokens already streamed are still billed.
    pub fn abort(&mut self) -> StreamUsage {
        self.settle()
    }

    /// Whether the stream has been settled.
    pub fn is_settled(&self) -> bool {
        self.settled.is_some()
    }

    /// The accumulated response text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Running output total and estimated cost so far.
    pub fn usage(&self) -> StreamLiveUsage {
        StreamLiveUsage {
            output_tokens: self.output_tokens,
            estimated_cost: pricing::cost(&self.model, self.input_tokens, self.output_tokens),
        }
    }
}
