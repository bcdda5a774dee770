//! Message shapes, the invoked-model contract, and adapters between the
//! multi-part wire format and flat messages.

use serde::{Deserialize, Serialize};

/// The role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// User/human input
    User,
    /// Assistant/model response
    Assistant,
    /// Tool execution result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A flat conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Content of the message
    pub content: String,
    /// Optional participant name (counted toward chat overhead)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    /// Create a new message with just role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a tool result message.
    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    /// Set the participant name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// One part of a multi-part prompt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PromptPart {
    Text { text: String },
}

/// A message in the provider-facing multi-part prompt shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: Vec<PromptPart>,
}

impl PromptMessage {
    /// Create a multi-part message from a single text block.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![PromptPart::Text { text: text.into() }],
        }
    }

    /// Concatenate the text parts of this message.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|p| match p {
                PromptPart::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Flatten a multi-part prompt into flat messages.
pub fn flatten_prompt(prompt: &[PromptMessage]) -> Vec<Message> {
    prompt
        .iter()
        .map(|m| Message::new(m.role, m.joined_text()))
        .collect()
}

/// Expand flat messages back into the multi-part prompt shape.
pub fn expand_messages(messages: &[Message]) -> Vec<PromptMessage> {
    messages
        .iter()
        .map(|m| PromptMessage::text(m.role, m.content.clone()))
        .collect()
}

/// The text of the last user turn, if any.
pub fn last_user_text(prompt: &[PromptMessage]) -> Option<String> {
    prompt
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.joined_text())
}

/// Anthropic-style request shape: system messages hoisted to a top-level
/// field, remaining turns left in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSplit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
}

/// Extract system messages to a top-level `system` field.
///
/// Multiple system messages are joined with blank lines, matching how
/// Anthropic-style providers accept a single system string.
pub fn extract_system(messages: &[Message]) -> SystemSplit {
    let mut system_parts = Vec::new();
    let mut rest = Vec::new();

    for msg in messages {
        if msg.role == Role::System {
            system_parts.push(msg.content.clone());
        } else {
            rest.push(msg.clone());
        }
    }

    SystemSplit {
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        },
        messages: rest,
    }
}

/// Token usage reported by the invoked model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    StopSequence,
    ToolUse,
    Error,
}

/// Result of a non-streaming model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    /// Generated text
    pub text: String,
    /// Token usage as reported by the provider
    pub usage: Usage,
    /// Why generation stopped
    pub finish_reason: FinishReason,
}

impl GenerateResult {
    pub fn new(text: impl Into<String>, usage: Usage, finish_reason: FinishReason) -> Self {
        Self {
            text: text.into(),
            usage,
            finish_reason,
        }
    }
}

/// One chunk of a streaming model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    /// Incremental text
    TextDelta { text_delta: String },
    /// Terminal chunk, optionally carrying provider usage
    Finish {
        finish_reason: FinishReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}
