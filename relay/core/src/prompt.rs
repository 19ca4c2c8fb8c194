//! Request shaping
//!
//! Builds the outbound chat completion request: a fixed system turn, optional
//! few-shot example turns, then the user's input.

use serde::{Deserialize, Serialize};

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions for the model
    System,
    /// End-user input
    User,
    /// Model output
    Assistant,
}

/// One chat turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author
    pub role: MessageRole,
    /// Text
    pub content: String,
}

impl ChatMessage {
    /// System turn
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// User turn
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Assistant turn
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling knobs sent with every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Response length limit
    pub max_tokens: u32,
    /// Randomness
    pub temperature: f32,
    /// Nucleus sampling cutoff
    pub top_p: f32,
    /// Penalty for repeated tokens
    pub frequency_penalty: f32,
    /// Penalty for tokens already present
    pub presence_penalty: f32,
    /// Stop sequences
    pub stop: Option<Vec<String>>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 3000,
            temperature: 0.1,
            top_p: 0.95,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop: None,
        }
    }
}

/// Body of a chat completion call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Ordered history
    pub messages: Vec<ChatMessage>,
    /// Model name; Azure deployments carry it in the URL instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Response length limit
    pub max_tokens: u32,
    /// Randomness
    pub temperature: f32,
    /// Nucleus sampling cutoff
    pub top_p: f32,
    /// Penalty for repeated tokens
    pub frequency_penalty: f32,
    /// Penalty for tokens already present
    pub presence_penalty: f32,
    /// Stop sequences (serialized as `null` when unset)
    pub stop: Option<Vec<String>>,
    /// Always `true` for relayed calls
    pub stream: bool,
}

impl CompletionRequest {
    /// Streaming request for `messages` with the given sampling knobs
    #[must_use]
    pub fn streaming(messages: Vec<ChatMessage>, params: &SamplingParams) -> Self {
        Self {
            messages,
            model: None,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            stop: params.stop.clone(),
            stream: true,
        }
    }
}

/// One few-shot example exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleTurn {
    /// Example user input
    pub user: String,
    /// Expected assistant reply
    pub assistant: String,
}

/// Fixed conversation prefix wrapped around each user input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplate {
    /// System instructions (omitted when empty)
    pub system: Option<String>,
    /// Example exchanges placed before the input
    pub examples: Vec<ExampleTurn>,
}

impl PromptTemplate {
    /// Message list for one user input
    #[must_use]
    pub fn build(&self, input: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2 + self.examples.len() * 2);
        if let Some(system) = self.system.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(system));
        }
        for example in &self.examples {
            messages.push(ChatMessage::user(&example.user));
            messages.push(ChatMessage::assistant(&example.assistant));
        }
        messages.push(ChatMessage::user(input));
        messages
    }
}
