//! Embedding and completion provider contracts.
//!
//! The engine consumes two external model services: an [`Embedder`] that
//! turns text into fixed-dimension vectors, and a [`Completer`] that answers
//! a system+user prompt, optionally choosing among registered tools. Both
//! are stateless trait objects shared across worker jobs.
//!
//! Deterministic implementations for tests live in [`mock`]; enable the
//! `openai` cargo feature for OpenAI-compatible implementations backed by
//! `async-openai`.

pub mod mock;

#[cfg(feature = "openai")]
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// Embedding provider.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// The fixed output dimension of this embedder.
    fn dimension(&self) -> usize;

    /// Embeds a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;

    /// Embeds a batch of texts, one vector per input in input order.
    ///
    /// The default implementation loops over [`embed`](Embedder::embed);
    /// providers with a batched API should override it.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// A tool offered to the completion model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool arguments.
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A tool invocation chosen by the completion model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    /// Raw JSON argument payload, decoded downstream by tool name.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Result of a completion call.
#[derive(Clone, Debug, Default)]
pub struct Completion {
    /// Free-form content, when the model answered in prose.
    pub content: Option<String>,
    /// Structured tool calls, when the model chose tools.
    pub tool_calls: Vec<ToolCall>,
}

impl Completion {
    /// A completion carrying only prose content.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// A completion carrying a single tool call.
    pub fn tool(call: ToolCall) -> Self {
        Self {
            content: None,
            tool_calls: vec![call],
        }
    }

    /// A completion with neither content nor tool calls (model silence).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Completion provider.
#[async_trait]
pub trait Completer: Send + Sync {
    /// Runs one completion with a fixed system prompt, a user prompt, and a
    /// set of registered tools (may be empty).
    async fn complete(
        &self,
        system: &str,
        user: &str,
        tools: &[ToolSpec],
    ) -> Result<Completion, MemoryError>;
}
