//! Deterministic providers for tests and offline development.
//!
//! [`MockEmbedder`] hashes token occurrences into a fixed-dimension vector:
//! identical text always produces identical embeddings, and texts sharing
//! vocabulary land near each other. [`ScriptedCompleter`] replays a queue of
//! canned completions and records every prompt it was shown, which is enough
//! to drive the extraction and reconciliation paths end-to-end without a
//! network.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::error::MemoryError;
use crate::store::l2_normalise;

use super::{Completer, Completion, Embedder, ToolSpec};

/// Deterministic hash-bucket embedder.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    /// Creates a mock embedder with the given output dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        // FNV-1a over the lowercased token.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.bytes() {
            hash ^= u64::from(byte.to_ascii_lowercase());
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (hash % self.dimension as u64) as usize
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        if text.trim().is_empty() {
            return Err(MemoryError::InvalidInput {
                message: "cannot embed empty text".to_string(),
            });
        }
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.split_whitespace() {
            vector[self.bucket(token)] += 1.0;
        }
        l2_normalise(&mut vector);
        Ok(vector)
    }
}

/// Completer that replays a scripted queue of responses.
///
/// When the queue runs dry it returns [`Completion::empty`], which downstream
/// means "model silence" (extraction sees malformed output, reconciliation
/// takes the default ADD).
#[derive(Default)]
pub struct ScriptedCompleter {
    responses: Mutex<VecDeque<Result<Completion, MemoryError>>>,
    prompts: Mutex<Vec<RecordedPrompt>>,
}

/// A prompt observed by the scripted completer.
#[derive(Clone, Debug)]
pub struct RecordedPrompt {
    pub system: String,
    pub user: String,
    pub tool_names: Vec<String>,
}

impl ScriptedCompleter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful completion.
    pub fn push(&self, completion: Completion) {
        self.responses.lock().push_back(Ok(completion));
    }

    /// Queues a failure.
    pub fn push_error(&self, error: MemoryError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Every prompt seen so far, in call order.
    #[must_use]
    pub fn prompts(&self) -> Vec<RecordedPrompt> {
        self.prompts.lock().clone()
    }

    /// Number of completions served.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl Completer for ScriptedCompleter {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        tools: &[ToolSpec],
    ) -> Result<Completion, MemoryError> {
        self.prompts.lock().push(RecordedPrompt {
            system: system.to_string(),
            user: user.to_string(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });
        match self.responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(Completion::empty()),
        }
    }
}
