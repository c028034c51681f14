//! OpenAI-compatible providers, enabled by the `openai` cargo feature.
//!
//! Both providers speak to any OpenAI-compatible endpoint via `async-openai`
//! and read their credentials through explicit [`from_env`] constructors
//! (`OPENAI_API_KEY`, `OPENAI_BASE_URL`, `OPENAI_EMBEDDING_MODEL`,
//! `OPENAI_CHAT_MODEL`); the engine core itself never touches the
//! environment.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestUserMessage, ChatCompletionTool, ChatCompletionToolType,
    CreateChatCompletionRequestArgs, FunctionObject,
};
use async_openai::types::embeddings::CreateEmbeddingRequestArgs;
use async_trait::async_trait;

use crate::error::MemoryError;
use crate::store::l2_normalise;

use super::{Completer, Completion, Embedder, ToolCall, ToolSpec};

fn env_var(name: &str) -> Result<String, MemoryError> {
    dotenvy::var(name).map_err(|_| MemoryError::InvalidInput {
        message: format!("missing environment variable {name}"),
    })
}

fn client_from_env() -> Result<Client<OpenAIConfig>, MemoryError> {
    let mut config = OpenAIConfig::new().with_api_key(env_var("OPENAI_API_KEY")?);
    if let Ok(base_url) = dotenvy::var("OPENAI_BASE_URL") {
        config = config.with_api_base(base_url);
    }
    Ok(Client::with_config(config))
}

/// Embedder backed by an OpenAI-compatible embeddings endpoint.
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(client: Client<OpenAIConfig>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client,
            model: model.into(),
            dimension,
        }
    }

    /// Builds an embedder from `OPENAI_*` environment variables.
    pub fn from_env(dimension: usize) -> Result<Self, MemoryError> {
        let client = client_from_env()?;
        let model = env_var("OPENAI_EMBEDDING_MODEL")?;
        Ok(Self::new(client, model, dimension))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::EmbedderUnavailable {
                message: "empty embedding response".to_string(),
            })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(texts.to_vec())
            .dimensions(self.dimension as u32)
            .build()
            .map_err(|err| MemoryError::InvalidInput {
                message: err.to_string(),
            })?;

        let response = self.client.embeddings().create(request).await.map_err(|err| {
            MemoryError::EmbedderUnavailable {
                message: err.to_string(),
            }
        })?;

        // The API may reorder items; restore input order by index.
        let mut data = response.data;
        data.sort_by_key(|e| e.index);
        if data.len() != texts.len() {
            return Err(MemoryError::EmbedderUnavailable {
                message: format!(
                    "embedding count mismatch: expected {}, got {}",
                    texts.len(),
                    data.len()
                ),
            });
        }

        Ok(data
            .into_iter()
            .map(|e| {
                let mut vector = e.embedding;
                l2_normalise(&mut vector);
                vector
            })
            .collect())
    }
}

/// Completer backed by an OpenAI-compatible chat endpoint.
pub struct OpenAiCompleter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiCompleter {
    pub fn new(client: Client<OpenAIConfig>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Builds a completer from `OPENAI_*` environment variables.
    pub fn from_env() -> Result<Self, MemoryError> {
        let client = client_from_env()?;
        let model = env_var("OPENAI_CHAT_MODEL")?;
        Ok(Self::new(client, model))
    }
}

#[async_trait]
impl Completer for OpenAiCompleter {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        tools: &[ToolSpec],
    ) -> Result<Completion, MemoryError> {
        let messages = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage::from(system)),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage::from(user)),
        ];

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(messages);
        if !tools.is_empty() {
            let tools: Vec<ChatCompletionTool> = tools
                .iter()
                .map(|spec| ChatCompletionTool {
                    r#type: ChatCompletionToolType::Function,
                    function: FunctionObject {
                        name: spec.name.clone(),
                        description: Some(spec.description.clone()),
                        parameters: Some(spec.parameters.clone()),
                        strict: None,
                    },
                })
                .collect();
            builder.tools(tools);
        }
        let request = builder.build().map_err(|err| MemoryError::InvalidInput {
            message: err.to_string(),
        })?;

        let response = self.client.chat().create(request).await.map_err(|err| {
            MemoryError::CompleterUnavailable {
                message: err.to_string(),
            }
        })?;

        let Some(choice) = response.choices.into_iter().next() else {
            return Ok(Completion::empty());
        };

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        Ok(Completion {
            content: choice.message.content,
            tool_calls,
        })
    }
}
