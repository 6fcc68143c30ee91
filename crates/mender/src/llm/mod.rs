//! Language-model service contract, providers and decorators.
//!
//! Provider state is never global: engines receive an `Arc<dyn LanguageModel>`
//! built from configuration, and caching or usage accounting wrap that trait
//! object rather than living in the engines.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{ModelConfig, ModelProvider};
use crate::errors::ModelError;

pub mod cache;
pub mod ollama;
pub mod openai;

pub use cache::{CachedModel, UsageReport, UsageTracker, DEFAULT_CACHE_CAPACITY};
pub use ollama::OllamaModel;
pub use openai::OpenAiModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    pub system_prompt: Option<String>,
    /// Overrides the provider's default model
    pub model: Option<String>,
    pub conversation_history: Vec<ChatTurn>,
    pub temperature: Option<f32>,
}

impl GenerateOptions {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Output was cut at the token limit; content may be truncated
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn from_provider(reason: Option<&str>) -> Self {
        match reason {
            None | Some("stop") | Some("end_turn") => FinishReason::Stop,
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

/// A text-generation service. Treated as slow and unreliable: callers must
/// tolerate errors and empty, malformed or truncated content.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider/model label for logs.
    fn name(&self) -> String;

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ModelError>;
}

/// Calls the model and degrades any failure to empty content.
pub async fn generate_text(
    model: &dyn LanguageModel,
    prompt: &str,
    options: &GenerateOptions,
    purpose: &str,
) -> String {
    match model.generate(prompt, options).await {
        Ok(response) => {
            if response.finish_reason == FinishReason::Length {
                warn!(purpose, "Model reply hit the length limit and may be truncated");
            }
            debug!(
                purpose,
                model = %model.name(),
                prompt_tokens = response.usage.prompt_tokens,
                completion_tokens = response.usage.completion_tokens,
                "Model reply received"
            );
            response.content
        }
        Err(e) => {
            warn!(purpose, model = %model.name(), "Model call failed: {}", e);
            String::new()
        }
    }
}

/// Rough token count for providers that do not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Builds the configured provider, wrapped in the cache when enabled.
pub fn from_config(config: &ModelConfig) -> Result<Arc<dyn LanguageModel>, ModelError> {
    let provider: Arc<dyn LanguageModel> = match config.provider {
        ModelProvider::Ollama => Arc::new(OllamaModel::new(
            &config.ollama_host,
            config.ollama_port,
            config.model.clone(),
        )?),
        ModelProvider::OpenAi => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                ModelError::NotConfigured("OPENAI_API_KEY is not set".to_string())
            })?;
            Arc::new(OpenAiModel::new(
                config.openai_base_url.clone(),
                api_key,
                config.model.clone(),
            )?)
        }
    };

    if config.cache {
        Ok(Arc::new(CachedModel::with_capacity(
            provider,
            config.cache_capacity,
        )))
    } else {
        Ok(provider)
    }
}
