use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{ChatRole, FinishReason, GenerateOptions, LanguageModel, ModelResponse, Usage};
use crate::errors::ModelError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Any server speaking the OpenAI chat-completions protocol.
#[derive(Debug, Clone)]
pub struct OpenAiModel {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ResponseUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiModel {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ModelError::NotConfigured(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

fn build_messages<'a>(prompt: &'a str, options: &'a GenerateOptions) -> Vec<ChatMessage<'a>> {
    let mut messages = Vec::with_capacity(options.conversation_history.len() + 2);
    if let Some(system) = &options.system_prompt {
        messages.push(ChatMessage {
            role: ChatRole::System.as_str(),
            content: system,
        });
    }
    for turn in &options.conversation_history {
        messages.push(ChatMessage {
            role: turn.role.as_str(),
            content: &turn.content,
        });
    }
    messages.push(ChatMessage {
        role: ChatRole::User.as_str(),
        content: prompt,
    });
    messages
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    fn name(&self) -> String {
        format!("openai/{}", self.model)
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ModelError> {
        let model = options.model.as_deref().unwrap_or(&self.model);
        let request = ChatRequest {
            model,
            messages: build_messages(prompt, options),
            temperature: options.temperature,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ModelError::Request(format!("Chat completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Request(format!(
                "Chat completion returned {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            ModelError::InvalidResponse(format!("Failed to parse chat completion: {e}"))
        })?;
        into_model_response(parsed)
    }
}

fn into_model_response(parsed: ChatResponse) -> Result<ModelResponse, ModelError> {
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::InvalidResponse("No choices in reply".to_string()))?;
    let content = choice
        .message
        .and_then(|m| m.content)
        .unwrap_or_default();
    let usage = parsed
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        })
        .unwrap_or_default();
    debug!(total_tokens = usage.total(), "Chat completion parsed");
    Ok(ModelResponse {
        content,
        usage,
        finish_reason: FinishReason::from_provider(choice.finish_reason.as_deref()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatTurn;

    #[test]
    fn test_messages_include_system_and_history() {
        let options = GenerateOptions {
            system_prompt: Some("be terse".to_string()),
            conversation_history: vec![ChatTurn::user("a"), ChatTurn::assistant("b")],
            ..GenerateOptions::default()
        };
        let messages = build_messages("c", &options);
        let roles: Vec<&str> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[3].content, "c");
    }

    #[test]
    fn test_parse_reply() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": "{\"action\":\"click\"}"}, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let response = into_model_response(parsed).unwrap();
        assert_eq!(response.content, r#"{"action":"click"}"#);
        assert_eq!(response.usage.total(), 17);
        assert_eq!(response.finish_reason, FinishReason::Length);
    }

    #[test]
    fn test_empty_choices_is_invalid() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(
            into_model_response(parsed),
            Err(ModelError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let model = OpenAiModel::new("http://localhost:8080/v1/", "key", "gpt").unwrap();
        assert_eq!(model.endpoint(), "http://localhost:8080/v1/chat/completions");
    }
}
