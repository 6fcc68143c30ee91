use async_trait::async_trait;
use ollama_rs::{generation::completion::request::GenerationRequest, Ollama};
use reqwest::Url;

use super::{
    estimate_tokens, ChatTurn, FinishReason, GenerateOptions, LanguageModel, ModelResponse, Usage,
};
use crate::errors::ModelError;

/// A local Ollama server.
pub struct OllamaModel {
    client: Ollama,
    model: String,
}

impl OllamaModel {
    pub fn new(host: &str, port: u16, model: impl Into<String>) -> Result<Self, ModelError> {
        let url = server_url(host, port)?;
        Ok(Self {
            client: Ollama::builder().url(url).build(),
            model: model.into(),
        })
    }
}

/// The builder panics on URLs without a host, so those are rejected here.
fn server_url(host: &str, port: u16) -> Result<Url, ModelError> {
    let mut url = Url::parse(host)
        .map_err(|e| ModelError::NotConfigured(format!("invalid ollama host '{host}': {e}")))?;
    if !url.has_host() || url.set_port(Some(port)).is_err() {
        return Err(ModelError::NotConfigured(format!(
            "ollama host '{host}' cannot take a port"
        )));
    }
    Ok(url)
}

/// The completion endpoint has no chat turns, so history is folded into the
/// prompt text.
fn fold_history(history: &[ChatTurn], prompt: &str) -> String {
    if history.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::from("Conversation so far:\n");
    for turn in history {
        out.push_str(&format!("[{}] {}\n", turn.role.as_str(), turn.content));
    }
    out.push_str("\n[user] ");
    out.push_str(prompt);
    out
}

#[async_trait]
impl LanguageModel for OllamaModel {
    fn name(&self) -> String {
        format!("ollama/{}", self.model)
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ModelError> {
        let model = options.model.clone().unwrap_or_else(|| self.model.clone());
        let text = fold_history(&options.conversation_history, prompt);
        tracing::info!("sending prompt to ollama model: {}", model);

        let mut request = GenerationRequest::new(model, text.clone());
        if let Some(system) = &options.system_prompt {
            request = request.system(system.clone());
        }

        let response = self
            .client
            .generate(request)
            .await
            .map_err(|e| ModelError::Request(format!("ollama: {e}")))?;

        tracing::info!("successfully received response from Ollama");

        let prompt_chars = text.len() + options.system_prompt.as_ref().map_or(0, |s| s.len());
        let usage = Usage {
            prompt_tokens: (prompt_chars as u64).div_ceil(4),
            completion_tokens: estimate_tokens(&response.response),
        };
        let finish_reason = if response.done {
            FinishReason::Stop
        } else {
            FinishReason::Length
        };
        Ok(ModelResponse {
            content: response.response,
            usage,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_url() {
        let url = server_url("http://localhost", 11434).unwrap();
        assert_eq!(url.as_str(), "http://localhost:11434/");
        assert_eq!(
            server_url("https://gpu.internal:9999", 11434).unwrap().port(),
            Some(11434)
        );
        assert!(matches!(
            server_url("localhost", 11434),
            Err(ModelError::NotConfigured(_))
        ));
        assert!(server_url("mailto:ops@example.com", 11434).is_err());
        assert!(OllamaModel::new("http://localhost", 11434, "llama3.2").is_ok());
    }

    #[test]
    fn test_fold_history() {
        assert_eq!(fold_history(&[], "hi"), "hi");
        let folded = fold_history(
            &[ChatTurn::user("plan it"), ChatTurn::assistant("1. click")],
            "now fix it",
        );
        assert!(folded.starts_with("Conversation so far:"));
        assert!(folded.contains("[assistant] 1. click"));
        assert!(folded.ends_with("[user] now fix it"));
    }
}
