//! Runtime configuration: YAML file plus environment overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::analyzer::AnalyzerOptions;
use crate::duration_parser::{parse_duration, serde_duration};
use crate::errors::MenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    #[default]
    Ollama,
    #[serde(alias = "openai-compatible", alias = "open_ai")]
    OpenAi,
}

impl std::str::FromStr for ModelProvider {
    type Err = MenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(ModelProvider::Ollama),
            "openai" | "open_ai" | "openai-compatible" => Ok(ModelProvider::OpenAi),
            other => Err(MenderError::Config(format!("Unknown model provider '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub model: String,
    pub ollama_host: String,
    pub ollama_port: u16,
    pub openai_base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    /// Replaces the built-in system prompts when set
    pub system_prompt: Option<String>,
    pub cache: bool,
    /// Replies kept before the oldest is evicted
    pub cache_capacity: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Ollama,
            model: "llama3.2".to_string(),
            ollama_host: "http://localhost".to_string(),
            ollama_port: 11434,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            temperature: Some(0.0),
            system_prompt: None,
            cache: true,
            cache_capacity: crate::llm::DEFAULT_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    pub max_markup_chars: usize,
    pub static_refine_attempts: u32,
    /// Added to the built-in list of locators that are only checked live
    pub exempt_patterns: Vec<String>,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            max_markup_chars: 12_000,
            static_refine_attempts: 3,
            exempt_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// Total attempts per command, the original included
    pub max_attempts: u32,
    /// Timeout of each locator strategy and each page operation
    #[serde(with = "serde_duration")]
    pub step_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub navigation_timeout: Duration,
    pub capture_markup: bool,
    pub capture_screenshot: bool,
    pub max_candidate_locators: usize,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step_timeout: Duration::from_secs(3),
            navigation_timeout: Duration::from_secs(30),
            capture_markup: true,
            capture_screenshot: false,
            max_candidate_locators: 50,
        }
    }
}

impl HealingConfig {
    /// Upper bound on time spent resolving one original command: every
    /// attempt may exhaust every strategy's timeout.
    /// Saturates at [`Duration::MAX`].
    pub fn worst_case_latency(&self, strategies: usize) -> Duration {
        let strategies = u32::try_from(strategies.max(1)).unwrap_or(u32::MAX);
        self.step_timeout
            .checked_mul(self.max_attempts.max(1))
            .and_then(|per_strategy| per_strategy.checked_mul(strategies))
            .unwrap_or(Duration::MAX)
    }

    pub fn analyzer_options(&self) -> AnalyzerOptions {
        AnalyzerOptions {
            capture_markup: self.capture_markup,
            capture_screenshot: self.capture_screenshot,
            max_locators: self.max_candidate_locators,
            ..AnalyzerOptions::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listen: String,
    /// How long to wait for the browser extension to connect
    #[serde(with = "serde_duration")]
    pub connect_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:17373".to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MenderConfig {
    pub model: ModelConfig,
    pub decomposition: DecompositionConfig,
    pub healing: HealingConfig,
    pub bridge: BridgeConfig,
}

impl MenderConfig {
    pub fn from_yaml(text: &str) -> Result<Self, MenderError> {
        serde_yaml::from_str(text)
            .map_err(|e| MenderError::Config(format!("Invalid configuration: {e}")))
    }

    /// Reads the optional file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, MenderError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    MenderError::Config(format!("Cannot read {}: {e}", path.display()))
                })?;
                Self::from_yaml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `MENDER_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), MenderError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(model) = var("MENDER_MODEL") {
            self.model.model = model;
        }
        if let Some(provider) = var("MENDER_PROVIDER") {
            self.model.provider = provider.parse()?;
        }
        if let Some(host) = var("MENDER_OLLAMA_HOST") {
            self.model.ollama_host = host;
        }
        if let Some(port) = var("MENDER_OLLAMA_PORT") {
            self.model.ollama_port = port
                .trim()
                .parse()
                .map_err(|_| MenderError::Config(format!("Invalid MENDER_OLLAMA_PORT '{port}'")))?;
        }
        if let Some(url) = var("MENDER_OPENAI_BASE_URL") {
            self.model.openai_base_url = url;
        }
        if let Some(key) = var("OPENAI_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(attempts) = var("MENDER_MAX_ATTEMPTS") {
            self.healing.max_attempts = attempts.trim().parse().map_err(|_| {
                MenderError::Config(format!("Invalid MENDER_MAX_ATTEMPTS '{attempts}'"))
            })?;
        }
        if let Some(timeout) = var("MENDER_STEP_TIMEOUT") {
            self.healing.step_timeout = parse_duration(&timeout)?;
        }
        debug!(provider = ?self.model.provider, model = %self.model.model, "Configuration loaded");
        Ok(())
    }
}
