//! Decorators around [`LanguageModel`]: reply memoization and usage accounting.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{FinishReason, GenerateOptions, LanguageModel, ModelResponse};
use crate::errors::ModelError;

/// Replies kept by [`CachedModel::new`].
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Default)]
struct Entries {
    replies: HashMap<String, ModelResponse>,
    /// Keys oldest first
    order: VecDeque<String>,
}

impl Entries {
    fn insert(&mut self, key: String, response: ModelResponse, capacity: usize) {
        if self.replies.insert(key.clone(), response).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.replies.remove(&oldest);
                debug!(key = %&oldest[..12], "Evicted model cache entry");
            }
        }
    }
}

/// Memoizes replies per (model, options, prompt), evicting the oldest entry
/// once `capacity` replies are held.
///
/// Failed calls, empty replies and truncated replies are never cached.
pub struct CachedModel {
    inner: Arc<dyn LanguageModel>,
    entries: Mutex<Entries>,
    capacity: usize,
    hits: AtomicU64,
}

impl CachedModel {
    pub fn new(inner: Arc<dyn LanguageModel>) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_CAPACITY)
    }

    /// A capacity of zero disables caching.
    pub fn with_capacity(inner: Arc<dyn LanguageModel>, capacity: usize) -> Self {
        Self {
            inner,
            entries: Mutex::new(Entries::default()),
            capacity,
            hits: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.replies.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.replies.is_empty()
    }

    fn key(&self, prompt: &str, options: &GenerateOptions) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.inner.name().as_bytes());
        hasher.update(&[0]);
        hasher.update(options.model.as_deref().unwrap_or("").as_bytes());
        hasher.update(&[0]);
        hasher.update(options.system_prompt.as_deref().unwrap_or("").as_bytes());
        hasher.update(&[0]);
        for turn in &options.conversation_history {
            hasher.update(turn.role.as_str().as_bytes());
            hasher.update(&[1]);
            hasher.update(turn.content.as_bytes());
            hasher.update(&[0]);
        }
        if let Some(t) = options.temperature {
            hasher.update(&t.to_le_bytes());
        }
        hasher.update(prompt.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

#[async_trait]
impl LanguageModel for CachedModel {
    fn name(&self) -> String {
        format!("cached({})", self.inner.name())
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ModelError> {
        let key = self.key(prompt, options);
        if let Some(hit) = self.entries.lock().await.replies.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %&key[..12], "Model cache hit");
            return Ok(hit.clone());
        }

        let response = self.inner.generate(prompt, options).await?;
        if !response.content.trim().is_empty() && response.finish_reason != FinishReason::Length {
            self.entries
                .lock()
                .await
                .insert(key, response.clone(), self.capacity);
        }
        Ok(response)
    }
}

/// Running totals collected by [`UsageTracker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub calls: u64,
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Counts calls and tokens passing through a model.
pub struct UsageTracker {
    inner: Arc<dyn LanguageModel>,
    calls: AtomicU64,
    failures: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl UsageTracker {
    pub fn new(inner: Arc<dyn LanguageModel>) -> Self {
        Self {
            inner,
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
        }
    }

    pub fn report(&self) -> UsageReport {
        UsageReport {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl LanguageModel for UsageTracker {
    fn name(&self) -> String {
        self.inner.name()
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.inner.generate(prompt, options).await {
            Ok(response) => {
                self.prompt_tokens
                    .fetch_add(response.usage.prompt_tokens, Ordering::Relaxed);
                self.completion_tokens
                    .fetch_add(response.usage.completion_tokens, Ordering::Relaxed);
                Ok(response)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}
