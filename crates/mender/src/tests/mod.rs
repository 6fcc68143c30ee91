//! In-crate fakes shared by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::artifact::ArtifactStore;
use crate::command::{Command, Selector};
use crate::errors::{MenderError, ModelError, PageError};
use crate::llm::{estimate_tokens, FinishReason, GenerateOptions, LanguageModel, ModelResponse, Usage};
use crate::page::{ElementHandle, PageDriver};
use crate::validator::{find_elements, MarkupElement};

mod scenarios;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct PageState {
    markup: String,
    url: String,
    queried: Vec<String>,
    actions: Vec<String>,
}

/// A page backed by static markup. Queries match through the static
/// element finder; interactions are recorded as strings.
pub struct FakePage {
    state: Mutex<PageState>,
    hanging: Vec<String>,
    reveals: HashMap<String, String>,
}

impl FakePage {
    pub fn new(html: &str) -> Self {
        Self {
            state: Mutex::new(PageState {
                markup: html.to_string(),
                url: "about:blank".to_string(),
                ..PageState::default()
            }),
            hanging: Vec::new(),
            reveals: HashMap::new(),
        }
    }

    pub fn with_url(self, url: &str) -> Self {
        self.state.lock().unwrap().url = url.to_string();
        self
    }

    /// Queries for this selector never return.
    pub fn hang_on(mut self, selector: &str) -> Self {
        self.hanging.push(selector.to_string());
        self
    }

    /// Clicking the element found by `selector` swaps in `markup`.
    pub fn reveal_on_click(mut self, selector: &str, markup: &str) -> Self {
        self.reveals.insert(selector.to_string(), markup.to_string());
        self
    }

    pub fn set_markup(&self, html: &str) {
        self.state.lock().unwrap().markup = html.to_string();
    }

    pub fn markup(&self) -> String {
        self.state.lock().unwrap().markup.clone()
    }

    pub fn queried(&self) -> Vec<String> {
        self.state.lock().unwrap().queried.clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.state.lock().unwrap().actions.clone()
    }

    fn record(&self, action: String) {
        self.state.lock().unwrap().actions.push(action);
    }

    fn element(&self, handle: &ElementHandle) -> Result<MarkupElement, PageError> {
        let markup = self.state.lock().unwrap().markup.clone();
        find_elements(&handle.selector, &markup)
            .into_iter()
            .next()
            .ok_or_else(|| PageError::ElementDetached(handle.selector.to_string()))
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn query(
        &self,
        selector: &Selector,
        _timeout: Duration,
    ) -> Result<ElementHandle, PageError> {
        let key = selector.to_string();
        let markup = {
            let mut state = self.state.lock().unwrap();
            state.queried.push(key.clone());
            state.markup.clone()
        };
        if self.hanging.contains(&key) {
            std::future::pending::<()>().await;
        }
        if find_elements(selector, &markup).is_empty() {
            return Err(PageError::ElementNotFound(key));
        }
        Ok(ElementHandle::new(format!("fake-{key}"), selector.clone()))
    }

    async fn count(&self, selector: &Selector) -> Result<usize, PageError> {
        let markup = self.state.lock().unwrap().markup.clone();
        Ok(find_elements(selector, &markup).len())
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), PageError> {
        self.state.lock().unwrap().url = url.to_string();
        self.record(format!("navigate {url}"));
        Ok(())
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), PageError> {
        self.element(element)?;
        let key = element.selector.to_string();
        self.record(format!("click {key}"));
        if let Some(markup) = self.reveals.get(&key) {
            self.set_markup(markup);
        }
        Ok(())
    }

    async fn hover(&self, element: &ElementHandle) -> Result<(), PageError> {
        self.element(element)?;
        self.record(format!("hover {}", element.selector));
        Ok(())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<(), PageError> {
        self.element(element)?;
        self.record(format!("type {} {text}", element.selector));
        Ok(())
    }

    async fn select_option(&self, element: &ElementHandle, value: &str) -> Result<(), PageError> {
        self.element(element)?;
        self.record(format!("select {} {value}", element.selector));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), PageError> {
        self.record(format!("press {key}"));
        Ok(())
    }

    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, PageError> {
        Ok(self.element(element)?.tag.attr(name).map(str::to_string))
    }

    async fn text_content(&self, element: &ElementHandle) -> Result<String, PageError> {
        Ok(self.element(element)?.text)
    }

    async fn is_visible(&self, element: &ElementHandle) -> Result<bool, PageError> {
        Ok(!self.element(element)?.tag.is_hidden())
    }

    async fn current_url(&self) -> Result<String, PageError> {
        Ok(self.state.lock().unwrap().url.clone())
    }

    async fn page_markup(&self) -> Result<String, PageError> {
        Ok(self.state.lock().unwrap().markup.clone())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, PageError> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn wait(&self, duration: Duration) -> Result<(), PageError> {
        self.record(format!("wait {}ms", duration.as_millis()));
        Ok(())
    }
}

/// A model that answers from a queue and records every prompt it saw.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    failing: bool,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Every call fails with a request error.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> String {
        "scripted".to_string()
    }

    async fn generate(
        &self,
        prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<ModelResponse, ModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.failing {
            return Err(ModelError::Request("connection refused".to_string()));
        }
        let content = self.replies.lock().unwrap().pop_front().unwrap_or_default();
        Ok(ModelResponse {
            usage: Usage {
                prompt_tokens: estimate_tokens(prompt),
                completion_tokens: estimate_tokens(&content),
            },
            content,
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Artifact store kept in memory, counting writes.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<HashMap<PathBuf, Vec<Command>>>,
    writes: Mutex<Vec<PathBuf>>,
}

impl MemoryStore {
    pub fn with_file(self, path: &str, commands: Vec<Command>) -> Self {
        self.files.lock().unwrap().insert(PathBuf::from(path), commands);
        self
    }

    pub fn commands(&self, path: &str) -> Vec<Command> {
        self.files
            .lock()
            .unwrap()
            .get(Path::new(path))
            .cloned()
            .unwrap_or_default()
    }

    pub fn writes(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn read(&self, path: &Path) -> Result<Vec<Command>, MenderError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| MenderError::ArtifactIo {
                path: path.display().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }

    async fn write(&self, path: &Path, commands: &[Command]) -> Result<(), MenderError> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), commands.to_vec());
        self.writes.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}
