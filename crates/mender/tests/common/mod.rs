#![allow(dead_code)]

use async_trait::async_trait;
use mender::errors::{ModelError, PageError};
use mender::llm::{FinishReason, GenerateOptions, LanguageModel, ModelResponse, Usage};
use mender::page::{ElementHandle, PageDriver};
use mender::validator::find_elements;
use mender::Selector;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::Level;

pub fn setup_logging() {
    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Page over fixed markup; interactions are recorded as strings.
pub struct StaticPage {
    markup: Mutex<String>,
    actions: Mutex<Vec<String>>,
}

impl StaticPage {
    pub fn new(html: &str) -> Self {
        Self {
            markup: Mutex::new(html.to_string()),
            actions: Mutex::new(Vec::new()),
        }
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    fn check(&self, element: &ElementHandle) -> Result<(), PageError> {
        if find_elements(&element.selector, &self.markup.lock().unwrap()).is_empty() {
            return Err(PageError::ElementDetached(element.selector.to_string()));
        }
        Ok(())
    }

    fn record(&self, action: String) {
        self.actions.lock().unwrap().push(action);
    }
}

#[async_trait]
impl PageDriver for StaticPage {
    async fn query(&self, selector: &Selector, _timeout: Duration) -> Result<ElementHandle, PageError> {
        if find_elements(selector, &self.markup.lock().unwrap()).is_empty() {
            return Err(PageError::ElementNotFound(selector.to_string()));
        }
        Ok(ElementHandle::new(selector.to_string(), selector.clone()))
    }

    async fn count(&self, selector: &Selector) -> Result<usize, PageError> {
        Ok(find_elements(selector, &self.markup.lock().unwrap()).len())
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), PageError> {
        self.record(format!("navigate {url}"));
        Ok(())
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), PageError> {
        self.check(element)?;
        self.record(format!("click {}", element.selector));
        Ok(())
    }

    async fn hover(&self, element: &ElementHandle) -> Result<(), PageError> {
        self.check(element)?;
        self.record(format!("hover {}", element.selector));
        Ok(())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<(), PageError> {
        self.check(element)?;
        self.record(format!("type {} {text}", element.selector));
        Ok(())
    }

    async fn select_option(&self, element: &ElementHandle, value: &str) -> Result<(), PageError> {
        self.check(element)?;
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
        let markup = self.markup.lock().unwrap().clone();
        Ok(find_elements(&element.selector, &markup)
            .first()
            .and_then(|e| e.tag.attr(name).map(str::to_string)))
    }

    async fn text_content(&self, element: &ElementHandle) -> Result<String, PageError> {
        let markup = self.markup.lock().unwrap().clone();
        Ok(find_elements(&element.selector, &markup)
            .first()
            .map(|e| e.text.clone())
            .unwrap_or_default())
    }

    async fn is_visible(&self, element: &ElementHandle) -> Result<bool, PageError> {
        self.check(element)?;
        Ok(true)
    }

    async fn current_url(&self) -> Result<String, PageError> {
        Ok("https://shop.test/".to_string())
    }

    async fn page_markup(&self) -> Result<String, PageError> {
        Ok(self.markup.lock().unwrap().clone())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, PageError> {
        Err(PageError::UnsupportedOperation("no screenshots".to_string()))
    }
}

/// Answers prompts from a fixed queue, then with empty replies.
pub struct QueueModel {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<usize>,
}

impl QueueModel {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl LanguageModel for QueueModel {
    fn name(&self) -> String {
        "queue".to_string()
    }

    async fn generate(
        &self,
        _prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<ModelResponse, ModelError> {
        *self.calls.lock().unwrap() += 1;
        let content = self.replies.lock().unwrap().pop_front().unwrap_or_default();
        Ok(ModelResponse {
            content,
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
        })
    }
}
