use async_trait::async_trait;
use std::time::Duration;

use crate::command::Selector;
use crate::errors::PageError;

/// A resolved element on the live page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    /// Driver-specific identity of the element
    pub id: String,
    /// The selector that resolved it
    pub selector: Selector,
}

impl ElementHandle {
    pub fn new(id: impl Into<String>, selector: Selector) -> Self {
        Self {
            id: id.into(),
            selector,
        }
    }
}

/// Primitive operations on the live browser page.
///
/// The page is the single shared mutable resource of a run; the healer owns
/// it exclusively while a unit executes. Drivers report failures as typed
/// [`PageError`]s so that "not found" and "timeout" stay distinguishable.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Finds one element for the selector, waiting up to `timeout`.
    async fn query(&self, selector: &Selector, timeout: Duration)
        -> Result<ElementHandle, PageError>;

    /// Number of elements currently matching the selector.
    async fn count(&self, selector: &Selector) -> Result<usize, PageError>;

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), PageError>;

    async fn click(&self, element: &ElementHandle) -> Result<(), PageError>;

    async fn hover(&self, element: &ElementHandle) -> Result<(), PageError>;

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<(), PageError>;

    async fn select_option(&self, element: &ElementHandle, value: &str) -> Result<(), PageError>;

    async fn press_key(&self, key: &str) -> Result<(), PageError>;

    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, PageError>;

    async fn text_content(&self, element: &ElementHandle) -> Result<String, PageError>;

    async fn is_visible(&self, element: &ElementHandle) -> Result<bool, PageError>;

    async fn current_url(&self) -> Result<String, PageError>;

    /// Full document markup as it is right now.
    async fn page_markup(&self) -> Result<String, PageError>;

    /// PNG bytes of the viewport.
    async fn screenshot(&self) -> Result<Vec<u8>, PageError>;

    async fn wait(&self, duration: Duration) -> Result<(), PageError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }
}
