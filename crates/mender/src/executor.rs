use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::command::{ActionType, Command};
use crate::errors::{ExecutionError, PageError};
use crate::locator::{Locator, DEFAULT_LOCATOR_TIMEOUT};
use crate::page::{ElementHandle, PageDriver};

const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs single commands against the live page.
#[derive(Clone)]
pub struct Executor {
    page: Arc<dyn PageDriver>,
    step_timeout: Duration,
    navigation_timeout: Duration,
}

impl Executor {
    pub fn new(page: Arc<dyn PageDriver>) -> Self {
        Self {
            page,
            step_timeout: DEFAULT_LOCATOR_TIMEOUT,
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
        }
    }

    /// Per-strategy and per-operation timeout.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    pub fn page(&self) -> &Arc<dyn PageDriver> {
        &self.page
    }

    #[instrument(level = "debug", skip(self, command), fields(action = %command.action))]
    pub async fn execute(&self, command: &Command) -> Result<(), ExecutionError> {
        command
            .check_shape()
            .map_err(ExecutionError::InvalidCommand)?;

        match command.action {
            ActionType::Navigate => self.navigate(command).await,
            ActionType::Click => self.click(command).await,
            ActionType::Type => self.type_text(command).await,
            ActionType::Select => self.select(command).await,
            ActionType::Hover => self.hover(command).await,
            ActionType::Press => self.press(command).await,
            ActionType::Wait => self.wait(command).await,
            ActionType::WaitForSelector => self.resolve(command).await.map(|_| ()),
            ActionType::AssertVisible => self.assert_visible(command).await,
            ActionType::AssertText => self.assert_text(command).await,
            ActionType::AssertUrl => self.assert_url(command).await,
        }
    }

    fn timeout_for(&self, command: &Command) -> Duration {
        command
            .params
            .timeout_ms
            .map(Duration::from_millis)
            .filter(|t| !t.is_zero())
            .unwrap_or(self.step_timeout)
    }

    async fn bounded<T>(
        &self,
        timeout: Duration,
        what: &str,
        op: impl Future<Output = Result<T, PageError>>,
    ) -> Result<T, ExecutionError> {
        match tokio::time::timeout(timeout, op).await {
            Ok(result) => result.map_err(ExecutionError::from),
            Err(_) => Err(PageError::Timeout(format!("{what} did not finish within {timeout:?}")).into()),
        }
    }

    async fn resolve(&self, command: &Command) -> Result<ElementHandle, ExecutionError> {
        let spec = command.locator.as_ref().ok_or_else(|| {
            ExecutionError::InvalidCommand(format!("'{}' requires a locator", command.action))
        })?;
        let element = Locator::new(self.page.clone(), spec.clone())
            .set_default_timeout(self.timeout_for(command))
            .resolve()
            .await?;
        debug!(element = %element.id, "Resolved element");
        Ok(element)
    }

    fn value<'a>(&self, command: &'a Command) -> Result<&'a str, ExecutionError> {
        command.value().ok_or_else(|| {
            ExecutionError::InvalidCommand(format!("'{}' requires a value", command.action))
        })
    }

    async fn navigate(&self, command: &Command) -> Result<(), ExecutionError> {
        let url = self.value(command)?;
        let timeout = self.navigation_timeout;
        self.bounded(timeout, "navigation", self.page.navigate(url, timeout))
            .await
    }

    async fn click(&self, command: &Command) -> Result<(), ExecutionError> {
        let element = self.resolve(command).await?;
        self.bounded(self.step_timeout, "click", self.page.click(&element))
            .await
    }

    async fn type_text(&self, command: &Command) -> Result<(), ExecutionError> {
        let text = self.value(command)?;
        let element = self.resolve(command).await?;
        self.bounded(self.step_timeout, "typing", self.page.type_text(&element, text))
            .await
    }

    async fn select(&self, command: &Command) -> Result<(), ExecutionError> {
        let option = self.value(command)?;
        let element = self.resolve(command).await?;
        self.bounded(
            self.step_timeout,
            "option selection",
            self.page.select_option(&element, option),
        )
        .await
    }

    async fn hover(&self, command: &Command) -> Result<(), ExecutionError> {
        let element = self.resolve(command).await?;
        self.bounded(self.step_timeout, "hover", self.page.hover(&element))
            .await
    }

    async fn press(&self, command: &Command) -> Result<(), ExecutionError> {
        let key = self.value(command)?;
        self.bounded(self.step_timeout, "key press", self.page.press_key(key))
            .await
    }

    async fn wait(&self, command: &Command) -> Result<(), ExecutionError> {
        let duration = Duration::from_millis(command.params.timeout_ms.unwrap_or(0));
        if duration.is_zero() {
            return Ok(());
        }
        self.page.wait(duration).await.map_err(ExecutionError::from)
    }

    async fn assert_visible(&self, command: &Command) -> Result<(), ExecutionError> {
        let element = self.resolve(command).await?;
        let visible = self
            .bounded(self.step_timeout, "visibility check", self.page.is_visible(&element))
            .await?;
        if visible {
            Ok(())
        } else {
            Err(ExecutionError::Assertion(format!(
                "expected {} to be visible",
                element.selector
            )))
        }
    }

    async fn assert_text(&self, command: &Command) -> Result<(), ExecutionError> {
        let expected = self.value(command)?;
        let element = self.resolve(command).await?;
        let actual = self
            .bounded(self.step_timeout, "text read", self.page.text_content(&element))
            .await?;
        if actual.contains(expected.trim()) {
            Ok(())
        } else {
            Err(ExecutionError::Assertion(format!(
                "expected text '{expected}' in {}, found '{}'",
                element.selector,
                actual.trim()
            )))
        }
    }

    async fn assert_url(&self, command: &Command) -> Result<(), ExecutionError> {
        let expected = self.value(command)?;
        let actual = self
            .bounded(self.step_timeout, "url read", self.page.current_url())
            .await?;
        if actual.contains(expected) {
            Ok(())
        } else {
            Err(ExecutionError::Assertion(format!(
                "expected URL containing '{expected}', found '{actual}'"
            )))
        }
    }
}
