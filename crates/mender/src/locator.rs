use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::command::{LocatorSpec, Selector};
use crate::errors::PageError;
use crate::page::{ElementHandle, PageDriver};

/// Per-strategy timeout used when none is configured.
pub const DEFAULT_LOCATOR_TIMEOUT: Duration = Duration::from_secs(3);

/// One failed strategy in a resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyAttempt {
    pub selector: Selector,
    pub error: PageError,
}

impl StrategyAttempt {
    pub fn timed_out(&self) -> bool {
        self.error.is_timeout()
    }
}

/// Every strategy of a locator spec failed. Carries each strategy's error in
/// the order tried.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionFailure {
    pub attempts: Vec<StrategyAttempt>,
    pub timeout: Duration,
}

impl ResolutionFailure {
    /// True when every strategy ran out of time rather than failing outright.
    pub fn all_timed_out(&self) -> bool {
        !self.attempts.is_empty() && self.attempts.iter().all(StrategyAttempt::timed_out)
    }

    pub fn tried(&self) -> impl Iterator<Item = &Selector> {
        self.attempts.iter().map(|a| &a.selector)
    }
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Element not found with any of {} locator strategies (timeout {:?} each)",
            self.attempts.len(),
            self.timeout
        )?;
        for attempt in &self.attempts {
            write!(f, "; {} -> {}", attempt.selector, attempt.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ResolutionFailure {}

/// Resolves a [`LocatorSpec`] against the live page: the primary strategy
/// first, then each fallback in listed order, each bounded by its own timeout.
///
/// Worst case a resolution takes `timeout × spec.strategy_count()`.
#[derive(Clone)]
pub struct Locator {
    page: Arc<dyn PageDriver>,
    spec: LocatorSpec,
    timeout: Duration,
}

impl Locator {
    pub fn new(page: Arc<dyn PageDriver>, spec: LocatorSpec) -> Self {
        Self {
            page,
            spec,
            timeout: DEFAULT_LOCATOR_TIMEOUT,
        }
    }

    /// Set the per-strategy timeout.
    pub fn set_default_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn spec(&self) -> &LocatorSpec {
        &self.spec
    }

    #[instrument(level = "debug", skip(self), fields(locator = %self.spec))]
    pub async fn resolve(&self) -> Result<ElementHandle, ResolutionFailure> {
        let mut attempts = Vec::with_capacity(self.spec.strategy_count());

        for (i, selector) in self.spec.selectors().enumerate() {
            match self.try_selector(selector).await {
                Ok(element) => {
                    if i > 0 {
                        debug!(strategy = %selector.strategy(), "Resolved via fallback #{}", i);
                    }
                    return Ok(element);
                }
                Err(error) => {
                    debug!(%selector, "Strategy failed: {}", error);
                    attempts.push(StrategyAttempt {
                        selector: selector.clone(),
                        error,
                    });
                }
            }
        }

        warn!(
            "All {} strategies failed for {}",
            attempts.len(),
            self.spec
        );
        Err(ResolutionFailure {
            attempts,
            timeout: self.timeout,
        })
    }

    async fn try_selector(&self, selector: &Selector) -> Result<ElementHandle, PageError> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.page.query(selector, timeout)).await {
            Ok(Ok(element)) => Ok(element),
            // Drivers report an exhausted wait as not-found; surface it as a timeout
            Ok(Err(PageError::ElementNotFound(inner))) if timeout > Duration::ZERO => {
                Err(PageError::Timeout(format!(
                    "Timed out after {timeout:?} waiting for {selector}. Original error: {inner}"
                )))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PageError::Timeout(format!(
                "Timed out after {timeout:?} waiting for {selector}"
            ))),
        }
    }
}

/// Resolves `spec` with `timeout` per strategy.
pub async fn resolve(
    spec: &LocatorSpec,
    page: Arc<dyn PageDriver>,
    timeout: Duration,
) -> Result<ElementHandle, ResolutionFailure> {
    Locator::new(page, spec.clone())
        .set_default_timeout(timeout)
        .resolve()
        .await
}
