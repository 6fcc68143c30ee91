use thiserror::Error;

use crate::locator::ResolutionFailure;
use crate::subtask::SubtaskStatus;

/// Hard failures that escape the healing pipeline.
///
/// Everything else (model hiccups, page failures, validation rejections) is
/// absorbed into failure contexts and unit status.
#[derive(Error, Debug)]
pub enum MenderError {
    #[error("Illegal state transition for unit '{unit}': {from} -> {to}")]
    IllegalTransition {
        unit: String,
        from: SubtaskStatus,
        to: SubtaskStatus,
    },

    #[error("Artifact I/O error at {path}: {source}")]
    ArtifactIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact format error at {path}: {message}")]
    ArtifactFormat { path: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Typed failures reported by a live page driver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PageError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Element is not visible: {0}")]
    ElementNotVisible(String),

    #[error("Element is detached from DOM: {0}")]
    ElementDetached(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Browser connection error: {0}")]
    Connection(String),

    #[error("Script error: {0}")]
    Script(String),
}

impl PageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PageError::ElementNotFound(_) | PageError::ElementDetached(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PageError::Timeout(_))
    }
}

/// Failures reported by a language-model provider.
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    Request(String),

    #[error("Model returned an unusable response: {0}")]
    InvalidResponse(String),

    #[error("Model provider is not configured: {0}")]
    NotConfigured(String),
}

/// Why a single command failed to execute against the live page.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error(transparent)]
    Resolution(#[from] ResolutionFailure),

    #[error(transparent)]
    Page(#[from] PageError),

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

impl ExecutionError {
    /// The resolver aggregate, when the failure came from locator resolution.
    pub fn resolution(&self) -> Option<&ResolutionFailure> {
        match self {
            ExecutionError::Resolution(failure) => Some(failure),
            _ => None,
        }
    }
}
