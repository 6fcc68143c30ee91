//! Executable units and their lifecycle.
//!
//! ```text
//! Pending ──> InProgress ──> Completed
//!    │            ├────────> Failed
//!    └────────────┴────────> Blocked
//! ```
//!
//! Every other transition is a caller bug and is reported as
//! [`MenderError::IllegalTransition`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

use crate::analyzer::FailureContext;
use crate::command::Command;
use crate::errors::MenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl SubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubtaskStatus::Completed | SubtaskStatus::Failed | SubtaskStatus::Blocked
        )
    }

    pub fn can_transition_to(&self, to: SubtaskStatus) -> bool {
        use SubtaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Blocked)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Blocked)
        )
    }
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::InProgress => "in_progress",
            SubtaskStatus::Completed => "completed",
            SubtaskStatus::Failed => "failed",
            SubtaskStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Where a unit's commands live on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    /// Index of the unit's first command in the artifact
    pub offset: usize,
}

/// Outcome details, set once when a unit reaches a terminal status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Replacement commands requested from the model across the unit
    pub healing_attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_history: Vec<FailureContext>,
    /// Indexes of commands that succeeded only after substitution
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub healed_commands: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl UnitResult {
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// The smallest independently tracked sequence of commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    pub commands: Vec<Command>,
    status: SubtaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<UnitResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
}

impl Subtask {
    pub fn new(description: impl Into<String>, commands: Vec<Command>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            commands,
            status: SubtaskStatus::Pending,
            result: None,
            source: None,
            started_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Remembers where the commands came from so healed versions can be
    /// written back.
    pub fn from_artifact(mut self, path: impl Into<PathBuf>, offset: usize) -> Self {
        self.source = Some(ArtifactRef {
            path: path.into(),
            offset,
        });
        self
    }

    pub fn status(&self) -> SubtaskStatus {
        self.status
    }

    pub fn result(&self) -> Option<&UnitResult> {
        self.result.as_ref()
    }

    fn transition(&mut self, to: SubtaskStatus) -> Result<(), MenderError> {
        if !self.status.can_transition_to(to) {
            return Err(MenderError::IllegalTransition {
                unit: self.id.clone(),
                from: self.status,
                to,
            });
        }
        debug!(unit = %self.id, from = %self.status, %to, "Unit transition");
        self.status = to;
        Ok(())
    }

    fn finish(&mut self, to: SubtaskStatus, mut result: UnitResult) -> Result<(), MenderError> {
        self.transition(to)?;
        result.started_at = self.started_at;
        result.finished_at = Some(Utc::now());
        self.result = Some(result);
        Ok(())
    }

    pub fn mark_in_progress(&mut self) -> Result<(), MenderError> {
        self.transition(SubtaskStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, result: UnitResult) -> Result<(), MenderError> {
        self.finish(SubtaskStatus::Completed, result)
    }

    /// The error is recorded on the result; an empty message is replaced by a
    /// generic one so a failed unit always explains itself.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        mut result: UnitResult,
    ) -> Result<(), MenderError> {
        let error = error.into();
        result.error = Some(if error.trim().is_empty() {
            "unit failed without an error message".to_string()
        } else {
            error
        });
        self.finish(SubtaskStatus::Failed, result)
    }

    pub fn mark_blocked(&mut self, reason: impl Into<String>) -> Result<(), MenderError> {
        let reason = reason.into();
        let result = UnitResult {
            error: Some(reason.clone()),
            blocked_reason: Some(reason),
            ..UnitResult::default()
        };
        self.finish(SubtaskStatus::Blocked, result)
    }
}
