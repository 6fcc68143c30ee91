//! Self-healing execution of units and tasks.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::analyzer::{AnalyzerOptions, FailureAnalyzer};
use crate::artifact::{heal_artifact, ArtifactStore};
use crate::command::Command;
use crate::config::MenderConfig;
use crate::errors::MenderError;
use crate::executor::Executor;
use crate::llm::{GenerateOptions, LanguageModel};
use crate::page::PageDriver;
use crate::refinement::RefinementEngine;
use crate::subtask::{Subtask, SubtaskStatus, UnitResult};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Current lifecycle status of a unit.
pub fn subtask_status(unit: &Subtask) -> SubtaskStatus {
    unit.status()
}

/// Units executed in order, plus commands that always run afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub units: Vec<Subtask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown: Vec<Command>,
}

impl Task {
    pub fn new(name: impl Into<String>, units: Vec<Subtask>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            units,
            teardown: Vec::new(),
        }
    }

    pub fn with_teardown(mut self, teardown: Vec<Command>) -> Self {
        self.teardown = teardown;
        self
    }

    pub fn summary(&self) -> TaskSummary {
        let mut summary = TaskSummary {
            total: self.units.len(),
            ..TaskSummary::default()
        };
        for unit in &self.units {
            match unit.status() {
                SubtaskStatus::Pending | SubtaskStatus::InProgress => summary.pending += 1,
                SubtaskStatus::Completed => summary.completed += 1,
                SubtaskStatus::Failed => summary.failed += 1,
                SubtaskStatus::Blocked => summary.blocked += 1,
            }
            if let Some(result) = unit.result() {
                summary.healing_attempts += result.healing_attempts;
                summary.healed_commands += result.healed_commands.len();
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub pending: usize,
    pub healed_commands: usize,
    pub healing_attempts: u32,
}

impl TaskSummary {
    pub fn succeeded(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

/// Drives execute → analyze → refine → retry for each command of a unit.
///
/// Each command gets at most `max_attempts` executions, the original
/// included. A single execution can spend the per-strategy timeout on every
/// strategy of its locator, so resolving one original command takes at most
/// `max_attempts × Σ per-strategy timeouts` plus model latency (see
/// [`HealingConfig::worst_case_latency`](crate::config::HealingConfig::worst_case_latency)).
///
/// The healer owns the page for the duration of a unit; commands and units
/// run strictly in order.
pub struct Healer {
    executor: Executor,
    analyzer: FailureAnalyzer,
    refiner: RefinementEngine,
    store: Option<Arc<dyn ArtifactStore>>,
    max_attempts: u32,
}

impl Healer {
    pub fn new(page: Arc<dyn PageDriver>, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            executor: Executor::new(page.clone()),
            analyzer: FailureAnalyzer::new(page, AnalyzerOptions::default()),
            refiner: RefinementEngine::new(model),
            store: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn from_config(
        page: Arc<dyn PageDriver>,
        model: Arc<dyn LanguageModel>,
        config: &MenderConfig,
    ) -> Self {
        let healing = &config.healing;
        let options = GenerateOptions {
            system_prompt: config.model.system_prompt.clone(),
            temperature: config.model.temperature,
            ..GenerateOptions::default()
        };
        Self {
            executor: Executor::new(page.clone())
                .with_step_timeout(healing.step_timeout)
                .with_navigation_timeout(healing.navigation_timeout),
            analyzer: FailureAnalyzer::new(page, healing.analyzer_options()),
            refiner: RefinementEngine::with_options(model, options),
            store: None,
            max_attempts: healing.max_attempts,
        }
    }

    /// Enables write-back of healed commands for units loaded from an artifact.
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.executor = self.executor.with_step_timeout(timeout);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Runs `unit` to a terminal status and returns it.
    ///
    /// Page and model failures end up in the unit's result. Only illegal
    /// transitions (the unit was not `Pending`) and artifact store failures
    /// are returned as errors.
    pub async fn execute_with_healing(&self, mut unit: Subtask) -> Result<Subtask, MenderError> {
        self.heal_in_place(&mut unit).await?;
        Ok(unit)
    }

    /// Same as [`execute_with_healing`](Self::execute_with_healing), on a
    /// borrowed unit. The unit keeps its terminal status even when the
    /// write-back afterwards fails.
    #[instrument(skip_all, fields(unit = %unit.id))]
    pub async fn heal_in_place(&self, unit: &mut Subtask) -> Result<(), MenderError> {
        unit.mark_in_progress()?;
        info!(commands = unit.commands.len(), "Executing unit '{}'", unit.description);

        let mut result = UnitResult::default();
        let mut healed: Vec<(usize, Command)> = Vec::new();
        let mut failure: Option<String> = None;

        for index in 0..unit.commands.len() {
            match self.run_command(unit, index, &mut result).await {
                Ok(passed) => {
                    if passed != unit.commands[index] {
                        let mut replacement = passed;
                        replacement.healed = true;
                        replacement.unverified = false;
                        info!(index, command = %replacement.summary(), "Command healed");
                        unit.commands[index] = replacement.clone();
                        result.healed_commands.push(index);
                        healed.push((index, replacement));
                    }
                }
                Err(message) => {
                    failure = Some(message);
                    break;
                }
            }
        }

        match failure {
            Some(message) => {
                error!(
                    healing_attempts = result.healing_attempts,
                    "Unit failed: {}", message
                );
                unit.mark_failed(message, result)?;
            }
            None => {
                info!(
                    healed = healed.len(),
                    healing_attempts = result.healing_attempts,
                    "Unit completed"
                );
                unit.mark_completed(result)?;
            }
        }

        self.write_back(unit, &healed).await
    }

    /// Executes one command with healing. Returns the command that passed, or
    /// the final error message once the attempts are used up. Failure
    /// contexts are appended to `result`.
    async fn run_command(
        &self,
        unit: &Subtask,
        index: usize,
        result: &mut UnitResult,
    ) -> Result<Command, String> {
        let max_attempts = self.max_attempts();
        let history_start = result.failure_history.len();
        let mut candidate = unit.commands[index].clone();

        for attempt in 1..=max_attempts {
            let error = match self.executor.execute(&candidate).await {
                Ok(()) => {
                    debug!(index, attempt, "Command passed");
                    return Ok(candidate);
                }
                Err(error) => error,
            };
            warn!(
                index,
                attempt,
                command = %candidate.summary(),
                "Command failed: {}", error
            );

            let context = self.analyzer.analyze(unit, index, &candidate, &error).await;
            result.failure_history.push(context);
            if attempt == max_attempts {
                break;
            }

            let Some((current, earlier)) = result.failure_history[history_start..].split_last()
            else {
                break;
            };
            candidate = self.refiner.refine(&unit.description, current, earlier).await;
            result.healing_attempts += 1;
        }

        let message = result
            .failure_history
            .last()
            .map(|context| context.error_message.clone())
            .unwrap_or_default();
        Err(format!(
            "command #{} failed after {} attempt(s): {}",
            index + 1,
            max_attempts,
            message
        ))
    }

    /// One full-file write per unit, and only when something was healed.
    async fn write_back(&self, unit: &Subtask, healed: &[(usize, Command)]) -> Result<(), MenderError> {
        if healed.is_empty() {
            return Ok(());
        }
        let (Some(store), Some(source)) = (&self.store, &unit.source) else {
            debug!("Healed commands are not written back: no artifact for this unit");
            return Ok(());
        };
        let positioned: Vec<(usize, Command)> = healed
            .iter()
            .map(|(index, command)| (source.offset + index, command.clone()))
            .collect();
        heal_artifact(store.as_ref(), &source.path, &positioned).await?;
        Ok(())
    }

    /// Runs the task's units in order. Once a unit fails, every unit that has
    /// not started is marked `Blocked`. Teardown commands run afterwards in
    /// all cases, without healing.
    #[instrument(skip_all, fields(task = %task.id))]
    pub async fn run_task(&self, task: &mut Task) -> Result<TaskSummary, MenderError> {
        info!(units = task.units.len(), "Running task '{}'", task.name);
        let outcome = self.run_units(&mut task.units).await;
        self.run_teardown(&task.teardown).await;
        outcome?;

        let summary = task.summary();
        info!(
            completed = summary.completed,
            failed = summary.failed,
            blocked = summary.blocked,
            "Task finished"
        );
        Ok(summary)
    }

    async fn run_units(&self, units: &mut [Subtask]) -> Result<(), MenderError> {
        let mut failed_unit: Option<String> = None;
        for unit in units.iter_mut() {
            if let Some(failed_id) = &failed_unit {
                if unit.status() == SubtaskStatus::Pending {
                    unit.mark_blocked(format!("blocked by failed unit '{failed_id}'"))?;
                    info!(unit = %unit.id, "Unit blocked");
                }
                continue;
            }
            if unit.status() != SubtaskStatus::Pending {
                debug!(unit = %unit.id, status = %unit.status(), "Skipping unit that already ran");
                continue;
            }
            self.heal_in_place(unit).await?;
            if unit.status() == SubtaskStatus::Failed {
                failed_unit = Some(unit.id.clone());
            }
        }
        Ok(())
    }

    async fn run_teardown(&self, teardown: &[Command]) {
        for (index, command) in teardown.iter().enumerate() {
            if let Err(e) = self.executor.execute(command).await {
                warn!(index, command = %command.summary(), "Teardown command failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ActionType, Selector};
    use crate::tests::{init_tracing, FakePage, MemoryStore, ScriptedModel};

    const PAGE: &str = r#"<html><body>
        <input name="email" placeholder="Email">
        <button data-testid="login" class="btn">Log in</button>
    </body></html>"#;

    fn healer(page: &Arc<FakePage>, model: &Arc<ScriptedModel>) -> Healer {
        Healer::new(page.clone(), model.clone()).with_step_timeout(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_passing_unit_needs_no_model() {
        let page = Arc::new(FakePage::new(PAGE));
        let model = Arc::new(ScriptedModel::default());
        let unit = Subtask::new(
            "log in",
            vec![
                Command::targeting(ActionType::Type, Selector::Placeholder("Email".into()))
                    .with_value("ada@example.com"),
                Command::targeting(ActionType::Click, Selector::TestId("login".into())),
            ],
        );
        let unit = healer(&page, &model).execute_with_healing(unit).await.unwrap();

        assert_eq!(subtask_status(&unit), SubtaskStatus::Completed);
        let result = unit.result().unwrap();
        assert_eq!(result.healing_attempts, 0);
        assert!(result.failure_history.is_empty());
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_command_is_healed_and_written_back() {
        init_tracing();
        let page = Arc::new(FakePage::new(PAGE));
        let model = Arc::new(ScriptedModel::new([
            r#"{"action": "click", "locator": {"primary": "test-id:login", "fallbacks": ["text:Log in"]}}"#,
        ]));
        let original = vec![
            Command::new(ActionType::Navigate).with_value("https://shop.test"),
            Command::new(ActionType::Press).with_value("Tab"),
            Command::targeting(ActionType::Click, Selector::CssClass("signin".into())),
        ];
        let store = Arc::new(MemoryStore::default().with_file("flow.yaml", original.clone()));
        let unit = Subtask::new("log in", original[1..].to_vec()).from_artifact("flow.yaml", 1);

        let unit = healer(&page, &model)
            .with_store(store.clone())
            .execute_with_healing(unit)
            .await
            .unwrap();

        assert_eq!(unit.status(), SubtaskStatus::Completed);
        let result = unit.result().unwrap();
        assert_eq!(result.healing_attempts, 1);
        assert_eq!(result.failure_history.len(), 1);
        assert_eq!(result.healed_commands, vec![1]);
        assert!(unit.commands[1].healed);
        assert_eq!(unit.commands[1].description, None);

        assert_eq!(store.writes(), 1);
        let persisted = store.commands("flow.yaml");
        assert_eq!(persisted.len(), 3);
        assert_eq!(persisted[0], original[0]);
        assert_eq!(persisted[1], original[1]);
        assert_eq!(persisted[2], unit.commands[1]);
        assert!(page.actions().contains(&"click test-id:login".to_string()));
    }

    #[tokio::test]
    async fn test_exhaustion_fails_the_unit() {
        let page = Arc::new(FakePage::new(PAGE));
        let model = Arc::new(ScriptedModel::failing());
        let store = Arc::new(MemoryStore::default());
        let unit = Subtask::new(
            "log in",
            vec![Command::targeting(ActionType::Click, Selector::CssClass("signin".into()))],
        )
        .from_artifact("flow.yaml", 0);

        let unit = healer(&page, &model)
            .with_store(store.clone())
            .with_max_attempts(2)
            .execute_with_healing(unit)
            .await
            .unwrap();

        assert_eq!(unit.status(), SubtaskStatus::Failed);
        let result = unit.result().unwrap();
        assert_eq!(result.failure_history.len(), 2);
        assert_eq!(result.healing_attempts, 1);
        assert!(result.error.as_deref().unwrap().contains("after 2 attempt(s)"));
        assert_eq!(model.calls(), 1);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_unit_must_be_pending() {
        let page = Arc::new(FakePage::new(PAGE));
        let model = Arc::new(ScriptedModel::default());
        let mut unit = Subtask::new("noop", vec![Command::noop_wait()]);
        unit.mark_in_progress().unwrap();
        let err = healer(&page, &model).execute_with_healing(unit).await.unwrap_err();
        assert!(matches!(err, MenderError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_task_blocks_remaining_units_and_runs_teardown() {
        let page = Arc::new(FakePage::new(PAGE));
        let model = Arc::new(ScriptedModel::failing());
        let first = Subtask::new(
            "open",
            vec![Command::new(ActionType::Navigate).with_value("https://shop.test")],
        )
        .with_id("open");
        let second = Subtask::new(
            "log in",
            vec![Command::targeting(ActionType::Click, Selector::CssClass("signin".into()))],
        )
        .with_id("login");
        let third = Subtask::new("checkout", vec![Command::noop_wait()]).with_id("checkout");
        let mut task = Task::new("purchase", vec![first, second, third])
            .with_teardown(vec![Command::new(ActionType::Navigate).with_value("about:blank")]);

        let summary = healer(&page, &model).run_task(&mut task).await.unwrap();

        assert_eq!(task.units[0].status(), SubtaskStatus::Completed);
        assert_eq!(task.units[1].status(), SubtaskStatus::Failed);
        assert_eq!(task.units[2].status(), SubtaskStatus::Blocked);
        assert!(task.units[2]
            .result()
            .unwrap()
            .blocked_reason
            .as_deref()
            .unwrap()
            .contains("'login'"));
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.blocked, 1);
        assert!(!summary.succeeded());
        assert_eq!(page.actions().last().unwrap(), "navigate about:blank");
    }
}
