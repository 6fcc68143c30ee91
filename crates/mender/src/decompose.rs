//! Instruction → draft unit: plan, generate one command per step, gate each
//! command against a fresh snapshot.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::command::{Command, Instruction};
use crate::config::MenderConfig;
use crate::gate::ValidationGate;
use crate::generator::CommandGenerator;
use crate::llm::{GenerateOptions, LanguageModel};
use crate::markup::MarkupExtractor;
use crate::planner::Planner;
use crate::snapshot::PageSnapshot;
use crate::subtask::Subtask;
use crate::validator::Validator;

pub const DEFAULT_MAX_MARKUP_CHARS: usize = 12_000;

pub struct Decomposer {
    planner: Planner,
    generator: CommandGenerator,
    gate: ValidationGate,
    extractor: Arc<dyn MarkupExtractor>,
    max_markup_chars: usize,
}

impl Decomposer {
    pub fn new(model: Arc<dyn LanguageModel>, extractor: Arc<dyn MarkupExtractor>) -> Self {
        Self {
            planner: Planner::new(model.clone()),
            generator: CommandGenerator::new(model.clone()),
            gate: ValidationGate::new(model, Validator::default()),
            extractor,
            max_markup_chars: DEFAULT_MAX_MARKUP_CHARS,
        }
    }

    pub fn from_config(
        model: Arc<dyn LanguageModel>,
        extractor: Arc<dyn MarkupExtractor>,
        config: &MenderConfig,
    ) -> Self {
        let options = GenerateOptions {
            system_prompt: config.model.system_prompt.clone(),
            temperature: config.model.temperature,
            ..GenerateOptions::default()
        };
        let validator = Validator::new(config.decomposition.exempt_patterns.clone());
        Self {
            planner: Planner::with_options(model.clone(), options.clone()),
            generator: CommandGenerator::with_options(model.clone(), options.clone()),
            gate: ValidationGate::with_options(model, validator, options)
                .with_max_attempts(config.decomposition.static_refine_attempts),
            extractor,
            max_markup_chars: config.decomposition.max_markup_chars,
        }
    }

    pub fn with_max_markup_chars(mut self, max_chars: usize) -> Self {
        self.max_markup_chars = max_chars;
        self
    }

    async fn snapshot(&self) -> PageSnapshot {
        PageSnapshot::capture(self.extractor.as_ref(), self.max_markup_chars).await
    }

    /// Builds a draft unit. The unit always holds at least one command and is
    /// left `Pending`; nothing is executed.
    #[instrument(skip_all, fields(goal = %instruction.goal))]
    pub async fn decompose(&self, instruction: &Instruction) -> Subtask {
        let steps = self.planner.plan(instruction, &self.snapshot().await).await;

        let mut commands: Vec<Command> = Vec::with_capacity(steps.len());
        let mut unverified = 0;
        for step in &steps {
            let snapshot = self.snapshot().await;
            let draft = self.generator.generate(step, &snapshot, &commands).await;
            let gated = self.gate.check(draft, &snapshot).await;
            if gated.command.unverified {
                unverified += 1;
            }
            commands.push(gated.command);
        }

        if commands.is_empty() {
            commands.push(Command::noop_wait());
        }
        info!(
            commands = commands.len(),
            unverified, "Decomposed instruction"
        );
        Subtask::new(instruction.goal.clone(), commands)
    }
}
