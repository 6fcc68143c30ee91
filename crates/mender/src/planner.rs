use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::command::{Instruction, PlanStep};
use crate::llm::{generate_text, GenerateOptions, LanguageModel};
use crate::prompts;
use crate::reply::parse_plan;
use crate::snapshot::PageSnapshot;

/// Breaks an instruction into ordered atomic steps.
#[derive(Clone)]
pub struct Planner {
    model: Arc<dyn LanguageModel>,
    options: GenerateOptions,
}

impl Planner {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self::with_options(model, GenerateOptions::default())
    }

    /// Uses `options` for every call, filling in the planner system prompt
    /// when none is set.
    pub fn with_options(model: Arc<dyn LanguageModel>, mut options: GenerateOptions) -> Self {
        if options.system_prompt.is_none() {
            options.system_prompt = Some(prompts::planner_system());
        }
        Self { model, options }
    }

    /// Never fails and never returns an empty plan: an unusable reply yields
    /// the instruction itself as the only step.
    #[instrument(level = "debug", skip_all, fields(goal = %instruction.goal))]
    pub async fn plan(&self, instruction: &Instruction, snapshot: &PageSnapshot) -> Vec<PlanStep> {
        let prompt = prompts::plan_prompt(instruction, snapshot);
        let reply = generate_text(self.model.as_ref(), &prompt, &self.options, "plan").await;

        let steps = parse_plan(&reply);
        if steps.is_empty() {
            warn!("Planner reply had no usable steps, using the instruction as a single step");
            return vec![PlanStep::new(instruction.goal.trim())];
        }
        info!("Planned {} step(s)", steps.len());
        steps
    }
}
