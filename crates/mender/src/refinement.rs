use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::analyzer::FailureContext;
use crate::command::Command;
use crate::llm::{generate_text, GenerateOptions, LanguageModel};
use crate::prompts;
use crate::reply::parse_command;

/// Asks the model for a replacement of a command that failed live.
#[derive(Clone)]
pub struct RefinementEngine {
    model: Arc<dyn LanguageModel>,
    options: GenerateOptions,
}

impl RefinementEngine {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self::with_options(model, GenerateOptions::default())
    }

    pub fn with_options(model: Arc<dyn LanguageModel>, mut options: GenerateOptions) -> Self {
        if options.system_prompt.is_none() {
            options.system_prompt = Some(prompts::command_system());
        }
        Self { model, options }
    }

    /// `history` holds the earlier failures of the same command, oldest
    /// first. When the reply has no usable command the failed command comes
    /// back unchanged so the caller's attempt counter still advances.
    #[instrument(level = "debug", skip_all, fields(unit = unit_name, index = current.command_index))]
    pub async fn refine(
        &self,
        unit_name: &str,
        current: &FailureContext,
        history: &[FailureContext],
    ) -> Command {
        let prompt = prompts::heal_prompt(unit_name, current, history);
        let reply = generate_text(self.model.as_ref(), &prompt, &self.options, "heal").await;

        match parse_command(&reply) {
            Some(mut candidate) => {
                if candidate.description.is_none() {
                    candidate.description = current.failed_command.description.clone();
                }
                candidate.healed = false;
                candidate.unverified = false;
                debug!(candidate = %candidate.summary(), "Proposed replacement");
                candidate
            }
            None => {
                warn!("Repair reply had no usable command, retrying the failed command");
                current.failed_command.clone()
            }
        }
    }
}
