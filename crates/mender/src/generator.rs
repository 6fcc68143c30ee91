use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::command::{Command, PlanStep};
use crate::llm::{generate_text, GenerateOptions, LanguageModel};
use crate::prompts;
use crate::reply::parse_command;
use crate::snapshot::PageSnapshot;

/// Turns one plan step into one command.
#[derive(Clone)]
pub struct CommandGenerator {
    model: Arc<dyn LanguageModel>,
    options: GenerateOptions,
}

impl CommandGenerator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self::with_options(model, GenerateOptions::default())
    }

    pub fn with_options(model: Arc<dyn LanguageModel>, mut options: GenerateOptions) -> Self {
        if options.system_prompt.is_none() {
            options.system_prompt = Some(prompts::command_system());
        }
        Self { model, options }
    }

    /// `prior` are the commands already generated for earlier steps. A reply
    /// without a usable command gives [`Command::noop_wait`].
    #[instrument(level = "debug", skip_all, fields(step = %step.text))]
    pub async fn generate(
        &self,
        step: &PlanStep,
        snapshot: &PageSnapshot,
        prior: &[Command],
    ) -> Command {
        let prompt = prompts::command_prompt(step, snapshot, prior);
        let reply = generate_text(self.model.as_ref(), &prompt, &self.options, "command").await;

        match parse_command(&reply) {
            Some(mut command) => {
                if command.description.is_none() {
                    command.description = Some(step.text.clone());
                }
                debug!(command = %command.summary(), "Generated command");
                command
            }
            None => {
                warn!("No command in model reply for step '{}', using a no-op wait", step.text);
                Command::noop_wait()
            }
        }
    }
}
