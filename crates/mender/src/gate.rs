//! Static validation with a bounded re-prompt loop.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::command::Command;
use crate::llm::{generate_text, GenerateOptions, LanguageModel};
use crate::prompts;
use crate::reply::parse_command;
use crate::snapshot::PageSnapshot;
use crate::validator::{ValidationOutcome, Validator};

pub const DEFAULT_REFINE_ATTEMPTS: u32 = 3;

/// A command after the gate, with the outcome of its last validation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateResult {
    pub command: Command,
    pub outcome: ValidationOutcome,
    /// Refine calls made for this command
    pub refinements: u32,
}

/// Validates proposed commands and asks the model for corrections when a
/// locator is rejected. Never drops a command: after the last attempt the
/// final candidate is kept and flagged `unverified`.
#[derive(Clone)]
pub struct ValidationGate {
    model: Arc<dyn LanguageModel>,
    options: GenerateOptions,
    validator: Validator,
    max_attempts: u32,
}

impl ValidationGate {
    pub fn new(model: Arc<dyn LanguageModel>, validator: Validator) -> Self {
        Self::with_options(model, validator, GenerateOptions::default())
    }

    pub fn with_options(
        model: Arc<dyn LanguageModel>,
        validator: Validator,
        mut options: GenerateOptions,
    ) -> Self {
        if options.system_prompt.is_none() {
            options.system_prompt = Some(prompts::command_system());
        }
        Self {
            model,
            options,
            validator,
            max_attempts: DEFAULT_REFINE_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// One corrected candidate for a rejected command. An unusable reply
    /// returns the input unchanged.
    pub async fn refine(
        &self,
        command: &Command,
        outcome: &ValidationOutcome,
        snapshot: &PageSnapshot,
        attempt: u32,
    ) -> Command {
        let reason = outcome
            .reason
            .as_deref()
            .unwrap_or("locator could not be confirmed in the page markup");
        let prompt = prompts::static_refine_prompt(command, reason, snapshot, attempt);
        let reply = generate_text(self.model.as_ref(), &prompt, &self.options, "static-refine").await;

        match parse_command(&reply) {
            Some(mut candidate) => {
                if candidate.description.is_none() {
                    candidate.description = command.description.clone();
                }
                candidate
            }
            None => {
                debug!(attempt, "Refine reply had no usable command");
                command.clone()
            }
        }
    }

    /// Validates `command`, refining up to the configured number of times
    /// while it is rejected.
    #[instrument(level = "debug", skip_all, fields(command = %command.summary()))]
    pub async fn check(&self, command: Command, snapshot: &PageSnapshot) -> GateResult {
        let mut candidate = command;
        let mut outcome = self.validator.validate(&candidate, snapshot);
        let mut refinements = 0;

        while !outcome.valid && refinements < self.max_attempts {
            refinements += 1;
            info!(
                attempt = refinements,
                ambiguous = outcome.ambiguous,
                "Command rejected: {}",
                outcome.reason.as_deref().unwrap_or("invalid")
            );
            candidate = self.refine(&candidate, &outcome, snapshot, refinements).await;
            outcome = self.validator.validate(&candidate, snapshot);
        }

        if !outcome.valid {
            warn!(
                command = %candidate.summary(),
                "Keeping command unverified after {} refinement(s)", refinements
            );
            candidate.unverified = true;
        }
        GateResult {
            command: candidate,
            outcome,
            refinements,
        }
    }
}
