//! Self-healing browser automation
//!
//! Natural-language instructions are decomposed into validated browser
//! commands with the help of a language model. At run time each command is
//! resolved against the live page; failures are analyzed, repaired by the
//! model and the healed commands are written back to the artifact they came
//! from so the next run starts from the repaired version.

pub mod analyzer;
pub mod artifact;
pub mod bridge;
pub mod command;
pub mod config;
pub mod decompose;
pub mod duration_parser;
pub mod errors;
pub mod executor;
pub mod gate;
pub mod generator;
pub mod llm;
pub mod locator;
pub mod logging;
pub mod markup;
pub mod orchestrator;
pub mod page;
pub mod planner;
pub mod prompts;
pub mod refinement;
pub mod reply;
pub mod snapshot;
pub mod subtask;
#[cfg(test)]
mod tests;
pub mod validator;

pub use analyzer::{FailureAnalyzer, FailureCategory, FailureContext};
pub use artifact::{heal_artifact, ArtifactStore, YamlArtifactStore};
pub use bridge::{BridgePage, ExtensionBridge};
pub use command::{
    ActionType, Command, CommandParams, Instruction, LocatorSpec, LocatorStrategy, PlanStep,
    Selector,
};
pub use config::MenderConfig;
pub use decompose::Decomposer;
pub use errors::{ExecutionError, MenderError, ModelError, PageError};
pub use executor::Executor;
pub use gate::{GateResult, ValidationGate};
pub use generator::CommandGenerator;
pub use llm::{GenerateOptions, LanguageModel, ModelResponse};
pub use locator::{Locator, ResolutionFailure};
pub use markup::{MarkupExtractor, PageMarkup, StaticMarkup};
pub use orchestrator::{Healer, Task, TaskSummary};
pub use page::{ElementHandle, PageDriver};
pub use planner::Planner;
pub use refinement::RefinementEngine;
pub use snapshot::PageSnapshot;
pub use subtask::{Subtask, SubtaskStatus, UnitResult};
pub use validator::{ValidationOutcome, Validator};
