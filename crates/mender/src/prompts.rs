//! Prompt templates for planning, command generation and repair.

use crate::analyzer::FailureContext;
use crate::command::{Command, Instruction, PlanStep};
use crate::snapshot::PageSnapshot;

const COMMAND_FORMAT: &str = r#"Reply with exactly one JSON object and nothing else:
{
  "action": "navigate | click | type | select | hover | press | wait | waitForSelector | assertVisible | assertText | assertUrl",
  "locator": {"primary": "<strategy>:<value>", "fallbacks": ["<strategy>:<value>"]},
  "value": "<url, text to type, option, key or expected text>",
  "timeoutMs": 1000
}
Locator strategies:
- css-class:<class>            an element whose class attribute contains <class>
- css-attribute:[name=value]   an attribute match
- css:<selector>               a simple compound selector, e.g. input[type=password]
- text:<exact visible text>
- placeholder:<placeholder text>
- role:<role>|<accessible name>
- test-id:<data-testid value>
- xpath:<expression>
Omit "locator" for navigate, press, wait and assertUrl. Omit "value" when the action takes none.
Prefer test-id, then attributes, then classes, then text. Text locators must be unique on the page."#;

pub fn planner_system() -> String {
    "You break browser tasks into the smallest ordered steps a test runner can execute. \
Each step performs exactly one browser action or one check."
        .to_string()
}

pub fn command_system() -> String {
    "You translate one browser test step into one machine-executable command. \
You only use locators that exist in the page markup you are given."
        .to_string()
}

fn page_block(snapshot: &PageSnapshot) -> String {
    let mut out = String::new();
    if let Some(context) = snapshot.language_context() {
        out.push_str(&context);
        out.push_str("\n\n");
    }
    if snapshot.markup.is_empty() {
        out.push_str("Page markup: (not available)\n");
    } else {
        out.push_str(&format!("Page markup:\n```html\n{}\n```\n", snapshot.markup));
    }
    out
}

pub fn plan_prompt(instruction: &Instruction, snapshot: &PageSnapshot) -> String {
    let mut out = format!("Task: {}\n", instruction.goal);
    if !instruction.acceptance_criteria.is_empty() {
        out.push_str("Acceptance criteria:\n");
        for criterion in &instruction.acceptance_criteria {
            out.push_str(&format!("- {criterion}\n"));
        }
    }
    out.push('\n');
    out.push_str(&page_block(snapshot));
    out.push_str(
        "\nList the steps as a numbered list, one action per line, no commentary. \
Add a final check step for each acceptance criterion.",
    );
    out
}

fn prior_block(prior: &[Command]) -> String {
    if prior.is_empty() {
        return String::new();
    }
    let mut out = String::from("Commands already generated for earlier steps:\n");
    for (i, command) in prior.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, command.summary()));
    }
    out.push('\n');
    out
}

pub fn command_prompt(step: &PlanStep, snapshot: &PageSnapshot, prior: &[Command]) -> String {
    format!(
        "Step: {}\n\n{}{}\n{}",
        step.text,
        prior_block(prior),
        page_block(snapshot),
        COMMAND_FORMAT
    )
}

/// Re-prompt after the static validator rejected a command.
pub fn static_refine_prompt(
    command: &Command,
    reason: &str,
    snapshot: &PageSnapshot,
    attempt: u32,
) -> String {
    let step = command
        .description
        .as_deref()
        .map(|d| format!("Step: {d}\n"))
        .unwrap_or_default();
    format!(
        "{step}Proposed command (attempt {attempt}): {}\n\
Rejected because: {reason}\n\
Choose a different locator that exists exactly once in the markup below.\n\n{}\n{}",
        command.summary(),
        page_block(snapshot),
        COMMAND_FORMAT
    )
}

/// Repair prompt built from a live failure and the earlier failures of the
/// same command.
pub fn heal_prompt(unit_name: &str, current: &FailureContext, history: &[FailureContext]) -> String {
    let mut out = format!(
        "Test unit '{unit_name}' failed at command #{}.\n\
Failed command: {}\n\
Failure category: {}\n\
Error: {}\n\
Page URL: {}\n",
        current.command_index + 1,
        current.failed_command.summary(),
        current.category,
        current.error_message,
        current.page_url,
    );

    if !history.is_empty() {
        out.push_str("\nEarlier attempts for this command (do not repeat these locators):\n");
        for (i, past) in history.iter().enumerate() {
            out.push_str(&format!(
                "{}. {} -> {}: {}\n",
                i + 1,
                past.failed_command.summary(),
                past.category,
                past.error_message
            ));
        }
    }

    if current.candidate_locators.is_empty() {
        out.push_str("\nNo candidate locators could be read from the page.\n");
    } else {
        out.push_str("\nLocators present on the page right now, best first:\n");
        for candidate in &current.candidate_locators {
            out.push_str(&format!("- {candidate}\n"));
        }
    }

    if let Some(markup) = &current.page_markup {
        out.push_str(&format!("\nCurrent page markup:\n```html\n{markup}\n```\n"));
    }

    out.push_str("\nPropose a corrected command for the same step, choosing from the locators above.\n");
    out.push_str(COMMAND_FORMAT);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ActionType, Selector};

    #[test]
    fn test_plan_prompt_carries_criteria_and_language() {
        let instruction =
            Instruction::new("Log in").with_criteria(["dashboard is shown"]);
        let snapshot = PageSnapshot::new(r#"<html lang="de"><button>Anmelden</button></html>"#);
        let prompt = plan_prompt(&instruction, &snapshot);
        assert!(prompt.starts_with("Task: Log in"));
        assert!(prompt.contains("- dashboard is shown"));
        assert!(prompt.contains("login -> anmelden"));
        assert!(prompt.contains("<button>Anmelden</button>"));
    }

    #[test]
    fn test_command_prompt_lists_prior_commands() {
        let prior = vec![Command::new(ActionType::Navigate).with_value("https://shop.test")];
        let prompt = command_prompt(&PlanStep::new("Click login"), &PageSnapshot::empty(), &prior);
        assert!(prompt.contains("1. navigate value=\"https://shop.test\""));
        assert!(prompt.contains("(not available)"));
        assert!(prompt.contains("\"action\""));
    }

    #[test]
    fn test_static_refine_prompt_mentions_reason() {
        let command = Command::targeting(ActionType::Click, Selector::Text("Submit".into()));
        let prompt = static_refine_prompt(&command, "text matches 2 elements", &PageSnapshot::empty(), 2);
        assert!(prompt.contains("attempt 2"));
        assert!(prompt.contains("text matches 2 elements"));
        assert!(prompt.contains("click text:Submit"));
    }
}
