//! Permissive parsing of model replies.
//!
//! Models wrap their output in prose, code fences and inconsistent field
//! names. Everything here returns `Option`/empty results instead of errors;
//! callers decide the fallback.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::command::{ActionType, Command, LocatorSpec, LocatorStrategy, PlanStep, Selector};

static STRUCTURED_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:step\s*\d+\s*[:.)-]?|\d+\s*[.):-]|[-*•+])\s*(.+?)\s*$")
        .expect("valid plan line regex")
});
static FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[a-zA-Z]*\s*\n?(.*?)```").expect("valid code fence regex")
});

const MIN_BARE_STEP_CHARS: usize = 10;

fn clean_step(text: &str) -> String {
    text.replace("**", "").replace('`', "").trim().to_string()
}

/// Splits a planner reply into steps.
///
/// Numbered and bulleted lines are preferred; bare lines longer than ten
/// characters that do not end with `:` are only used when the reply has no
/// structured lines at all.
pub fn parse_plan(reply: &str) -> Vec<PlanStep> {
    let lines: Vec<&str> = reply
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("```"))
        .collect();

    let structured: Vec<PlanStep> = lines
        .iter()
        .filter_map(|line| STRUCTURED_LINE_RE.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| clean_step(m.as_str())))
        .filter(|text| !text.is_empty() && !text.ends_with(':'))
        .map(PlanStep::new)
        .collect();
    if !structured.is_empty() {
        return structured;
    }

    lines
        .into_iter()
        .map(clean_step)
        .filter(|text| text.chars().count() > MIN_BARE_STEP_CHARS && !text.ends_with(':'))
        .map(PlanStep::new)
        .collect()
}

/// Finds the first balanced JSON object in `text`.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn json_candidates(reply: &str) -> Vec<&str> {
    let mut candidates: Vec<&str> = FENCE_RE
        .captures_iter(reply)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| first_json_object(m.as_str()))
        .collect();
    if let Some(object) = first_json_object(reply) {
        candidates.push(object);
    }
    candidates
}

fn field<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| object.get(*name)).filter(|v| !v.is_null())
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_selector(value: &Value) -> Option<Selector> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(Selector::from(s.as_str())),
        Value::Object(object) => {
            let raw = field(object, &["value", "selector", "locator"]).and_then(as_text)?;
            match field(object, &["strategy", "type", "by"]).and_then(Value::as_str) {
                Some(strategy) => match strategy.parse::<LocatorStrategy>() {
                    Ok(strategy) => Some(Selector::new(strategy, raw)),
                    Err(_) => Some(Selector::from(raw)),
                },
                None => Some(Selector::from(raw)),
            }
        }
        _ => None,
    }
}

fn parse_selector_list(value: Option<&Value>) -> Vec<Selector> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(parse_selector).collect(),
        Some(single) => parse_selector(single).into_iter().collect(),
        None => Vec::new(),
    }
}

fn parse_locator(object: &Map<String, Value>) -> Option<LocatorSpec> {
    let raw = field(object, &["locator", "target", "selector", "element"])?;
    let mut spec = match raw {
        Value::Object(inner) if inner.contains_key("primary") => {
            let primary = inner.get("primary").and_then(parse_selector)?;
            let mut spec = LocatorSpec::new(primary);
            spec.fallbacks = parse_selector_list(field(inner, &["fallbacks", "fallback"]));
            spec
        }
        other => LocatorSpec::new(parse_selector(other)?),
    };
    spec.fallbacks
        .extend(parse_selector_list(field(object, &["fallbacks", "fallback"])));
    Some(spec)
}

fn command_from_object(object: &Map<String, Value>) -> Option<Command> {
    if let Some(Value::Object(inner)) = object.get("command") {
        return command_from_object(inner);
    }

    let action = field(object, &["action", "actionType", "action_type"])
        .and_then(Value::as_str)?
        .parse::<ActionType>()
        .ok()?;

    let mut command = Command::new(action);
    command.locator = parse_locator(object);
    if let Some(params) = field(object, &["params", "parameters"]).and_then(Value::as_object) {
        command.params.value = field(params, &["value", "text", "url", "key", "option", "expected"])
            .and_then(as_text);
        command.params.timeout_ms =
            field(params, &["timeoutMs", "timeout_ms", "timeout"]).and_then(Value::as_u64);
    }
    if command.params.value.is_none() {
        command.params.value =
            field(object, &["value", "text", "url", "key", "option", "expected"]).and_then(as_text);
    }
    if command.params.timeout_ms.is_none() {
        command.params.timeout_ms =
            field(object, &["timeoutMs", "timeout_ms", "timeout"]).and_then(Value::as_u64);
    }
    command.description = field(object, &["description", "step"]).and_then(as_text);

    match command.check_shape() {
        Ok(()) => Some(command),
        Err(reason) => {
            debug!("Discarding parsed command: {}", reason);
            None
        }
    }
}

/// Extracts exactly one command from a model reply.
pub fn parse_command(reply: &str) -> Option<Command> {
    for candidate in json_candidates(reply) {
        let value: Value = match serde_json::from_str(candidate) {
            Ok(value) => value,
            Err(e) => {
                debug!("Reply fragment is not valid JSON: {}", e);
                continue;
            }
        };
        let object = match &value {
            Value::Object(object) => object,
            _ => continue,
        };
        if let Some(command) = command_from_object(object) {
            return Some(command);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_plan() {
        let steps = parse_plan("Here is the plan:\n1. Open the login page\n2) Click the login button\n");
        let texts: Vec<&str> = steps.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["Open the login page", "Click the login button"]);
    }

    #[test]
    fn test_bullet_plan_ignores_headings() {
        let steps = parse_plan("Steps:\n- **Type** the email\n* Submit the form\n- Checks:\n");
        let texts: Vec<&str> = steps.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["Type the email", "Submit the form"]);
    }

    #[test]
    fn test_bare_lines_need_length() {
        let steps = parse_plan("Click the login button\nok\nNext steps:");
        assert_eq!(steps, vec![PlanStep::new("Click the login button")]);
    }

    #[test]
    fn test_empty_plan() {
        assert!(parse_plan("").is_empty());
        assert!(parse_plan("```\n```").is_empty());
    }

    #[test]
    fn test_command_from_fenced_json() {
        let reply = "Sure!\n```json\n{\"action\": \"click\", \"locator\": {\"primary\": \"css-class:login-btn\", \"fallbacks\": [\"text:Login\"]}}\n```";
        let command = parse_command(reply).unwrap();
        assert_eq!(command.action, ActionType::Click);
        let locator = command.locator.unwrap();
        assert_eq!(locator.primary, Selector::CssClass("login-btn".into()));
        assert_eq!(locator.fallbacks, vec![Selector::Text("Login".into())]);
    }

    #[test]
    fn test_command_with_object_selectors_and_aliases() {
        let reply = r#"{"action":"fill","locator":{"strategy":"placeholder","value":"Email"},"text":"a@b.c","timeout":500}"#;
        let command = parse_command(reply).unwrap();
        assert_eq!(command.action, ActionType::Type);
        assert_eq!(
            command.locator.as_ref().unwrap().primary,
            Selector::Placeholder("Email".into())
        );
        assert_eq!(command.value(), Some("a@b.c"));
        assert_eq!(command.params.timeout_ms, Some(500));
    }

    #[test]
    fn test_command_with_braces_inside_strings() {
        let reply = r##"I think {"action":"assertText","selector":"#msg","value":"Hi {name}"} works"##;
        let command = parse_command(reply).unwrap();
        assert_eq!(command.action, ActionType::AssertText);
        assert_eq!(command.value(), Some("Hi {name}"));
        assert_eq!(command.locator.unwrap().primary, Selector::Css("#msg".into()));
    }

    #[test]
    fn test_malformed_replies() {
        assert!(parse_command("").is_none());
        assert!(parse_command("click the button").is_none());
        assert!(parse_command(r#"{"action": "click"}"#).is_none());
        assert!(parse_command(r#"{"action": "teleport", "locator": ".x"}"#).is_none());
        assert!(parse_command(r#"{"action": "click", "locator": ".x""#).is_none());
    }

    #[test]
    fn test_nested_command_object() {
        let reply = r#"{"command": {"action": "navigate", "url": "https://shop.test"}}"#;
        let command = parse_command(reply).unwrap();
        assert_eq!(command.action, ActionType::Navigate);
        assert_eq!(command.value(), Some("https://shop.test"));
    }
}
