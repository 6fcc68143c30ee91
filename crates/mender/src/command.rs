//! Commands, selectors and the inputs they are generated from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A natural-language goal with optional acceptance criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub goal: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
}

impl Instruction {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            acceptance_criteria: Vec::new(),
        }
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }
}

/// One atomic, ordered sub-instruction produced by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub text: String,
}

impl PlanStep {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// The locator strategies a selector can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocatorStrategy {
    CssClass,
    CssAttribute,
    Css,
    Text,
    Placeholder,
    Role,
    TestId,
    Xpath,
}

impl LocatorStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            LocatorStrategy::CssClass => "css-class",
            LocatorStrategy::CssAttribute => "css-attribute",
            LocatorStrategy::Css => "css",
            LocatorStrategy::Text => "text",
            LocatorStrategy::Placeholder => "placeholder",
            LocatorStrategy::Role => "role",
            LocatorStrategy::TestId => "test-id",
            LocatorStrategy::Xpath => "xpath",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.trim().to_lowercase().replace('_', "-").as_str() {
            "css-class" | "class" | "classname" => Some(LocatorStrategy::CssClass),
            "css-attribute" | "attribute" | "attr" => Some(LocatorStrategy::CssAttribute),
            "css" => Some(LocatorStrategy::Css),
            "text" => Some(LocatorStrategy::Text),
            "placeholder" => Some(LocatorStrategy::Placeholder),
            "role" => Some(LocatorStrategy::Role),
            "test-id" | "testid" | "data-testid" | "data-test-id" => Some(LocatorStrategy::TestId),
            "xpath" => Some(LocatorStrategy::Xpath),
            _ => None,
        }
    }
}

impl fmt::Display for LocatorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LocatorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_prefix(s).ok_or_else(|| format!("Unknown locator strategy: '{s}'"))
    }
}

/// A single (strategy, value) pair identifying a page element.
///
/// The `role` strategy accepts `role|name` (e.g. `button|Sign in`) as its
/// precise form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "value", rename_all = "kebab-case")]
pub enum Selector {
    /// Matches elements whose class attribute contains the value
    CssClass(String),
    /// A bracketed attribute selector such as `[name=email]`
    CssAttribute(String),
    /// A simple compound CSS selector such as `input[type=password]`
    Css(String),
    /// Exact visible text
    Text(String),
    /// The placeholder attribute of an input
    Placeholder(String),
    /// ARIA role, optionally `role|accessible name`
    Role(String),
    /// `data-testid` / `data-test-id` / `data-test`
    TestId(String),
    /// XPath expression; only checked for well-formedness offline
    Xpath(String),
}

impl Selector {
    pub fn new(strategy: LocatorStrategy, value: impl Into<String>) -> Self {
        let value = value.into();
        match strategy {
            LocatorStrategy::CssClass => Selector::CssClass(value),
            LocatorStrategy::CssAttribute => Selector::CssAttribute(value),
            LocatorStrategy::Css => Selector::Css(value),
            LocatorStrategy::Text => Selector::Text(value),
            LocatorStrategy::Placeholder => Selector::Placeholder(value),
            LocatorStrategy::Role => Selector::Role(value),
            LocatorStrategy::TestId => Selector::TestId(value),
            LocatorStrategy::Xpath => Selector::Xpath(value),
        }
    }

    pub fn strategy(&self) -> LocatorStrategy {
        match self {
            Selector::CssClass(_) => LocatorStrategy::CssClass,
            Selector::CssAttribute(_) => LocatorStrategy::CssAttribute,
            Selector::Css(_) => LocatorStrategy::Css,
            Selector::Text(_) => LocatorStrategy::Text,
            Selector::Placeholder(_) => LocatorStrategy::Placeholder,
            Selector::Role(_) => LocatorStrategy::Role,
            Selector::TestId(_) => LocatorStrategy::TestId,
            Selector::Xpath(_) => LocatorStrategy::Xpath,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Selector::CssClass(v)
            | Selector::CssAttribute(v)
            | Selector::Css(v)
            | Selector::Text(v)
            | Selector::Placeholder(v)
            | Selector::Role(v)
            | Selector::TestId(v)
            | Selector::Xpath(v) => v,
        }
    }

    /// Splits a `role|name` value into its parts.
    pub fn role_and_name(&self) -> Option<(&str, Option<&str>)> {
        match self {
            Selector::Role(v) => match v.split_once('|') {
                Some((role, name)) => {
                    let name = name.trim().strip_prefix("name:").unwrap_or(name.trim());
                    Some((role.trim(), Some(name).filter(|n| !n.is_empty())))
                }
                None => Some((v.trim(), None)),
            },
            _ => None,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.strategy(), self.value())
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        let s = s.trim();

        // Explicit `strategy:value` form first
        if let Some((prefix, rest)) = s.split_once(':') {
            if let Some(strategy) = LocatorStrategy::from_prefix(prefix) {
                return Selector::new(strategy, rest.trim());
            }
        }

        // Playwright-style prefixes
        if let Some(rest) = s.strip_prefix("text=") {
            return Selector::Text(rest.trim_matches('"').to_string());
        }
        if let Some(rest) = s.strip_prefix("xpath=") {
            return Selector::Xpath(rest.to_string());
        }

        match s {
            _ if s.starts_with("//") || s.starts_with("(/") || s.starts_with("./") => {
                Selector::Xpath(s.to_string())
            }
            _ if s.starts_with('[') && s.ends_with(']') && s.matches('[').count() == 1 => {
                Selector::CssAttribute(s.to_string())
            }
            _ if s.starts_with('.') && is_plain_identifier(&s[1..]) => {
                Selector::CssClass(s[1..].to_string())
            }
            _ if looks_like_css(s) => Selector::Css(s.to_string()),
            _ => Selector::Text(s.to_string()),
        }
    }
}

impl From<String> for Selector {
    fn from(s: String) -> Self {
        Selector::from(s.as_str())
    }
}

fn is_plain_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn looks_like_css(s: &str) -> bool {
    if s.contains(char::is_whitespace) && !s.contains(['[', '#', '.', '>']) {
        return false;
    }
    s.starts_with('#')
        || s.starts_with('.')
        || s.contains('[')
        || (s.contains(['#', '.', '>'])
            && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic()))
}

/// A primary selector plus ordered fallbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorSpec {
    pub primary: Selector,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<Selector>,
}

impl LocatorSpec {
    pub fn new(primary: impl Into<Selector>) -> Self {
        Self {
            primary: primary.into(),
            fallbacks: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, selector: impl Into<Selector>) -> Self {
        self.fallbacks.push(selector.into());
        self
    }

    /// Primary first, then fallbacks in listed order.
    pub fn selectors(&self) -> impl Iterator<Item = &Selector> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }

    pub fn strategy_count(&self) -> usize {
        1 + self.fallbacks.len()
    }
}

impl From<Selector> for LocatorSpec {
    fn from(selector: Selector) -> Self {
        LocatorSpec::new(selector)
    }
}

impl fmt::Display for LocatorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        for fallback in &self.fallbacks {
            write!(f, " || {fallback}")?;
        }
        Ok(())
    }
}

/// Browser actions a command can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    Navigate,
    Click,
    Type,
    Select,
    Hover,
    Press,
    Wait,
    WaitForSelector,
    AssertVisible,
    AssertText,
    AssertUrl,
}

impl ActionType {
    /// Interaction and element assertions need a target.
    pub fn requires_locator(&self) -> bool {
        matches!(
            self,
            ActionType::Click
                | ActionType::Type
                | ActionType::Select
                | ActionType::Hover
                | ActionType::WaitForSelector
                | ActionType::AssertVisible
                | ActionType::AssertText
        )
    }

    pub fn requires_value(&self) -> bool {
        matches!(
            self,
            ActionType::Navigate
                | ActionType::Type
                | ActionType::Select
                | ActionType::Press
                | ActionType::AssertText
                | ActionType::AssertUrl
        )
    }

    pub fn is_assertion(&self) -> bool {
        matches!(
            self,
            ActionType::AssertVisible | ActionType::AssertText | ActionType::AssertUrl
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActionType::Navigate => "navigate",
            ActionType::Click => "click",
            ActionType::Type => "type",
            ActionType::Select => "select",
            ActionType::Hover => "hover",
            ActionType::Press => "press",
            ActionType::Wait => "wait",
            ActionType::WaitForSelector => "waitForSelector",
            ActionType::AssertVisible => "assertVisible",
            ActionType::AssertText => "assertText",
            ActionType::AssertUrl => "assertUrl",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "navigate" | "goto" | "open" | "visit" | "openurl" => Ok(ActionType::Navigate),
            "click" | "tap" | "clickelement" => Ok(ActionType::Click),
            "type" | "fill" | "input" | "enter" | "typetext" | "entertext" => Ok(ActionType::Type),
            "select" | "selectoption" | "choose" => Ok(ActionType::Select),
            "hover" | "mouseover" => Ok(ActionType::Hover),
            "press" | "presskey" | "keypress" => Ok(ActionType::Press),
            "wait" | "sleep" | "pause" => Ok(ActionType::Wait),
            "waitforselector" | "waitfor" | "waitforelement" => Ok(ActionType::WaitForSelector),
            "assertvisible" | "expectvisible" | "verifyvisible" => Ok(ActionType::AssertVisible),
            "asserttext" | "expecttext" | "verifytext" => Ok(ActionType::AssertText),
            "asserturl" | "expecturl" | "verifyurl" => Ok(ActionType::AssertUrl),
            _ => Err(format!("Unknown action type: '{s}'")),
        }
    }
}

/// Action arguments. `value` is the URL, typed text, option, key or expected
/// text depending on the action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CommandParams {
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.timeout_ms.is_none()
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One executable browser command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub action: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<LocatorSpec>,
    #[serde(default, skip_serializing_if = "CommandParams::is_empty")]
    pub params: CommandParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Succeeded only after substitution by the healer
    #[serde(default, skip_serializing_if = "is_false")]
    pub healed: bool,
    /// Kept after exhausting static refinement without passing validation
    #[serde(default, skip_serializing_if = "is_false")]
    pub unverified: bool,
}

impl Command {
    pub fn new(action: ActionType) -> Self {
        Self {
            action,
            locator: None,
            params: CommandParams::default(),
            description: None,
            healed: false,
            unverified: false,
        }
    }

    pub fn targeting(action: ActionType, locator: impl Into<LocatorSpec>) -> Self {
        Self::new(action).with_locator(locator)
    }

    pub fn with_locator(mut self, locator: impl Into<LocatorSpec>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.params.value = Some(value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.params.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The neutral command used when a model reply cannot be parsed.
    pub fn noop_wait() -> Self {
        Self::new(ActionType::Wait)
            .with_timeout_ms(0)
            .with_description("no-op: model reply could not be parsed")
    }

    pub fn is_noop(&self) -> bool {
        self.action == ActionType::Wait && self.params.timeout_ms.unwrap_or(0) == 0
    }

    pub fn value(&self) -> Option<&str> {
        self.params.value.as_deref()
    }

    /// Checks the structural requirements of the action type.
    pub fn check_shape(&self) -> Result<(), String> {
        if self.action.requires_locator() && self.locator.is_none() {
            return Err(format!("'{}' requires a locator", self.action));
        }
        if self.action.requires_value() && self.params.value.is_none() {
            return Err(format!("'{}' requires a value", self.action));
        }
        Ok(())
    }

    /// Short human-readable form used in logs and prompts.
    pub fn summary(&self) -> String {
        let mut out = self.action.to_string();
        if let Some(locator) = &self.locator {
            out.push_str(&format!(" {locator}"));
        }
        if let Some(value) = &self.params.value {
            out.push_str(&format!(" value={value:?}"));
        }
        if let Some(timeout) = self.params.timeout_ms {
            out.push_str(&format!(" timeout={timeout}ms"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_strategy_prefix() {
        assert_eq!(
            Selector::from("css-class:login-btn"),
            Selector::CssClass("login-btn".to_string())
        );
        assert_eq!(
            Selector::from("test-id:submit"),
            Selector::TestId("submit".to_string())
        );
        assert_eq!(
            Selector::from("css:input[type=password]"),
            Selector::Css("input[type=password]".to_string())
        );
    }

    #[test]
    fn test_inferred_selectors() {
        assert_eq!(
            Selector::from(".login-btn"),
            Selector::CssClass("login-btn".to_string())
        );
        assert_eq!(
            Selector::from("[name=email]"),
            Selector::CssAttribute("[name=email]".to_string())
        );
        assert_eq!(
            Selector::from("//button[@id='go']"),
            Selector::Xpath("//button[@id='go']".to_string())
        );
        assert_eq!(
            Selector::from("#email"),
            Selector::Css("#email".to_string())
        );
        assert_eq!(
            Selector::from("Sign in"),
            Selector::Text("Sign in".to_string())
        );
        assert_eq!(
            Selector::from("text=\"Submit\""),
            Selector::Text("Submit".to_string())
        );
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        let selector = Selector::Role("button|Sign in".to_string());
        assert_eq!(selector.to_string(), "role:button|Sign in");
        assert_eq!(Selector::from(selector.to_string().as_str()), selector);
    }

    #[test]
    fn test_role_and_name() {
        let selector = Selector::Role("button|name:Sign in".to_string());
        assert_eq!(selector.role_and_name(), Some(("button", Some("Sign in"))));
        let bare = Selector::Role("navigation".to_string());
        assert_eq!(bare.role_and_name(), Some(("navigation", None)));
    }

    #[test]
    fn test_action_aliases() {
        assert_eq!("fill".parse::<ActionType>().unwrap(), ActionType::Type);
        assert_eq!("goto".parse::<ActionType>().unwrap(), ActionType::Navigate);
        assert_eq!(
            "wait_for_selector".parse::<ActionType>().unwrap(),
            ActionType::WaitForSelector
        );
        assert_eq!(
            "assertVisible".parse::<ActionType>().unwrap(),
            ActionType::AssertVisible
        );
        assert!("teleport".parse::<ActionType>().is_err());
    }

    #[test]
    fn test_check_shape() {
        assert!(Command::new(ActionType::Click).check_shape().is_err());
        assert!(Command::targeting(ActionType::Click, Selector::from(".x"))
            .check_shape()
            .is_ok());
        assert!(Command::new(ActionType::Navigate).check_shape().is_err());
        assert!(Command::noop_wait().check_shape().is_ok());
    }

    #[test]
    fn test_command_yaml_shape() {
        let command = Command::targeting(
            ActionType::Click,
            LocatorSpec::new(Selector::CssClass("login-btn".into()))
                .with_fallback(Selector::Text("Login".into())),
        );
        let yaml = serde_yaml::to_string(&command).unwrap();
        assert!(yaml.contains("action: click"));
        assert!(yaml.contains("strategy: css-class"));
        assert!(!yaml.contains("healed"));
        let back: Command = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, command);
    }
}
