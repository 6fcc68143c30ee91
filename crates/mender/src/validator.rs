//! Heuristic static validation of a command's locator against snapshot markup.
//!
//! This is a false-negative-tolerant pre-filter, not a correctness check: it
//! cannot see elements that only appear after an earlier action, and css
//! pseudo-classes that depend on live state never match a snapshot. Real
//! correctness is established only when the command runs against the live
//! page. The exemption list below is deliberately incomplete and expected to
//! grow.

use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::{Command, Selector};
use crate::markup::{self, Tag};
use crate::snapshot::PageSnapshot;

/// Locator fragments that usually target content revealed by a prior action.
pub const DYNAMIC_LOCATOR_PATTERNS: &[&str] = &[
    "type=password",
    "current-password",
    "new-password",
    "modal",
    "dialog",
    "dropdown",
    "menu",
    "popover",
    "popup",
    "tooltip",
    "toast",
    "overlay",
];

const TEST_ID_ATTRIBUTES: &[&str] = &["data-testid", "data-test-id", "data-test", "data-qa"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub ambiguous: bool,
    /// Exempt from static checking; left to execution-time resolution
    #[serde(default)]
    pub deferred: bool,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn ambiguous(reason: impl Into<String>) -> Self {
        Self {
            ambiguous: true,
            ..Self::invalid(reason)
        }
    }

    pub fn deferred(reason: impl Into<String>) -> Self {
        Self {
            valid: true,
            reason: Some(reason.into()),
            ambiguous: false,
            deferred: true,
        }
    }
}

/// A parsed snapshot and its text runs, built once per validation.
struct MarkupIndex {
    document: Html,
    texts: Vec<String>,
}

impl MarkupIndex {
    fn build(html: &str) -> Self {
        let document = Html::parse_document(html);
        let texts = markup::text_runs(&document);
        Self { document, texts }
    }
}

/// Static validator with the built-in exemption list plus configured extras.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    extra_exempt_patterns: Vec<String>,
}

impl Validator {
    pub fn new(extra_exempt_patterns: Vec<String>) -> Self {
        Self {
            extra_exempt_patterns: extra_exempt_patterns
                .into_iter()
                .map(|p| normalize_pattern(&p))
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Whether the selector targets content the snapshot cannot contain yet.
    /// Text locators are never exempt.
    pub fn is_exempt(&self, selector: &Selector) -> bool {
        if matches!(selector, Selector::Text(_)) {
            return false;
        }
        let value = normalize_pattern(selector.value());
        DYNAMIC_LOCATOR_PATTERNS
            .iter()
            .any(|pattern| value.contains(pattern))
            || self
                .extra_exempt_patterns
                .iter()
                .any(|pattern| value.contains(pattern.as_str()))
    }

    /// Checks the primary selector of `command` against the snapshot.
    /// Pure: the same inputs always give the same outcome.
    pub fn validate(&self, command: &Command, snapshot: &PageSnapshot) -> ValidationOutcome {
        if let Err(reason) = command.check_shape() {
            return ValidationOutcome::invalid(reason);
        }
        let Some(locator) = &command.locator else {
            return ValidationOutcome::ok();
        };
        let selector = &locator.primary;

        if self.is_exempt(selector) {
            debug!(%selector, "Locator exempt from static validation");
            return ValidationOutcome::deferred(format!(
                "'{selector}' likely targets content revealed by an earlier action"
            ));
        }
        if snapshot.markup.trim().is_empty() {
            return ValidationOutcome::deferred("no snapshot markup to validate against");
        }

        let index = MarkupIndex::build(&snapshot.markup);
        let outcome = match selector {
            Selector::Text(value) => check_text(value, &index),
            Selector::Xpath(value) => check_xpath(value),
            _ => check_elements(selector, &index),
        };
        debug!(%selector, valid = outcome.valid, ambiguous = outcome.ambiguous, "Static validation");
        outcome
    }
}

/// Validates with the built-in exemption list only.
pub fn validate(command: &Command, snapshot: &PageSnapshot) -> ValidationOutcome {
    Validator::default().validate(command, snapshot)
}

fn normalize_pattern(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '"' && *c != '\'')
        .collect::<String>()
        .to_lowercase()
}

fn class_matches(value: &str, tag: &Tag) -> bool {
    let mut classes = value.split(['.', ' ']).filter(|c| !c.is_empty()).peekable();
    classes.peek().is_some()
        && tag
            .attr("class")
            .is_some_and(|class| classes.all(|c| class.contains(c)))
}

/// Css text for the strategies that are css selectors.
fn css_text(selector: &Selector) -> Option<String> {
    match selector {
        Selector::Css(value) => Some(value.trim().to_string()),
        Selector::CssAttribute(value) => {
            let value = value.trim();
            Some(if value.contains('[') {
                value.to_string()
            } else {
                format!("[{value}]")
            })
        }
        _ => None,
    }
}

fn parse_css(css: &str) -> Result<scraper::Selector, String> {
    scraper::Selector::parse(css).map_err(|e| format!("invalid css selector '{css}': {e}"))
}

/// Elements the selector picks, in tree order. Text picks elements whose
/// whole text equals the value; xpath picks nothing.
fn matching<'a>(selector: &Selector, document: &'a Html) -> Result<Vec<ElementRef<'a>>, String> {
    if let Some(css) = css_text(selector) {
        let parsed = parse_css(&css)?;
        return Ok(document.select(&parsed).collect());
    }
    let role = selector.role_and_name();
    let picks = |element: ElementRef<'a>| {
        let tag = Tag::from(element);
        match selector {
            Selector::CssClass(value) => class_matches(value, &tag),
            Selector::Text(value) => {
                let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
                !value.is_empty() && markup::element_text(element) == value
            }
            Selector::Placeholder(value) => placeholder_matches(value, &tag),
            Selector::Role(_) => {
                role.is_some_and(|(role, name)| role_matches(role, name, &tag, element))
            }
            Selector::TestId(value) => test_id_matches(value, &tag),
            Selector::Css(_) | Selector::CssAttribute(_) | Selector::Xpath(_) => false,
        }
    };
    Ok(markup::elements(document).filter(|e| picks(*e)).collect())
}

fn missing_reason(selector: &Selector) -> String {
    match selector {
        Selector::CssClass(value) => format!("no element has a class containing '{value}'"),
        Selector::CssAttribute(value) => {
            format!("no element matches attribute selector '{value}'")
        }
        Selector::Css(value) => format!("no element matches '{value}'"),
        Selector::Placeholder(value) => format!("no element has placeholder '{value}'"),
        Selector::TestId(value) => format!("no element has test id '{value}'"),
        Selector::Role(_) => match selector.role_and_name() {
            Some((role, Some(name))) => format!("no '{role}' element named '{name}'"),
            Some((role, None)) => format!("no element with role '{role}'"),
            None => "not a role locator".to_string(),
        },
        Selector::Text(value) => format!("text '{value}' does not appear on the page"),
        Selector::Xpath(value) => format!("xpath '{value}' cannot be matched against markup"),
    }
}

/// At least one element must match; css is matched structurally, so
/// combinators and sibling relationships count.
fn check_elements(selector: &Selector, index: &MarkupIndex) -> ValidationOutcome {
    match selector {
        Selector::CssClass(value) if value.trim_matches(['.', ' ']).is_empty() => {
            return ValidationOutcome::invalid("empty class locator");
        }
        Selector::Role(_) if selector.role_and_name().is_none() => {
            return ValidationOutcome::invalid("not a role locator");
        }
        _ => {}
    }
    match matching(selector, &index.document) {
        Ok(found) if !found.is_empty() => ValidationOutcome::ok(),
        Ok(_) => ValidationOutcome::invalid(missing_reason(selector)),
        Err(reason) => ValidationOutcome::invalid(reason),
    }
}

/// Counts occurrences across text runs; more than one is ambiguous.
fn check_text(value: &str, index: &MarkupIndex) -> ValidationOutcome {
    let needle = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if needle.is_empty() {
        return ValidationOutcome::invalid("empty text locator");
    }
    let count: usize = index
        .texts
        .iter()
        .map(|text| text.matches(needle.as_str()).count())
        .sum();
    match count {
        0 => ValidationOutcome::invalid(format!("text '{value}' does not appear on the page")),
        1 => ValidationOutcome::ok(),
        n => ValidationOutcome::ambiguous(format!(
            "text '{value}' matches {n} places on the page; use a more specific locator"
        )),
    }
}

fn placeholder_matches(value: &str, tag: &Tag) -> bool {
    tag.attr("placeholder")
        .is_some_and(|p| p == value || p.eq_ignore_ascii_case(value.trim()))
}

pub(crate) fn implicit_role(tag: &Tag) -> Option<&'static str> {
    let input_type = tag.attr("type").unwrap_or("text").to_lowercase();
    Some(match tag.name.as_str() {
        "button" => "button",
        "a" if tag.has_attr("href") => "link",
        "input" => match input_type.as_str() {
            "submit" | "button" | "reset" | "image" => "button",
            "checkbox" => "checkbox",
            "radio" => "radio",
            "range" => "slider",
            "search" => "searchbox",
            "hidden" => return None,
            _ => "textbox",
        },
        "textarea" => "textbox",
        "select" if tag.has_attr("multiple") => "listbox",
        "select" => "combobox",
        "option" => "option",
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "heading",
        "nav" => "navigation",
        "main" => "main",
        "header" => "banner",
        "footer" => "contentinfo",
        "form" => "form",
        "img" => "img",
        "ul" | "ol" => "list",
        "li" => "listitem",
        "table" => "table",
        "dialog" => "dialog",
        _ => return None,
    })
}

fn role_matches(role: &str, name: Option<&str>, tag: &Tag, element: ElementRef<'_>) -> bool {
    let has_role = match tag.attr("role") {
        Some(explicit) => explicit.eq_ignore_ascii_case(role),
        None => implicit_role(tag).is_some_and(|implicit| implicit.eq_ignore_ascii_case(role)),
    };
    has_role
        && name.map_or(true, |name| {
            tag.attr("aria-label").is_some_and(|l| l.contains(name))
                || tag.attr("value").is_some_and(|v| v.contains(name))
                || tag.attr("title").is_some_and(|t| t.contains(name))
                || markup::element_text(element).contains(name)
        })
}

fn test_id_matches(value: &str, tag: &Tag) -> bool {
    TEST_ID_ATTRIBUTES
        .iter()
        .any(|attr| tag.attr(attr) == Some(value))
}

/// Well-formedness only: balanced brackets and quotes.
fn check_xpath(value: &str) -> ValidationOutcome {
    let value = value.trim();
    if value.is_empty() {
        return ValidationOutcome::invalid("empty xpath");
    }
    let mut stack: Vec<char> = Vec::new();
    let mut quote: Option<char> = None;
    for c in value.chars() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '[' | '(' => stack.push(c),
            ']' | ')' => {
                let open = if c == ']' { '[' } else { '(' };
                if stack.pop() != Some(open) {
                    return ValidationOutcome::invalid(format!("unbalanced '{c}' in xpath '{value}'"));
                }
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return ValidationOutcome::invalid(format!("unterminated string in xpath '{value}'"));
    }
    if !stack.is_empty() {
        return ValidationOutcome::invalid(format!("unclosed bracket in xpath '{value}'"));
    }
    ValidationOutcome::ok()
}

/// An element picked out of static markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupElement {
    pub tag: Tag,
    /// Collapsed text of the element's subtree
    pub text: String,
}

/// Elements of `html` the selector would pick, in document order.
///
/// Css is matched structurally; text matches elements whose whole text
/// equals the value; xpath and unparseable css never match.
pub fn find_elements(selector: &Selector, html: &str) -> Vec<MarkupElement> {
    let document = Html::parse_document(html);
    match matching(selector, &document) {
        Ok(found) => found
            .into_iter()
            .map(|element| MarkupElement {
                tag: Tag::from(element),
                text: markup::element_text(element),
            })
            .collect(),
        Err(reason) => {
            debug!(%selector, %reason, "Selector cannot be matched against markup");
            Vec::new()
        }
    }
}
