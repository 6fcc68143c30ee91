//! Structured diagnostics for a live execution failure.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::command::Command;
use crate::errors::ExecutionError;
use crate::markup::{self, Tag};
use crate::page::PageDriver;
use crate::subtask::Subtask;
use crate::validator::implicit_role;

pub const DEFAULT_MAX_LOCATORS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    SelectorNotFound,
    Timeout,
    AssertionMismatch,
    NavigationError,
    Unknown,
}

impl FailureCategory {
    /// Matches error text against known patterns, highest priority first.
    pub fn classify(error: &str) -> Self {
        const PATTERNS: &[(FailureCategory, &[&str])] = &[
            (
                FailureCategory::SelectorNotFound,
                &[
                    "not found",
                    "no element",
                    "unable to locate",
                    "no such element",
                    "detached",
                    "failed to find",
                ],
            ),
            (
                FailureCategory::Timeout,
                &["timed out", "timeout", "deadline exceeded"],
            ),
            (
                FailureCategory::AssertionMismatch,
                &["assertion", "expected", "mismatch", "does not match"],
            ),
            (
                FailureCategory::NavigationError,
                &["navigation", "navigate", "net::err", "dns", "connection refused"],
            ),
        ];
        let error = error.to_lowercase();
        PATTERNS
            .iter()
            .find(|(_, needles)| needles.iter().any(|needle| error.contains(needle)))
            .map(|(category, _)| *category)
            .unwrap_or(FailureCategory::Unknown)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCategory::SelectorNotFound => "selector-not-found",
            FailureCategory::Timeout => "timeout",
            FailureCategory::AssertionMismatch => "assertion-mismatch",
            FailureCategory::NavigationError => "navigation-error",
            FailureCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerOptions {
    pub capture_markup: bool,
    pub capture_screenshot: bool,
    pub max_locators: usize,
    /// Cap on the markup kept in the context
    pub max_markup_chars: usize,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            capture_markup: true,
            capture_screenshot: false,
            max_locators: DEFAULT_MAX_LOCATORS,
            max_markup_chars: 8_000,
        }
    }
}

/// Immutable record of one failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub error_message: String,
    pub failed_command: Command,
    pub command_index: usize,
    pub page_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_markup: Option<String>,
    /// Base64 PNG
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    pub candidate_locators: Vec<String>,
    pub category: FailureCategory,
    pub timestamp: DateTime<Utc>,
}

pub struct FailureAnalyzer {
    page: Arc<dyn PageDriver>,
    options: AnalyzerOptions,
}

impl FailureAnalyzer {
    pub fn new(page: Arc<dyn PageDriver>, options: AnalyzerOptions) -> Self {
        Self { page, options }
    }

    /// Builds the failure context. Never fails: anything the page cannot
    /// provide is left out.
    #[instrument(level = "debug", skip_all, fields(unit = %unit.id, index = command_index))]
    pub async fn analyze(
        &self,
        unit: &Subtask,
        command_index: usize,
        command: &Command,
        error: &ExecutionError,
    ) -> FailureContext {
        let error_message = error.to_string();
        let category = FailureCategory::classify(&error_message);

        let page_url = match self.page.current_url().await {
            Ok(url) => url,
            Err(e) => {
                debug!("Could not read page URL: {}", e);
                "unknown".to_string()
            }
        };

        let raw_markup = match self.page.page_markup().await {
            Ok(markup) => Some(markup),
            Err(e) => {
                debug!("Could not read page markup: {}", e);
                None
            }
        };
        let candidate_locators = raw_markup
            .as_deref()
            .map(|html| extract_candidate_locators(html, self.options.max_locators))
            .unwrap_or_default();
        let page_markup = if self.options.capture_markup {
            raw_markup.map(|html| {
                markup::truncate(&markup::simplify(&html), self.options.max_markup_chars)
            })
        } else {
            None
        };

        let screenshot = if self.options.capture_screenshot {
            match self.page.screenshot().await {
                Ok(png) => Some(general_purpose::STANDARD.encode(png)),
                Err(e) => {
                    debug!("No screenshot for failure context: {}", e);
                    None
                }
            }
        } else {
            None
        };

        debug!(%category, candidates = candidate_locators.len(), "Failure analyzed");
        FailureContext {
            error_message,
            failed_command: command.clone(),
            command_index,
            page_url,
            page_markup,
            screenshot,
            candidate_locators,
            category,
            timestamp: Utc::now(),
        }
    }
}

fn short_text(text: &str) -> Option<String> {
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty() && text.chars().count() <= 60).then_some(text)
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}

/// Candidate locator strings from live markup, best first.
///
/// Tiers: test ids and aria labels, then id/name/placeholder, then role and
/// text of actionable elements, then classes, then bare tags.
pub fn extract_candidate_locators(html: &str, max: usize) -> Vec<String> {
    fn walk(element: ElementRef<'_>, tiers: &mut [Vec<String>; 5]) {
        let tag = Tag::from(element);
        if tag.is_noise() || tag.name == "head" || tag.is_hidden() {
            return;
        }
        for attr in ["data-testid", "data-test-id", "data-test", "data-qa"] {
            if let Some(value) = tag.attr(attr).filter(|v| !v.is_empty()) {
                tiers[0].push(format!("test-id:{value}"));
            }
        }
        if let Some(label) = tag.attr("aria-label").filter(|v| !v.is_empty()) {
            tiers[0].push(format!("css-attribute:[aria-label={}]", quote(label)));
        }
        if let Some(id) = tag.attr("id").filter(|v| !v.is_empty()) {
            tiers[1].push(format!("css:#{id}"));
        }
        if let Some(name) = tag.attr("name").filter(|v| !v.is_empty()) {
            tiers[1].push(format!("css-attribute:[name={}]", quote(name)));
        }
        if let Some(placeholder) = tag.attr("placeholder").filter(|v| !v.is_empty()) {
            tiers[1].push(format!("placeholder:{placeholder}"));
        }
        if let Some(class) = tag.attr("class") {
            for class in class.split_whitespace() {
                tiers[3].push(format!("css-class:{class}"));
            }
        }
        if tag.is_interactive() {
            tiers[4].push(format!("css:{}", tag.name));
            let text = if tag.is_void() {
                tag.attr("value").and_then(short_text)
            } else {
                short_text(&markup::element_text(element))
            };
            if let Some(text) = text {
                if !tag.is_void() {
                    if let Some(role) = tag.attr("role").or_else(|| implicit_role(&tag)) {
                        tiers[2].push(format!("role:{role}|{text}"));
                    }
                }
                tiers[2].push(format!("text:{text}"));
            }
        }
        for child in element.children().filter_map(ElementRef::wrap) {
            walk(child, tiers);
        }
    }

    let document = Html::parse_document(html);
    let mut tiers: [Vec<String>; 5] = Default::default();
    walk(document.root_element(), &mut tiers);

    let mut seen = HashSet::new();
    tiers
        .into_iter()
        .flatten()
        .filter(|candidate| seen.insert(candidate.clone()))
        .take(max)
        .collect()
}
