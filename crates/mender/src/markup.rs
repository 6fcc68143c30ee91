//! Markup capture and the transforms applied before prompting.
//!
//! Markup is parsed with `scraper`, so broken documents are repaired the way
//! a browser would before any transform runs.

use async_trait::async_trait;
use scraper::node::Element;
use scraper::{ElementRef, Html, Node};
use std::sync::Arc;

use crate::errors::PageError;
use crate::page::PageDriver;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

const INTERACTIVE_TAGS: &[&str] = &[
    "a", "button", "input", "select", "textarea", "option", "summary",
];

/// Subtrees that never reach a prompt and hold no visible text.
const NOISE_ELEMENTS: &[&str] = &["script", "style", "svg", "noscript", "template"];

const MAX_INTERACTIVE_TEXT: usize = 120;

/// An element's name and attributes, detached from the parsed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

impl From<&Element> for Tag {
    fn from(element: &Element) -> Self {
        Self {
            name: element.name().to_string(),
            attrs: element
                .attrs()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }
}

impl From<ElementRef<'_>> for Tag {
    fn from(element: ElementRef<'_>) -> Self {
        Self::from(element.value())
    }
}

impl Tag {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn is_void(&self) -> bool {
        VOID_ELEMENTS.contains(&self.name.as_str())
    }

    pub fn is_noise(&self) -> bool {
        NOISE_ELEMENTS.contains(&self.name.as_str())
    }

    pub fn is_interactive(&self) -> bool {
        INTERACTIVE_TAGS.contains(&self.name.as_str())
            || self.has_attr("role")
            || self.has_attr("onclick")
            || self.has_attr("tabindex")
            || self.attr("contenteditable").is_some_and(|v| v != "false")
    }

    pub fn is_hidden(&self) -> bool {
        if self.has_attr("hidden") {
            return true;
        }
        if self.attr("aria-hidden") == Some("true") {
            return true;
        }
        if self.name == "input" && self.attr("type") == Some("hidden") {
            return true;
        }
        self.attr("style").is_some_and(|style| {
            let style: String = style.chars().filter(|c| !c.is_whitespace()).collect();
            let style = style.to_lowercase();
            style.contains("display:none") || style.contains("visibility:hidden")
        })
    }

    fn render(&self, keep: impl Fn(&str) -> bool) -> String {
        let mut out = format!("<{}", self.name);
        for (key, value) in &self.attrs {
            if !keep(key) {
                continue;
            }
            if value.is_empty() {
                out.push_str(&format!(" {key}"));
            } else {
                out.push_str(&format!(" {key}=\"{}\"", value.replace('"', "&quot;")));
            }
        }
        out.push('>');
        out
    }
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn keep_attribute(name: &str) -> bool {
    name != "style" && !name.starts_with("on") && !name.starts_with("data-mender-")
}

/// The document head, or an element hiding its subtree.
fn is_concealed(tag: &Tag) -> bool {
    tag.name == "head" || tag.is_hidden()
}

/// Collapsed text of the element's subtree, skipping script-like content.
pub fn element_text(element: ElementRef<'_>) -> String {
    fn walk(element: ElementRef<'_>, words: &mut Vec<String>) {
        for child in element.children() {
            match child.value() {
                Node::Text(text) => words.extend(text.split_whitespace().map(str::to_string)),
                Node::Element(el) if !NOISE_ELEMENTS.contains(&el.name()) => {
                    if let Some(child) = ElementRef::wrap(child) {
                        walk(child, words);
                    }
                }
                _ => {}
            }
        }
    }
    let mut words = Vec::new();
    walk(element, &mut words);
    words.join(" ")
}

/// Text nodes of the document outside script-like content, whitespace-collapsed.
pub fn text_runs(document: &Html) -> Vec<String> {
    fn walk(element: ElementRef<'_>, runs: &mut Vec<String>) {
        for child in element.children() {
            match child.value() {
                Node::Text(text) => {
                    let text = collapse(text);
                    if !text.is_empty() {
                        runs.push(text);
                    }
                }
                Node::Element(el) if !NOISE_ELEMENTS.contains(&el.name()) => {
                    if let Some(child) = ElementRef::wrap(child) {
                        walk(child, runs);
                    }
                }
                _ => {}
            }
        }
    }
    let mut runs = Vec::new();
    walk(document.root_element(), &mut runs);
    runs
}

/// Every element of the document in tree order, the root included.
pub fn elements(document: &Html) -> impl Iterator<Item = ElementRef<'_>> {
    document.root_element().descendants().filter_map(ElementRef::wrap)
}

fn render(element: ElementRef<'_>, skip_concealed: bool, out: &mut String) {
    let tag = Tag::from(element);
    if tag.is_noise() || (skip_concealed && is_concealed(&tag)) {
        return;
    }
    out.push_str(&tag.render(keep_attribute));
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(&collapse(text)),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    render(child, skip_concealed, out);
                }
            }
            _ => {}
        }
    }
    if !tag.is_void() {
        out.push_str(&format!("</{}>", tag.name));
    }
}

/// Markup without scripts, styles, comments and noisy attributes.
pub fn simplify(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::with_capacity(html.len() / 2);
    render(document.root_element(), false, &mut out);
    out
}

/// Simplified markup with hidden subtrees and the document head removed.
pub fn visible(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::with_capacity(html.len() / 2);
    render(document.root_element(), true, &mut out);
    out
}

/// One line per actionable element, with its text.
pub fn interactive(html: &str) -> String {
    fn walk(element: ElementRef<'_>, lines: &mut Vec<String>) {
        let tag = Tag::from(element);
        if tag.is_noise() || is_concealed(&tag) {
            return;
        }
        if tag.is_interactive() {
            let opening = tag.render(keep_attribute);
            if tag.is_void() {
                lines.push(opening);
            } else {
                let text: String = element_text(element)
                    .chars()
                    .take(MAX_INTERACTIVE_TEXT)
                    .collect();
                lines.push(format!("{opening}{text}</{}>", tag.name));
            }
        }
        for child in element.children().filter_map(ElementRef::wrap) {
            walk(child, lines);
        }
    }
    let document = Html::parse_document(html);
    let mut lines = Vec::new();
    walk(document.root_element(), &mut lines);
    lines.join("\n")
}

/// Cuts `text` to at most `max_chars` characters, marking the cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}\n<!-- truncated: {} more chars -->", total - max_chars)
}

/// Captures markup from the current state of a page.
///
/// Implementations must reflect the page at call time; callers own any
/// caching beyond the snapshot they asked for.
#[async_trait]
pub trait MarkupExtractor: Send + Sync {
    /// Raw document markup.
    async fn extract_raw(&self) -> Result<String, PageError>;

    async fn extract_simplified(&self) -> Result<String, PageError> {
        Ok(simplify(&self.extract_raw().await?))
    }

    async fn extract_visible(&self) -> Result<String, PageError> {
        Ok(visible(&self.extract_raw().await?))
    }

    async fn extract_interactive(&self) -> Result<String, PageError> {
        Ok(interactive(&self.extract_raw().await?))
    }

    async fn extract_truncated(&self, max_len: usize) -> Result<String, PageError> {
        Ok(truncate(&self.extract_simplified().await?, max_len))
    }
}

/// Reads markup from a live page.
#[derive(Clone)]
pub struct PageMarkup {
    page: Arc<dyn PageDriver>,
}

impl PageMarkup {
    pub fn new(page: Arc<dyn PageDriver>) -> Self {
        Self { page }
    }
}

#[async_trait]
impl MarkupExtractor for PageMarkup {
    async fn extract_raw(&self) -> Result<String, PageError> {
        self.page.page_markup().await
    }
}

/// Markup captured ahead of time, e.g. a saved HTML file.
#[derive(Debug, Clone)]
pub struct StaticMarkup {
    html: String,
}

impl StaticMarkup {
    pub fn new(html: impl Into<String>) -> Self {
        Self { html: html.into() }
    }
}

#[async_trait]
impl MarkupExtractor for StaticMarkup {
    async fn extract_raw(&self) -> Result<String, PageError> {
        Ok(self.html.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!DOCTYPE html>
<html lang="de">
  <head><title>Shop</title><style>.x { color: red }</style></head>
  <body>
    <!-- nav -->
    <script>window.track = 1;</script>
    <div class='menu' style="display: none"><a href="/secret">Secret</a></div>
    <button class="login-btn" onclick="go()">Login</button>
    <input type=text name=user placeholder="Benutzername">
    <p>Welcome   back</p>
  </body>
</html>"#;

    #[test]
    fn test_tag_attributes_in_all_quote_styles() {
        let document =
            Html::parse_fragment(r#"<input type=text name='user' placeholder="Name" disabled>"#);
        let tag = elements(&document)
            .map(Tag::from)
            .find(|tag| tag.name == "input")
            .unwrap();
        assert_eq!(tag.attr("type"), Some("text"));
        assert_eq!(tag.attr("name"), Some("user"));
        assert_eq!(tag.attr("placeholder"), Some("Name"));
        assert!(tag.has_attr("disabled"));
        assert!(tag.is_void());
    }

    #[test]
    fn test_broken_markup_is_repaired() {
        let out = simplify("<ul><li>One<li>Two</ul><p>Open");
        assert!(out.contains("<ul><li>One</li><li>Two</li></ul>"));
        assert!(out.ends_with("<p>Open</p></body></html>"));
    }

    #[test]
    fn test_element_handles_never_reach_prompts() {
        let html = r#"<button data-mender-handle="h-1" data-testid="go">Go</button>"#;
        for out in [simplify(html), visible(html), interactive(html)] {
            assert!(!out.contains("data-mender-handle"), "{out}");
            assert!(out.contains(r#"data-testid="go""#));
        }
    }

    #[test]
    fn test_text_skips_scripts() {
        let document = Html::parse_document(
            "<body><p>Total <b>3</b> items</p><script>var Total = 1;</script></body>",
        );
        assert_eq!(text_runs(&document), vec!["Total", "3", "items"]);
        assert_eq!(element_text(document.root_element()), "Total 3 items");
    }

    #[test]
    fn test_simplify_drops_noise() {
        let out = simplify(PAGE);
        assert!(!out.contains("window.track"));
        assert!(!out.contains("color: red"));
        assert!(!out.contains("onclick"));
        assert!(!out.contains("nav"));
        assert!(out.contains(r#"<button class="login-btn">Login</button>"#));
        assert!(out.contains("<p>Welcome back</p>"));
        assert!(out.starts_with(r#"<html lang="de">"#));
    }

    #[test]
    fn test_visible_skips_hidden_subtrees() {
        let out = visible(PAGE);
        assert!(!out.contains("Secret"));
        assert!(!out.contains("<title>"));
        assert!(out.contains("Login"));
    }

    #[test]
    fn test_interactive_lists_actionable_elements() {
        let out = interactive(PAGE);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"<button class="login-btn">Login</button>"#);
        assert!(lines[1].starts_with("<input "));
        for attr in [r#"type="text""#, r#"name="user""#, r#"placeholder="Benutzername""#] {
            assert!(lines[1].contains(attr), "{}", lines[1]);
        }
    }

    #[test]
    fn test_truncate_marks_cut() {
        assert_eq!(truncate("short", 10), "short");
        let out = truncate("abcdefghij", 4);
        assert!(out.starts_with("abcd\n"));
        assert!(out.contains("6 more chars"));
    }

    #[tokio::test]
    async fn test_static_markup_extractor() {
        let extractor = StaticMarkup::new(PAGE);
        let truncated = extractor.extract_truncated(20).await.unwrap();
        assert!(truncated.starts_with(r#"<html lang="de">"#));
        assert!(truncated.contains("truncated"));
    }
}
