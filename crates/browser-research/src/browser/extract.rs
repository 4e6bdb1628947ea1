//! Main-content extraction from raw HTML.
//!
//! Picks the most likely content container (`<article>`, `<main>`, common
//! content classes, then the densest `<div>`) and flattens it to text,
//! skipping scripts, navigation chrome and other boilerplate.

use std::collections::BTreeMap;

use scraper::node::{Element, Node};
use scraper::{ElementRef, Html, Selector};

const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "iframe", "svg", "nav", "header", "footer", "aside", "form",
    "button",
];

const NOISE_PATTERNS: &[&str] = &[
    "comment", "share", "social", "footer", "banner", "menu", "navbar", "ad-", "popup", "cookie",
    "sidebar", "related", "recommended", "popular",
];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "br", "li", "ul", "ol", "h1", "h2", "h3", "h4",
    "h5", "h6", "blockquote", "pre", "table", "tr", "dd", "dt",
];

const CONTENT_SELECTORS: &[&str] = &[
    "div.content",
    "div.post",
    "div.entry",
    ".post-content",
    ".entry-content",
    "#content",
    "#mw-content-text",
];

fn is_noise(el: &Element) -> bool {
    if SKIP_TAGS.contains(&el.name()) {
        return true;
    }
    let mut labels = el.classes().map(|c| c.to_ascii_lowercase()).collect::<Vec<_>>();
    if let Some(id) = el.id() {
        labels.push(id.to_ascii_lowercase());
    }
    labels
        .iter()
        .any(|l| NOISE_PATTERNS.iter().any(|p| l.contains(p)))
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) => {
                if is_noise(e) {
                    continue;
                }
                let Some(child_ref) = ElementRef::wrap(child) else {
                    continue;
                };
                let block = BLOCK_TAGS.contains(&e.name());
                if block {
                    out.push('\n');
                }
                collect_text(child_ref, out);
                if block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

fn visible_text(el: ElementRef<'_>) -> String {
    let mut raw = String::new();
    collect_text(el, &mut raw);
    clean_text(&raw)
}

/// Collapse runs of spaces and drop blank lines.
pub fn clean_text(raw: &str) -> String {
    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn largest<'a>(doc: &'a Html, selector: &str) -> Option<(ElementRef<'a>, String)> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .map(|el| {
            let text = visible_text(el);
            (el, text)
        })
        .filter(|(_, text)| !text.is_empty())
        .max_by_key(|(_, text)| text.len())
}

/// Densest `<div>` with at least 200 characters of text.
fn densest_div(doc: &Html) -> Option<String> {
    let sel = Selector::parse("div").ok()?;
    let mut best: Option<(f64, usize, String)> = None;
    for div in doc.select(&sel) {
        let text = visible_text(div);
        if text.len() < 200 {
            continue;
        }
        let tags = div.descendants().filter(|n| n.value().is_element()).count();
        if tags == 0 {
            continue;
        }
        let ratio = text.len() as f64 / tags as f64;
        if ratio < 10.0 {
            continue;
        }
        let better = match &best {
            Some((r, len, _)) => ratio > *r || (ratio == *r && text.len() > *len),
            None => true,
        };
        if better {
            best = Some((ratio, text.len(), text));
        }
    }
    best.map(|(_, _, text)| text)
}

/// Main readable text of an HTML page.
pub fn extract_main_content(html: &str) -> String {
    let doc = Html::parse_document(html);

    for tag in ["article", "main"] {
        if let Some((_, text)) = largest(&doc, tag) {
            return text;
        }
    }
    for selector in CONTENT_SELECTORS {
        if let Some((_, text)) = largest(&doc, selector) {
            return text;
        }
    }
    if let Some(text) = densest_div(&doc) {
        return text;
    }
    Selector::parse("body")
        .ok()
        .and_then(|sel| doc.select(&sel).next().map(visible_text))
        .unwrap_or_default()
}

/// Page title: `<title>`, then `og:title`, then the first `<h1>`.
pub fn extract_title(html: &str) -> String {
    let doc = Html::parse_document(html);
    let text_of = |selector: &str| -> Option<String> {
        let sel = Selector::parse(selector).ok()?;
        doc.select(&sel)
            .map(|el| clean_text(&el.text().collect::<String>()))
            .find(|t| !t.is_empty())
    };
    text_of("title")
        .or_else(|| meta_content(&doc, r#"meta[property="og:title"]"#))
        .or_else(|| text_of("h1"))
        .unwrap_or_default()
}

fn meta_content(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .filter_map(|el| el.value().attr("content"))
        .map(|c| c.trim().to_string())
        .find(|c| !c.is_empty())
}

/// Description, author and publication date from meta tags.
pub fn extract_metadata(html: &str) -> BTreeMap<String, String> {
    let doc = Html::parse_document(html);
    let mut meta = BTreeMap::new();
    let lookups = [
        ("description", r#"meta[name="description"]"#),
        ("description", r#"meta[property="og:description"]"#),
        ("author", r#"meta[name="author"]"#),
        ("date", r#"meta[property="article:published_time"]"#),
        ("date", r#"meta[name="date"]"#),
    ];
    for (key, selector) in lookups {
        if meta.contains_key(key) {
            continue;
        }
        if let Some(value) = meta_content(&doc, selector) {
            meta.insert(key.to_string(), value);
        }
    }
    meta
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
