//! HTML content extraction: clutter identification, main-content selection,
//! the sufficiency gate, and DOM link extraction.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use ego_tree::NodeId;
use scraper::{ElementRef, Html, Node, Selector};
use url::Url;

use crate::config::Config;
use crate::htmlmd;
use crate::markdown;
use crate::models::{CrawlScope, ScrapeResult};
use crate::url_utils;

/// Boilerplate elements stripped from every page.
const CLUTTER_TAGS: &[&str] = &[
    "nav", "header", "footer", "script", "style", "iframe", "svg", "noscript", "template",
    "form", "button", "input",
];

/// Everything the hybrid worker needs after one parse pass.
#[derive(Debug)]
pub struct ProcessedHtml {
    pub result: ScrapeResult,
    pub links: Vec<Url>,
    pub sufficient: bool,
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector parses")
}

fn main_selectors() -> &'static Vec<Selector> {
    static SELECTORS: OnceLock<Vec<Selector>> = OnceLock::new();
    SELECTORS.get_or_init(|| {
        [
            "main",
            "article",
            "[role=\"main\"]",
            "#content",
            "#main",
            ".content",
            ".main-content",
            ".markdown-body",
            ".docs-content",
        ]
        .iter()
        .map(|css| selector(css))
        .collect()
    })
}

fn body_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| selector("body"))
}

fn base_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| selector("base[href]"))
}

fn title_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| selector("title"))
}

fn h1_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| selector("h1"))
}

fn anchor_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| selector("a[href]"))
}

/// Parse, clean, and convert one HTML document.
///
/// Runs entirely on the calling thread; the DOM types are not `Send`, so
/// workers invoke this inside `spawn_blocking`.
pub fn process_html(
    html: &str,
    page_url: &Url,
    fetched: DateTime<Utc>,
    scope: Option<&CrawlScope>,
    collect_clutter: bool,
) -> ProcessedHtml {
    let doc = Html::parse_document(html);

    let body = doc
        .select(body_selector())
        .next()
        .unwrap_or_else(|| doc.root_element());
    let clutter_nodes = collect_clutter_nodes(body);

    let content_root = find_main_content(&doc).unwrap_or(body);
    let engine = htmlmd::engine();

    let content_md = engine.convert_excluding(content_root, &clutter_nodes);
    let full_md = engine.convert_excluding(body, &clutter_nodes);
    let sufficient =
        visible_text_len(content_root, &clutter_nodes) > Config::SUFFICIENT_CONTENT_CHARS;

    let clutter_md = if collect_clutter {
        let parts: Vec<String> = clutter_elements(body)
            .into_iter()
            .map(|el| engine.convert(el))
            .filter(|md| !md.trim().is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    } else {
        None
    };

    // Prefer a title heading the content itself carries; fall back to
    // <title>, then to the URL.
    let (content_title, content_body) = markdown::split_leading_title(&content_md);
    let (full_title, full_body) = markdown::split_leading_title(&full_md);
    let title = content_title
        .or(full_title)
        .or_else(|| document_title(&doc))
        .unwrap_or_else(|| markdown::title_from_url(page_url));

    let page = markdown::compose_document(&title, &content_body, page_url, &fetched);
    let llms_full = markdown::compose_document(&title, &full_body, page_url, &fetched);
    let clutter = clutter_md
        .map(|md| markdown::compose_document(&title, &md, page_url, &fetched));

    let links = match scope {
        Some(scope) => extract_links_from_dom(&doc, page_url, scope),
        None => Vec::new(),
    };

    ProcessedHtml {
        result: ScrapeResult {
            source_url: page_url.clone(),
            fetched_at: fetched,
            title,
            llms: page.clone(),
            page,
            clutter,
            llms_full,
        },
        links,
        sufficient,
    }
}

/// First match of the main-content selector chain.
fn find_main_content(doc: &Html) -> Option<ElementRef<'_>> {
    main_selectors()
        .iter()
        .find_map(|sel| doc.select(sel).next())
}

fn document_title(doc: &Html) -> Option<String> {
    let from_title = doc
        .select(title_selector())
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());
    from_title.or_else(|| {
        doc.select(h1_selector())
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    })
}

/// True for boilerplate that never belongs in mirrored content.
fn is_clutter_element(el: ElementRef<'_>) -> bool {
    let tag = el.value().name();
    if CLUTTER_TAGS.contains(&tag) {
        return true;
    }
    // Skip-to-content links jump to an in-page anchor.
    if tag == "a" {
        if let Some(href) = el.value().attr("href") {
            if href.starts_with('#') {
                let text = el.text().collect::<String>().to_lowercase();
                return text.contains("skip to");
            }
        }
    }
    false
}

fn collect_clutter_nodes(body: ElementRef<'_>) -> HashSet<NodeId> {
    clutter_elements(body).into_iter().map(|el| el.id()).collect()
}

/// Topmost clutter elements under `body` (nested clutter folds into its
/// ancestor).
fn clutter_elements(body: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let mut found = Vec::new();
    collect_clutter_rec(body, &mut found);
    found
}

fn collect_clutter_rec<'a>(el: ElementRef<'a>, found: &mut Vec<ElementRef<'a>>) {
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            if is_clutter_element(child_el) {
                found.push(child_el);
            } else {
                collect_clutter_rec(child_el, found);
            }
        }
    }
}

/// Non-whitespace character count of visible text, clutter excluded.
fn visible_text_len(el: ElementRef<'_>, excluded: &HashSet<NodeId>) -> usize {
    let mut count = 0usize;
    visible_text_len_rec(el, excluded, &mut count);
    count
}

fn visible_text_len_rec(el: ElementRef<'_>, excluded: &HashSet<NodeId>, count: &mut usize) {
    for child in el.children() {
        if excluded.contains(&child.id()) {
            continue;
        }
        match child.value() {
            Node::Text(text) => {
                *count += text.text.chars().filter(|c| !c.is_whitespace()).count();
            }
            Node::Element(element) => {
                if matches!(element.name(), "script" | "style") {
                    continue;
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    visible_text_len_rec(child_el, excluded, count);
                }
            }
            _ => {}
        }
    }
}

/// Collect in-scope crawl candidates from a parsed document.
///
/// A `<base href>` participates in resolution when present. Cross-origin,
/// out-of-scope, and non-HTML targets are dropped; hash and query are
/// stripped; order of first appearance is preserved.
pub fn extract_links_from_dom(doc: &Html, page_url: &Url, scope: &CrawlScope) -> Vec<Url> {
    let base = doc
        .select(base_selector())
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| page_url.join(href).ok())
        .unwrap_or_else(|| page_url.clone());

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for el in doc.select(anchor_selector()) {
        let href = match el.value().attr("href") {
            Some(h) => h.trim(),
            None => continue,
        };
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let mut resolved = match base.join(href) {
            Ok(u) => u,
            Err(_) => continue,
        };
        if !url_utils::is_http_scheme(&resolved)
            || !scope.contains(&resolved)
            || !url_utils::is_html_candidate(&resolved)
        {
            continue;
        }
        resolved.set_fragment(None);
        resolved.set_query(None);
        let key = resolved.to_string();
        if seen.insert(key) {
            out.push(resolved);
        }
    }
    out
}
