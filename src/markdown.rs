//! Markdown-source content pipeline: frontmatter, title normalization, and
//! link-candidate extraction from Markdown text.

use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use url::Url;

use crate::models::{CrawlScope, ScrapeResult};
use crate::url_utils;

fn inline_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\]\(\s*<?([^)\s>]+)>?\s*(?:"[^"]*")?\)"#).unwrap())
}

fn ref_def_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s{0,3}\[[^\]]+\]:\s*(\S+)").unwrap())
}

fn autolink_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<(https?://[^>\s]+)>").unwrap())
}

fn href_attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"href=(?:"([^"]+)"|'([^']+)'|\{"([^"}]+)"\})"#).unwrap()
    })
}

fn bare_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>()\[\]'"]+"#).unwrap())
}

/// Render the fixed frontmatter header.
pub fn frontmatter(source: &Url, fetched: &DateTime<Utc>) -> String {
    format!(
        "---\nSource: {}\nFetched: {}\n---\n",
        source,
        fetched.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Frontmatter, blank line, canonical title heading, blank line, body.
pub fn compose_document(
    title: &str,
    body: &str,
    source: &Url,
    fetched: &DateTime<Utc>,
) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("{}\n# {}\n", frontmatter(source, fetched), title)
    } else {
        format!("{}\n# {}\n\n{}\n", frontmatter(source, fetched), title, body)
    }
}

/// Split a leading `# title` heading off a Markdown body, if present.
pub fn split_leading_title(md: &str) -> (Option<String>, String) {
    let trimmed = md.trim_start_matches(['\n', '\r']);
    let mut lines = trimmed.lines();
    if let Some(first) = lines.next() {
        if let Some(title) = first.trim().strip_prefix("# ") {
            let rest = trimmed[first.len()..].trim_start_matches(['\n', '\r']);
            return (Some(title.trim().to_string()), rest.to_string());
        }
    }
    (None, md.to_string())
}

/// Fallback title derived from the last meaningful URL path segment.
pub fn title_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("");
    let segment = segment
        .trim_end_matches(".md")
        .trim_end_matches(".txt")
        .replace(['-', '_'], " ");
    if segment.is_empty() {
        url.host_str().unwrap_or("index").to_string()
    } else {
        segment
    }
}

/// Build the scrape result for a raw companion Markdown document.
///
/// All variants share the body; there is no clutter to separate.
pub fn markdown_scrape_result(raw: &str, url: &Url, fetched: DateTime<Utc>) -> ScrapeResult {
    let (existing_title, body) = split_leading_title(raw);
    let title = existing_title.unwrap_or_else(|| title_from_url(url));
    let document = compose_document(&title, &body, url, &fetched);
    ScrapeResult {
        source_url: url.clone(),
        fetched_at: fetched,
        title,
        page: document.clone(),
        clutter: None,
        llms: document.clone(),
        llms_full: document,
    }
}

/// Extract in-scope crawl candidates from Markdown text.
///
/// Recognizes inline links, reference definitions, angle-bracket autolinks,
/// `href` attributes in embedded JSX-like tags, and bare URLs outside code
/// fences and reference lines. Candidates are resolved against `base`,
/// filtered to the crawl scope, stripped of hash/query, and deduplicated in
/// order of first appearance.
pub fn extract_links(md: &str, base: &Url, scope: &CrawlScope) -> Vec<Url> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    let mut in_fence = false;

    for line in md.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        let mut candidates: Vec<(usize, &str)> = Vec::new();
        let is_ref_line = if let Some(caps) = ref_def_re().captures(line) {
            if let Some(m) = caps.get(1) {
                candidates.push((m.start(), m.as_str()));
            }
            true
        } else {
            false
        };

        for caps in inline_link_re().captures_iter(line) {
            if let Some(m) = caps.get(1) {
                candidates.push((m.start(), m.as_str()));
            }
        }
        for caps in autolink_re().captures_iter(line) {
            if let Some(m) = caps.get(1) {
                candidates.push((m.start(), m.as_str()));
            }
        }
        for caps in href_attr_re().captures_iter(line) {
            let m = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3));
            if let Some(m) = m {
                candidates.push((m.start(), m.as_str()));
            }
        }
        if !is_ref_line {
            for m in bare_url_re().find_iter(line) {
                if bare_position_excluded(line, m.start()) {
                    continue;
                }
                candidates.push((m.start(), m.as_str()));
            }
        }

        candidates.sort_by_key(|(pos, _)| *pos);
        for (_, href) in candidates {
            if let Some(resolved) = resolve_candidate(href, base, scope) {
                let key = url_utils::normalize_for_queue(&resolved);
                if seen.insert(key.clone()) {
                    out.push(Url::parse(&key).expect("normalized URL reparses"));
                }
            }
        }
    }

    out
}

/// Bare URLs immediately after `](`, inside `<...>`, or in quoted
/// attributes were already handled by the other patterns.
fn bare_position_excluded(line: &str, start: usize) -> bool {
    let before = &line[..start];
    before.ends_with('<')
        || before.ends_with('(')
        || before.ends_with('"')
        || before.ends_with('\'')
        || before.ends_with('=')
}

/// Resolve one href against the page and keep it only when it stays inside
/// the crawl scope and looks like an HTML page.
pub fn resolve_candidate(href: &str, base: &Url, scope: &CrawlScope) -> Option<Url> {
    let href = href.trim().trim_end_matches(['.', ',', ';']);
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let mut resolved = base.join(href).ok()?;
    if !url_utils::is_http_scheme(&resolved) {
        return None;
    }

    // Root-absolute links that escape the scope sometimes just lost the
    // scope prefix; try reattaching it before giving up.
    if !scope.contains(&resolved) && href.starts_with('/') {
        let prefix = scope.path_prefix.trim_end_matches('/');
        if !prefix.is_empty() {
            if let Ok(repaired) = base.join(&format!("{prefix}{href}")) {
                if scope.contains(&repaired) {
                    resolved = repaired;
                }
            }
        }
    }

    if !scope.contains(&resolved) || !url_utils::is_html_candidate(&resolved) {
        return None;
    }
    resolved.set_fragment(None);
    resolved.set_query(None);
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn scope(s: &str) -> CrawlScope {
        CrawlScope::from_seed(&url(s))
    }

    #[test]
    fn test_frontmatter_shape() {
        let fetched = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let fm = frontmatter(&url("https://x.test/docs"), &fetched);
        assert_eq!(
            fm,
            "---\nSource: https://x.test/docs\nFetched: 2026-01-02T03:04:05Z\n---\n"
        );
    }

    #[test]
    fn test_markdown_result_keeps_existing_title_once() {
        let fetched = Utc::now();
        let result = markdown_scrape_result("# Title\nBody", &url("https://x.test/docs"), fetched);
        assert_eq!(result.title, "Title");
        assert_eq!(result.page.matches("# Title").count(), 1);
        assert!(result.page.contains("\n# Title\n\nBody\n"));
        assert!(result.page.starts_with("---\nSource: https://x.test/docs\n"));
    }

    #[test]
    fn test_markdown_result_derives_missing_title() {
        let fetched = Utc::now();
        let result =
            markdown_scrape_result("Just text.", &url("https://x.test/user-guide"), fetched);
        assert_eq!(result.title, "user guide");
        assert!(result.page.contains("# user guide\n\nJust text.\n"));
    }

    #[test]
    fn test_extract_inline_and_reference_links() {
        let md = "\
See [guide](/docs/guide) and [api][1].

[1]: https://x.test/docs/api
";
        let links = extract_links(md, &url("https://x.test/docs/"), &scope("https://x.test/docs/"));
        let strs: Vec<&str> = links.iter().map(Url::as_str).collect();
        assert_eq!(strs, ["https://x.test/docs/guide", "https://x.test/docs/api"]);
    }

    #[test]
    fn test_extract_autolink_and_bare() {
        let md = "Auto <https://x.test/docs/a> then bare https://x.test/docs/b here.";
        let links = extract_links(md, &url("https://x.test/docs/"), &scope("https://x.test/docs/"));
        let strs: Vec<&str> = links.iter().map(Url::as_str).collect();
        assert_eq!(strs, ["https://x.test/docs/a", "https://x.test/docs/b"]);
    }

    #[test]
    fn test_extract_jsx_href_attribute() {
        let md = r#"<Card href="/docs/cards" /> <a href='/docs/quotes'>q</a> <Link href={"/docs/jsx"}>"#;
        let links = extract_links(md, &url("https://x.test/docs/"), &scope("https://x.test/docs/"));
        let strs: Vec<&str> = links.iter().map(Url::as_str).collect();
        assert_eq!(
            strs,
            [
                "https://x.test/docs/cards",
                "https://x.test/docs/quotes",
                "https://x.test/docs/jsx"
            ]
        );
    }

    #[test]
    fn test_extract_skips_code_fences() {
        let md = "```\nhttps://x.test/docs/hidden\n```\nhttps://x.test/docs/visible\n";
        let links = extract_links(md, &url("https://x.test/docs/"), &scope("https://x.test/docs/"));
        let strs: Vec<&str> = links.iter().map(Url::as_str).collect();
        assert_eq!(strs, ["https://x.test/docs/visible"]);
    }

    #[test]
    fn test_extract_filters_scope_and_candidacy() {
        let md = "\
[out](https://other.test/docs/x)
[css](/docs/style.css)
[blog](/blog/post)
[ok](/docs/fine)
";
        let links = extract_links(md, &url("https://x.test/docs/"), &scope("https://x.test/docs/"));
        let strs: Vec<&str> = links.iter().map(Url::as_str).collect();
        // Cross-origin and blocked extensions drop; the root-absolute /blog
        // link is repaired onto the scope prefix.
        assert_eq!(
            strs,
            ["https://x.test/docs/blog/post", "https://x.test/docs/fine"]
        );
    }

    #[test]
    fn test_extract_strips_hash_and_query_and_dedups() {
        let md = "[a](/docs/a?v=1) [a2](/docs/a#sec) [a3](/docs/a)";
        let links = extract_links(md, &url("https://x.test/docs/"), &scope("https://x.test/docs/"));
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].as_str(), "https://x.test/docs/a");
    }

    #[test]
    fn test_scope_repair_for_root_absolute() {
        let md = "[guide](/guide)";
        let links = extract_links(md, &url("https://x.test/docs/"), &scope("https://x.test/docs/"));
        let strs: Vec<&str> = links.iter().map(Url::as_str).collect();
        assert_eq!(strs, ["https://x.test/docs/guide"]);
    }
}
