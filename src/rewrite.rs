//! Link rewriting: known in-scope targets become relative on-disk paths,
//! everything that stays external gets a visible marker.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use url::Url;

use crate::dedup::LinkFilter;
use crate::models::ScrapeResult;
use crate::output;
use crate::url_utils;

/// Marker appended once to the display text of external links.
pub const EXTERNAL_MARKER: char = '↗';

/// Everything needed to decide and compute one page's rewrites.
pub struct RewriteContext<'a> {
    pub page_url: &'a Url,
    /// Directory holding this page's `page.md`.
    pub page_dir: &'a Path,
    pub out_dir: &'a Path,
    /// Normalized URLs discovered on this page; they will be mirrored soon,
    /// so links to them may rewrite before the files exist.
    pub hints: &'a HashSet<String>,
    /// Shared cross-worker membership hint.
    pub filter: Option<&'a LinkFilter>,
}

fn inline_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\[([^\]]*)\]\(\s*<?([^)\s>]+)>?(\s+"[^"]*")?\s*\)"#).unwrap()
    })
}

fn ref_def_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\s{0,3}\[[^\]]+\]:\s*)(\S+)(.*)$").unwrap())
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

fn source_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Source:\s*(.+?)\s*$").unwrap())
}

impl<'a> RewriteContext<'a> {
    /// Relative on-disk path for `href`, when its target is known.
    ///
    /// Known means: hinted by this job, present in the shared filter, or its
    /// `page.md` already exists on disk. The fragment survives the rewrite.
    fn rewrite_target(&self, href: &str) -> Option<String> {
        let (base_href, fragment) = split_fragment(href);
        if base_href.is_empty() {
            return None;
        }
        let resolved = self.page_url.join(base_href).ok()?;
        if !url_utils::is_http_scheme(&resolved) {
            return None;
        }
        let normalized = url_utils::normalize_for_queue(&resolved);
        let paths = output::build_output_paths(&resolved, self.out_dir);

        let known = self.hints.contains(&normalized)
            || self.filter.map_or(false, |f| f.contains(&normalized))
            || paths.page_path.exists();
        if !known {
            return None;
        }

        let mut rel = output::relative_path(self.page_dir, &paths.page_path);
        if let Some(frag) = fragment {
            rel.push('#');
            rel.push_str(frag);
        }
        Some(rel)
    }

    /// True when a non-rewritten href points outside this page's origin.
    fn is_external(&self, href: &str) -> bool {
        match Url::parse(href) {
            Ok(u) => {
                url_utils::is_http_scheme(&u)
                    && u.origin().ascii_serialization()
                        != self.page_url.origin().ascii_serialization()
            }
            // Relative links resolve inside the origin.
            Err(_) => false,
        }
    }
}

/// Rewrite every Markdown variant of a scrape result in place.
pub fn rewrite_links_in_result(result: &mut ScrapeResult, ctx: &RewriteContext<'_>) {
    let mut rewritten = Vec::new();
    for variant in result.variants_mut() {
        rewritten.push(rewrite_markdown(variant, ctx));
    }
    for (variant, text) in result.variants_mut().into_iter().zip(rewritten) {
        *variant = text;
    }
}

/// Rewrite one Markdown document.
pub fn rewrite_markdown(text: &str, ctx: &RewriteContext<'_>) -> String {
    let mut out = Vec::with_capacity(text.lines().count());
    let mut in_fence = false;
    let mut frontmatter = FrontmatterScan::new(text);

    for line in text.lines() {
        if frontmatter.consume(line) {
            out.push(normalize_source_line(line));
            continue;
        }

        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            out.push(line.to_string());
            continue;
        }
        if in_fence {
            out.push(line.to_string());
            continue;
        }

        if let Some(caps) = ref_def_re().captures(line) {
            let target = &caps[2];
            let rewritten = match ctx.rewrite_target(target) {
                Some(rel) => format!("{}{}{}", &caps[1], rel, &caps[3]),
                None => line.to_string(),
            };
            out.push(rewritten);
            continue;
        }

        let mut processed = rewrite_inline_links(line, ctx);
        processed = rewrite_href_attrs(&processed, ctx);
        processed = linkify_bare_urls(&processed, ctx);
        out.push(processed);
    }

    let mut joined = out.join("\n");
    if text.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

/// Tracks whether the current line sits inside a leading `---` frontmatter
/// block.
struct FrontmatterScan {
    active: bool,
    seen_open: bool,
}

impl FrontmatterScan {
    fn new(text: &str) -> Self {
        Self {
            active: text.starts_with("---"),
            seen_open: false,
        }
    }

    /// Returns true while the line belongs to the frontmatter block.
    fn consume(&mut self, line: &str) -> bool {
        if !self.active {
            return false;
        }
        if line.trim_end() == "---" {
            if self.seen_open {
                self.active = false;
            } else {
                self.seen_open = true;
            }
            return true;
        }
        self.seen_open
    }
}

/// Keep the frontmatter `Source:` value a plain URL even when the incoming
/// text decorated it as a link or marked it external.
fn normalize_source_line(line: &str) -> String {
    let caps = match source_line_re().captures(line) {
        Some(c) => c,
        None => return line.to_string(),
    };
    let mut value = caps[1].trim().to_string();
    if let Some(stripped) = value.strip_suffix(EXTERNAL_MARKER) {
        value = stripped.trim_end().to_string();
    }
    if let Some(inner) = inline_link_re()
        .captures(&value)
        .and_then(|c| c.get(2).map(|m| m.as_str().to_string()))
    {
        value = inner;
    } else if value.starts_with('<') && value.ends_with('>') {
        value = value[1..value.len() - 1].to_string();
    }
    format!("Source: {value}")
}

fn rewrite_inline_links(line: &str, ctx: &RewriteContext<'_>) -> String {
    inline_link_re()
        .replace_all(line, |caps: &Captures<'_>| {
            let text = &caps[1];
            let href = &caps[2];
            let title = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            match ctx.rewrite_target(href) {
                Some(rel) => format!("[{}]({}{})", strip_marker(text), rel, title),
                None => {
                    let text = if ctx.is_external(href) {
                        add_marker(text)
                    } else {
                        text.to_string()
                    };
                    format!("[{text}]({href}{title})")
                }
            }
        })
        .into_owned()
}

fn rewrite_href_attrs(line: &str, ctx: &RewriteContext<'_>) -> String {
    href_attr_re()
        .replace_all(line, |caps: &Captures<'_>| {
            let (href, shape) = if let Some(m) = caps.get(1) {
                (m.as_str(), AttrShape::Double)
            } else if let Some(m) = caps.get(2) {
                (m.as_str(), AttrShape::Single)
            } else {
                (caps.get(3).map(|m| m.as_str()).unwrap_or(""), AttrShape::Jsx)
            };
            let value = ctx.rewrite_target(href).unwrap_or_else(|| href.to_string());
            match shape {
                AttrShape::Double => format!("href=\"{value}\""),
                AttrShape::Single => format!("href='{value}'"),
                AttrShape::Jsx => format!("href={{\"{value}\"}}"),
            }
        })
        .into_owned()
}

enum AttrShape {
    Double,
    Single,
    Jsx,
}

/// Turn bare URLs into links, but only when they rewrite to a mirrored
/// page. Positions already inside link syntax or tags are left alone.
fn linkify_bare_urls(line: &str, ctx: &RewriteContext<'_>) -> String {
    let mut replacements: Vec<(usize, usize, String)> = Vec::new();
    for m in bare_url_re().find_iter(line) {
        let before = &line[..m.start()];
        if before.ends_with('<')
            || before.ends_with('(')
            || before.ends_with('"')
            || before.ends_with('\'')
            || before.ends_with('=')
            || before.ends_with("](")
        {
            continue;
        }
        if let Some(rel) = ctx.rewrite_target(m.as_str()) {
            replacements.push((m.start(), m.end(), format!("[{}]({})", m.as_str(), rel)));
        }
    }
    let mut out = line.to_string();
    for (start, end, replacement) in replacements.into_iter().rev() {
        out.replace_range(start..end, &replacement);
    }
    out
}

fn split_fragment(href: &str) -> (&str, Option<&str>) {
    match href.split_once('#') {
        Some((base, frag)) => (base, Some(frag)),
        None => (href, None),
    }
}

fn add_marker(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.ends_with(EXTERNAL_MARKER) {
        return text.to_string();
    }
    if trimmed.is_empty() {
        return text.to_string();
    }
    format!("{trimmed} {EXTERNAL_MARKER}")
}

fn strip_marker(text: &str) -> String {
    let trimmed = text.trim_end();
    match trimmed.strip_suffix(EXTERNAL_MARKER) {
        Some(rest) => rest.trim_end().to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct Fixture {
        page_url: Url,
        page_dir: PathBuf,
        out_dir: PathBuf,
        hints: HashSet<String>,
    }

    impl Fixture {
        fn new(page: &str, hints: &[&str]) -> Self {
            let page_url = Url::parse(page).unwrap();
            let out_dir = PathBuf::from("out");
            let page_dir = output::build_output_paths(&page_url, &out_dir).dir;
            Self {
                page_url,
                page_dir,
                out_dir,
                hints: hints.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn ctx(&self) -> RewriteContext<'_> {
            RewriteContext {
                page_url: &self.page_url,
                page_dir: &self.page_dir,
                out_dir: &self.out_dir,
                hints: &self.hints,
                filter: None,
            }
        }
    }

    #[test]
    fn test_known_link_becomes_relative() {
        let fx = Fixture::new("https://s.test/a/", &["https://s.test/b/"]);
        let md = "See [B](https://s.test/b/) for details.\n";
        assert_eq!(
            rewrite_markdown(md, &fx.ctx()),
            "See [B](../b/page.md) for details.\n"
        );
    }

    #[test]
    fn test_rewrite_preserves_fragment() {
        let fx = Fixture::new("https://s.test/a/", &["https://s.test/b/"]);
        let md = "See [B](https://s.test/b/#install).";
        assert_eq!(
            rewrite_markdown(md, &fx.ctx()),
            "See [B](../b/page.md#install)."
        );
    }

    #[test]
    fn test_external_link_gets_marker_once() {
        let fx = Fixture::new("https://s.test/a/", &[]);
        let md = "See [other](https://ext.test/x).";
        let once = rewrite_markdown(md, &fx.ctx());
        assert_eq!(once, "See [other ↗](https://ext.test/x).");
        let twice = rewrite_markdown(&once, &fx.ctx());
        assert_eq!(twice, once);
    }

    #[test]
    fn test_rewritten_link_loses_marker() {
        let fx = Fixture::new("https://s.test/a/", &["https://s.test/b/"]);
        let md = "See [B ↗](https://s.test/b/).";
        assert_eq!(rewrite_markdown(md, &fx.ctx()), "See [B](../b/page.md).");
    }

    #[test]
    fn test_unknown_same_origin_link_untouched() {
        let fx = Fixture::new("https://s.test/a/", &[]);
        let md = "See [C](/c/page).";
        assert_eq!(rewrite_markdown(md, &fx.ctx()), md);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let fx = Fixture::new("https://s.test/a/", &["https://s.test/b/"]);
        let md = "Start [B](https://s.test/b/) and [ext](https://ext.test/) done.\n";
        let once = rewrite_markdown(md, &fx.ctx());
        let twice = rewrite_markdown(&once, &fx.ctx());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_reference_definition_rewritten() {
        let fx = Fixture::new("https://s.test/a/", &["https://s.test/b/"]);
        let md = "[b]: https://s.test/b/\n";
        assert_eq!(rewrite_markdown(md, &fx.ctx()), "[b]: ../b/page.md\n");
    }

    #[test]
    fn test_href_attributes_rewritten() {
        let fx = Fixture::new("https://s.test/a/", &["https://s.test/b/"]);
        let md = r#"<Card href="https://s.test/b/" /> <Link href={"https://s.test/b/"}>"#;
        let result = rewrite_markdown(md, &fx.ctx());
        assert_eq!(
            result,
            r#"<Card href="../b/page.md" /> <Link href={"../b/page.md"}>"#
        );
    }

    #[test]
    fn test_bare_url_linkified_only_when_known() {
        let fx = Fixture::new("https://s.test/a/", &["https://s.test/b/"]);
        let md = "Visit https://s.test/b/ and https://ext.test/nope now.";
        assert_eq!(
            rewrite_markdown(md, &fx.ctx()),
            "Visit [https://s.test/b/](../b/page.md) and https://ext.test/nope now."
        );
    }

    #[test]
    fn test_bare_urls_in_fences_untouched() {
        let fx = Fixture::new("https://s.test/a/", &["https://s.test/b/"]);
        let md = "```\nhttps://s.test/b/\n```\n";
        assert_eq!(rewrite_markdown(md, &fx.ctx()), md);
    }

    #[test]
    fn test_source_line_normalized() {
        let fx = Fixture::new("https://s.test/a/", &[]);
        let md = "---\nSource: [site](https://s.test/a/) ↗\nFetched: 2026-01-01T00:00:00Z\n---\n\n# T\n";
        let result = rewrite_markdown(md, &fx.ctx());
        assert!(result.contains("\nSource: https://s.test/a/\n"));
    }

    #[test]
    fn test_source_line_angle_form_normalized() {
        let fx = Fixture::new("https://s.test/a/", &[]);
        let md = "---\nSource: <https://s.test/a/>\nFetched: x\n---\n";
        let result = rewrite_markdown(md, &fx.ctx());
        assert!(result.contains("\nSource: https://s.test/a/\n"));
    }

    #[test]
    fn test_disk_presence_rewrites_without_hint() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out_dir = tmp.path().to_path_buf();
        let page_url = Url::parse("https://s.test/a/").unwrap();
        let target_url = Url::parse("https://s.test/c/").unwrap();
        let target_paths = output::build_output_paths(&target_url, &out_dir);
        std::fs::create_dir_all(&target_paths.dir).unwrap();
        std::fs::write(&target_paths.page_path, "# C\n").unwrap();

        let page_dir = output::build_output_paths(&page_url, &out_dir).dir;
        let hints = HashSet::new();
        let ctx = RewriteContext {
            page_url: &page_url,
            page_dir: &page_dir,
            out_dir: &out_dir,
            hints: &hints,
            filter: None,
        };
        assert_eq!(
            rewrite_markdown("[C](https://s.test/c/)", &ctx),
            "[C](../c/page.md)"
        );
    }
}
