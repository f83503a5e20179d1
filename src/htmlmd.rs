//! HTML to CommonMark conversion.
//!
//! The engine is constructed once and shared process-wide; its rule set is
//! fixed after init. Conversion walks the parsed DOM, so callers hand in an
//! `ElementRef` rooted wherever they decided the content starts, plus an
//! optional set of nodes to leave out (used to drop page clutter).

use std::collections::HashSet;
use std::sync::OnceLock;

use ego_tree::NodeId;
use scraper::{ElementRef, Node};

/// Shared converter instance.
pub fn engine() -> &'static MarkdownEngine {
    static ENGINE: OnceLock<MarkdownEngine> = OnceLock::new();
    ENGINE.get_or_init(MarkdownEngine::new)
}

pub struct MarkdownEngine {
    skip: HashSet<&'static str>,
    block: HashSet<&'static str>,
}

impl MarkdownEngine {
    fn new() -> Self {
        let skip = ["script", "style", "noscript", "template", "head", "meta", "link", "title"]
            .into_iter()
            .collect();
        let block = [
            "address", "article", "aside", "blockquote", "body", "dd", "details", "div", "dl",
            "dt", "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4",
            "h5", "h6", "header", "hr", "html", "li", "main", "nav", "ol", "p", "pre", "section",
            "summary", "table", "ul",
        ]
        .into_iter()
        .collect();
        Self { skip, block }
    }

    /// Convert the subtree rooted at `root` to Markdown.
    pub fn convert(&self, root: ElementRef) -> String {
        self.convert_excluding(root, &HashSet::new())
    }

    /// Convert while leaving out the given DOM nodes entirely.
    pub fn convert_excluding(&self, root: ElementRef, excluded: &HashSet<NodeId>) -> String {
        let mut out = String::new();
        self.render_blocks(root, &mut out, excluded);
        tidy(&out)
    }

    fn is_block(&self, tag: &str) -> bool {
        self.block.contains(tag)
    }

    /// Render the children of a container element, grouping consecutive
    /// inline content into paragraphs.
    fn render_blocks(&self, el: ElementRef, out: &mut String, excluded: &HashSet<NodeId>) {
        let mut inline_run = String::new();
        for child in el.children() {
            if excluded.contains(&child.id()) {
                continue;
            }
            match child.value() {
                Node::Text(text) => {
                    inline_run.push_str(&collapse_ws(&text.text));
                }
                Node::Element(element) => {
                    let tag = element.name();
                    if self.skip.contains(tag) {
                        continue;
                    }
                    let child_el = match ElementRef::wrap(child) {
                        Some(e) => e,
                        None => continue,
                    };
                    if self.is_block(tag) {
                        flush_paragraph(&mut inline_run, out);
                        self.render_block_element(child_el, tag, out, excluded);
                    } else if tag == "a" && self.contains_heading(child_el, excluded) {
                        // An anchor wrapping a heading promotes to the
                        // topmost heading level.
                        flush_paragraph(&mut inline_run, out);
                        self.render_anchor_heading(child_el, out, excluded);
                    } else {
                        self.render_inline(child_el, &mut inline_run, excluded);
                    }
                }
                _ => {}
            }
        }
        flush_paragraph(&mut inline_run, out);
    }

    fn render_block_element(
        &self,
        el: ElementRef,
        tag: &str,
        out: &mut String,
        excluded: &HashSet<NodeId>,
    ) {
        match tag {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = tag[1..].parse::<usize>().unwrap_or(1);
                let text = collapse_ws(&self.inline_text(el, excluded)).trim().to_string();
                if !text.is_empty() {
                    out.push_str(&"#".repeat(level));
                    out.push(' ');
                    out.push_str(&text);
                    out.push_str("\n\n");
                }
            }
            "p" | "dt" | "dd" | "figcaption" | "summary" | "address" => {
                let mut run = String::new();
                self.render_inline_children(el, &mut run, excluded);
                flush_paragraph(&mut run, out);
            }
            "ul" => self.render_list(el, out, false, excluded),
            "ol" => self.render_list(el, out, true, excluded),
            "pre" => self.render_code_block(el, out),
            "blockquote" => {
                let mut inner = String::new();
                self.render_blocks(el, &mut inner, excluded);
                for line in tidy(&inner).lines() {
                    if line.is_empty() {
                        out.push_str(">\n");
                    } else {
                        out.push_str("> ");
                        out.push_str(line);
                        out.push('\n');
                    }
                }
                out.push('\n');
            }
            "table" => self.render_table(el, out, excluded),
            "hr" => out.push_str("---\n\n"),
            _ => self.render_blocks(el, out, excluded),
        }
    }

    /// Inline rendering with Markdown marks. Appends to `run`.
    fn render_inline(&self, el: ElementRef, run: &mut String, excluded: &HashSet<NodeId>) {
        let tag = el.value().name();
        match tag {
            "a" => {
                let mut inner = String::new();
                self.render_inline_children(el, &mut inner, excluded);
                // Anchor text collapses whitespace.
                let text = collapse_ws(&inner).trim().to_string();
                match el.value().attr("href") {
                    Some(href) if !text.is_empty() => {
                        run.push('[');
                        run.push_str(&text);
                        run.push_str("](");
                        run.push_str(href);
                        run.push(')');
                    }
                    _ => run.push_str(&text),
                }
            }
            "strong" | "b" => self.render_marked(el, run, "**", excluded),
            "em" | "i" => self.render_marked(el, run, "*", excluded),
            "del" | "s" | "strike" => self.render_marked(el, run, "~~", excluded),
            "code" | "kbd" | "samp" => {
                let text = self.inline_text(el, excluded);
                let text = text.trim();
                if !text.is_empty() {
                    run.push('`');
                    run.push_str(text);
                    run.push('`');
                }
            }
            "br" => run.push_str("  \n"),
            "img" => {
                let alt = el.value().attr("alt").unwrap_or("");
                if let Some(src) = el.value().attr("src") {
                    run.push_str("![");
                    run.push_str(alt);
                    run.push_str("](");
                    run.push_str(src);
                    run.push(')');
                }
            }
            _ => self.render_inline_children(el, run, excluded),
        }
    }

    fn contains_heading(&self, el: ElementRef, excluded: &HashSet<NodeId>) -> bool {
        for child in el.children() {
            if excluded.contains(&child.id()) {
                continue;
            }
            if let Some(child_el) = ElementRef::wrap(child) {
                let tag = child_el.value().name();
                if matches!(tag, "h1" | "h2" | "h3" | "h4" | "h5" | "h6") {
                    return true;
                }
                if self.contains_heading(child_el, excluded) {
                    return true;
                }
            }
        }
        false
    }

    /// Emit a heading-wrapping anchor as a level-1 heading block.
    fn render_anchor_heading(&self, el: ElementRef, out: &mut String, excluded: &HashSet<NodeId>) {
        let text = collapse_ws(&self.inline_text(el, excluded)).trim().to_string();
        if text.is_empty() {
            return;
        }
        out.push_str("# ");
        match el.value().attr("href") {
            Some(href) => {
                out.push('[');
                out.push_str(&text);
                out.push_str("](");
                out.push_str(href);
                out.push(')');
            }
            None => out.push_str(&text),
        }
        out.push_str("\n\n");
    }

    fn render_marked(
        &self,
        el: ElementRef,
        run: &mut String,
        mark: &str,
        excluded: &HashSet<NodeId>,
    ) {
        let mut inner = String::new();
        self.render_inline_children(el, &mut inner, excluded);
        let text = collapse_ws(&inner);
        let text = text.trim();
        if !text.is_empty() {
            run.push_str(mark);
            run.push_str(text);
            run.push_str(mark);
        }
    }

    fn render_inline_children(&self, el: ElementRef, run: &mut String, excluded: &HashSet<NodeId>) {
        for child in el.children() {
            if excluded.contains(&child.id()) {
                continue;
            }
            match child.value() {
                Node::Text(text) => run.push_str(&collapse_ws(&text.text)),
                Node::Element(element) => {
                    if self.skip.contains(element.name()) {
                        continue;
                    }
                    if let Some(child_el) = ElementRef::wrap(child) {
                        self.render_inline(child_el, run, excluded);
                    }
                }
                _ => {}
            }
        }
    }

    /// Plain text of a subtree, marks dropped, skip-tags excluded.
    fn inline_text(&self, el: ElementRef, excluded: &HashSet<NodeId>) -> String {
        let mut out = String::new();
        self.collect_text(el, &mut out, excluded);
        out
    }

    fn collect_text(&self, el: ElementRef, out: &mut String, excluded: &HashSet<NodeId>) {
        for child in el.children() {
            if excluded.contains(&child.id()) {
                continue;
            }
            match child.value() {
                Node::Text(text) => out.push_str(&text.text),
                Node::Element(element) => {
                    if self.skip.contains(element.name()) {
                        continue;
                    }
                    if let Some(child_el) = ElementRef::wrap(child) {
                        self.collect_text(child_el, out, excluded);
                    }
                }
                _ => {}
            }
        }
    }

    fn render_list(
        &self,
        el: ElementRef,
        out: &mut String,
        ordered: bool,
        excluded: &HashSet<NodeId>,
    ) {
        let mut index = 0usize;
        for child in el.children() {
            if excluded.contains(&child.id()) {
                continue;
            }
            let child_el = match ElementRef::wrap(child) {
                Some(e) => e,
                None => continue,
            };
            if child_el.value().name() != "li" {
                continue;
            }
            index += 1;
            let marker = if ordered {
                format!("{index}. ")
            } else {
                "- ".to_string()
            };

            let mut item = String::new();
            self.render_blocks(child_el, &mut item, excluded);
            let item = tidy(&item);
            let mut lines = item.lines();
            match lines.next() {
                Some(first) => {
                    out.push_str(&marker);
                    out.push_str(first);
                    out.push('\n');
                }
                None => continue,
            }
            let indent = " ".repeat(marker.len());
            for line in lines {
                if line.is_empty() {
                    out.push('\n');
                } else {
                    out.push_str(&indent);
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        out.push('\n');
    }

    fn render_code_block(&self, el: ElementRef, out: &mut String) {
        // Language comes from a nested <code class="language-*">.
        let mut language = String::new();
        for child in el.children() {
            if let Some(child_el) = ElementRef::wrap(child) {
                if child_el.value().name() == "code" {
                    if let Some(class) = child_el.value().attr("class") {
                        language = class
                            .split_whitespace()
                            .find_map(|c| {
                                c.strip_prefix("language-").or_else(|| c.strip_prefix("lang-"))
                            })
                            .unwrap_or("")
                            .to_string();
                    }
                }
            }
        }
        let code = raw_text(el);
        let code = code.trim_matches('\n');
        out.push_str("```");
        out.push_str(&language);
        out.push('\n');
        out.push_str(code);
        out.push_str("\n```\n\n");
    }

    fn render_table(&self, el: ElementRef, out: &mut String, excluded: &HashSet<NodeId>) {
        let mut header: Option<Vec<String>> = None;
        let mut rows: Vec<Vec<String>> = Vec::new();
        self.collect_rows(el, &mut header, &mut rows, excluded);

        let columns = header
            .as_ref()
            .map(|h| h.len())
            .or_else(|| rows.first().map(|r| r.len()))
            .unwrap_or(0);
        if columns == 0 {
            return;
        }

        // Tables need a header row; fabricate an empty one when the source
        // table has none.
        let header = header.unwrap_or_else(|| vec![String::new(); columns]);

        push_row(out, &header, columns);
        let separator: Vec<String> = vec!["---".to_string(); columns];
        push_row(out, &separator, columns);
        for row in rows {
            push_row(out, &row, columns);
        }
        out.push('\n');
    }

    fn collect_rows(
        &self,
        el: ElementRef,
        header: &mut Option<Vec<String>>,
        rows: &mut Vec<Vec<String>>,
        excluded: &HashSet<NodeId>,
    ) {
        for child in el.children() {
            if excluded.contains(&child.id()) {
                continue;
            }
            let child_el = match ElementRef::wrap(child) {
                Some(e) => e,
                None => continue,
            };
            match child_el.value().name() {
                "thead" | "tbody" | "tfoot" => self.collect_rows(child_el, header, rows, excluded),
                "tr" => {
                    let mut cells = Vec::new();
                    let mut all_th = true;
                    for cell in child_el.children() {
                        let cell_el = match ElementRef::wrap(cell) {
                            Some(e) => e,
                            None => continue,
                        };
                        match cell_el.value().name() {
                            "th" => cells.push(self.cell_text(cell_el, excluded)),
                            "td" => {
                                all_th = false;
                                cells.push(self.cell_text(cell_el, excluded));
                            }
                            _ => {}
                        }
                    }
                    if cells.is_empty() {
                        continue;
                    }
                    if all_th && header.is_none() && rows.is_empty() {
                        *header = Some(cells);
                    } else {
                        rows.push(cells);
                    }
                }
                _ => {}
            }
        }
    }

    fn cell_text(&self, el: ElementRef, excluded: &HashSet<NodeId>) -> String {
        let mut run = String::new();
        self.render_inline_children(el, &mut run, excluded);
        collapse_ws(&run).trim().replace('|', "\\|")
    }
}

fn push_row(out: &mut String, cells: &[String], columns: usize) {
    out.push('|');
    for i in 0..columns {
        out.push(' ');
        out.push_str(cells.get(i).map(String::as_str).unwrap_or(""));
        out.push_str(" |");
    }
    out.push('\n');
}

fn flush_paragraph(run: &mut String, out: &mut String) {
    let text = run.trim();
    if !text.is_empty() {
        out.push_str(text);
        out.push_str("\n\n");
    }
    run.clear();
}

/// Collapse whitespace runs to single spaces, preserving hard breaks that
/// inline rendering already emitted.
fn collapse_ws(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_ws = false;
    for ch in input.chars() {
        if ch == '\n' && out.ends_with("  ") {
            out.push('\n');
            in_ws = false;
            continue;
        }
        if ch.is_whitespace() {
            if !in_ws {
                out.push(' ');
            }
            in_ws = true;
        } else {
            out.push(ch);
            in_ws = false;
        }
    }
    out
}

/// Verbatim text of a subtree (used for code blocks).
fn raw_text(el: ElementRef) -> String {
    el.text().collect::<String>()
}

/// Collapse runs of blank lines and normalize the trailing newline.
fn tidy(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut blank_run = 0usize;
    for line in input.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(line.trim_end());
            out.push('\n');
        }
    }
    let trimmed = out.trim_matches('\n');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::{Html, Selector};

    fn convert(html: &str) -> String {
        let doc = Html::parse_document(html);
        engine().convert(doc.root_element())
    }

    #[test]
    fn test_headings_and_paragraphs() {
        let md = convert("<h1>Title</h1><p>First.</p><h2>Sub</h2><p>Second.</p>");
        assert_eq!(md, "# Title\n\nFirst.\n\n## Sub\n\nSecond.\n");
    }

    #[test]
    fn test_inline_marks() {
        let md = convert("<p>a <strong>bold</strong> and <em>soft</em> and <del>gone</del></p>");
        assert_eq!(md, "a **bold** and *soft* and ~~gone~~\n");
    }

    #[test]
    fn test_anchor_whitespace_collapses() {
        let md = convert("<p><a href=\"/x\">  spread\n  out  </a></p>");
        assert_eq!(md, "[spread out](/x)\n");
    }

    #[test]
    fn test_anchor_wrapping_heading_promotes_to_top_level() {
        let md = convert("<div><a href=\"/x\"><h3>Deep</h3></a></div>");
        assert_eq!(md, "# [Deep](/x)\n");
    }

    #[test]
    fn test_anchor_wrapping_heading_keeps_surrounding_text() {
        let md = convert("<div>intro <a href=\"/x\"><h2>Section</h2></a><p>after</p></div>");
        assert_eq!(md, "intro\n\n# [Section](/x)\n\nafter\n");
    }

    #[test]
    fn test_code_fence_with_language() {
        let md = convert("<pre><code class=\"language-rust\">fn main() {}\n</code></pre>");
        assert_eq!(md, "```rust\nfn main() {}\n```\n");
    }

    #[test]
    fn test_unordered_list() {
        let md = convert("<ul><li>one</li><li>two</li></ul>");
        assert_eq!(md, "- one\n- two\n");
    }

    #[test]
    fn test_ordered_list_numbering() {
        let md = convert("<ol><li>first</li><li>second</li></ol>");
        assert_eq!(md, "1. first\n2. second\n");
    }

    #[test]
    fn test_table_with_header() {
        let md = convert(
            "<table><tr><th>Name</th><th>Value</th></tr><tr><td>a</td><td>1</td></tr></table>",
        );
        assert_eq!(md, "| Name | Value |\n| --- | --- |\n| a | 1 |\n");
    }

    #[test]
    fn test_table_fabricates_missing_header() {
        let md = convert("<table><tr><td>a</td><td>1</td></tr></table>");
        assert_eq!(md, "|  |  |\n| --- | --- |\n| a | 1 |\n");
    }

    #[test]
    fn test_table_escapes_pipes() {
        let md = convert("<table><tr><td>a|b</td></tr></table>");
        assert!(md.contains("a\\|b"));
    }

    #[test]
    fn test_blockquote() {
        let md = convert("<blockquote><p>quoted</p></blockquote>");
        assert_eq!(md, "> quoted\n");
    }

    #[test]
    fn test_script_and_style_dropped() {
        let md = convert("<p>keep</p><script>var x = 1;</script><style>p{}</style>");
        assert_eq!(md, "keep\n");
    }

    #[test]
    fn test_image() {
        let md = convert("<p><img src=\"/pic.png\" alt=\"a pic\"></p>");
        assert_eq!(md, "![a pic](/pic.png)\n");
    }

    #[test]
    fn test_excluded_nodes_are_dropped() {
        let doc = Html::parse_document("<div><p>keep</p><nav id=\"n\"><p>menu</p></nav></div>");
        let nav_sel = Selector::parse("nav").unwrap();
        let mut excluded = HashSet::new();
        for el in doc.select(&nav_sel) {
            excluded.insert(el.id());
        }
        let md = engine().convert_excluding(doc.root_element(), &excluded);
        assert_eq!(md, "keep\n");
    }
}
