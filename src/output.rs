//! Deterministic URL → filesystem mapping for mirrored pages.

use std::path::{Component, Path, PathBuf};

use url::Url;

/// On-disk locations for the Markdown variants of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub dir: PathBuf,
    pub page_path: PathBuf,
    pub clutter_path: PathBuf,
    pub llms_path: PathBuf,
    pub llms_full_path: PathBuf,
}

/// Collapse runs of non-alphanumerics to `_`, trim, and lowercase.
fn sanitize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Map a URL to its output directory and fixed per-variant filenames.
///
/// Two URLs with the same normalized form always map to the same paths:
/// query and hash never participate.
pub fn build_output_paths(url: &Url, out_dir: &Path) -> OutputPaths {
    let mut host = sanitize_segment(url.host_str().unwrap_or_default());
    if host.is_empty() {
        host = "index".to_string();
    }

    let mut dir = out_dir.join(host);
    let mut had_segment = false;
    if let Some(segments) = url.path_segments() {
        for segment in segments {
            let cleaned = sanitize_segment(segment);
            if cleaned.is_empty() {
                continue;
            }
            had_segment = true;
            dir.push(cleaned);
        }
    }
    if !had_segment {
        dir.push("root");
    }

    OutputPaths {
        page_path: dir.join("page.md"),
        clutter_path: dir.join("clutter.md"),
        llms_path: dir.join(".llms.md"),
        llms_full_path: dir.join("llms-full.md"),
        dir,
    }
}

/// POSIX-style relative path from `from_dir` to `to_file`.
///
/// Both paths are expected to live under the same output root; components
/// are compared textually, so callers must not mix absolute and relative
/// inputs.
pub fn relative_path(from_dir: &Path, to_file: &Path) -> String {
    let from: Vec<&str> = from_dir
        .components()
        .filter_map(component_str)
        .collect();
    let to: Vec<&str> = to_file.components().filter_map(component_str).collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = Vec::new();
    for _ in common..from.len() {
        parts.push("..");
    }
    parts.extend(&to[common..]);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

fn component_str(component: Component<'_>) -> Option<&str> {
    match component {
        Component::Normal(os) => os.to_str(),
        _ => None,
    }
}
