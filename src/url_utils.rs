//! URL helper functions used throughout the crawler

use url::Url;

/// Extensions that never yield an HTML page worth mirroring.
const BLOCKED_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico", ".bmp", ".avif", ".woff", ".woff2",
    ".ttf", ".otf", ".eot", ".css", ".js", ".mjs", ".map", ".pdf", ".zip", ".gz", ".tgz", ".tar",
    ".bz2", ".7z", ".rar", ".mp3", ".mp4", ".avi", ".mov", ".wav", ".exe", ".dmg", ".msi", ".iso",
    ".wasm", ".bin",
];

/// Canonical queue key for a URL: hash and query stripped, scheme preserved.
pub fn normalize_for_queue(url: &Url) -> String {
    let mut u = url.clone();
    u.set_fragment(None);
    u.set_query(None);
    u.to_string()
}

/// Origin key used by the rate limiter and robots cache.
pub fn origin_key(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Check whether a pathname falls inside the crawl scope prefix.
///
/// Scope `/` matches everything; otherwise the path must equal the scope,
/// equal it with a trailing slash, or extend it past a slash boundary.
pub fn is_path_in_scope(pathname: &str, scope: &str) -> bool {
    let scope = scope.trim_end_matches('/');
    if scope.is_empty() {
        return true;
    }
    pathname == scope
        || pathname == format!("{scope}/")
        || pathname.starts_with(&format!("{scope}/"))
}

/// Determine whether a URL can plausibly serve an HTML page.
pub fn is_html_candidate(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    !BLOCKED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Only HTTP(S) targets are ever traversed.
pub fn is_http_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Companion fetches never touch style or script assets.
pub fn is_refused_asset(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.ends_with(".css") || path.ends_with(".js")
}

/// Derive the companion Markdown URL for a page.
///
/// Roots map to `/llms.txt`; paths already ending in `.md`/`.txt` pass
/// through; everything else gets `.md` appended after dropping a trailing
/// slash.
pub fn companion_markdown_url(url: &Url) -> Url {
    let mut candidate = url.clone();
    candidate.set_fragment(None);

    let path = candidate.path().to_string();
    if path.is_empty() || path == "/" {
        candidate.set_path("/llms.txt");
        return candidate;
    }
    if path.ends_with(".md") || path.ends_with(".txt") {
        return candidate;
    }
    if let Some(stripped) = path.strip_suffix('/') {
        if stripped.is_empty() {
            candidate.set_path("/llms.txt");
        } else if stripped.ends_with(".md") {
            candidate.set_path(stripped);
        } else {
            candidate.set_path(&format!("{stripped}.md"));
        }
        return candidate;
    }
    candidate.set_path(&format!("{path}.md"));
    candidate
}

/// Build the robots.txt URL for the given page URL.
pub fn robots_url(url: &Url) -> Option<Url> {
    let host = url.host_str()?;
    let port = url
        .port()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    Url::parse(&format!("{}://{}{}/robots.txt", url.scheme(), host, port)).ok()
}

/// Normalize CLI input by adding https:// when no scheme is provided.
pub fn normalize_cli_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }
    format!("https://{trimmed}")
}
