//! Shared data types: jobs, scrape results, worker messages, crawl report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use url::Url;

pub type JobId = u64;
pub type WorkerId = usize;

/// The two worker flavors in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Probes for a companion Markdown document first.
    Markdown,
    /// Fetches HTML, escalating to a rendered fetch when content is thin.
    Hybrid,
}

impl WorkerKind {
    pub fn label(self) -> &'static str {
        match self {
            WorkerKind::Markdown => "markdown",
            WorkerKind::Hybrid => "hybrid",
        }
    }
}

/// Region of a site reachable from a crawl seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlScope {
    /// ASCII origin, e.g. `https://docs.example.com`.
    pub origin: String,
    /// Pathname prefix of the seed (trailing slash preserved).
    pub path_prefix: String,
}

impl CrawlScope {
    pub fn from_seed(url: &Url) -> Self {
        Self {
            origin: url.origin().ascii_serialization(),
            path_prefix: url.path().to_string(),
        }
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.origin == url.origin().ascii_serialization()
            && crate::url_utils::is_path_in_scope(url.path(), &self.path_prefix)
    }
}

/// A unit of crawl work. Owned by the scheduler while queued and by exactly
/// one worker while in flight.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub url: Url,
    pub depth: u32,
    pub can_go_deeper: bool,
    /// Present for crawl mode; absent in scrape (`url`/`urls`) mode, which
    /// never expands the frontier.
    pub scope: Option<CrawlScope>,
    /// Earliest send time, assigned by the scheduler's rate limiter.
    pub wait_until: Instant,
}

/// The Markdown variants produced for one page.
#[derive(Debug, Clone)]
pub struct ScrapeResult {
    pub source_url: Url,
    pub fetched_at: DateTime<Utc>,
    pub title: String,
    /// Main-content Markdown; always written as `page.md`.
    pub page: String,
    /// Stripped boilerplate, kept only when requested.
    pub clutter: Option<String>,
    /// Condensed variant written as `.llms.md`.
    pub llms: String,
    /// Full cleaned document written as `llms-full.md`.
    pub llms_full: String,
}

impl ScrapeResult {
    /// Mutable access to every variant body, for the link rewriter.
    pub fn variants_mut(&mut self) -> Vec<&mut String> {
        let mut out = vec![&mut self.page, &mut self.llms, &mut self.llms_full];
        if let Some(clutter) = self.clutter.as_mut() {
            out.push(clutter);
        }
        out
    }
}

/// Why a worker left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No assignment arrived within the inactivity window.
    Idle,
    /// The scheduler asked it to stop.
    Shutdown,
}

/// Worker → scheduler messages.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The worker is idle and wants a job.
    Ready { worker: WorkerId },
    /// Terminal success; `links` are in-scope discoveries for the frontier.
    Completed {
        worker: WorkerId,
        job_id: JobId,
        links: Vec<Url>,
        active_ms: Option<u64>,
    },
    /// Terminal failure with a human-readable reason.
    Failed {
        worker: WorkerId,
        job_id: JobId,
        url: Url,
        error: String,
        active_ms: Option<u64>,
    },
    /// No companion Markdown; the job should fall back to the hybrid queue.
    MarkdownUnavailable {
        worker: WorkerId,
        job: Box<Job>,
        active_ms: Option<u64>,
    },
    /// Extracted body text was too thin; the worker holds the job suspended
    /// until the scheduler replies with a render command.
    HtmlInsufficient { worker: WorkerId, job_id: JobId },
    /// The worker exited.
    Stopped { worker: WorkerId, reason: StopReason },
}

/// Scheduler → worker messages.
#[derive(Debug)]
pub enum WorkerCommand {
    Assign(Box<Job>),
    /// Re-fetch the suspended job through the headless renderer.
    Render { job_id: JobId },
    Stop,
}

/// One failed job in the final summary.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub url: String,
    pub error: String,
}

/// Summary persisted as `crawl-report.json` and printed on completion.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub start_urls: Vec<String>,
    pub saved: usize,
    pub failed: usize,
    pub blocked_by_robots: usize,
    pub duration_secs: f64,
    pub failures: Vec<FailureRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_from_seed_preserves_trailing_slash() {
        let url = Url::parse("https://docs.example.com/guide/").unwrap();
        let scope = CrawlScope::from_seed(&url);
        assert_eq!(scope.origin, "https://docs.example.com");
        assert_eq!(scope.path_prefix, "/guide/");
    }

    #[test]
    fn test_scope_contains() {
        let scope = CrawlScope::from_seed(&Url::parse("https://x.test/docs").unwrap());
        assert!(scope.contains(&Url::parse("https://x.test/docs/intro").unwrap()));
        assert!(scope.contains(&Url::parse("https://x.test/docs").unwrap()));
        assert!(!scope.contains(&Url::parse("https://x.test/blog").unwrap()));
        assert!(!scope.contains(&Url::parse("https://other.test/docs/intro").unwrap()));
    }

    #[test]
    fn test_variants_mut_includes_clutter_when_present() {
        let mut result = ScrapeResult {
            source_url: Url::parse("https://x.test/a").unwrap(),
            fetched_at: Utc::now(),
            title: "A".into(),
            page: "p".into(),
            clutter: Some("c".into()),
            llms: "l".into(),
            llms_full: "f".into(),
        };
        assert_eq!(result.variants_mut().len(), 4);
        result.clutter = None;
        assert_eq!(result.variants_mut().len(), 3);
    }
}
