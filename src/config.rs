use std::path::PathBuf;

use crate::models::WorkerKind;

/// Process-wide tuning constants.
pub struct Config;

impl Config {
    pub const MAX_CONTENT_SIZE: usize = 10 * 1024 * 1024;

    /// Floor on worker counts while work remains.
    pub const MIN_WORKERS_PER_KIND: usize = 1;
    pub const MIN_TOTAL_WORKERS: usize = 2;

    /// Autoscaler tick cadence and per-tick lifecycle budgets.
    pub const AUTOSCALE_TICK_MS: u64 = 1_000;
    pub const MAX_SPAWN_PER_TICK: usize = 5;
    pub const MAX_STOP_PER_TICK: usize = 5;

    /// Target time to drain the estimated remaining work.
    pub const AUTOSCALE_TARGET_DRAIN_MS: f64 = 2_000.0;

    pub const EWMA_ALPHA: f64 = 0.3;
    pub const INITIAL_MARKDOWN_ACTIVE_MS: f64 = 200.0;
    pub const INITIAL_HYBRID_ACTIVE_MS: f64 = 600.0;
    pub const INITIAL_MARKDOWN_UNAVAILABLE_RATE: f64 = 0.25;

    /// Idle workers exit after this long without an assignment.
    pub const WORKER_INACTIVITY_MS: u64 = 30_000;

    /// Spacing window for transport-level retries. Companion probes and
    /// page fetches share the per-origin limiter, so retry pacing only has
    /// to spread simultaneous failures, not enforce politeness.
    pub const RETRY_BASE_DELAY_MS: u64 = 250;
    pub const RETRY_MAX_DELAY_MS: u64 = 4_000;

    /// Minimum spacing between progress log lines.
    pub const PROGRESS_INTERVAL_SECS: u64 = 5;

    /// Body-text threshold below which HTML escalates to a rendered fetch.
    pub const SUFFICIENT_CONTENT_CHARS: usize = 200;

    /// Bit width of the shared link-hint filter.
    pub const LINK_FILTER_BITS: usize = 1 << 20;
}

/// Effective options for one crawl or scrape run.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub out_dir: PathBuf,
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub retries: u32,
    pub user_agent: String,
    pub max_depth: u32,
    pub max_pages: usize,
    /// User-requested minimum spacing between same-origin requests.
    pub delay_ms: u64,
    pub respect_robots: bool,
    pub render: bool,
    pub render_cmd: Option<String>,
    pub overwrite_llms: bool,
    pub keep_clutter: bool,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("docs"),
            concurrency: 8,
            timeout_ms: 30_000,
            retries: 2,
            user_agent: format!("mdmirror/{}", env!("CARGO_PKG_VERSION")),
            max_depth: 3,
            max_pages: 500,
            delay_ms: 0,
            respect_robots: true,
            render: true,
            render_cmd: None,
            overwrite_llms: false,
            keep_clutter: false,
        }
    }
}

impl CrawlOptions {
    /// Hard ceiling on pool size; the autoscaler never exceeds it.
    pub fn max_total_workers(&self) -> usize {
        self.concurrency.max(Config::MIN_TOTAL_WORKERS)
    }

    /// Initial pool composition: the per-kind minimum of each.
    pub fn initial_workers(&self) -> [(WorkerKind, usize); 2] {
        [
            (WorkerKind::Markdown, Config::MIN_WORKERS_PER_KIND),
            (WorkerKind::Hybrid, Config::MIN_WORKERS_PER_KIND),
        ]
    }
}
