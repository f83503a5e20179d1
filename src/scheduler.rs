//! Crawl engine: owns the two-tier frontier, dedup state, robots cache,
//! rate limiter, dispatch policy, autoscaling, and termination.
//!
//! The scheduler is a single task. Workers never touch its state; they talk
//! to it over one shared event channel and receive commands over per-worker
//! channels. The run loop multiplexes worker events, the autoscaler tick,
//! and the shutdown signal.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::autoscaler::{Autoscaler, PoolSnapshot};
use crate::config::{Config, CrawlOptions};
use crate::dedup::{KnownUrls, LinkFilter};
use crate::models::{
    CrawlReport, CrawlScope, FailureRecord, Job, JobId, WorkerCommand, WorkerEvent, WorkerId,
    WorkerKind,
};
use crate::network::{FetchError, HttpClient};
use crate::pool::WorkerPool;
use crate::rate_limit::OriginRateLimiter;
use crate::render::Renderer;
use crate::robots::{RobotsPolicy, RobotsSource};
use crate::url_utils;
use crate::worker::WorkerContext;
use crate::writer;

/// Scheduler-side record of an in-flight job.
#[derive(Debug, Clone)]
struct JobMeta {
    url: Url,
    depth: u32,
    scope: Option<CrawlScope>,
    kind: WorkerKind,
}

pub struct Scheduler {
    options: Arc<CrawlOptions>,
    http: Arc<HttpClient>,
    pool: WorkerPool,
    events: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    filter: Arc<LinkFilter>,

    markdown_queue: VecDeque<Job>,
    hybrid_queue: VecDeque<Job>,
    visited: HashSet<String>,
    known: KnownUrls,
    robots: HashMap<String, Arc<RobotsPolicy>>,
    limiter: OriginRateLimiter,
    autoscaler: Autoscaler,
    in_flight: HashMap<JobId, JobMeta>,

    next_job_id: JobId,
    saved: usize,
    blocked: usize,
    failures: Vec<FailureRecord>,
    start_urls: Vec<String>,
    draining: bool,
    last_progress: std::time::Instant,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(options: CrawlOptions, shutdown: CancellationToken) -> Result<Self, FetchError> {
        let options = Arc::new(options);
        let http = Arc::new(HttpClient::new(&options.user_agent, options.timeout_ms)?);
        let filter = Arc::new(LinkFilter::new(Config::LINK_FILTER_BITS));
        let renderer = Arc::new(Renderer::from_options(
            options.render,
            options.render_cmd.as_deref(),
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = WorkerContext {
            options: Arc::clone(&options),
            http: Arc::clone(&http),
            renderer,
            filter: Arc::clone(&filter),
            events: events_tx,
        };

        Ok(Self {
            options,
            http,
            pool: WorkerPool::new(context),
            events: Some(events_rx),
            filter,
            markdown_queue: VecDeque::new(),
            hybrid_queue: VecDeque::new(),
            visited: HashSet::new(),
            known: KnownUrls::new(),
            robots: HashMap::new(),
            limiter: OriginRateLimiter::new(),
            autoscaler: Autoscaler::new(),
            in_flight: HashMap::new(),
            next_job_id: 0,
            saved: 0,
            blocked: 0,
            failures: Vec::new(),
            start_urls: Vec::new(),
            draining: false,
            last_progress: std::time::Instant::now(),
            shutdown,
        })
    }

    /// Seed a crawl; link discovery stays inside the seed's scope.
    pub fn enqueue_crawl_seed(&mut self, url: Url) {
        self.enqueue_seed(url, true);
    }

    /// Seed a scrape-only target; the frontier never expands from it.
    pub fn enqueue_scrape_seed(&mut self, url: Url) {
        self.enqueue_seed(url, false);
    }

    fn enqueue_seed(&mut self, url: Url, crawl: bool) {
        if !url_utils::is_http_scheme(&url) {
            tracing::warn!(%url, "ignoring non-http(s) seed");
            return;
        }
        let normalized = url_utils::normalize_for_queue(&url);
        if !self.known.insert(&normalized) {
            return;
        }
        self.filter.insert(&normalized);
        self.start_urls.push(url.to_string());

        let scope = if crawl {
            Some(CrawlScope::from_seed(&url))
        } else {
            None
        };
        let job = Job {
            id: self.next_id(),
            url,
            depth: 0,
            can_go_deeper: crawl && self.options.max_depth > 0,
            scope,
            wait_until: Instant::now(),
        };
        self.markdown_queue.push_back(job);
    }

    fn next_id(&mut self) -> JobId {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    /// The crawl is over when the page budget is spent or nothing remains.
    fn is_done(&self) -> bool {
        self.saved >= self.options.max_pages
            || (self.in_flight.is_empty()
                && self.markdown_queue.is_empty()
                && self.hybrid_queue.is_empty())
    }

    /// Drive the crawl to completion and return the report.
    pub async fn run(mut self) -> CrawlReport {
        let started = std::time::Instant::now();
        let mut events = self.events.take().expect("run() called once");

        for (kind, count) in self.options.initial_workers() {
            for _ in 0..count {
                self.pool.spawn(kind);
            }
        }

        let mut tick = interval(Duration::from_millis(Config::AUTOSCALE_TICK_MS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();

        let mut interrupted = false;
        while !self.is_done() {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    interrupted = true;
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = tick.tick() => self.autoscale_tick(),
            }
        }
        if interrupted {
            tracing::info!("interrupt received, finishing in-flight jobs");
        }

        self.drain(&mut events).await;

        let report = self.build_report(started.elapsed());
        self.print_summary(&report);
        if let Err(error) = writer::write_report(&report, &self.options.out_dir) {
            tracing::warn!(%error, "failed to write crawl report");
        }
        report
    }

    /// Stop every worker and absorb their final events.
    async fn drain(&mut self, events: &mut mpsc::UnboundedReceiver<WorkerEvent>) {
        self.draining = true;
        self.pool.stop_all();
        while !self.pool.is_empty() {
            match tokio::time::timeout(Duration::from_secs(60), events.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("timed out waiting for workers to stop");
                    break;
                }
            }
        }
        self.pool.join_all().await;
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready { worker } => {
                if let Some(handle) = self.pool.get_mut(worker) {
                    handle.idle = true;
                    handle.current_job = None;
                }
                if !self.draining {
                    self.assign_next(worker).await;
                }
            }
            WorkerEvent::Completed {
                worker: _,
                job_id,
                links,
                active_ms,
            } => {
                let meta = self.in_flight.remove(&job_id);
                self.saved += 1;
                if let Some(meta) = &meta {
                    self.record_outcome(meta.kind, active_ms, false);
                    tracing::info!("saved {}", meta.url);
                    if !self.draining && !links.is_empty() {
                        self.enqueue_links(&links, meta.depth, meta.scope.as_ref());
                        self.dispatch_idle().await;
                    }
                }
            }
            WorkerEvent::Failed {
                worker: _,
                job_id,
                url,
                error,
                active_ms,
            } => {
                if let Some(meta) = self.in_flight.remove(&job_id) {
                    self.record_outcome(meta.kind, active_ms, false);
                }
                tracing::warn!("failed {url}: {error}");
                self.failures.push(FailureRecord {
                    url: url.to_string(),
                    error,
                });
            }
            WorkerEvent::MarkdownUnavailable {
                worker: _,
                job,
                active_ms,
            } => {
                self.in_flight.remove(&job.id);
                self.record_outcome(WorkerKind::Markdown, active_ms, true);
                tracing::debug!(url = %job.url, "no companion markdown, falling back to HTML");
                self.hybrid_queue.push_back(*job);
                if !self.draining {
                    self.dispatch_idle().await;
                }
            }
            WorkerEvent::HtmlInsufficient { worker, job_id } => {
                // The worker holds the job suspended; answer with a render.
                self.pool.send(worker, WorkerCommand::Render { job_id });
            }
            WorkerEvent::Stopped { worker, reason } => {
                if let Some(handle) = self.pool.remove(worker) {
                    if let Some(job_id) = handle.current_job {
                        if let Some(meta) = self.in_flight.remove(&job_id) {
                            self.failures.push(FailureRecord {
                                url: meta.url.to_string(),
                                error: "worker stopped before completion".to_string(),
                            });
                        }
                    }
                    tracing::debug!(
                        worker,
                        kind = handle.kind.label(),
                        ?reason,
                        "worker left the pool"
                    );
                }
            }
        }
    }

    fn record_outcome(&mut self, kind: WorkerKind, active_ms: Option<u64>, unavailable: bool) {
        if let Some(ms) = active_ms {
            self.autoscaler.record_active(kind, ms);
        }
        if kind == WorkerKind::Markdown {
            self.autoscaler.record_markdown_outcome(unavailable);
        }
    }

    /// Hand the next eligible job from the worker's kind-queue to it.
    ///
    /// For the markdown queue this drops already-visited and robots-denied
    /// entries on the way; the hybrid queue holds only jobs that already
    /// passed those gates.
    async fn assign_next(&mut self, worker: WorkerId) {
        let kind = match self.pool.get(worker) {
            Some(handle) if handle.idle && !handle.stopping => handle.kind,
            _ => return,
        };

        loop {
            let popped = match kind {
                WorkerKind::Markdown => self.markdown_queue.pop_front(),
                WorkerKind::Hybrid => self.hybrid_queue.pop_front(),
            };
            let mut job = match popped {
                Some(job) => job,
                None => return,
            };

            if kind == WorkerKind::Markdown {
                let normalized = url_utils::normalize_for_queue(&job.url);
                if self.visited.contains(&normalized) {
                    continue;
                }
                if self.options.respect_robots {
                    let policy = self.robots_for(&job.url).await;
                    if !policy.is_allowed(job.url.path()) {
                        self.blocked += 1;
                        tracing::info!("Blocked by robots.txt: {}", job.url);
                        continue;
                    }
                }
                self.visited.insert(normalized);
            }

            let origin = url_utils::origin_key(&job.url);
            let user_delay = Duration::from_millis(self.options.delay_ms);
            let delay = if self.options.respect_robots {
                self.robots_for(&job.url).await.effective_delay(user_delay)
            } else {
                user_delay
            };
            job.wait_until = self.limiter.compute_wait(&origin, delay);

            let job_id = job.id;
            self.in_flight.insert(
                job_id,
                JobMeta {
                    url: job.url.clone(),
                    depth: job.depth,
                    scope: job.scope.clone(),
                    kind,
                },
            );
            if let Some(handle) = self.pool.get_mut(worker) {
                handle.idle = false;
                handle.current_job = Some(job_id);
            }
            if !self.pool.send(worker, WorkerCommand::Assign(Box::new(job))) {
                // The worker vanished between Ready and now; its Stopped
                // event will surface the lost job.
                tracing::warn!(worker, "assignment failed, worker gone");
            }
            return;
        }
    }

    /// Cached robots policy for a URL's origin, fetching on first need.
    async fn robots_for(&mut self, url: &Url) -> Arc<RobotsPolicy> {
        let origin = url_utils::origin_key(url);
        if let Some(policy) = self.robots.get(&origin) {
            return Arc::clone(policy);
        }

        let policy = if !self.options.respect_robots {
            RobotsPolicy::allow_all(RobotsSource::Disabled)
        } else {
            match url_utils::robots_url(url) {
                Some(robots_url) => {
                    match self.http.fetch(&robots_url, "text/plain,*/*;q=0.8").await {
                        Ok(response) if response.is_success() => {
                            RobotsPolicy::parse(&response.text, &self.options.user_agent)
                        }
                        Ok(response) => {
                            tracing::debug!(
                                %origin,
                                status = response.status,
                                "no robots.txt, allowing all"
                            );
                            RobotsPolicy::allow_all(RobotsSource::AllowAll)
                        }
                        Err(error) => {
                            tracing::debug!(%origin, %error, "robots fetch failed, allowing all");
                            RobotsPolicy::allow_all(RobotsSource::AllowAll)
                        }
                    }
                }
                None => RobotsPolicy::allow_all(RobotsSource::AllowAll),
            }
        };

        let policy = Arc::new(policy);
        self.robots.insert(origin, Arc::clone(&policy));
        policy
    }

    /// Expand the frontier with discovered links, respecting the page
    /// budget and dedup sets.
    fn enqueue_links(&mut self, links: &[Url], parent_depth: u32, scope: Option<&CrawlScope>) {
        if parent_depth >= self.options.max_depth {
            return;
        }
        let depth = parent_depth + 1;

        for link in links {
            let pending =
                self.markdown_queue.len() + self.hybrid_queue.len() + self.in_flight.len();
            if self.saved + pending >= self.options.max_pages {
                tracing::debug!("page budget reached, dropping remaining links");
                break;
            }

            let normalized = url_utils::normalize_for_queue(link);
            if self.visited.contains(&normalized) || self.known.contains(&normalized) {
                continue;
            }
            self.known.insert(&normalized);
            self.filter.insert(&normalized);

            let job = Job {
                id: self.next_id(),
                url: link.clone(),
                depth,
                can_go_deeper: depth < self.options.max_depth,
                scope: scope.cloned(),
                wait_until: Instant::now(),
            };
            self.markdown_queue.push_back(job);
        }
    }

    /// Offer queued work to every idle worker.
    async fn dispatch_idle(&mut self) {
        for kind in [WorkerKind::Markdown, WorkerKind::Hybrid] {
            for worker in self.pool.idle_of_kind(kind) {
                let has_work = match kind {
                    WorkerKind::Markdown => !self.markdown_queue.is_empty(),
                    WorkerKind::Hybrid => !self.hybrid_queue.is_empty(),
                };
                if !has_work {
                    break;
                }
                self.assign_next(worker).await;
            }
        }
    }

    fn in_flight_of_kind(&self, kind: WorkerKind) -> usize {
        self.in_flight.values().filter(|m| m.kind == kind).count()
    }

    fn report_progress(&mut self) {
        if self.last_progress.elapsed().as_secs() < Config::PROGRESS_INTERVAL_SECS {
            return;
        }
        self.last_progress = std::time::Instant::now();
        tracing::info!(
            saved = self.saved,
            failed = self.failures.len(),
            queued = self.markdown_queue.len() + self.hybrid_queue.len(),
            in_flight = self.in_flight.len(),
            workers = self.pool.len(),
            "crawl progress"
        );
    }

    fn autoscale_tick(&mut self) {
        self.report_progress();
        let snapshot = PoolSnapshot {
            pending_markdown: self.markdown_queue.len(),
            pending_hybrid: self.hybrid_queue.len(),
            in_flight_markdown: self.in_flight_of_kind(WorkerKind::Markdown),
            in_flight_hybrid: self.in_flight_of_kind(WorkerKind::Hybrid),
            workers_markdown: self.pool.count_of_kind(WorkerKind::Markdown),
            workers_hybrid: self.pool.count_of_kind(WorkerKind::Hybrid),
            idle_markdown: self.pool.idle_of_kind(WorkerKind::Markdown).len(),
            idle_hybrid: self.pool.idle_of_kind(WorkerKind::Hybrid).len(),
            max_total: self.options.max_total_workers(),
        };
        let plan = self.autoscaler.plan(&snapshot);
        if plan.is_noop() {
            return;
        }
        tracing::debug!(
            ?plan,
            unavailable_rate = self.autoscaler.markdown_unavailable_rate(),
            "autoscale tick"
        );

        for _ in 0..plan.stop_markdown {
            if let Some(&id) = self.pool.idle_of_kind(WorkerKind::Markdown).first() {
                self.pool.stop(id);
            }
        }
        for _ in 0..plan.stop_hybrid {
            if let Some(&id) = self.pool.idle_of_kind(WorkerKind::Hybrid).first() {
                self.pool.stop(id);
            }
        }
        for _ in 0..plan.spawn_markdown {
            self.pool.spawn(WorkerKind::Markdown);
        }
        for _ in 0..plan.spawn_hybrid {
            self.pool.spawn(WorkerKind::Hybrid);
        }
    }

    fn build_report(&self, elapsed: std::time::Duration) -> CrawlReport {
        CrawlReport {
            start_urls: self.start_urls.clone(),
            saved: self.saved,
            failed: self.failures.len(),
            blocked_by_robots: self.blocked,
            duration_secs: elapsed.as_secs_f64(),
            failures: self.failures.clone(),
        }
    }

    fn print_summary(&self, report: &CrawlReport) {
        let failed_part = if report.failed > 0 {
            format!(", {} failed", report.failed)
        } else {
            String::new()
        };
        println!(
            "Completed in {:.1}s ({} saved{})",
            report.duration_secs, report.saved, failed_part
        );
        if !report.failures.is_empty() {
            println!("Failures ({}):", report.failures.len());
            for (index, failure) in report.failures.iter().enumerate() {
                println!("  {}. {} - {}", index + 1, failure.url, failure.error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scheduler(options: CrawlOptions) -> (Scheduler, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut options = options;
        options.out_dir = tmp.path().to_path_buf();
        (
            Scheduler::new(options, CancellationToken::new()).unwrap(),
            tmp,
        )
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_seed_dedup() {
        let (mut sched, _tmp) = scheduler(CrawlOptions::default());
        sched.enqueue_crawl_seed(url("https://x.test/docs"));
        sched.enqueue_crawl_seed(url("https://x.test/docs#other"));
        sched.enqueue_crawl_seed(url("https://x.test/docs?v=2"));
        assert_eq!(sched.markdown_queue.len(), 1);
        assert_eq!(sched.start_urls.len(), 1);
    }

    #[tokio::test]
    async fn test_non_http_seed_ignored() {
        let (mut sched, _tmp) = scheduler(CrawlOptions::default());
        sched.enqueue_crawl_seed(url("ftp://x.test/file"));
        assert!(sched.markdown_queue.is_empty());
    }

    #[tokio::test]
    async fn test_scrape_seed_has_no_scope() {
        let (mut sched, _tmp) = scheduler(CrawlOptions::default());
        sched.enqueue_scrape_seed(url("https://x.test/docs"));
        let job = sched.markdown_queue.front().unwrap();
        assert!(job.scope.is_none());
        assert!(!job.can_go_deeper);
    }

    #[tokio::test]
    async fn test_max_depth_zero_seed_cannot_go_deeper() {
        let mut options = CrawlOptions::default();
        options.max_depth = 0;
        let (mut sched, _tmp) = scheduler(options);
        sched.enqueue_crawl_seed(url("https://x.test/docs"));
        assert!(!sched.markdown_queue.front().unwrap().can_go_deeper);
    }

    #[tokio::test]
    async fn test_enqueue_links_respects_page_budget() {
        let mut options = CrawlOptions::default();
        options.max_pages = 3;
        let (mut sched, _tmp) = scheduler(options);
        sched.enqueue_crawl_seed(url("https://x.test/docs/"));
        let scope = CrawlScope::from_seed(&url("https://x.test/docs/"));

        let links: Vec<Url> = (0..10)
            .map(|i| url(&format!("https://x.test/docs/p{i}")))
            .collect();
        sched.enqueue_links(&links, 0, Some(&scope));
        // Seed plus discovered links never exceed max_pages.
        assert_eq!(sched.markdown_queue.len(), 3);
    }

    #[tokio::test]
    async fn test_enqueue_links_skips_known() {
        let (mut sched, _tmp) = scheduler(CrawlOptions::default());
        sched.enqueue_crawl_seed(url("https://x.test/docs/"));
        let scope = CrawlScope::from_seed(&url("https://x.test/docs/"));

        let links = vec![url("https://x.test/docs/"), url("https://x.test/docs/new")];
        sched.enqueue_links(&links, 0, Some(&scope));
        assert_eq!(sched.markdown_queue.len(), 2);
        assert_eq!(
            sched.markdown_queue.back().unwrap().url.as_str(),
            "https://x.test/docs/new"
        );
    }

    #[tokio::test]
    async fn test_enqueue_links_stops_at_max_depth() {
        let mut options = CrawlOptions::default();
        options.max_depth = 1;
        let (mut sched, _tmp) = scheduler(options);
        let scope = CrawlScope::from_seed(&url("https://x.test/docs/"));

        sched.enqueue_links(&[url("https://x.test/docs/a")], 0, Some(&scope));
        assert_eq!(sched.markdown_queue.len(), 1);
        assert!(!sched.markdown_queue.front().unwrap().can_go_deeper);

        // Children of a depth-1 page exceed max_depth and are dropped.
        sched.enqueue_links(&[url("https://x.test/docs/b")], 1, Some(&scope));
        assert_eq!(sched.markdown_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_is_done_logic() {
        let (mut sched, _tmp) = scheduler(CrawlOptions::default());
        assert!(sched.is_done());
        sched.enqueue_crawl_seed(url("https://x.test/docs"));
        assert!(!sched.is_done());
        sched.markdown_queue.clear();
        assert!(sched.is_done());
        sched.saved = sched.options.max_pages;
        assert!(sched.is_done());
    }

    #[tokio::test]
    async fn test_markdown_unavailable_moves_job_to_hybrid_tail() {
        let (mut sched, _tmp) = scheduler(CrawlOptions::default());
        let job = Job {
            id: 9,
            url: url("https://x.test/docs/a"),
            depth: 0,
            can_go_deeper: true,
            scope: Some(CrawlScope::from_seed(&url("https://x.test/docs/"))),
            wait_until: Instant::now(),
        };
        sched.in_flight.insert(
            9,
            JobMeta {
                url: job.url.clone(),
                depth: 0,
                scope: job.scope.clone(),
                kind: WorkerKind::Markdown,
            },
        );
        sched
            .handle_event(WorkerEvent::MarkdownUnavailable {
                worker: 0,
                job: Box::new(job),
                active_ms: Some(100),
            })
            .await;
        assert_eq!(sched.hybrid_queue.len(), 1);
        assert!(sched.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_failed_event_recorded() {
        let (mut sched, _tmp) = scheduler(CrawlOptions::default());
        sched
            .handle_event(WorkerEvent::Failed {
                worker: 0,
                job_id: 1,
                url: url("https://x.test/docs/broken"),
                error: "HTTP 500 Internal Server Error".to_string(),
                active_ms: Some(50),
            })
            .await;
        assert_eq!(sched.failures.len(), 1);
        assert!(sched.failures[0].error.contains("500"));
    }
}
