//! Worker task bodies: the cooperative state machines for both worker
//! kinds. A worker announces readiness, waits for an assignment, honors the
//! job's politeness deadline, fetches, parses, writes, and reports exactly
//! one terminal outcome per job.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use url::Url;

use crate::config::{Config, CrawlOptions};
use crate::dedup::LinkFilter;
use crate::extract::{self, ProcessedHtml};
use crate::markdown;
use crate::models::{Job, ScrapeResult, StopReason, WorkerCommand, WorkerEvent, WorkerId, WorkerKind};
use crate::network::{HttpClient, HTML_ACCEPT, MARKDOWN_ACCEPT};
use crate::output;
use crate::render::Renderer;
use crate::rewrite::{self, RewriteContext};
use crate::url_utils;
use crate::writer;

/// Shared dependencies handed to every worker task.
#[derive(Clone)]
pub struct WorkerContext {
    pub options: Arc<CrawlOptions>,
    pub http: Arc<HttpClient>,
    pub renderer: Arc<Renderer>,
    pub filter: Arc<LinkFilter>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Main loop shared by both kinds.
pub async fn run_worker(
    id: WorkerId,
    kind: WorkerKind,
    ctx: WorkerContext,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
) {
    loop {
        if ctx.events.send(WorkerEvent::Ready { worker: id }).is_err() {
            return;
        }

        let idle_window = Duration::from_millis(Config::WORKER_INACTIVITY_MS);
        let command = match timeout(idle_window, commands.recv()).await {
            Ok(Some(command)) => command,
            Ok(None) => return,
            Err(_) => {
                let _ = ctx.events.send(WorkerEvent::Stopped {
                    worker: id,
                    reason: StopReason::Idle,
                });
                return;
            }
        };

        match command {
            WorkerCommand::Stop => {
                let _ = ctx.events.send(WorkerEvent::Stopped {
                    worker: id,
                    reason: StopReason::Shutdown,
                });
                return;
            }
            // A render command with no suspended job is stale; drop it.
            WorkerCommand::Render { .. } => continue,
            WorkerCommand::Assign(job) => {
                let outcome = match kind {
                    WorkerKind::Markdown => Some(run_markdown_job(id, &ctx, *job).await),
                    WorkerKind::Hybrid => run_hybrid_job(id, &ctx, *job, &mut commands).await,
                };
                match outcome {
                    Some(event) => {
                        if ctx.events.send(event).is_err() {
                            return;
                        }
                    }
                    None => {
                        // Stop arrived while the job was suspended.
                        let _ = ctx.events.send(WorkerEvent::Stopped {
                            worker: id,
                            reason: StopReason::Shutdown,
                        });
                        return;
                    }
                }
            }
        }
    }
}

/// Try the companion Markdown document for a page.
async fn run_markdown_job(id: WorkerId, ctx: &WorkerContext, job: Job) -> WorkerEvent {
    sleep_until(job.wait_until).await;

    if url_utils::is_refused_asset(&job.url) {
        tracing::debug!(url = %job.url, "refusing companion fetch for asset URL");
        return WorkerEvent::MarkdownUnavailable {
            worker: id,
            job: Box::new(job),
            active_ms: None,
        };
    }

    let companion = url_utils::companion_markdown_url(&job.url);
    let started = Instant::now();
    let response = ctx
        .http
        .fetch_with_retries(&companion, MARKDOWN_ACCEPT, ctx.options.retries)
        .await;
    let active_ms = Some(started.elapsed().as_millis() as u64);

    let response = match response {
        Ok(response) => response,
        Err(error) => {
            tracing::debug!(url = %companion, %error, "companion fetch failed");
            return WorkerEvent::MarkdownUnavailable {
                worker: id,
                job: Box::new(job),
                active_ms,
            };
        }
    };

    if !response.is_success() {
        if response.status != 404 && response.status != 410 {
            tracing::debug!(
                url = %companion,
                status = response.status,
                "companion responded without Markdown"
            );
        }
        return WorkerEvent::MarkdownUnavailable {
            worker: id,
            job: Box::new(job),
            active_ms,
        };
    }

    let fetched = Utc::now();
    let mut result = markdown::markdown_scrape_result(&response.text, &job.url, fetched);
    let links = match (&job.scope, job.can_go_deeper) {
        (Some(scope), true) => markdown::extract_links(&response.text, &job.url, scope),
        _ => Vec::new(),
    };

    match finalize_and_write(ctx, &job, &mut result, &links) {
        Ok(()) => WorkerEvent::Completed {
            worker: id,
            job_id: job.id,
            links,
            active_ms: Some(started.elapsed().as_millis() as u64),
        },
        Err(error) => WorkerEvent::Failed {
            worker: id,
            job_id: job.id,
            url: job.url,
            error,
            active_ms: Some(started.elapsed().as_millis() as u64),
        },
    }
}

/// Fetch HTML, escalating through the renderer when content is too thin.
///
/// Returns `None` when a stop command interrupted a suspended job; the
/// caller emits the `Stopped` event.
async fn run_hybrid_job(
    id: WorkerId,
    ctx: &WorkerContext,
    job: Job,
    commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
) -> Option<WorkerEvent> {
    sleep_until(job.wait_until).await;
    let started = Instant::now();

    let failed = |error: String, started: Instant| WorkerEvent::Failed {
        worker: id,
        job_id: job.id,
        url: job.url.clone(),
        error,
        active_ms: Some(started.elapsed().as_millis() as u64),
    };

    let response = match ctx
        .http
        .fetch_with_retries(&job.url, HTML_ACCEPT, ctx.options.retries)
        .await
    {
        Ok(response) => response,
        Err(error) => return Some(failed(error.to_string(), started)),
    };
    if !response.is_success() {
        return Some(failed(
            format!("HTTP {} {}", response.status, response.reason),
            started,
        ));
    }

    let mut processed = match process_html_blocking(ctx, &job, response.text).await {
        Ok(processed) => processed,
        Err(error) => return Some(failed(error, started)),
    };

    if !processed.sufficient && ctx.options.render {
        tracing::debug!(url = %job.url, "content below threshold, requesting render");
        if ctx
            .events
            .send(WorkerEvent::HtmlInsufficient {
                worker: id,
                job_id: job.id,
            })
            .is_err()
        {
            return None;
        }

        // Suspended: this worker holds the job until the scheduler answers.
        loop {
            match commands.recv().await {
                Some(WorkerCommand::Render { job_id }) if job_id == job.id => {
                    let rendered = ctx
                        .renderer
                        .render(
                            &job.url,
                            Duration::from_millis(ctx.options.timeout_ms),
                            &ctx.options.user_agent,
                        )
                        .await;
                    match rendered {
                        Ok(html) => match process_html_blocking(ctx, &job, html).await {
                            Ok(reprocessed) => {
                                processed = reprocessed;
                                break;
                            }
                            Err(error) => return Some(failed(error, started)),
                        },
                        Err(error) => {
                            return Some(failed(format!("render failed: {error}"), started))
                        }
                    }
                }
                Some(WorkerCommand::Render { .. }) => continue,
                Some(WorkerCommand::Stop) | None => {
                    let _ = ctx.events.send(failed("render aborted by shutdown".into(), started));
                    return None;
                }
                Some(WorkerCommand::Assign(_)) => {
                    // The scheduler never assigns to a busy worker.
                    tracing::warn!(worker = id, "assignment received while suspended");
                    continue;
                }
            }
        }
    }

    let ProcessedHtml {
        mut result, links, ..
    } = processed;

    match finalize_and_write(ctx, &job, &mut result, &links) {
        Ok(()) => Some(WorkerEvent::Completed {
            worker: id,
            job_id: job.id,
            links,
            active_ms: Some(started.elapsed().as_millis() as u64),
        }),
        Err(error) => Some(failed(error, started)),
    }
}

/// HTML parsing pins the DOM to one thread, so it runs on the blocking pool.
async fn process_html_blocking(
    ctx: &WorkerContext,
    job: &Job,
    html: String,
) -> Result<ProcessedHtml, String> {
    let url = job.url.clone();
    let scope = if job.can_go_deeper { job.scope.clone() } else { None };
    let collect_clutter = ctx.options.keep_clutter;
    tokio::task::spawn_blocking(move || {
        extract::process_html(&html, &url, Utc::now(), scope.as_ref(), collect_clutter)
    })
    .await
    .map_err(|e| format!("parse failure: {e}"))
}

/// Rewrite links against everything known so far, then write the variants.
fn finalize_and_write(
    ctx: &WorkerContext,
    job: &Job,
    result: &mut ScrapeResult,
    links: &[Url],
) -> Result<(), String> {
    let paths = output::build_output_paths(&job.url, &ctx.options.out_dir);
    let hints: HashSet<String> = links.iter().map(|u| u.to_string()).collect();
    let rewrite_ctx = RewriteContext {
        page_url: &job.url,
        page_dir: &paths.dir,
        out_dir: &ctx.options.out_dir,
        hints: &hints,
        filter: Some(&ctx.filter),
    };
    rewrite::rewrite_links_in_result(result, &rewrite_ctx);
    writer::write_result(result, &paths, &ctx.options).map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_context(out_dir: &std::path::Path) -> (WorkerContext, mpsc::UnboundedReceiver<WorkerEvent>) {
        let mut options = CrawlOptions::default();
        options.out_dir = out_dir.to_path_buf();
        options.timeout_ms = 2_000;
        options.retries = 0;
        let (events, events_rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            options: Arc::new(options),
            http: Arc::new(HttpClient::new("mdmirror-test", 2_000).unwrap()),
            renderer: Arc::new(Renderer::Disabled),
            filter: Arc::new(LinkFilter::new(1 << 12)),
            events,
        };
        (ctx, events_rx)
    }

    fn job(url: &str) -> Job {
        Job {
            id: 1,
            url: Url::parse(url).unwrap(),
            depth: 0,
            can_go_deeper: false,
            scope: None,
            wait_until: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_idle_worker_stops_after_inactivity() {
        // Shrink the window indirectly by closing the channel: a closed
        // command stream ends the loop without an event.
        let tmp = TempDir::new().unwrap();
        let (ctx, mut events_rx) = test_context(tmp.path());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(7, WorkerKind::Markdown, ctx, cmd_rx));

        match events_rx.recv().await {
            Some(WorkerEvent::Ready { worker }) => assert_eq!(worker, 7),
            other => panic!("expected Ready, got {other:?}"),
        }
        drop(cmd_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_command_acknowledged() {
        let tmp = TempDir::new().unwrap();
        let (ctx, mut events_rx) = test_context(tmp.path());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(3, WorkerKind::Hybrid, ctx, cmd_rx));

        assert!(matches!(
            events_rx.recv().await,
            Some(WorkerEvent::Ready { worker: 3 })
        ));
        cmd_tx.send(WorkerCommand::Stop).unwrap();
        match events_rx.recv().await {
            Some(WorkerEvent::Stopped { worker, reason }) => {
                assert_eq!(worker, 3);
                assert_eq!(reason, StopReason::Shutdown);
            }
            other => panic!("expected Stopped, got {other:?}"),
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_asset_reports_unavailable() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _events_rx) = test_context(tmp.path());
        let event = run_markdown_job(1, &ctx, job("https://x.test/app.js")).await;
        match event {
            WorkerEvent::MarkdownUnavailable { job, .. } => {
                assert_eq!(job.url.as_str(), "https://x.test/app.js");
            }
            other => panic!("expected MarkdownUnavailable, got {other:?}"),
        }
    }
}
