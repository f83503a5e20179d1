use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use url::Url;

use mdmirror::cli::{Cli, Commands};
use mdmirror::logging;
use mdmirror::scheduler::Scheduler;
use mdmirror::url_utils;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let (options, seeds, crawl_mode) = match cli.command {
        Commands::Crawl { url, opts } => {
            logging::init_logging(opts.verbose);
            (opts.to_options(), vec![parse_seed(&url)?], true)
        }
        Commands::Url { url, opts } => {
            logging::init_logging(opts.verbose);
            (opts.to_options(), vec![parse_seed(&url)?], false)
        }
        Commands::Urls { file, opts } => {
            logging::init_logging(opts.verbose);
            (opts.to_options(), read_url_file(&file)?, false)
        }
    };

    let shutdown = CancellationToken::new();
    let exit_code = spawn_signal_watcher(shutdown.clone());

    let mut scheduler = Scheduler::new(options, shutdown)
        .context("failed to initialize the crawler")?;
    for seed in seeds {
        if crawl_mode {
            scheduler.enqueue_crawl_seed(seed);
        } else {
            scheduler.enqueue_scrape_seed(seed);
        }
    }

    scheduler.run().await;

    Ok(exit_code.load(std::sync::atomic::Ordering::SeqCst))
}

fn parse_seed(raw: &str) -> Result<Url> {
    let normalized = url_utils::normalize_cli_url(raw);
    Url::parse(&normalized).with_context(|| format!("invalid URL: {raw}"))
}

fn read_url_file(path: &Path) -> Result<Vec<Url>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut seeds = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        seeds.push(parse_seed(line)?);
    }
    anyhow::ensure!(!seeds.is_empty(), "no URLs found in {}", path.display());
    Ok(seeds)
}

/// Cancel the crawl on SIGINT/SIGTERM and remember the conventional exit
/// code (130/143). A second signal aborts immediately.
fn spawn_signal_watcher(
    shutdown: CancellationToken,
) -> std::sync::Arc<std::sync::atomic::AtomicI32> {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    let exit_code = Arc::new(AtomicI32::new(0));
    let code = Arc::clone(&exit_code);

    tokio::spawn(async move {
        let sigint = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = sigint => code.store(130, Ordering::SeqCst),
                _ = sigterm.recv() => code.store(143, Ordering::SeqCst),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = sigint.await;
            code.store(130, Ordering::SeqCst);
        }
        shutdown.cancel();

        // A second interrupt skips the graceful drain.
        let _ = tokio::signal::ctrl_c().await;
        std::process::exit(130);
    });

    exit_code
}
