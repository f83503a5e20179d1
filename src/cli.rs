use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::CrawlOptions;

/// mdmirror cli
#[derive(Parser)]
#[command(name = "mdmirror")]
#[command(about = "Mirror documentation sites as cross-linked Markdown")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Crawl a site starting from a URL, following in-scope links
    Crawl {
        /// Start URL; its origin and path prefix define the crawl scope
        url: String,

        #[command(flatten)]
        opts: SharedOpts,
    },

    /// Scrape a single URL without link discovery
    Url {
        /// Page URL to scrape
        url: String,

        #[command(flatten)]
        opts: SharedOpts,
    },

    /// Scrape every URL listed in a file (one per line, # comments)
    Urls {
        /// Path to the URL list
        file: PathBuf,

        #[command(flatten)]
        opts: SharedOpts,
    },
}

#[derive(Args)]
pub struct SharedOpts {
    /// Output directory for the Markdown mirror
    #[arg(long, default_value = "docs")]
    pub out_dir: PathBuf,

    /// Upper bound on the worker pool size
    #[arg(long, default_value = "8")]
    pub concurrency: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Transport-level retry attempts per fetch
    #[arg(long, default_value = "2")]
    pub retries: u32,

    /// User-Agent header sent verbatim
    #[arg(long, default_value = concat!("mdmirror/", env!("CARGO_PKG_VERSION")))]
    pub user_agent: String,

    /// Maximum link depth from the start URL
    #[arg(long, default_value = "3")]
    pub max_depth: u32,

    /// Maximum number of pages to save
    #[arg(long, default_value = "500")]
    pub max_pages: usize,

    /// Minimum delay between same-origin requests, in milliseconds
    #[arg(long, default_value = "0")]
    pub delay: u64,

    /// Respect robots.txt (default)
    #[arg(long, overrides_with = "no_robots")]
    pub robots: bool,

    /// Ignore robots.txt entirely
    #[arg(long)]
    pub no_robots: bool,

    /// Allow render escalation for thin pages (default)
    #[arg(long, overrides_with = "no_render")]
    pub render: bool,

    /// Never escalate to a headless render
    #[arg(long)]
    pub no_render: bool,

    /// Command that renders a URL to HTML on stdout
    #[arg(long)]
    pub render_cmd: Option<String>,

    /// Overwrite existing .llms.md / llms-full.md files
    #[arg(long, overrides_with = "no_overwrite_llms")]
    pub overwrite_llms: bool,

    /// Keep existing .llms.md / llms-full.md files (default)
    #[arg(long)]
    pub no_overwrite_llms: bool,

    /// Also write the stripped boilerplate as clutter.md
    #[arg(long, overrides_with = "no_clutter")]
    pub clutter: bool,

    /// Never write clutter.md (default)
    #[arg(long)]
    pub no_clutter: bool,

    /// Debug-level logging
    #[arg(long, short)]
    pub verbose: bool,
}

impl SharedOpts {
    /// Resolve flag pairs into effective crawl options.
    pub fn to_options(&self) -> CrawlOptions {
        CrawlOptions {
            out_dir: self.out_dir.clone(),
            concurrency: self.concurrency.max(1),
            timeout_ms: self.timeout.saturating_mul(1_000),
            retries: self.retries,
            user_agent: self.user_agent.clone(),
            max_depth: self.max_depth,
            max_pages: self.max_pages.max(1),
            delay_ms: self.delay,
            respect_robots: !self.no_robots,
            render: !self.no_render,
            render_cmd: self.render_cmd.clone(),
            overwrite_llms: self.overwrite_llms && !self.no_overwrite_llms,
            keep_clutter: self.clutter && !self.no_clutter,
        }
    }
}

impl Cli {
    /// Parse args, treating a bare URL positional as the crawl command.
    pub fn parse_args() -> Self {
        let mut args: Vec<String> = std::env::args().collect();
        if let Some(first) = args.get(1) {
            if looks_like_url(first) {
                args.insert(1, "crawl".to_string());
            }
        }
        Self::parse_from(args)
    }
}

fn looks_like_url(arg: &str) -> bool {
    arg.starts_with("http://") || arg.starts_with("https://")
}
