//! Filesystem output: variant write policy and the final crawl report.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::CrawlOptions;
use crate::models::{CrawlReport, ScrapeResult};
use crate::output::OutputPaths;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Write the Markdown variants for one page.
///
/// `page.md` is always (re)written. `clutter.md` appears only when requested
/// and non-empty. The llms variants respect `--overwrite-llms`: without it,
/// existing files are left alone.
pub fn write_result(
    result: &ScrapeResult,
    paths: &OutputPaths,
    options: &CrawlOptions,
) -> Result<Vec<PathBuf>, WriteError> {
    fs::create_dir_all(&paths.dir).map_err(|source| WriteError::CreateDir {
        path: paths.dir.clone(),
        source,
    })?;

    let mut written = Vec::new();

    write_file(&paths.page_path, &result.page)?;
    written.push(paths.page_path.clone());

    if options.keep_clutter {
        if let Some(clutter) = &result.clutter {
            write_file(&paths.clutter_path, clutter)?;
            written.push(paths.clutter_path.clone());
        }
    }

    if options.overwrite_llms || !paths.llms_path.exists() {
        write_file(&paths.llms_path, &result.llms)?;
        written.push(paths.llms_path.clone());
    }
    if options.overwrite_llms || !paths.llms_full_path.exists() {
        write_file(&paths.llms_full_path, &result.llms_full)?;
        written.push(paths.llms_full_path.clone());
    }

    Ok(written)
}

fn write_file(path: &Path, contents: &str) -> Result<(), WriteError> {
    fs::write(path, contents).map_err(|source| WriteError::WriteFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Persist the run summary next to the mirrored pages.
pub fn write_report(report: &CrawlReport, out_dir: &Path) -> Result<PathBuf, WriteError> {
    fs::create_dir_all(out_dir).map_err(|source| WriteError::CreateDir {
        path: out_dir.to_path_buf(),
        source,
    })?;
    let path = out_dir.join("crawl-report.json");
    let json = serde_json::to_string_pretty(report).expect("report serializes");
    write_file(&path, &json)?;
    Ok(path)
}
