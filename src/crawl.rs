use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::browser::BrowserSession;
use crate::result::PageResult;
use crate::rules::RuleOracle;
use crate::screenshot::ScreenshotSink;

/// Default bound on concurrently crawled pages.
pub const DEFAULT_WORKERS: usize = 10;

/// Fans the input list out across a bounded worker pool and collects the
/// per-page records.
///
/// Every worker drives one page to completion through the shared browser
/// session; there is no cooperative cancellation — a page either finishes
/// or fails on its own. Results are reported as they complete, in
/// completion order.
pub struct CrawlController {
    browser: Arc<BrowserSession>,
    rules: Arc<RuleOracle>,
    sink: ScreenshotSink,
    workers: usize,
    results_path: Option<PathBuf>,
}

impl CrawlController {
    #[must_use]
    pub fn new(
        browser: Arc<BrowserSession>,
        rules: Arc<RuleOracle>,
        sink: ScreenshotSink,
        workers: usize,
        results_path: Option<PathBuf>,
    ) -> Self {
        Self {
            browser,
            rules,
            sink,
            workers,
            results_path,
        }
    }

    /// Crawl every host and return the completed records.
    ///
    /// Per-page failures are part of the records, not errors; only
    /// screenshot-sink write failures (and worker panics) abort the run.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error on sink or results-file failure.
    pub async fn run(&self, hosts: &[String]) -> io::Result<Vec<PageResult>> {
        info!("crawling {} hosts with {} workers", hosts.len(), self.workers);

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for (index, host) in hosts.iter().enumerate() {
            let page = page_shell(index, host);
            let browser = Arc::clone(&self.browser);
            let rules = Arc::clone(&self.rules);
            let sink = self.sink.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                // the semaphore is never closed
                let _permit = semaphore.acquire_owned().await.ok();
                browser.crawl_page(&rules, &sink, page).await
            });
        }

        let mut results_file = match &self.results_path {
            Some(path) => Some(std::fs::File::create(path)?),
            None => None,
        };

        let mut results = Vec::with_capacity(hosts.len());
        while let Some(joined) = tasks.join_next().await {
            let page = match joined {
                Ok(Ok(page)) => page,
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(io::Error::other(e)),
            };
            report(&page);
            if let Some(file) = results_file.as_mut() {
                let line = serde_json::to_string(&page).map_err(io::Error::other)?;
                writeln!(file, "{line}")?;
            }
            results.push(page);
        }
        Ok(results)
    }
}

/// The empty record a worker fills in; rank is the 1-based list position.
fn page_shell(index: usize, host: &str) -> PageResult {
    PageResult::new(index + 1, format!("https://{host}"))
}

fn report(page: &PageResult) {
    println!("#{}: {}", page.rank, page.url);
    for line in page.outcome_lines() {
        println!("{line}");
    }
}

/// Read the ranked hosts file: one hostname per line, blank lines skipped.
///
/// # Errors
///
/// Returns the underlying I/O error if the file cannot be read.
pub fn read_hosts(path: &Path, limit: Option<usize>) -> io::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    let mut hosts: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect();
    if let Some(limit) = limit {
        hosts.truncate(limit);
    }
    Ok(hosts)
}
