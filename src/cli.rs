use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "noticescan",
    version,
    about = "Crawl a ranked host list and capture cookie-consent notices",
    long_about = "noticescan visits every host of a ranked list in a running \
        Chromium instance (attached over the DevTools protocol), detects \
        cookie-consent notices with selector rules and DOM heuristics, and \
        writes one annotated screenshot per candidate plus per-page metadata. \
        The browser must already be running with remote debugging enabled."
)]
pub struct Cli {
    /// Ranked hosts file, one hostname per line
    #[arg(value_name = "HOSTS")]
    pub hosts: PathBuf,

    /// DevTools debugger HTTP endpoint
    #[arg(
        long,
        default_value = "http://127.0.0.1:9222",
        env = "NOTICESCAN_ENDPOINT"
    )]
    pub endpoint: String,

    /// Element-hiding rule file (cookie-notice selectors)
    #[arg(long, default_value = "resources/cookie-notice-css-rules.txt")]
    pub rules: PathBuf,

    /// Maximum number of pages crawled in parallel
    #[arg(long, default_value_t = noticescan::crawl::DEFAULT_WORKERS)]
    pub workers: usize,

    /// Directory for captured screenshots
    #[arg(long, default_value = "screenshots")]
    pub screenshots: PathBuf,

    /// Append completed page records to this file as JSON Lines
    #[arg(long)]
    pub results: Option<PathBuf>,

    /// Crawl only the first N hosts
    #[arg(long)]
    pub limit: Option<usize>,

    /// Per-call CDP timeout in milliseconds
    #[arg(long)]
    pub timeout: Option<u64>,
}
