mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use noticescan::browser::BrowserSession;
use noticescan::cdp::CdpConfig;
use noticescan::crawl::{CrawlController, read_hosts};
use noticescan::error::AppError;
use noticescan::rules::RuleOracle;
use noticescan::screenshot::ScreenshotSink;

use cli::Cli;

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    // Per-page failures are recorded, not fatal; only run-level errors
    // (unreachable browser, unreadable inputs, sink write failures) exit
    // non-zero.
    if let Err(e) = run(&cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<(), AppError> {
    let rules = RuleOracle::load(&cli.rules)?;
    info!("loaded {} selector rules", rules.len());

    let hosts = read_hosts(&cli.hosts, cli.limit)?;

    let mut cdp_config = CdpConfig::default();
    if let Some(timeout_ms) = cli.timeout {
        cdp_config.call_timeout = Duration::from_millis(timeout_ms);
    }
    let browser = BrowserSession::connect(&cli.endpoint, cdp_config).await?;

    let controller = CrawlController::new(
        Arc::new(browser),
        Arc::new(rules),
        ScreenshotSink::new(cli.screenshots.clone()),
        cli.workers,
        cli.results.clone(),
    );
    let results = controller.run(&hosts).await?;
    info!("run complete: {} pages", results.len());
    Ok(())
}
