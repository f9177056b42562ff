use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use scorehaul_adapters::{HtmlDocumentFactory, SessionFactory};
use scorehaul_core::DateWindow;
use scorehaul_sync::{load_harvest_file, report_recent_runs_markdown, HarvestEnv, HarvestRequest};
use scorehaul_webdriver::{WebDriverConfig, WebDriverFactory};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scorehaul")]
#[command(about = "Harvest football match records into per-competition JSON")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    /// Harvest file, overriding SCOREHAUL_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every enabled competition over a date window.
    Harvest {
        /// First day, inclusive. Defaults to yesterday.
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day, inclusive. Defaults to `--from`, or yesterday.
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Restrict the run to these competition ids.
        #[arg(long)]
        only: Vec<String>,
        #[arg(long)]
        workers: Option<usize>,
        /// Serve pages from a fixture directory instead of a WebDriver endpoint.
        #[arg(long)]
        replay_dir: Option<PathBuf>,
    },
    /// List configured competitions.
    Targets,
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json)?;

    let mut env = HarvestEnv::from_env();
    if let Some(config) = cli.config {
        env.config_path = config;
    }

    match cli.command.unwrap_or(Commands::Targets) {
        Commands::Harvest {
            from,
            to,
            only,
            workers,
            replay_dir,
        } => {
            let window = resolve_window(from, to)?;
            let file = load_harvest_file(&env.config_path)?;
            let factory: Arc<dyn SessionFactory> = match replay_dir {
                Some(dir) => Arc::new(
                    HtmlDocumentFactory::from_fixture_dir(&dir)
                        .with_context(|| format!("loading replay pages from {}", dir.display()))?,
                ),
                None => Arc::new(webdriver_factory(&env)?),
            };

            let cancel = CancellationToken::new();
            spawn_ctrl_c(cancel.clone());

            let summary = scorehaul_sync::run_harvest(
                &env,
                &file,
                HarvestRequest {
                    window,
                    only,
                    workers,
                },
                factory,
                cancel,
            )
            .await?;

            let report = &summary.report;
            println!(
                "harvest complete: run_id={} targets={} records={} units_failed={} fields_gapped={} cancelled={} report={}",
                report.run_id,
                report.targets.len(),
                report.records_harvested(),
                report.units_failed(),
                report.fields_gapped(),
                report.cancelled,
                summary.report_dir.display()
            );
            for (competition, warning) in report.persistence_warnings() {
                eprintln!("persistence warning: {competition}: {warning}");
            }
        }
        Commands::Targets => {
            let file = load_harvest_file(&env.config_path)?;
            println!("site: {}", file.site);
            for target in &file.targets {
                let state = if target.enabled { "enabled" } else { "disabled" };
                println!(
                    "{:<32} {:<9} {}",
                    target.competition_id, state, target.competition_url
                );
            }
        }
        Commands::Report { runs } => {
            let markdown = report_recent_runs_markdown(runs, &env.reports_dir)?;
            println!("{markdown}");
        }
    }

    Ok(())
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn resolve_window(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<DateWindow> {
    let yesterday = Utc::now()
        .date_naive()
        .pred_opt()
        .context("computing yesterday")?;
    let start = from.unwrap_or(yesterday);
    let end = to.unwrap_or(if from.is_some() { start } else { yesterday });
    DateWindow::new(start, end).with_context(|| format!("invalid window {start}..{end}"))
}

fn webdriver_factory(env: &HarvestEnv) -> Result<WebDriverFactory> {
    let config = WebDriverConfig {
        endpoint: env.webdriver_url.clone(),
        headless: env.headless,
        user_agent: env.user_agent.clone(),
        ..WebDriverConfig::default()
    };
    info!(endpoint = %config.endpoint, headless = config.headless, "using webdriver endpoint");
    WebDriverFactory::new(config).context("building webdriver client")
}

/// Ctrl-C stops the run between units and the current unit still flushes.
/// A second Ctrl-C exits immediately.
fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, &cancel).await {
            warn!("second interrupt received, exiting without flushing");
            std::process::exit(130);
        }
    });
}

/// Cancels on the first signal. Returns true once a second signal arrives,
/// false if the signal source fails.
async fn watch_interrupts<F, Fut>(mut next_signal: F, cancel: &CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = next_signal().await {
        warn!(error = %err, "interrupt handler unavailable");
        return false;
    }
    warn!("interrupt received, finishing current unit then stopping");
    cancel.cancel();
    next_signal().await.is_ok()
}
