// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use fetchpool::config::Config;
use fetchpool::download::{Registry, Transfer, TransferSnapshot, TransferStatus};
use fetchpool::error::{failure_report, ErrorBuilder};

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Every download finished
    pub const SUCCESS: i32 = 0;
    /// At least one download failed or was interrupted
    pub const ERROR: i32 = 1;
    /// Configuration error - invalid config file or HTTP client setup
    pub const CONFIG: i32 = 78;
}

/// How often progress bars are redrawn.
const REFRESH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "fetchpool")]
#[command(author, version, about = "Concurrent, resumable file downloads", long_about = None)]
struct Cli {
    /// URLs to download
    #[arg(required = true, value_name = "URL")]
    urls: Vec<String>,

    /// Download directory (overrides config)
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Maximum reconnect attempts per download (overrides config)
    #[arg(short = 'r', long, value_name = "N")]
    retries: Option<u32>,

    /// Seconds to wait between reconnect attempts (overrides config)
    #[arg(long, value_name = "SECS")]
    backoff: Option<u64>,

    /// Print final download details as JSON
    #[arg(long)]
    json: bool,

    /// Don't show progress bars
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "fetchpool=debug" } else { "fetchpool=warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(dir) = &cli.output_dir {
        config.download_dir = dir.clone();
    }
    if let Some(retries) = cli.retries {
        config.max_retries = retries;
    }
    if let Some(backoff) = cli.backoff {
        config.retry_backoff_secs = backoff;
    }
    Ok(config)
}

/// One progress bar per transfer, redrawn from the transfers' own counters.
struct ProgressView {
    _multi: MultiProgress,
    bars: Vec<(Transfer, ProgressBar)>,
}

impl ProgressView {
    fn new(transfers: Vec<Transfer>) -> Self {
        let multi = MultiProgress::new();
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:24!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");

        let bars = transfers
            .into_iter()
            .map(|transfer| {
                let bar = multi.add(ProgressBar::new(0));
                bar.set_style(style.clone());
                bar.set_prefix(transfer.file_name().to_string());
                (transfer, bar)
            })
            .collect();

        Self { _multi: multi, bars }
    }

    fn refresh(&self) {
        for (transfer, bar) in &self.bars {
            if bar.is_finished() {
                continue;
            }
            bar.set_length(transfer.bytes_total());
            bar.set_position(transfer.bytes_downloaded());

            let status = transfer.status();
            if status.is_finished() {
                bar.finish_with_message(status.to_string());
                continue;
            }

            let message = match status {
                TransferStatus::Downloading => format!(
                    "{}/s, eta {}",
                    HumanBytes(transfer.speed() as u64),
                    HumanDuration(transfer.eta())
                ),
                TransferStatus::Reconnecting => format!(
                    "reconnecting ({}/{})",
                    transfer.attempts(),
                    transfer.max_retries()
                ),
                other => other.to_string(),
            };
            bar.set_message(message);
            bar.tick();
        }
    }
}

fn print_summary(snapshots: &[TransferSnapshot]) {
    println!();
    for snapshot in snapshots {
        let name = snapshot
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| snapshot.source.clone());

        match snapshot.status {
            TransferStatus::Finished => println!(
                "  {} {} ({})",
                "[✓]".green(),
                name,
                HumanBytes(snapshot.bytes_downloaded)
            ),
            TransferStatus::Failed => println!(
                "  {} {} - {}",
                "[✗]".red(),
                name,
                snapshot.last_error.as_deref().unwrap_or("failed")
            ),
            status => println!(
                "  {} {} - {} at {:.1}%",
                "[!]".yellow(),
                name,
                status,
                snapshot.progress
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            let message = ErrorBuilder::new(format!("{:#}", e))
                .cause("The config file is not valid JSON")
                .fix(match Config::config_path() {
                    Ok(path) => format!("Fix or delete {}", path.display()),
                    Err(_) => "Make sure $HOME is set".to_string(),
                });
            eprintln!("{}", message);
            std::process::exit(exit_codes::CONFIG);
        }
    };

    let registry = match Registry::from_config(&config) {
        Ok(registry) => registry,
        Err(e) => {
            let message = ErrorBuilder::new(format!("Failed to set up HTTP client: {}", e))
                .cause("Invalid user_agent in config")
                .fix("Remove user_agent from the config file");
            eprintln!("{}", message);
            std::process::exit(exit_codes::CONFIG);
        }
    };

    for url in &cli.urls {
        registry
            .add(url.clone(), None, None)
            .with_context(|| format!("Failed to add {}", url))?;
    }

    let view = (!cli.quiet && !cli.json).then(|| ProgressView::new(registry.list()));
    registry.start().context("Failed to start downloads")?;

    let interrupt = {
        let registry = registry.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{} Stopping downloads...", "[!]".yellow());
                if let Err(e) = registry.stop() {
                    tracing::debug!(error = %e, "nothing to stop");
                }
            }
        })
    };

    let settled = registry.wait();
    tokio::pin!(settled);
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut settled => break,
            _ = ticker.tick() => {
                if let Some(view) = &view {
                    view.refresh();
                }
            }
        }
    }
    interrupt.abort();
    if let Some(view) = &view {
        view.refresh();
    }

    let snapshots = registry.snapshots();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    } else if !cli.quiet {
        print_summary(&snapshots);
    }

    if let Some(report) = failure_report(&snapshots) {
        eprintln!("\n{}", report);
    }

    let all_finished = snapshots
        .iter()
        .all(|s| s.status == TransferStatus::Finished);
    std::process::exit(if all_finished {
        exit_codes::SUCCESS
    } else {
        exit_codes::ERROR
    });
}
