mod config;
mod error;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::pipeline::{Pipeline, RunMode, RunSummary};

#[derive(Parser)]
#[command(name = "edsp-scraper", about = "São Paulo school transparency data extractor", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Extract schools from the first listing page(s) only
    Sample {
        /// Listing pages to walk (default: pipeline.sample_pages)
        #[arg(short, long)]
        pages: Option<u32>,

        /// CSV destination (default: results/edsp_schools_<timestamp>.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Extract every school listed
    Run {
        /// Listing pages to walk (default: discovered from page 1)
        #[arg(short, long)]
        pages: Option<u32>,

        /// CSV destination (default: results/edsp_schools_<timestamp>.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "edsp_scraper=info,warn",
        1 => "edsp_scraper=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    let (mode, pages, output) = match cli.command {
        Command::Sample { pages, output } => (RunMode::Sample, pages, output),
        Command::Run { pages, output } => (RunMode::Full, pages, output),
    };

    let summary = {
        let mut timer = utils::Timer::start(match mode {
            RunMode::Sample => "Sample extraction",
            RunMode::Full => "Full extraction",
        });
        let summary = Pipeline::new(config).run(mode, pages, output).await?;
        timer.pages(summary.total);
        summary
    };

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("─────────────────────────────────");
    println!("  EDSP Scraper: Run Summary");
    println!("─────────────────────────────────");
    println!("  Schools    : {}", utils::fmt_count(summary.total));
    println!("  Successful : {}", utils::fmt_count(summary.successful));
    println!("  Failed     : {}", utils::fmt_count(summary.failed));
    println!("  Success    : {:.1}%", summary.success_rate);
    if let Some(n) = summary.total_institutions {
        println!("  Listed     : {}", utils::fmt_count(n as usize));
    }
    if !summary.classifications.is_empty() {
        println!("  Classification:");
        for (class, count) in &summary.classifications {
            println!("    {:<8} : {}", class, utils::fmt_count(*count));
        }
    }
    println!("  Output     : {}", summary.output.display());
    println!("  Size       : {}", utils::fmt_bytes(summary.size_bytes));
    println!("─────────────────────────────────");
}
