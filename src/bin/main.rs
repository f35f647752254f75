use anyhow::{Context, Result};
use clap::Parser;
use humansize::{format_size, DECIMAL};
use log::{info, warn};
use num_format::{Locale, ToFormattedString};
use std::path::PathBuf;
use std::time::Instant;

use trade_median::config::{find_input_files, Config};
use trade_median::pipeline;

/// A tool for computing the running median of trade prices across large
/// CSV files with parallel parsing and external sorting
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, visible_alias = "cfg", default_value = "./config.toml")]
    config: PathBuf,

    /// Memory budget in bytes for buffered records
    #[arg(long, default_value_t = 524_288_000)]
    max_memory: u64,

    /// Number of worker threads
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
    max_thread: u32,
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let workers = cli.max_thread as usize;
    let cpus = num_cpus::get();
    if workers > cpus {
        warn!("{} worker threads requested on a {}-cpu machine", workers, cpus);
    }

    let cfg = Config::load(&cli.config)?;
    let files = find_input_files(&cfg).context("Failed to enumerate input files")?;
    info!(
        "processing {} input files from {} with {} workers, memory budget {}",
        files.len().to_formatted_string(&Locale::en),
        cfg.main.input.display(),
        workers,
        format_size(cli.max_memory, DECIMAL)
    );

    let out_path = cfg.main.output.join("output.csv");
    let t0 = Instant::now();
    pipeline::run(&files, &out_path, cli.max_memory, workers)?;
    info!("done in {:.2?}, output at {}", t0.elapsed(), out_path.display());
    Ok(())
}
