use anyhow::{Context, Result};
use chrono::Utc;
use humansize::{format_size, DECIMAL};
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

const INSTRUMENTS: &[&str] = &["AAPL", "MSFT", "GOOG", "AMZN", "TSLA", "NVDA"];

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: {} <rows_per_file> [num_files]", args[0]);
        std::process::exit(1);
    }
    let rows_per_file: usize = args[1]
        .parse()
        .expect("Please provide a valid number for rows_per_file");
    let num_files: usize = args
        .get(2)
        .map(|v| v.parse().expect("Please provide a valid number for num_files"))
        .unwrap_or(2);

    println!(
        "🚀 Starting to generate {} trade CSV files ({} rows each)",
        num_files, rows_per_file
    );

    let output_dir = "trade_files";
    std::fs::create_dir_all(output_dir).context("Failed to create output directory")?;

    let mut total_bytes = 0u64;
    for i in 0..num_files {
        let path = format!("{}/trades_{}.csv", output_dir, i + 1);
        // Offset the timestamp ranges so files overlap but are not equal.
        let ts_base = Utc::now().timestamp_millis() as u64 + (i as u64) * (rows_per_file as u64 / 2);
        generate_trade_csv(&path, rows_per_file, ts_base)
            .with_context(|| format!("Failed to generate {}", path))?;
        total_bytes += std::fs::metadata(&path)?.len();
    }

    println!(
        "\n✅ Generated {} files in '{}' ({})",
        num_files,
        output_dir,
        format_size(total_bytes, DECIMAL)
    );
    Ok(())
}

fn generate_trade_csv(file_path: &str, rows: usize, ts_base: u64) -> Result<()> {
    println!("\n📝 Generating: {} ({} rows)", file_path, rows);

    let start_time = Instant::now();
    let file = File::create(file_path)?;
    let mut writer = BufWriter::with_capacity(16 * 1024 * 1024, file);

    writer.write_all(b"receive_ts;instrument;price;qty;side\n")?;

    // Shuffled timestamps so the input is deliberately unsorted.
    let mut timestamps: Vec<u64> = (0..rows as u64).map(|n| ts_base + n).collect();
    let mut rng = rand::rng();
    timestamps.shuffle(&mut rng);

    let batch_size = 200_000;
    let mut records_written = 0;
    for batch in timestamps.chunks(batch_size) {
        let batch_lines: Vec<String> = batch
            .par_iter()
            .map(|&receive_ts| {
                let mut rng = rand::rng();
                let instrument = INSTRUMENTS[rng.random_range(0..INSTRUMENTS.len())];
                let price: f64 = rng.random_range(10.0..500.0);
                let qty: u32 = rng.random_range(1..1_000);
                let side = if rng.random_range(0..2) == 0 { "B" } else { "S" };
                format!("{};{};{:.4};{};{}", receive_ts, instrument, price, qty, side)
            })
            .collect();
        let batch_str = batch_lines.join("\n");
        writer.write_all(batch_str.as_bytes())?;
        writer.write_all(b"\n")?;
        records_written += batch_lines.len();
    }
    writer.flush()?;
    let elapsed = start_time.elapsed();
    println!("   -> Done: {} rows in {:.2?}", records_written, elapsed);
    Ok(())
}
