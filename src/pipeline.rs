// --- End-to-end pipeline drive ---

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::{debug, info};
use num_format::{Locale, ToFormattedString};

use crate::external_sort::ExternalSorter;
use crate::ingest::CsvIngest;
use crate::median::MedianAggregator;
use crate::pool::WorkerPool;
use crate::record::{by_receive_ts, TradeRecord, TradeSerializer, RECORD_SIZE};

/// Runs the whole pipeline: parse `files` in parallel, sort within the
/// memory budget (spilling to disk when it does not fit), and write the
/// change-compressed running median to `out_path`.
///
/// The chunk drain runs concurrently with parsing, so the bounded chunk
/// channel keeps resident records proportional to the budget instead of
/// the input size.
pub fn run(files: &[PathBuf], out_path: &Path, mem_budget: u64, worker_count: usize) -> Result<()> {
    let t0 = Instant::now();
    let pool = Arc::new(WorkerPool::new(worker_count)?);
    let mut ingest = CsvIngest::new(Arc::clone(&pool), mem_budget, worker_count);

    let max_elements = (mem_budget as usize / RECORD_SIZE).max(1);
    let mut sorter = ExternalSorter::new(
        Arc::clone(&pool),
        max_elements,
        TradeSerializer,
        MedianAggregator::new(),
        by_receive_ts as fn(&TradeRecord, &TradeRecord) -> std::cmp::Ordering,
    );

    info!(
        "parsing {} files ({} records per chunk, {} buffered records max)",
        files.len().to_formatted_string(&Locale::en),
        ingest.chunk_capacity().to_formatted_string(&Locale::en),
        max_elements.to_formatted_string(&Locale::en)
    );
    for file in files {
        ingest.enqueue_file(file);
    }
    ingest.close_input();

    let mut collected: u64 = 0;
    while let Some(chunk) = ingest.take_chunk() {
        collected += chunk.len() as u64;
        sorter.collect(chunk);
    }
    ingest.wait_complete();
    debug!(
        "parse phase done in {:?}, {} records collected",
        t0.elapsed(),
        collected.to_formatted_string(&Locale::en)
    );

    sorter.finalize(out_path)?;
    pool.shutdown();
    info!("pipeline finished in {:?}", t0.elapsed());
    Ok(())
}
