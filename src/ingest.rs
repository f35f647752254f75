// --- Parallel CSV ingestion stage ---

use std::fs;
use std::mem;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord};
use log::{debug, warn};

use crate::pool::WorkerPool;
use crate::record::{TradeRecord, RECORD_SIZE};

/// Unit of hand-off between parser workers and the collector.
pub type Chunk = Vec<TradeRecord>;

/// Minimum number of fields a data line must carry.
const MIN_FIELDS: usize = 5;

/// Parses input CSVs in parallel and hands the records off as fixed-size
/// chunks over a bounded channel.
///
/// One parse task per file runs on the shared pool. The channel is sized
/// at two chunks per worker, so a stalled consumer blocks the producers
/// instead of growing memory. Dropping the stage's own sender via
/// `close_input` plus the natural drop of every task's sender clone is
/// what terminates `take_chunk`.
pub struct CsvIngest {
    pool: Arc<WorkerPool>,
    tx: Option<flume::Sender<Chunk>>,
    rx: flume::Receiver<Chunk>,
    chunk_cap: usize,
}

impl CsvIngest {
    pub fn new(pool: Arc<WorkerPool>, mem_budget: u64, worker_count: usize) -> Self {
        let workers = worker_count.max(1);
        let chunk_cap = (mem_budget as usize / workers / RECORD_SIZE).max(1);
        let (tx, rx) = flume::bounded(workers * 2);
        Self { pool, tx: Some(tx), rx, chunk_cap }
    }

    /// Records per chunk, derived from the memory budget.
    pub fn chunk_capacity(&self) -> usize {
        self.chunk_cap
    }

    /// Submits a parse task for one CSV file. Non-blocking.
    pub fn enqueue_file(&self, path: &Path) {
        let Some(tx) = self.tx.as_ref().cloned() else {
            warn!("input side already closed, ignoring {}", path.display());
            return;
        };
        let path = path.to_path_buf();
        let chunk_cap = self.chunk_cap;
        self.pool.submit(move || parse_file(&path, chunk_cap, &tx));
    }

    /// Closes the input side. After every in-flight parse task finishes,
    /// `take_chunk` drains the channel and then yields `None`.
    pub fn close_input(&mut self) {
        self.tx.take();
    }

    /// Next parsed chunk, blocking while producers are still running.
    /// `None` once all producers are done and the channel is drained.
    pub fn take_chunk(&self) -> Option<Chunk> {
        self.rx.recv().ok()
    }

    /// Blocks until every submitted parse task has completed.
    pub fn wait_complete(&self) {
        self.pool.wait_quiescent();
    }
}

/// Parses one file into chunks of `chunk_cap` records.
///
/// Malformed lines are logged and skipped, never fatal: lines with fewer
/// than five fields, a non-integer timestamp, or a price that does not
/// parse to a finite float all fall into this bucket.
fn parse_file(path: &Path, chunk_cap: usize, tx: &flume::Sender<Chunk>) -> Result<()> {
    let meta = fs::metadata(path)
        .with_context(|| format!("Failed to stat input file {}", path.display()))?;
    if meta.len() == 0 {
        warn!("skipping empty file {}", path.display());
        return Ok(());
    }

    let mut reader = ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open input file {}", path.display()))?;

    let mut chunk: Chunk = Vec::with_capacity(chunk_cap);
    let mut accepted: u64 = 0;
    let mut record = StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                let line = record.position().map_or(0, |p| p.line());
                match parse_line(&record) {
                    Some(parsed) => {
                        chunk.push(parsed);
                        accepted += 1;
                        if chunk.len() == chunk_cap {
                            let full = mem::replace(&mut chunk, Vec::with_capacity(chunk_cap));
                            if tx.send(full).is_err() {
                                debug!("chunk channel closed, dropping rest of {}", path.display());
                                return Ok(());
                            }
                        }
                    }
                    None => warn!("{}: skipping malformed line {}", path.display(), line),
                }
            }
            Err(err) => warn!("{}: skipping unreadable record: {}", path.display(), err),
        }
    }

    if !chunk.is_empty() && tx.send(chunk).is_err() {
        debug!("chunk channel closed, dropping final chunk of {}", path.display());
    }
    if accepted == 0 {
        warn!("file {} yielded no usable records", path.display());
    } else {
        debug!("parsed {} records from {}", accepted, path.display());
    }
    Ok(())
}

fn parse_line(record: &StringRecord) -> Option<TradeRecord> {
    if record.len() < MIN_FIELDS {
        return None;
    }
    let receive_ts = record.get(0)?.trim().parse::<u64>().ok()?;
    let price = record.get(2)?.trim().parse::<f64>().ok()?;
    if !price.is_finite() {
        return None;
    }
    Some(TradeRecord { receive_ts, price })
}
