// --- Running median with change-only output ---

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use csv::WriterBuilder;
use log::error;

use crate::external_sort::Aggregator;
use crate::record::TradeRecord;

/// Median change below this threshold is not worth an output row.
pub const MEDIAN_EPSILON: f64 = 1e-8;

const OUTPUT_HEADER: [&str; 2] = ["receive_ts", "price_median"];

/// Total-order wrapper so finite prices can live in a `BinaryHeap`.
#[derive(Debug, Clone, Copy)]
struct OrdPrice(f64);

impl PartialEq for OrdPrice {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for OrdPrice {}

impl PartialOrd for OrdPrice {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdPrice {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Classic two-heap running median: a max-heap with the lower half and a
/// min-heap with the upper half, rebalanced so the lower half holds the
/// extra element when the count is odd. Insert and read are `O(log n)`.
#[derive(Debug, Default)]
pub struct RunningMedian {
    lower: BinaryHeap<OrdPrice>,
    upper: BinaryHeap<Reverse<OrdPrice>>,
}

impl RunningMedian {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, price: f64) {
        match self.lower.peek() {
            Some(top) if price > top.0 => self.upper.push(Reverse(OrdPrice(price))),
            _ => self.lower.push(OrdPrice(price)),
        }
        if self.lower.len() > self.upper.len() + 1 {
            if let Some(top) = self.lower.pop() {
                self.upper.push(Reverse(top));
            }
        } else if self.upper.len() > self.lower.len() {
            if let Some(Reverse(top)) = self.upper.pop() {
                self.lower.push(top);
            }
        }
    }

    /// Median of everything inserted so far, `None` before the first insert.
    pub fn current(&self) -> Option<f64> {
        if self.lower.len() > self.upper.len() {
            return self.lower.peek().map(|p| p.0);
        }
        match (self.lower.peek(), self.upper.peek()) {
            (Some(low), Some(Reverse(high))) => Some((low.0 + high.0) / 2.0),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len() + self.upper.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes the change-compressed median series for a timestamp-sorted
/// record sequence.
struct ChangeEmitter {
    writer: csv::Writer<File>,
    median: RunningMedian,
    last_emitted: f64,
    emitted_any: bool,
    epsilon: f64,
}

impl ChangeEmitter {
    fn create(out_path: &Path, epsilon: f64) -> Result<Self> {
        if let Some(parent) = out_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create output directory {}", parent.display()))?;
            }
        }
        let mut writer = WriterBuilder::new()
            .delimiter(b';')
            .from_path(out_path)
            .with_context(|| format!("Failed to create output file {}", out_path.display()))?;
        writer
            .write_record(OUTPUT_HEADER)
            .context("Failed to write output header")?;
        Ok(Self {
            writer,
            median: RunningMedian::new(),
            last_emitted: 0.0,
            emitted_any: false,
            epsilon,
        })
    }

    fn observe(&mut self, record: &TradeRecord) -> Result<()> {
        self.median.insert(record.price);
        let Some(current) = self.median.current() else {
            return Ok(());
        };
        if !self.emitted_any || (current - self.last_emitted).abs() > self.epsilon {
            self.writer
                .write_record([record.receive_ts.to_string(), format!("{:.8}", current)])
                .context("Failed to write output row")?;
            self.last_emitted = current;
            self.emitted_any = true;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush output file")
    }
}

/// Aggregator producing the `receive_ts;price_median` output CSV.
#[derive(Debug, Clone)]
pub struct MedianAggregator {
    epsilon: f64,
}

impl MedianAggregator {
    pub fn new() -> Self {
        Self { epsilon: MEDIAN_EPSILON }
    }
}

impl Default for MedianAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator<TradeRecord> for MedianAggregator {
    fn process_in_memory(&mut self, sorted: Vec<TradeRecord>, out_path: &Path) -> Result<()> {
        let mut emitter = ChangeEmitter::create(out_path, self.epsilon)?;
        for record in &sorted {
            emitter.observe(record)?;
        }
        emitter.finish()
    }

    fn process_stream<I>(&mut self, sorted: I, out_path: &Path) -> Result<()>
    where
        I: IntoIterator<Item = io::Result<TradeRecord>>,
    {
        let mut emitter = ChangeEmitter::create(out_path, self.epsilon)?;
        for item in sorted {
            match item {
                Ok(record) => emitter.observe(&record)?,
                Err(err) => {
                    // Keep what was aggregated so far.
                    error!("read error in sorted stream: {}", err);
                    break;
                }
            }
        }
        emitter.finish()
    }
}
