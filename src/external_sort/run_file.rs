// --- Binary run files ---
//
// A run is a sorted sequence of records persisted as `<count: u64 LE>`
// followed by `count` fixed-width entries. Files are uniquely named from
// a process-wide counter so runs from concurrent sorters never collide.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::record::Serializer;

const RUN_FILE_STAMP: &str = "binary_data_12345678";

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Reserves a fresh, unique run-file path under `dir`.
pub fn next_run_path(dir: &Path) -> PathBuf {
    let n = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("{}_{}.bin", RUN_FILE_STAMP, n))
}

/// Writes a complete run: count header, then every record in order.
pub fn write_run<T, S>(path: &Path, records: &[T], serializer: &S) -> Result<()>
where
    S: Serializer<T>,
{
    let file = File::create(path)
        .with_context(|| format!("Failed to create run file {}", path.display()))?;
    let mut sink = BufWriter::new(file);
    sink.write_all(&(records.len() as u64).to_le_bytes())?;
    for record in records {
        serializer.write(&mut sink, record)?;
    }
    sink.flush()
        .with_context(|| format!("Failed to flush run file {}", path.display()))
}

/// Sequential reader over one run file.
///
/// The element count comes from the header, so the iterator ends exactly
/// where the writer said the run does; trailing garbage is never read.
pub struct RunReader<T, S> {
    source: BufReader<File>,
    remaining: u64,
    serializer: Arc<S>,
    _record: PhantomData<fn() -> T>,
}

impl<T, S: Serializer<T>> RunReader<T, S> {
    pub fn open(path: &Path, serializer: Arc<S>) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open run file {}", path.display()))?;
        let mut source = BufReader::new(file);
        let mut header = [0u8; 8];
        source
            .read_exact(&mut header)
            .with_context(|| format!("Failed to read run header of {}", path.display()))?;
        Ok(Self {
            source,
            remaining: u64::from_le_bytes(header),
            serializer,
            _record: PhantomData,
        })
    }

    /// Records left to read according to the header.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<T, S: Serializer<T>> Iterator for RunReader<T, S> {
    type Item = io::Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.serializer.read(&mut self.source))
    }
}
