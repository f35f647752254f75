// --- External-sort writer ---
//
// Buffers incoming record chunks up to a memory cap, spills sorted runs
// to disk through the worker pool, k-way merges the runs, and feeds the
// result to an aggregation algorithm. Parameterised over the record
// type, its binary codec, the aggregator, and the sort comparator so the
// component stays reusable beyond the trade pipeline.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use num_format::{Locale, ToFormattedString};

use crate::pool::WorkerPool;
use crate::record::Serializer;

pub mod run_file;

use self::run_file::RunReader;

/// Aggregation algorithm driven by the sorter once all input is in.
///
/// Both entry points receive the same logical sequence; which one runs
/// depends on whether the input fit in memory.
pub trait Aggregator<T> {
    fn process_in_memory(&mut self, sorted: Vec<T>, out_path: &Path) -> Result<()>;

    fn process_stream<I>(&mut self, sorted: I, out_path: &Path) -> Result<()>
    where
        I: IntoIterator<Item = io::Result<T>>;
}

pub struct ExternalSorter<T, S, A, F> {
    pool: Arc<WorkerPool>,
    serializer: Arc<S>,
    aggregator: A,
    compare: F,
    buffer: Vec<T>,
    max_elements: usize,
    run_files: Arc<Mutex<Vec<PathBuf>>>,
    run_dir: PathBuf,
}

impl<T, S, A, F> ExternalSorter<T, S, A, F>
where
    T: Send + 'static,
    S: Serializer<T> + 'static,
    A: Aggregator<T>,
    F: Fn(&T, &T) -> Ordering,
{
    /// `max_elements` is the buffer capacity in records. Run files land in
    /// the process working directory unless `with_run_dir` overrides it.
    pub fn new(pool: Arc<WorkerPool>, max_elements: usize, serializer: S, aggregator: A, compare: F) -> Self {
        Self {
            pool,
            serializer: Arc::new(serializer),
            aggregator,
            compare,
            buffer: Vec::new(),
            max_elements: max_elements.max(1),
            run_files: Arc::new(Mutex::new(Vec::new())),
            run_dir: PathBuf::from("."),
        }
    }

    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = dir.into();
        self
    }

    /// Records currently held in the in-memory buffer.
    pub fn buffered_records(&self) -> usize {
        self.buffer.len()
    }

    /// Absorbs a chunk. Whenever the buffer reaches capacity it is sorted
    /// and handed to a flush task, so the buffer never exceeds
    /// `max_elements` regardless of chunk size.
    pub fn collect(&mut self, chunk: Vec<T>) {
        let mut chunk = chunk;
        loop {
            let free = self.max_elements - self.buffer.len();
            if chunk.len() <= free {
                self.buffer.append(&mut chunk);
                return;
            }
            let rest = chunk.split_off(free);
            self.buffer.append(&mut chunk);
            self.spill_buffer();
            chunk = rest;
        }
    }

    fn spill_buffer(&mut self) {
        self.buffer.sort_unstable_by(|a, b| (self.compare)(a, b));
        let run = mem::replace(&mut self.buffer, Vec::with_capacity(self.max_elements));
        let path = run_file::next_run_path(&self.run_dir);
        let serializer = Arc::clone(&self.serializer);
        let run_files = Arc::clone(&self.run_files);
        self.pool.submit(move || {
            match run_file::write_run(&path, &run, serializer.as_ref()) {
                Ok(()) => {
                    debug!("created run file {} ({} records)", path.display(), run.len());
                    run_files.lock().unwrap().push(path);
                    Ok(())
                }
                Err(err) => {
                    // A failed flush loses that run's records, not the job.
                    let _ = std::fs::remove_file(&path);
                    Err(err)
                }
            }
        });
    }

    /// Closes the input side and drives the aggregation.
    ///
    /// With no spilled runs the buffer is sorted and processed in memory.
    /// Otherwise the remaining buffer becomes the final run, every run is
    /// merged into a single sorted file, and the aggregator consumes that
    /// stream. Returns the aggregator so callers can inspect it.
    pub fn finalize(mut self, out_path: &Path) -> Result<A> {
        self.pool.wait_quiescent();

        if self.run_files.lock().unwrap().is_empty() {
            if self.buffer.is_empty() {
                warn!("no records collected, nothing to aggregate");
                return Ok(self.aggregator);
            }
            info!(
                "in-memory model chosen ({} records)",
                self.buffer.len().to_formatted_string(&Locale::en)
            );
            let mut data = mem::take(&mut self.buffer);
            data.sort_unstable_by(|a, b| (self.compare)(a, b));
            self.aggregator.process_in_memory(data, out_path)?;
            return Ok(self.aggregator);
        }

        info!("external-merge model chosen");
        if !self.buffer.is_empty() {
            // The pool is already drained, so the last run is written
            // inline rather than queued; merge must see a complete list.
            let mut last = mem::take(&mut self.buffer);
            last.sort_unstable_by(|a, b| (self.compare)(a, b));
            let path = run_file::next_run_path(&self.run_dir);
            match run_file::write_run(&path, &last, self.serializer.as_ref()) {
                Ok(()) => {
                    debug!("created final run file {} ({} records)", path.display(), last.len());
                    self.run_files.lock().unwrap().push(path);
                }
                Err(err) => {
                    error!("failed to write final run: {:#}", err);
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        let runs = mem::take(&mut *self.run_files.lock().unwrap());
        let merged = merge_runs(&runs, &self.serializer, &self.compare, run_file::next_run_path(&self.run_dir))?;
        let Some(merged_path) = merged else {
            warn!("all run files were empty or unreadable, nothing to aggregate");
            return Ok(self.aggregator);
        };

        let reader = RunReader::open(&merged_path, Arc::clone(&self.serializer))
            .with_context(|| format!("Failed to open merged run {}", merged_path.display()))?;
        let outcome = self.aggregator.process_stream(reader, out_path);
        match std::fs::remove_file(&merged_path) {
            Ok(()) => debug!("removed merged run {}", merged_path.display()),
            Err(err) => warn!("failed to remove merged run {}: {}", merged_path.display(), err),
        }
        outcome?;
        Ok(self.aggregator)
    }
}

// --- K-way merge over run files ---

struct HeapEntry<'a, T, F> {
    record: T,
    source: usize,
    compare: &'a F,
}

impl<T, F: Fn(&T, &T) -> Ordering> Ord for HeapEntry<'_, T, F> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the std max-heap pops the smallest record first.
        (self.compare)(&self.record, &other.record).reverse()
    }
}

impl<T, F: Fn(&T, &T) -> Ordering> PartialOrd for HeapEntry<'_, T, F> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, F: Fn(&T, &T) -> Ordering> PartialEq for HeapEntry<'_, T, F> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, F: Fn(&T, &T) -> Ordering> Eq for HeapEntry<'_, T, F> {}

/// Merges sorted runs into a single run at `out_path`. Empty or
/// unreadable inputs are skipped; every input is unlinked afterwards.
/// Returns `None` when no input had any records.
fn merge_runs<T, S, F>(runs: &[PathBuf], serializer: &Arc<S>, compare: &F, out_path: PathBuf) -> Result<Option<PathBuf>>
where
    S: Serializer<T>,
    F: Fn(&T, &T) -> Ordering,
{
    let t0 = Instant::now();
    info!("Merging {} run files", runs.len().to_formatted_string(&Locale::en));

    let mut streams = Vec::with_capacity(runs.len());
    for path in runs {
        match RunReader::open(path, Arc::clone(serializer)) {
            Ok(reader) if reader.remaining() > 0 => streams.push(reader),
            Ok(_) => debug!("skipping empty run {}", path.display()),
            Err(err) => error!("skipping unreadable run {}: {:#}", path.display(), err),
        }
    }
    if streams.is_empty() {
        remove_run_files(runs);
        return Ok(None);
    }

    let file = File::create(&out_path)
        .with_context(|| format!("Failed to create merged run {}", out_path.display()))?;
    let mut sink = BufWriter::new(file);
    // Placeholder count, back-patched once the heap drains.
    sink.write_all(&0u64.to_le_bytes())?;

    let mut heap = BinaryHeap::with_capacity(streams.len());
    for (source, stream) in streams.iter_mut().enumerate() {
        if let Some(record) = next_record(stream, source) {
            heap.push(HeapEntry { record, source, compare });
        }
    }

    let mut total: u64 = 0;
    while let Some(entry) = heap.pop() {
        serializer.write(&mut sink, &entry.record)?;
        total += 1;
        let source = entry.source;
        if let Some(record) = next_record(&mut streams[source], source) {
            heap.push(HeapEntry { record, source, compare });
        }
    }

    sink.flush()?;
    let mut file = sink.into_inner().map_err(|err| err.into_error())?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&total.to_le_bytes())?;

    remove_run_files(runs);
    debug!(
        "merged {} records into {} in {:?}",
        total.to_formatted_string(&Locale::en),
        out_path.display(),
        t0.elapsed()
    );
    Ok(Some(out_path))
}

fn next_record<T, S: Serializer<T>>(stream: &mut RunReader<T, S>, source: usize) -> Option<T> {
    match stream.next() {
        Some(Ok(record)) => Some(record),
        Some(Err(err)) => {
            // Treat the rest of a corrupt run as exhausted.
            error!("read error in run stream {}: {}", source, err);
            None
        }
        None => None,
    }
}

fn remove_run_files(runs: &[PathBuf]) {
    for path in runs {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed run file {}", path.display()),
            Err(err) => warn!("failed to remove run file {}: {}", path.display(), err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    // A deliberately non-trade record type: the sorter must not care.
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct TestItem {
        id: u32,
        key: i32,
    }

    struct TestItemCodec;

    impl Serializer<TestItem> for TestItemCodec {
        fn write<W: Write + ?Sized>(&self, sink: &mut W, value: &TestItem) -> io::Result<()> {
            sink.write_all(&value.id.to_le_bytes())?;
            sink.write_all(&value.key.to_le_bytes())
        }

        fn read<R: Read + ?Sized>(&self, source: &mut R) -> io::Result<TestItem> {
            let mut id = [0u8; 4];
            let mut key = [0u8; 4];
            source.read_exact(&mut id)?;
            source.read_exact(&mut key)?;
            Ok(TestItem { id: u32::from_le_bytes(id), key: i32::from_le_bytes(key) })
        }
    }

    fn by_key(a: &TestItem, b: &TestItem) -> Ordering {
        a.key.cmp(&b.key)
    }

    #[derive(Default)]
    struct CollectingAggregator {
        in_memory: Vec<TestItem>,
        streamed: Vec<TestItem>,
    }

    impl Aggregator<TestItem> for CollectingAggregator {
        fn process_in_memory(&mut self, sorted: Vec<TestItem>, _out_path: &Path) -> Result<()> {
            self.in_memory = sorted;
            Ok(())
        }

        fn process_stream<I>(&mut self, sorted: I, _out_path: &Path) -> Result<()>
        where
            I: IntoIterator<Item = io::Result<TestItem>>,
        {
            for item in sorted {
                self.streamed.push(item?);
            }
            Ok(())
        }
    }

    fn items(keys: &[i32]) -> Vec<TestItem> {
        keys.iter()
            .enumerate()
            .map(|(i, &key)| TestItem { id: i as u32, key })
            .collect()
    }

    fn is_sorted_by_key(data: &[TestItem]) -> bool {
        data.windows(2).all(|w| w[0].key <= w[1].key)
    }

    fn run_files_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "bin"))
            .collect()
    }

    fn sorter(
        max_elements: usize,
        run_dir: &Path,
    ) -> ExternalSorter<TestItem, TestItemCodec, CollectingAggregator, fn(&TestItem, &TestItem) -> Ordering> {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        ExternalSorter::new(
            pool,
            max_elements,
            TestItemCodec,
            CollectingAggregator::default(),
            by_key as fn(&TestItem, &TestItem) -> Ordering,
        )
        .with_run_dir(run_dir)
    }

    #[test]
    fn in_memory_mode_sorts_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = sorter(10, dir.path());
        writer.collect(items(&[5, 3, 7]));
        writer.collect(items(&[1, 9, 2]));
        writer.collect(items(&[4, 6, 8]));

        let agg = writer.finalize(Path::new("unused.txt")).unwrap();
        assert_eq!(agg.in_memory.len(), 9);
        assert!(is_sorted_by_key(&agg.in_memory));
        assert!(agg.streamed.is_empty());
        assert!(run_files_in(dir.path()).is_empty());
    }

    #[test]
    fn external_mode_merges_all_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = sorter(10, dir.path());
        writer.collect(items(&[9, 8, 7, 6, 5, 4]));
        writer.collect(items(&[15, 14, 13, 12, 11, 10]));
        writer.collect(items(&[3, 2, 1, 0, -1, -2]));

        let agg = writer.finalize(Path::new("unused.txt")).unwrap();
        assert!(agg.in_memory.is_empty());
        assert_eq!(agg.streamed.len(), 18);
        assert!(is_sorted_by_key(&agg.streamed));
        assert!(run_files_in(dir.path()).is_empty(), "all run files must be unlinked");
    }

    #[test]
    fn buffer_never_exceeds_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = sorter(4, dir.path());
        for batch in [&[1, 2, 3][..], &[4, 5, 6, 7, 8, 9, 10, 11, 12][..], &[13][..]] {
            writer.collect(items(batch));
            assert!(writer.buffered_records() <= 4);
        }
        let agg = writer.finalize(Path::new("unused.txt")).unwrap();
        assert_eq!(agg.streamed.len(), 13);
        assert!(is_sorted_by_key(&agg.streamed));
    }

    #[test]
    fn runs_are_created_while_spilling() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let mut writer = ExternalSorter::new(
            Arc::clone(&pool),
            3,
            TestItemCodec,
            CollectingAggregator::default(),
            by_key as fn(&TestItem, &TestItem) -> Ordering,
        )
        .with_run_dir(dir.path());
        writer.collect(items(&[6, 5, 4, 3, 2, 1, 0]));
        pool.wait_quiescent();
        assert!(!run_files_in(dir.path()).is_empty(), "spill must produce run files");

        let agg = writer.finalize(Path::new("unused.txt")).unwrap();
        assert_eq!(agg.streamed.len(), 7);
        assert!(run_files_in(dir.path()).is_empty());
    }

    #[test]
    fn failed_spill_degrades_to_remaining_data() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does_not_exist");
        let mut writer = sorter(3, &missing);
        writer.collect(items(&[5, 4, 3, 2]));

        // The spilled run was lost, the remainder is still aggregated.
        let agg = writer.finalize(Path::new("unused.txt")).unwrap();
        assert_eq!(agg.in_memory.len(), 1);
        assert_eq!(agg.in_memory[0].key, 2);
    }

    #[test]
    fn finalize_without_data_produces_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = sorter(8, dir.path());
        let agg = writer.finalize(Path::new("unused.txt")).unwrap();
        assert!(agg.in_memory.is_empty());
        assert!(agg.streamed.is_empty());
    }

    #[test]
    fn merged_run_header_matches_body() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = Arc::new(TestItemCodec);
        let mut sorted_a = items(&[1, 3, 5]);
        let mut sorted_b = items(&[2, 4, 6]);
        sorted_a.sort_unstable_by(by_key);
        sorted_b.sort_unstable_by(by_key);

        let run_a = run_file::next_run_path(dir.path());
        let run_b = run_file::next_run_path(dir.path());
        run_file::write_run(&run_a, &sorted_a, serializer.as_ref()).unwrap();
        run_file::write_run(&run_b, &sorted_b, serializer.as_ref()).unwrap();

        let merged = merge_runs(
            &[run_a.clone(), run_b.clone()],
            &serializer,
            &(by_key as fn(&TestItem, &TestItem) -> Ordering),
            run_file::next_run_path(dir.path()),
        )
        .unwrap()
        .expect("merge must produce a file");

        let reader = RunReader::open(&merged, Arc::clone(&serializer)).unwrap();
        assert_eq!(reader.remaining(), 6);
        let merged_items: Vec<TestItem> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(merged_items.len(), 6);
        assert!(is_sorted_by_key(&merged_items));
        assert!(!run_a.exists());
        assert!(!run_b.exists());
    }

    #[test]
    fn merge_of_empty_runs_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = Arc::new(TestItemCodec);
        let run = run_file::next_run_path(dir.path());
        run_file::write_run::<TestItem, _>(&run, &[], serializer.as_ref()).unwrap();

        let merged = merge_runs(
            &[run.clone()],
            &serializer,
            &(by_key as fn(&TestItem, &TestItem) -> Ordering),
            run_file::next_run_path(dir.path()),
        )
        .unwrap();
        assert!(merged.is_none());
        assert!(!run.exists());
    }
}
