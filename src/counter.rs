use crate::config::CounterConfig;
use crate::error::{Error, Result};
use crate::hash::murmur3_32;
use crate::partition::partition_records_as_bytes;

use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::thread;

/// Size of one captured record
pub const RECORD_LEN: usize = 16;
/// The hashed key is the second half of the record
pub const KEY_OFFSET: usize = 8;
pub const KEY_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterParams {
    pub cardinality: usize,
    pub record_len: usize,
    pub key_offset: usize,
    pub key_len: usize,
    /// Size of a single read
    pub block_size: usize,
}

impl Default for CounterParams {
    fn default() -> Self {
        CounterParams {
            cardinality: 4096,
            record_len: RECORD_LEN,
            key_offset: KEY_OFFSET,
            key_len: KEY_LEN,
            block_size: 4096,
        }
    }
}

impl CounterParams {
    pub fn new(config: &CounterConfig) -> Result<Self> {
        let params = CounterParams {
            cardinality: config.cardinality,
            block_size: config.block_size,
            ..CounterParams::default()
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.cardinality.is_power_of_two() {
            return Err(Error::Config(format!(
                "counter cardinality must be a power of two, not {}",
                self.cardinality
            )));
        }
        if self.record_len == 0 || self.key_offset + self.key_len > self.record_len {
            return Err(Error::Config(format!(
                "key [{}, {}) does not fit in a {}-byte record",
                self.key_offset,
                self.key_offset + self.key_len,
                self.record_len
            )));
        }
        if self.block_size < self.record_len {
            return Err(Error::Config(format!(
                "block size ({}) must hold at least one record ({} bytes)",
                self.block_size, self.record_len
            )));
        }
        Ok(())
    }
}

/// Per-bucket frequency of the record keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterTable {
    counts: Vec<u32>,
}

impl CounterTable {
    /// `cardinality` must be a power of two
    pub fn new(cardinality: usize) -> Self {
        debug_assert!(cardinality.is_power_of_two());
        CounterTable {
            counts: vec![0; cardinality],
        }
    }

    #[inline]
    pub fn increment(&mut self, hash: u32) {
        let mask = self.counts.len() - 1;
        let bucket = &mut self.counts[hash as usize & mask];
        *bucket = bucket.wrapping_add(1);
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    pub fn cardinality(&self) -> usize {
        self.counts.len()
    }

    pub fn sum(&self) -> u64 {
        self.counts.iter().map(|c| u64::from(*c)).sum()
    }

    /// Add the counts of a table of the same cardinality
    pub fn merge(&mut self, other: &CounterTable) {
        debug_assert_eq!(self.counts.len(), other.counts.len());
        for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a = a.wrapping_add(*b);
        }
    }

    /// The snapshot format: `cardinality` little-endian u32
    pub fn to_bytes(&self) -> Vec<u8> {
        self.counts.iter().flat_map(|c| c.to_le_bytes()).collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
        file.write_all(&self.to_bytes())
            .map_err(|e| Error::io(path, e))?;
        log::debug!("Table saved into {}", path.display());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountReport {
    pub table: CounterTable,
    /// Records actually hashed
    pub processed: u64,
    /// Records the file should contain according to its size
    pub expected: u64,
    pub lost: u64,
    /// Bytes at the end of the input that do not form a whole record
    pub trailing_bytes: u64,
}

impl CountReport {
    fn new(table: CounterTable, processed: u64, expected: u64, trailing_bytes: u64) -> Self {
        CountReport {
            table,
            processed,
            expected,
            lost: expected.saturating_sub(processed),
            trailing_bytes,
        }
    }

    pub fn log(&self, input: &Path) {
        log::info!(
            "{}: {} records processed out of {}",
            input.display(),
            self.processed,
            self.expected
        );
        if self.lost > 0 {
            log::warn!("{}: {} records lost", input.display(), self.lost);
        }
        if self.trailing_bytes > 0 {
            log::warn!(
                "{}: {} trailing bytes ignored",
                input.display(),
                self.trailing_bytes
            );
        }
    }
}

/// Hash every record of `reader` into `table`.
///
/// The input is read by blocks of `block_size` bytes. A record cut by the end of a read is moved
/// to the front of the buffer and completed by the next read, so no record is ever hashed
/// partially, whatever the read sizes. Returns the number of records hashed and the number of
/// leftover bytes at end of input.
pub fn count_reader<R: Read>(
    mut reader: R,
    seed: u32,
    params: &CounterParams,
    table: &mut CounterTable,
) -> io::Result<(u64, usize)> {
    let mut buf = vec![0u8; params.block_size];
    let mut carry = 0;
    let mut processed = 0;
    let key = params.key_offset..params.key_offset + params.key_len;

    loop {
        let n = match reader.read(&mut buf[carry..]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let available = carry + n;
        let whole = available - available % params.record_len;
        for record in buf[..whole].chunks_exact(params.record_len) {
            table.increment(murmur3_32(&record[key.clone()], seed));
            processed += 1;
        }
        buf.copy_within(whole..available, 0);
        carry = available - whole;
    }
    Ok((processed, carry))
}

/// Count an in-memory capture
pub fn count_bytes(bytes: &[u8], seed: u32, params: &CounterParams) -> CountReport {
    let mut table = CounterTable::new(params.cardinality);
    // reading from a slice never fails
    let (processed, trailing) = count_reader(bytes, seed, params, &mut table).unwrap_or((0, 0));
    let expected = (bytes.len() / params.record_len) as u64;
    CountReport::new(table, processed, expected, trailing as u64)
}

/// Count one byte range of a file
fn count_range(
    path: &Path,
    range: Range<u64>,
    seed: u32,
    params: &CounterParams,
) -> io::Result<(CounterTable, u64)> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(range.start))?;
    let mut table = CounterTable::new(params.cardinality);
    let (processed, _) = count_reader(
        file.take(range.end - range.start),
        seed,
        params,
        &mut table,
    )?;
    Ok((table, processed))
}

/// Count a capture file.
///
/// With several jobs, the file is split into ranges of whole records, each counted by its own
/// thread, and the partial tables are summed. The result does not depend on the number of jobs.
pub fn count_file(
    path: impl AsRef<Path>,
    seed: u32,
    jobs: usize,
    params: &CounterParams,
) -> Result<CountReport> {
    let path = path.as_ref();
    params.validate()?;
    let file_len = fs::metadata(path).map_err(|e| Error::io(path, e))?.len();
    let expected = file_len / params.record_len as u64;

    if jobs <= 1 {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut table = CounterTable::new(params.cardinality);
        let (processed, trailing) =
            count_reader(file, seed, params, &mut table).map_err(|e| Error::io(path, e))?;
        return Ok(CountReport::new(table, processed, expected, trailing as u64));
    }

    let ranges = partition_records_as_bytes(file_len, params.record_len, jobs)?;
    log::debug!("Counting {} with {} jobs", path.display(), ranges.len());
    let partials: Vec<io::Result<(CounterTable, u64)>> = thread::scope(|s| {
        let handles: Vec<_> = ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_empty())
            .map(|(i, r)| {
                let range = r.start as u64..r.end() as u64;
                thread::Builder::new()
                    .name(format!("count-{i}"))
                    .spawn_scoped(s, move || count_range(path, range, seed, params))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h {
                Ok(h) => h
                    .join()
                    .unwrap_or_else(|_| Err(io::Error::other("counting thread panicked"))),
                Err(e) => Err(e),
            })
            .collect()
    });

    let mut table = CounterTable::new(params.cardinality);
    let mut processed = 0;
    for partial in partials {
        let (t, p) = partial.map_err(|e| Error::io(path, e))?;
        table.merge(&t);
        processed += p;
    }
    let trailing = file_len % params.record_len as u64;
    Ok(CountReport::new(table, processed, expected, trailing))
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.green} Counting [{wide_bar}] {pos}/{len} ({eta})")
    {
        pb.set_style(
            style.with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
                let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
            }),
        );
    }
    pb
}

/// Where the table of `seed` is written in batch mode
pub fn seed_table_path(out_dir: &Path, seed: u32) -> PathBuf {
    out_dir.join(format!("{seed}.bin"))
}

/// Produce one table per seed of `seeds`, written as `<out_dir>/<seed>.bin`.
///
/// Seeds are handed out to `jobs` threads, and each seed streams the capture from disk again, so
/// memory does not grow with the capture. Returns the number of tables written.
pub fn count_seed_range(
    path: impl AsRef<Path>,
    seeds: Range<u32>,
    out_dir: impl AsRef<Path>,
    jobs: usize,
    params: &CounterParams,
) -> Result<usize> {
    let path = path.as_ref();
    let out_dir = out_dir.as_ref();
    params.validate()?;
    if seeds.is_empty() {
        return Err(Error::Config(format!(
            "empty seed range [{}, {})",
            seeds.start, seeds.end
        )));
    }
    fs::create_dir_all(out_dir).map_err(|e| {
        Error::Setup(format!(
            "cannot create output directory {}: {e}",
            out_dir.display()
        ))
    })?;
    let file_len = fs::metadata(path).map_err(|e| Error::io(path, e))?.len();
    log::info!(
        "Counting {} records of {} for seeds {} to {}",
        file_len / params.record_len as u64,
        path.display(),
        seeds.start,
        seeds.end - 1
    );

    let (tx_seed, rx_seed) = crossbeam_channel::unbounded::<u32>();
    for seed in seeds.clone() {
        // the receiver is alive, so this cannot fail
        let _ = tx_seed.send(seed);
    }
    drop(tx_seed);

    let pb = progress_bar(seeds.len() as u64);
    let jobs = jobs.clamp(1, seeds.len());
    let results: Vec<Result<usize>> = thread::scope(|s| {
        let handles: Vec<_> = (0..jobs)
            .map(|i| {
                let rx_seed = rx_seed.clone();
                let pb = pb.clone();
                thread::Builder::new()
                    .name(format!("count-{i}"))
                    .spawn_scoped(s, move || -> Result<usize> {
                        let mut written = 0;
                        for seed in rx_seed.iter() {
                            let report = count_file(path, seed, 1, params)?;
                            if report.lost > 0 {
                                log::warn!("Seed {seed}: {} records lost", report.lost);
                            }
                            report.table.save(seed_table_path(out_dir, seed))?;
                            written += 1;
                            pb.inc(1);
                        }
                        Ok(written)
                    })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h {
                Ok(h) => h
                    .join()
                    .unwrap_or_else(|_| Err(Error::Setup("counting thread panicked".into()))),
                Err(e) => Err(Error::Setup(format!("cannot spawn counting thread: {e}"))),
            })
            .collect()
    });
    pb.finish();

    let mut written = 0;
    for r in results {
        written += r?;
    }
    log::info!("{written} tables written into {}", out_dir.display());
    Ok(written)
}
