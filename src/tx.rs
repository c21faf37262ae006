use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::packet::PacketBuilder;
use crate::partition::partition;
use crate::stats::{self, StatsSnapshot, WorkerStats};
use crate::structs::*;
use crate::utils::pin_if_requested;

use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A batched transmit primitive.
///
/// `Ok(n)` with `n < frames.len()` means that only the first `n` frames were accepted (the queue
/// is full). It is not an error: the worker will submit the other ones again. `Err` is a failure
/// of the queue itself.
pub trait TxQueue {
    fn tx_burst(&mut self, frames: &[Frame]) -> io::Result<usize>;
}

impl<Q: TxQueue + ?Sized> TxQueue for Box<Q> {
    fn tx_burst(&mut self, frames: &[Frame]) -> io::Result<usize> {
        (**self).tx_burst(frames)
    }
}

/// What a transmit worker did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxReport {
    pub worker: usize,
    pub sent: u64,
    /// Records not sent because of the policy for protocols other than TCP and UDP
    pub skipped: u64,
    pub bytes: u64,
    pub duration: Duration,
    /// Set if the queue failed before the end of the range
    pub error: Option<String>,
}

pub struct TxWorker {
    id: usize,
    builder: PacketBuilder,
    batch_size: usize,
    stats: Arc<WorkerStats>,
}

impl TxWorker {
    pub fn new(
        id: usize,
        builder: PacketBuilder,
        batch_size: usize,
        stats: Arc<WorkerStats>,
    ) -> Self {
        TxWorker {
            id,
            builder,
            batch_size: batch_size.max(1),
            stats,
        }
    }

    /// Send the records of `range`.
    ///
    /// Each iteration fills up to `batch_size` frames, submits them and advances the cursor past
    /// the accepted frames only: the records of rejected frames are built and submitted again at
    /// the next iteration.
    pub fn run<Q: TxQueue + ?Sized>(
        &mut self,
        queue: &mut Q,
        dataset: &[FlowTuple],
        range: WorkRange,
        stop: &StopSignal,
    ) -> TxReport {
        log::debug!("TX worker {} started on records {:?}", self.id, range.indices());
        let frame_len = self.builder.frame_len() as u64;
        let mut frames: Vec<Frame> = (0..self.batch_size)
            .map(|_| self.builder.template())
            .collect();
        // index of the record held by each filled frame
        let mut frame_record = vec![0usize; self.batch_size];

        let end = range.end();
        let mut cursor = range.start;
        let mut totals = StatsSnapshot::default();
        let mut skipped = 0;
        let mut error = None;
        let start = Instant::now();

        while cursor < end {
            if stop.is_set() {
                log::debug!("TX worker {} stopped with {} records left", self.id, end - cursor);
                break;
            }

            let mut filled = 0;
            let mut next = cursor;
            while filled < self.batch_size && next < end {
                if self.builder.write(&dataset[next], &mut frames[filled]).is_some() {
                    frame_record[filled] = next;
                    filled += 1;
                } else {
                    log::trace!("Record {next} skipped (protocol {})", dataset[next].proto);
                }
                next += 1;
            }

            let accepted = if filled == 0 {
                0
            } else {
                match queue.tx_burst(&frames[..filled]) {
                    Ok(n) => n.min(filled),
                    Err(e) => {
                        log::error!("TX worker {}: queue failure: {e}", self.id);
                        error = Some(e.to_string());
                        break;
                    }
                }
            };

            let new_cursor = if accepted == filled {
                next
            } else {
                frame_record[accepted]
            };
            skipped += (new_cursor - cursor - accepted) as u64;
            cursor = new_cursor;

            if accepted > 0 {
                totals.packets += accepted as u64;
                totals.bytes += accepted as u64 * frame_len;
                self.stats.publish(&totals);
            }
        }

        let report = TxReport {
            worker: self.id,
            sent: totals.packets,
            skipped,
            bytes: totals.bytes,
            duration: start.elapsed(),
            error,
        };
        log::debug!(
            "TX worker {} done: {} sent, {} skipped",
            self.id,
            report.sent,
            report.skipped
        );
        report
    }
}

/// Split the dataset between one worker per queue and run them on their own threads.
///
/// Fails without sending anything if there is no queue, or not one stats slot per queue.
pub fn run_workers<Q: TxQueue + Send>(
    queues: Vec<Q>,
    dataset: &[FlowTuple],
    builder: &PacketBuilder,
    engine: &EngineConfig,
    stats: &[Arc<WorkerStats>],
    stop: &StopSignal,
) -> Result<Vec<TxReport>> {
    if queues.len() != stats.len() {
        return Err(Error::Config(format!(
            "{} TX queues but {} stats slots",
            queues.len(),
            stats.len()
        )));
    }
    let ranges = partition(dataset.len(), queues.len())?;
    let reports = thread::scope(|s| {
        let handles: Vec<_> = queues
            .into_iter()
            .zip(ranges)
            .zip(stats)
            .enumerate()
            .map(|(i, ((mut queue, range), stats))| {
                let mut worker =
                    TxWorker::new(i, builder.clone(), engine.batch_size, stats.clone());
                let core = engine.first_core + i;
                let pin = engine.pin_threads;
                thread::Builder::new()
                    .name(format!("tx-{i}"))
                    .spawn_scoped(s, move || {
                        pin_if_requested(pin, core);
                        worker.run(&mut queue, dataset, range, stop)
                    })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(i, h)| {
                let failed = |error: String| TxReport {
                    worker: i,
                    sent: 0,
                    skipped: 0,
                    bytes: 0,
                    duration: Duration::ZERO,
                    error: Some(error),
                };
                match h {
                    Ok(h) => h
                        .join()
                        .unwrap_or_else(|_| failed("worker panicked".into())),
                    Err(e) => failed(format!("cannot spawn worker: {e}")),
                }
            })
            .collect()
    });
    Ok(reports)
}

/// Totals of a transmit run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxTotals {
    pub sent: u64,
    pub skipped: u64,
    pub bytes: u64,
    /// Duration of the slowest worker
    pub duration_secs: f64,
    pub packet_rate: Option<f64>,
    pub bit_rate: Option<f64>,
    pub failed_workers: usize,
}

impl TxTotals {
    pub fn from_reports(reports: &[TxReport]) -> Self {
        let sent = reports.iter().map(|r| r.sent).sum();
        let bytes = reports.iter().map(|r| r.bytes).sum();
        let duration = reports
            .iter()
            .map(|r| r.duration)
            .max()
            .unwrap_or_default();
        let rates = stats::rates(sent, bytes, duration);
        TxTotals {
            sent,
            skipped: reports.iter().map(|r| r.skipped).sum(),
            bytes,
            duration_secs: duration.as_secs_f64(),
            packet_rate: rates.map(|r| r.0),
            bit_rate: rates.map(|r| r.1),
            failed_workers: reports.iter().filter(|r| r.error.is_some()).count(),
        }
    }

    pub fn log(&self) {
        log::info!("Packets sent: {}", self.sent);
        if self.skipped > 0 {
            log::info!("Records skipped: {}", self.skipped);
        }
        log::info!("Duration: {:.6} s", self.duration_secs);
        if let (Some(pps), Some(bps)) = (self.packet_rate, self.bit_rate) {
            log::info!("Average throughput: {}", stats::format_rates(pps, bps));
        }
        if self.failed_workers > 0 {
            log::error!("{} workers failed", self.failed_workers);
        }
    }
}
