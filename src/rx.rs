use crate::config::{EngineConfig, LifecycleConfig};
use crate::error::{Error, Result};
use crate::packet::{ETHERNET_HEADER_LEN, IP_START};
use crate::stats::{self, Aggregator, RunState, StatsSnapshot, Summary, WorkerStats};
use crate::structs::*;
use crate::utils::pin_if_requested;

use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ipv4::Ipv4Packet;
use serde::{Deserialize, Serialize};
use std::hint;
use std::io;
use std::sync::Arc;
use std::thread;

/// Size of the value embedded by the generator right after the IPv4 header
pub const MEASUREMENT_FIELD_LEN: usize = 4;
/// Capacity of a receive buffer. Offloading interfaces and captures can deliver frames well over
/// the MTU, up to the 65535-byte snapshot length.
pub const MAX_CAPTURE_LEN: usize = 65535;

/// A batched, non-blocking receive primitive.
///
/// The queue copies up to `bufs.len()` frames into the worker's buffers and returns how many it
/// filled. Zero is a normal outcome.
pub trait RxQueue {
    fn rx_burst(&mut self, bufs: &mut [Frame]) -> io::Result<usize>;
}

impl<Q: RxQueue + ?Sized> RxQueue for Box<Q> {
    fn rx_burst(&mut self, bufs: &mut [Frame]) -> io::Result<usize> {
        (**self).rx_burst(bufs)
    }
}

#[derive(clap::ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Measurement {
    /// Count every frame and its length
    #[default]
    Throughput,
    /// Also sum the 32-bit value the switch writes after the IPv4 header
    Latency,
}

/// Extract the frame length and the measured value from a received frame.
///
/// Returns `None` for frames that cannot carry the measurement field.
pub fn extract(measurement: Measurement, frame: &[u8]) -> Option<(u64, u64)> {
    match measurement {
        Measurement::Throughput => Some((frame.len() as u64, 0)),
        Measurement::Latency => {
            let eth = EthernetPacket::new(frame)?;
            if eth.get_ethertype() != EtherTypes::Ipv4 {
                return None;
            }
            let ip = Ipv4Packet::new(&frame[IP_START..])?;
            let ihl = ip.get_header_length() as usize * 4;
            if ihl < 20 {
                return None;
            }
            let field = ETHERNET_HEADER_LEN + ihl;
            let value = frame.get(field..field + MEASUREMENT_FIELD_LEN)?;
            let value = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            Some((frame.len() as u64, u64::from(value)))
        }
    }
}

/// What a receive worker saw
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RxReport {
    pub worker: usize,
    pub totals: StatsSnapshot,
    pub error: Option<String>,
}

pub struct RxWorker {
    id: usize,
    measurement: Measurement,
    batch_size: usize,
    stats: Arc<WorkerStats>,
}

impl RxWorker {
    pub fn new(
        id: usize,
        measurement: Measurement,
        batch_size: usize,
        stats: Arc<WorkerStats>,
    ) -> Self {
        RxWorker {
            id,
            measurement,
            batch_size: batch_size.max(1),
            stats,
        }
    }

    /// Poll `queue` until the stop signal is set.
    ///
    /// A failure of the queue sets the stop signal, so that the other workers and the aggregator
    /// end too.
    pub fn run<Q: RxQueue + ?Sized>(&mut self, queue: &mut Q, stop: &StopSignal) -> RxReport {
        log::debug!("RX worker {} started", self.id);
        let mut bufs: Vec<Frame> = (0..self.batch_size)
            .map(|_| Frame::with_capacity(MAX_CAPTURE_LEN))
            .collect();
        let mut totals = StatsSnapshot::default();
        let mut error = None;

        while !stop.is_set() {
            let received = match queue.rx_burst(&mut bufs) {
                Ok(n) => n.min(self.batch_size),
                Err(e) => {
                    log::error!("RX worker {}: queue failure: {e}", self.id);
                    error = Some(e.to_string());
                    stop.trigger();
                    break;
                }
            };
            if received == 0 {
                hint::spin_loop();
                continue;
            }
            for frame in &bufs[..received] {
                match extract(self.measurement, frame.as_slice()) {
                    Some((bytes, value)) => {
                        totals.packets += 1;
                        totals.bytes += bytes;
                        totals.latency_sum += value;
                    }
                    None => {
                        log::trace!("RX worker {}: malformed frame of {} bytes", self.id, frame.len());
                        totals.malformed += 1;
                    }
                }
            }
            self.stats.publish(&totals);
        }

        log::debug!("RX worker {} done: {} packets", self.id, totals.packets);
        RxReport {
            worker: self.id,
            totals,
            error,
        }
    }
}

/// Result of a receive run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RxOutcome {
    pub summary: Summary,
    pub reports: Vec<RxReport>,
    /// Whether the run saw any traffic before it stopped
    pub state_before_stop: RunState,
}

/// Run one worker per queue and the aggregator, until silence or cancellation.
///
/// Without any queue, nothing could ever end the run: it is refused.
pub fn run_measurement<Q: RxQueue + Send>(
    queues: Vec<Q>,
    measurement: Measurement,
    engine: &EngineConfig,
    lifecycle: &LifecycleConfig,
    stop: &StopSignal,
) -> Result<RxOutcome> {
    if queues.is_empty() {
        return Err(Error::Config("at least one RX queue is needed".into()));
    }
    let worker_stats: Vec<Arc<WorkerStats>> = queues.iter().map(|_| Arc::default()).collect();
    let aggregator = Aggregator::new(worker_stats.clone(), lifecycle.clone());

    let (lifecycle, reports) = thread::scope(|s| {
        let handles: Vec<_> = queues
            .into_iter()
            .zip(&worker_stats)
            .enumerate()
            .map(|(i, (mut queue, stats))| {
                let mut worker = RxWorker::new(i, measurement, engine.batch_size, stats.clone());
                let core = engine.first_core + i;
                let pin = engine.pin_threads;
                thread::Builder::new()
                    .name(format!("rx-{i}"))
                    .spawn_scoped(s, move || {
                        pin_if_requested(pin, core);
                        worker.run(&mut queue, stop)
                    })
            })
            .collect();

        let lifecycle = thread::Builder::new()
            .name("aggregator".into())
            .spawn_scoped(s, || aggregator.run(stop))
            .map_err(|e| log::error!("Cannot spawn the aggregator: {e}"))
            .and_then(|h| h.join().map_err(|_| log::error!("Aggregator panicked")))
            .ok();
        // whatever happened to the aggregator, the workers must end
        stop.trigger();

        let reports: Vec<RxReport> = handles
            .into_iter()
            .enumerate()
            .map(|(i, h)| {
                let failed = |error: String| RxReport {
                    worker: i,
                    totals: StatsSnapshot::default(),
                    error: Some(error),
                };
                match h {
                    Ok(h) => h
                        .join()
                        .unwrap_or_else(|_| failed("worker panicked".into())),
                    Err(e) => failed(format!("cannot spawn worker: {e}")),
                }
            })
            .collect();
        (lifecycle, reports)
    });

    // the workers are joined, their counters are final
    let totals = stats::total(&worker_stats);
    let (summary, state_before_stop) = match lifecycle {
        Some(l) => (
            l.summarize(totals, measurement),
            if l.active_duration().is_some() {
                RunState::Active
            } else {
                RunState::Idle
            },
        ),
        None => (Summary::new(totals, None, measurement), RunState::Idle),
    };
    Ok(RxOutcome {
        summary,
        reports,
        state_before_stop,
    })
}
