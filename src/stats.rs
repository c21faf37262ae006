use crate::config::LifecycleConfig;
use crate::rx::Measurement;
use crate::structs::StopSignal;

use indicatif::HumanBytes;
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Below this duration, no rate is computed
const MIN_DURATION: Duration = Duration::from_micros(1);

/// Counters of one worker.
///
/// Only the owning worker writes them (plain stores of its local totals, no read-modify-write),
/// everybody else only reads. Aligned on a cache line so that two workers never share one.
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct WorkerStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    latency_sum: AtomicU64,
    malformed: AtomicU64,
}

/// A consistent-enough copy of the counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub latency_sum: u64,
    pub malformed: u64,
}

impl AddAssign for StatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.latency_sum += other.latency_sum;
        self.malformed += other.malformed;
    }
}

impl WorkerStats {
    /// Publish the worker's running totals. Must only be called by the owning worker.
    pub fn publish(&self, totals: &StatsSnapshot) {
        self.packets.store(totals.packets, Ordering::Relaxed);
        self.bytes.store(totals.bytes, Ordering::Relaxed);
        self.latency_sum.store(totals.latency_sum, Ordering::Relaxed);
        self.malformed.store(totals.malformed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            latency_sum: self.latency_sum.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Sum the counters of all the workers
pub fn total(stats: &[Arc<WorkerStats>]) -> StatsSnapshot {
    let mut sum = StatsSnapshot::default();
    for s in stats {
        sum += s.snapshot();
    }
    sum
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    /// No packet seen yet
    Idle,
    /// Traffic is flowing
    Active,
    /// Terminal
    Stopped,
}

/// Decides when a receive run starts and ends.
///
/// The workers have no way to know that the experiment is over, so the end of the run is
/// detected by silence: no new packet during `silence_timeout`. A sender that pauses for longer
/// than that will be considered finished.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: RunState,
    silence_timeout: Duration,
    start_time: Option<Instant>,
    last_progress_time: Option<Instant>,
    prev_total: u64,
}

impl Lifecycle {
    pub fn new(silence_timeout: Duration) -> Self {
        Lifecycle {
            state: RunState::Idle,
            silence_timeout,
            start_time: None,
            last_progress_time: None,
            prev_total: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Feed one observation of the total packet count.
    ///
    /// Returns the new state when a transition happens, `None` otherwise.
    pub fn observe(&mut self, total: u64, now: Instant, cancelled: bool) -> Option<RunState> {
        let next = match self.state {
            RunState::Stopped => return None,
            _ if cancelled => RunState::Stopped,
            RunState::Idle if total > 0 => {
                self.start_time = Some(now);
                self.last_progress_time = Some(now);
                self.prev_total = total;
                RunState::Active
            }
            RunState::Idle => return None,
            RunState::Active => {
                if total > self.prev_total {
                    self.last_progress_time = Some(now);
                    self.prev_total = total;
                    return None;
                }
                match self.last_progress_time {
                    Some(last) if now.saturating_duration_since(last) > self.silence_timeout => {
                        RunState::Stopped
                    }
                    _ => return None,
                }
            }
        };
        self.state = next;
        Some(next)
    }

    /// Time between the first and the last observed progress
    pub fn active_duration(&self) -> Option<Duration> {
        match (self.start_time, self.last_progress_time) {
            (Some(start), Some(last)) => Some(last.saturating_duration_since(start)),
            _ => None,
        }
    }

    pub fn summarize(&self, totals: StatsSnapshot, measurement: Measurement) -> Summary {
        Summary::new(totals, self.active_duration(), measurement)
    }
}

/// Final results of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub packets: u64,
    pub bytes: u64,
    pub latency_sum: u64,
    pub malformed: u64,
    pub duration_secs: Option<f64>,
    /// Packets per second
    pub packet_rate: Option<f64>,
    /// Bits per second
    pub bit_rate: Option<f64>,
    /// Average of the embedded measurement field, in the unit of the field. Latency runs only.
    pub avg_latency: Option<f64>,
}

/// Packet and bit rates over `duration`, or `None` if it is too short to divide by
pub fn rates(packets: u64, bytes: u64, duration: Duration) -> Option<(f64, f64)> {
    if duration < MIN_DURATION {
        return None;
    }
    let secs = duration.as_secs_f64();
    Some((packets as f64 / secs, 8. * bytes as f64 / secs))
}

impl Summary {
    pub fn new(totals: StatsSnapshot, duration: Option<Duration>, measurement: Measurement) -> Self {
        let rates = duration.and_then(|d| rates(totals.packets, totals.bytes, d));
        Summary {
            packets: totals.packets,
            bytes: totals.bytes,
            latency_sum: totals.latency_sum,
            malformed: totals.malformed,
            duration_secs: duration.map(|d| d.as_secs_f64()),
            packet_rate: rates.map(|r| r.0),
            bit_rate: rates.map(|r| r.1),
            avg_latency: if measurement == Measurement::Latency && totals.packets > 0 {
                Some(totals.latency_sum as f64 / totals.packets as f64)
            } else {
                None
            },
        }
    }

    pub fn log(&self) {
        log::info!("Total packets: {}", self.packets);
        log::info!("Total bytes: {} ({})", self.bytes, HumanBytes(self.bytes));
        if self.malformed > 0 {
            log::info!("Malformed frames: {}", self.malformed);
        }
        if let Some(d) = self.duration_secs {
            log::info!("Duration: {d:.6} s");
        }
        match (self.packet_rate, self.bit_rate) {
            (Some(pps), Some(bps)) => {
                log::info!("Average throughput: {}", format_rates(pps, bps))
            }
            _ => log::info!("Duration too short to compute a throughput"),
        }
        if let Some(avg) = self.avg_latency {
            log::info!("Average latency: {avg:.2} (switch time units)");
        }
    }
}

pub fn format_rates(pps: f64, bps: f64) -> String {
    let mpps = pps / 1e6;
    if bps < 1e6 {
        format!("{mpps:.2} Mpps | {:.2} kbps", bps / 1e3)
    } else if bps < 1e9 {
        format!("{mpps:.2} Mpps | {:.2} Mbps", bps / 1e6)
    } else {
        format!("{mpps:.2} Mpps | {:.2} Gbps", bps / 1e9)
    }
}

/// The control loop of a receive run.
///
/// It polls the worker counters at a fixed cadence, never touches the workers otherwise, and
/// sets the stop signal once the run is over.
pub struct Aggregator {
    stats: Vec<Arc<WorkerStats>>,
    config: LifecycleConfig,
}

impl Aggregator {
    pub fn new(stats: Vec<Arc<WorkerStats>>, config: LifecycleConfig) -> Self {
        Aggregator { stats, config }
    }

    /// Run until silence or cancellation. Returns the lifecycle, to be summarized once the
    /// workers have been joined.
    pub fn run(&self, stop: &StopSignal) -> Lifecycle {
        log::debug!("Aggregator started");
        let ticker = crossbeam_channel::tick(self.config.poll_interval);
        let mut lifecycle = Lifecycle::new(self.config.silence_timeout);
        let mut last_report: Option<(Instant, StatsSnapshot)> = None;

        for now in ticker.iter() {
            let current = total(&self.stats);
            match lifecycle.observe(current.packets, now, stop.is_set()) {
                Some(RunState::Active) => {
                    log::info!("Traffic detected! Starting timer...");
                    last_report = Some((now, current));
                }
                Some(RunState::Stopped) => {
                    if stop.is_set() {
                        log::info!("Run cancelled. Stopping.");
                    } else {
                        log::info!("Silence detected. Stopping.");
                    }
                    stop.trigger();
                    break;
                }
                _ => (),
            }

            if let Some((since, previous)) = last_report {
                let elapsed = now.saturating_duration_since(since);
                if !self.config.report_interval.is_zero() && elapsed >= self.config.report_interval
                {
                    let secs = elapsed.as_secs_f64();
                    let pps = (current.packets - previous.packets) as f64 / secs;
                    let bps = 8. * (current.bytes - previous.bytes) as f64 / secs;
                    log::info!("Throughput: {}", format_rates(pps, bps));
                    last_report = Some((now, current));
                }
            }
        }
        lifecycle
    }
}

/// Log the progress of transmit workers until `done` is set
pub fn monitor(stats: Vec<Arc<WorkerStats>>, done: StopSignal, interval: Duration) {
    let start = Instant::now();
    let ticker = crossbeam_channel::tick(interval.max(Duration::from_millis(100)));
    while !done.is_set() {
        if ticker.recv().is_err() {
            break;
        }
        if done.is_set() {
            break;
        }
        let current = total(&stats);
        let secs = start.elapsed().as_secs_f64();
        log::info!(
            "{} packets sent ({})",
            current.packets,
            format_rates(current.packets as f64 / secs, 8. * current.bytes as f64 / secs)
        );
    }
}
