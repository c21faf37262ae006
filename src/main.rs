mod cmd;

use flowrig::backend::{datalink, pcap};
use flowrig::config::{CounterConfig, OtherProtocols, Profile};
use flowrig::counter::{self, CounterParams};
use flowrig::packet::PacketBuilder;
use flowrig::rx::{self, RxQueue};
use flowrig::stats::{self, WorkerStats};
use flowrig::structs::{StopSignal, WorkRange};
use flowrig::tx::{self, TxTotals, TxWorker};
use flowrig::{config, dataset, Error, Result};

use clap::Parser;
use std::cmp::max;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = cmd::Args::parse();
    if let Err(e) = run(args) {
        log::error!("{e}");
        process::exit(1);
    }
}

/// The requested number of workers, or half the logical cores
fn worker_count(jobs: Option<usize>) -> Result<usize> {
    match jobs {
        Some(0) => Err(Error::Config("worker count must be at least 1".into())),
        Some(jobs) => Ok(jobs),
        None => Ok(max(1, num_cpus::get() / 2)),
    }
}

/// The first Ctrl-C stops the run gracefully, the second one exits
fn handle_ctrlc(stop: &StopSignal) -> Result<()> {
    let stop = stop.clone();
    ctrlc::set_handler(move || {
        if !stop.is_set() {
            log::warn!("Stopping, press Ctrl-C again to exit immediately");
            stop.trigger();
        } else {
            process::exit(1);
        }
    })
    .map_err(|e| Error::Setup(format!("cannot set the Ctrl-C handler: {e}")))
}

fn run(args: cmd::Args) -> Result<()> {
    let profile = config::load_profile(args.config.as_deref())?;

    match args.command {
        cmd::Command::Send {
            interface,
            dataset,
            frame_len,
            jobs,
        } => send(&profile, &interface, &dataset, frame_len, worker_count(jobs)?),
        cmd::Command::Receive {
            interface,
            pcap,
            jobs,
            measurement,
            report,
        } => {
            let jobs = worker_count(jobs)?;
            let queues: Vec<Box<dyn RxQueue + Send>> = match (pcap, interface) {
                (Some(path), _) => {
                    log::info!("Replaying {}", path.display());
                    vec![Box::new(pcap::PcapSource::open(&path)?)]
                }
                (None, Some(interface)) => datalink::open_rx(&interface, jobs)?
                    .into_iter()
                    .map(|q| Box::new(q) as Box<dyn RxQueue + Send>)
                    .collect(),
                (None, None) => {
                    return Err(Error::Config("an interface or a capture is needed".into()))
                }
            };
            receive(&profile, queues, measurement, report.as_deref())
        }
        cmd::Command::Convert {
            dataset,
            frame_len,
            outfile,
            keep_other_protocols,
        } => {
            let outfile = outfile.unwrap_or_else(|| {
                let mut name = dataset.clone().into_os_string();
                name.push(".pcap");
                PathBuf::from(name)
            });
            let other_protocols = if keep_other_protocols {
                OtherProtocols::RawIp
            } else {
                OtherProtocols::Drop
            };
            convert(&profile, &dataset, frame_len, &outfile, other_protocols)
        }
        cmd::Command::Count {
            input,
            seed,
            outfile,
            output_dir,
            start_seed,
            end_seed,
            jobs,
            cardinality,
        } => {
            let jobs = worker_count(jobs)?;
            let params = CounterParams::new(&CounterConfig {
                cardinality: cardinality.unwrap_or(profile.counter.cardinality),
                ..profile.counter.clone()
            })?;
            match (seed, outfile, output_dir) {
                (Some(seed), Some(outfile), _) => {
                    log::info!("Counting {} with seed {seed}", input.display());
                    let report = counter::count_file(&input, seed, jobs, &params)?;
                    report.log(&input);
                    report.table.save(&outfile)?;
                    log::info!("Table saved into {}", outfile.display());
                    Ok(())
                }
                (None, _, Some(output_dir)) => {
                    counter::count_seed_range(&input, start_seed..end_seed, &output_dir, jobs, &params)
                        .map(|_| ())
                }
                _ => Err(Error::Config(
                    "either --seed and --outfile, or --output-dir, are needed".into(),
                )),
            }
        }
    }
}

fn send(
    profile: &Profile,
    interface: &str,
    dataset_path: &Path,
    frame_len: usize,
    jobs: usize,
) -> Result<()> {
    let tuples = dataset::load(dataset_path)?;
    let builder = PacketBuilder::new(frame_len, &profile.frame)?;
    let queues = datalink::open_tx(interface, jobs)?;
    let stop = StopSignal::new();
    handle_ctrlc(&stop)?;

    let worker_stats: Vec<Arc<WorkerStats>> = (0..jobs).map(|_| Arc::default()).collect();
    let done = StopSignal::new();
    let monitor = if profile.lifecycle.report_interval.is_zero() {
        None
    } else {
        let worker_stats = worker_stats.clone();
        let done = done.clone();
        let interval = profile.lifecycle.report_interval;
        thread::Builder::new()
            .name("monitor".into())
            .spawn(move || stats::monitor(worker_stats, done, interval))
            .map_err(|e| log::warn!("Cannot spawn the monitor: {e}"))
            .ok()
    };

    log::info!(
        "Sending {} tuples as {frame_len}-byte frames with {jobs} workers",
        tuples.len()
    );
    let reports = tx::run_workers(
        queues,
        &tuples,
        &builder,
        &profile.engine,
        &worker_stats,
        &stop,
    );
    done.trigger();
    if let Some(monitor) = monitor {
        let _ = monitor.join();
    }

    let totals = TxTotals::from_reports(&reports?);
    totals.log();
    if totals.failed_workers > 0 {
        return Err(Error::Worker(format!(
            "{} of {jobs} TX workers failed",
            totals.failed_workers
        )));
    }
    Ok(())
}

fn receive(
    profile: &Profile,
    queues: Vec<Box<dyn RxQueue + Send>>,
    measurement: rx::Measurement,
    report: Option<&Path>,
) -> Result<()> {
    let stop = StopSignal::new();
    handle_ctrlc(&stop)?;
    log::info!(
        "Waiting for traffic on {} queues ({measurement:?})...",
        queues.len()
    );
    let outcome = rx::run_measurement(
        queues,
        measurement,
        &profile.engine,
        &profile.lifecycle,
        &stop,
    )?;
    outcome.summary.log();

    if let Some(path) = report {
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &outcome)
            .map_err(|e| Error::io(path, e.into()))?;
        log::info!("Report written into {}", path.display());
    }

    let failed: Vec<&str> = outcome
        .reports
        .iter()
        .filter_map(|r| r.error.as_deref())
        .collect();
    if !failed.is_empty() {
        return Err(Error::Worker(failed.join("; ")));
    }
    Ok(())
}

fn convert(
    profile: &Profile,
    dataset_path: &Path,
    frame_len: usize,
    outfile: &Path,
    other_protocols: OtherProtocols,
) -> Result<()> {
    let tuples = dataset::load(dataset_path)?;
    let mut frame_config = profile.frame.clone();
    frame_config.other_protocols = other_protocols;
    let builder = PacketBuilder::new(frame_len, &frame_config)?;
    let mut sink = pcap::PcapSink::create(outfile)?;

    let mut worker = TxWorker::new(0, builder, profile.engine.batch_size, Arc::default());
    let range = WorkRange {
        start: 0,
        count: tuples.len(),
    };
    let report = worker.run(&mut sink, &tuples, range, &StopSignal::new());
    let written = sink.finish()?;
    if let Some(e) = report.error {
        return Err(Error::Worker(e));
    }
    log::info!(
        "{written} packets written into {} ({} tuples skipped)",
        outfile.display(),
        report.skipped
    );
    Ok(())
}
