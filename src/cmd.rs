use clap::{Parser, Subcommand};
use flowrig::rx::Measurement;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(
        short,
        long,
        global = true,
        help = "TOML profile overriding the default frame, engine, lifecycle and counter settings"
    )]
    pub config: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Send every flow of a dataset as one packet, spread over several cores
    Send {
        #[arg(short, long, help = "Network interface to send the packets on")]
        interface: String,
        #[arg(short, long, help = "Dataset of 13-byte flow tuples")]
        dataset: PathBuf,
        #[arg(short = 'l', long, default_value_t = 64, help = "Length of every frame in bytes")]
        frame_len: usize,
        #[arg(
            short,
            long,
            default_value = None,
            help = "Number of TX workers. By default, use half the logical cores"
        )]
        jobs: Option<usize>,
    },
    /// Measure the received traffic until it stops
    Receive {
        #[arg(
            short,
            long,
            required_unless_present = "pcap",
            help = "Network interface to capture from"
        )]
        interface: Option<String>,
        #[arg(
            long,
            conflicts_with = "interface",
            help = "Replay a capture file instead of capturing"
        )]
        pcap: Option<PathBuf>,
        #[arg(
            short,
            long,
            default_value = None,
            help = "Number of RX workers. By default, use half the logical cores"
        )]
        jobs: Option<usize>,
        #[arg(short, long, value_enum, default_value_t = Measurement::Throughput)]
        measurement: Measurement,
        #[arg(short, long, default_value = None, help = "Write the summary into a JSON file")]
        report: Option<PathBuf>,
    },
    /// Convert a dataset into a capture file
    Convert {
        #[arg(short, long, help = "Dataset of 13-byte flow tuples")]
        dataset: PathBuf,
        #[arg(short = 'l', long, default_value_t = 64, help = "Length of every frame in bytes")]
        frame_len: usize,
        #[arg(
            short,
            long,
            default_value = None,
            help = "Output pcap file. By default, the dataset path followed by \".pcap\""
        )]
        outfile: Option<PathBuf>,
        #[arg(
            long,
            default_value_t = false,
            help = "Keep the flows that are neither TCP nor UDP, as bare IPv4 packets"
        )]
        keep_other_protocols: bool,
    },
    /// Count the keys of a raw capture of 16-byte records into a table of hashed buckets
    Count {
        #[arg(short, long, help = "Capture file of 16-byte records")]
        input: PathBuf,
        #[arg(
            short,
            long,
            requires = "outfile",
            conflicts_with = "output_dir",
            help = "Hash seed (single mode)"
        )]
        seed: Option<u32>,
        #[arg(short, long, requires = "seed", help = "Output table (single mode)")]
        outfile: Option<PathBuf>,
        #[arg(
            short = 'd',
            long,
            required_unless_present = "seed",
            help = "Output directory of the tables, one per seed (batch mode)"
        )]
        output_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 0, help = "First seed (batch mode)")]
        start_seed: u32,
        #[arg(long, default_value_t = 2000, help = "Seed after the last one (batch mode)")]
        end_seed: u32,
        #[arg(
            short,
            long,
            default_value = None,
            help = "Number of counting threads. By default, use half the logical cores"
        )]
        jobs: Option<usize>,
        #[arg(long, default_value = None, help = "Number of buckets, a power of two")]
        cardinality: Option<usize>,
    },
}
