//! Implementations of the transmit and receive queues.
//!
//! - `datalink`: one raw Ethernet socket per worker
//! - `pcap`: capture files, for conversion and offline measurement

pub mod datalink;
pub mod pcap;
