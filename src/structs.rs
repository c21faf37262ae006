use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::net::Ipv4Addr;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Size of one flow tuple record in a dataset file
pub const TUPLE_RECORD_LEN: usize = 13;

// Dataset structures

/// One flow of the dataset.
///
/// Addresses and ports are kept in host order here; on disk and on the wire they are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

impl FlowTuple {
    pub fn new(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16, proto: u8) -> Self {
        FlowTuple {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            proto,
        }
    }

    /// Decode a record: `src_ip(4) dst_ip(4) src_port(2) dst_port(2) proto(1)`
    pub fn from_record(record: &[u8; TUPLE_RECORD_LEN]) -> Self {
        FlowTuple {
            src_ip: Ipv4Addr::new(record[0], record[1], record[2], record[3]),
            dst_ip: Ipv4Addr::new(record[4], record[5], record[6], record[7]),
            src_port: u16::from_be_bytes([record[8], record[9]]),
            dst_port: u16::from_be_bytes([record[10], record[11]]),
            proto: record[12],
        }
    }

    pub fn to_record(&self) -> [u8; TUPLE_RECORD_LEN] {
        let mut record = [0u8; TUPLE_RECORD_LEN];
        record[0..4].copy_from_slice(&self.src_ip.octets());
        record[4..8].copy_from_slice(&self.dst_ip.octets());
        record[8..10].copy_from_slice(&self.src_port.to_be_bytes());
        record[10..12].copy_from_slice(&self.dst_port.to_be_bytes());
        record[12] = self.proto;
        record
    }

    pub fn get_transport(&self) -> TransportKind {
        TransportKind::from(self.proto)
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    TCP,
    UDP,
    /// Any other IP protocol: only the IPv4 header is meaningful
    RawIp,
}

impl From<u8> for TransportKind {
    fn from(proto: u8) -> TransportKind {
        match proto {
            6 => TransportKind::TCP,
            17 => TransportKind::UDP,
            _ => TransportKind::RawIp,
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::TCP => write!(f, "TCP"),
            TransportKind::UDP => write!(f, "UDP"),
            TransportKind::RawIp => write!(f, "raw IP"),
        }
    }
}

// Work distribution

/// A contiguous slice of the dataset (or of a file) owned by one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRange {
    pub start: usize,
    pub count: usize,
}

impl WorkRange {
    pub fn end(&self) -> usize {
        self.start + self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn indices(&self) -> Range<usize> {
        self.start..self.end()
    }

    /// Convert a range of units (e.g. records) into a range of sub-units (e.g. bytes)
    pub fn scaled(&self, unit: usize) -> WorkRange {
        WorkRange {
            start: self.start * unit,
            count: self.count * unit,
        }
    }
}

// Frames

/// A fixed-capacity packet buffer.
///
/// The backing storage is allocated once; `len` tells how many bytes are meaningful.
/// Two frames are equal when their meaningful bytes are, whatever their capacities.
#[derive(Clone, Eq)]
pub struct Frame {
    data: Vec<u8>,
    len: usize,
}

impl Frame {
    /// An empty frame able to hold up to `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Frame {
            data: vec![0; capacity],
            len: 0,
        }
    }

    /// A frame of exactly `len` zero bytes
    pub fn zeroed(len: usize) -> Self {
        Frame {
            data: vec![0; len],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Copy `bytes` into the frame, truncated to its capacity. Returns the copied length.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let len = bytes.len().min(self.data.len());
        self.data[..len].copy_from_slice(&bytes[..len]);
        self.len = len;
        len
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

// Run control

/// Process-wide stop flag. It only goes from "running" to "stopped", never back.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        StopSignal::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip_keeps_network_order() {
        let t = FlowTuple::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 2),
            0x1234,
            80,
            6,
        );
        let record = t.to_record();
        assert_eq!(&record[0..4], &[10, 0, 0, 1]);
        assert_eq!(&record[8..10], &[0x12, 0x34]);
        assert_eq!(FlowTuple::from_record(&record), t);
    }

    #[test]
    fn transport_from_proto() {
        assert_eq!(TransportKind::from(6), TransportKind::TCP);
        assert_eq!(TransportKind::from(17), TransportKind::UDP);
        assert_eq!(TransportKind::from(1), TransportKind::RawIp);
    }

    #[test]
    fn frame_fill_truncates_to_capacity() {
        let mut f = Frame::with_capacity(4);
        assert!(f.is_empty());
        assert_eq!(f.fill_from(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(f.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(f.fill_from(&[9]), 1);
        assert_eq!(f.as_slice(), &[9]);
    }

    #[test]
    fn frames_compare_by_content() {
        let mut small = Frame::with_capacity(8);
        let mut large = Frame::with_capacity(9000);
        small.fill_from(&[1, 2, 3]);
        large.fill_from(&[7; 100]);
        // stale bytes past the length are ignored
        large.fill_from(&[1, 2, 3]);
        assert_eq!(small, large);
        large.fill_from(&[1, 2, 4]);
        assert_ne!(small, large);
        assert_ne!(Frame::zeroed(2), Frame::zeroed(3));
    }

    #[test]
    fn stop_signal_is_shared() {
        let s = StopSignal::new();
        let s2 = s.clone();
        assert!(!s2.is_set());
        s.trigger();
        assert!(s2.is_set());
    }
}
