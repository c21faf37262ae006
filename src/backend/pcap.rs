use crate::error::{Error, Result};
use crate::rx::{RxQueue, MAX_CAPTURE_LEN};
use crate::structs::Frame;
use crate::tx::TxQueue;

use pcap_file::pcap::{PcapHeader, PcapPacket, PcapReader, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Writes every submitted frame into a capture file, with a null timestamp
pub struct PcapSink {
    writer: PcapWriter<BufWriter<File>>,
    path: PathBuf,
    written: u64,
}

impl PcapSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        let header = PcapHeader {
            version_major: 2,
            version_minor: 4,
            ts_correction: 0,
            ts_accuracy: 0,
            snaplen: MAX_CAPTURE_LEN as u32,
            datalink: DataLink::ETHERNET,
            ts_resolution: TsResolution::MicroSecond,
            endianness: Endianness::Little,
        };
        let writer = PcapWriter::with_header(BufWriter::new(file), header)
            .map_err(|e| Error::io(path, io::Error::other(e)))?;
        log::trace!("Saving into {}", path.display());
        Ok(PcapSink {
            writer,
            path: path.to_path_buf(),
            written: 0,
        })
    }

    /// Flush the file. Returns the number of frames written.
    pub fn finish(self) -> Result<u64> {
        let path = self.path;
        self.writer
            .into_writer()
            .flush()
            .map_err(|e| Error::io(&path, e))?;
        log::debug!("{} frames written into {}", self.written, path.display());
        Ok(self.written)
    }
}

impl TxQueue for PcapSink {
    fn tx_burst(&mut self, frames: &[Frame]) -> io::Result<usize> {
        for frame in frames {
            let data = frame.as_slice();
            self.writer
                .write_packet(&PcapPacket::new(Duration::ZERO, data.len() as u32, data))
                .map_err(io::Error::other)?;
            self.written += 1;
        }
        Ok(frames.len())
    }
}

/// Replays the frames of a capture file. Once it is exhausted, every poll returns nothing.
pub struct PcapSource {
    reader: PcapReader<BufReader<File>>,
    path: PathBuf,
    exhausted: bool,
}

impl PcapSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let reader = PcapReader::new(BufReader::new(file)).map_err(|e| Error::Format {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(PcapSource {
            reader,
            path: path.to_path_buf(),
            exhausted: false,
        })
    }
}

impl RxQueue for PcapSource {
    fn rx_burst(&mut self, bufs: &mut [Frame]) -> io::Result<usize> {
        if self.exhausted {
            return Ok(0);
        }
        for i in 0..bufs.len() {
            match self.reader.next_packet() {
                Some(Ok(packet)) => {
                    bufs[i].fill_from(&packet.data);
                }
                Some(Err(e)) => {
                    log::warn!("{}: {e}", self.path.display());
                    self.exhausted = true;
                    return if i > 0 { Ok(i) } else { Err(io::Error::other(e)) };
                }
                None => {
                    log::debug!("End of {}", self.path.display());
                    self.exhausted = true;
                    return Ok(i);
                }
            }
        }
        Ok(bufs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(byte: u8, len: usize) -> Frame {
        let mut f = Frame::with_capacity(len);
        f.fill_from(&vec![byte; len]);
        f
    }

    #[test]
    fn sink_then_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcap");
        let mut sink = PcapSink::create(&path).unwrap();
        let frames: Vec<Frame> = (0..5).map(|i| frame(i, 60 + i as usize)).collect();
        assert_eq!(sink.tx_burst(&frames[..3]).unwrap(), 3);
        assert_eq!(sink.tx_burst(&frames[3..]).unwrap(), 2);
        assert_eq!(sink.finish().unwrap(), 5);

        let bytes = std::fs::read(&path).unwrap();
        // little-endian magic, version 2.4, snaplen 65535, Ethernet
        assert_eq!(&bytes[..4], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(&bytes[4..8], &[2, 0, 4, 0]);
        assert_eq!(&bytes[16..20], &65535u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &1u32.to_le_bytes());
        // null timestamp of the first record
        assert_eq!(&bytes[24..32], &[0; 8]);

        let mut source = PcapSource::open(&path).unwrap();
        let mut bufs: Vec<Frame> = (0..4).map(|_| Frame::with_capacity(MAX_CAPTURE_LEN)).collect();
        assert_eq!(source.rx_burst(&mut bufs).unwrap(), 4);
        assert_eq!(bufs[2], frames[2]);
        assert_eq!(source.rx_burst(&mut bufs).unwrap(), 1);
        assert_eq!(bufs[0], frames[4]);
        assert_eq!(source.rx_burst(&mut bufs).unwrap(), 0);
        assert_eq!(source.rx_burst(&mut bufs).unwrap(), 0);
    }

    #[test]
    fn frames_larger_than_the_mtu_survive_a_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jumbo.pcap");
        let mut sink = PcapSink::create(&path).unwrap();
        let jumbo = frame(0x5a, 12000);
        assert_eq!(sink.tx_burst(std::slice::from_ref(&jumbo)).unwrap(), 1);
        sink.finish().unwrap();

        let mut source = PcapSource::open(&path).unwrap();
        let mut bufs = vec![Frame::with_capacity(MAX_CAPTURE_LEN)];
        assert_eq!(source.rx_burst(&mut bufs).unwrap(), 1);
        assert_eq!(bufs[0].len(), 12000);
        assert_eq!(bufs[0], jumbo);
    }

    #[test]
    fn source_rejects_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not.pcap");
        std::fs::write(&path, b"definitely not a capture").unwrap();
        assert!(matches!(PcapSource::open(&path), Err(Error::Format { .. })));
        assert!(matches!(
            PcapSource::open(dir.path().join("missing.pcap")),
            Err(Error::Io { .. })
        ));
    }
}
