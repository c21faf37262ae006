use crate::error::{Error, Result};
use crate::rx::{RxQueue, MAX_CAPTURE_LEN};
use crate::structs::Frame;
use crate::tx::TxQueue;

use pnet::datalink::{self, Channel, Config, DataLinkReceiver, DataLinkSender, NetworkInterface};
use std::io;
use std::time::Duration;

pub struct DatalinkTx {
    tx: Box<dyn DataLinkSender>,
}

pub struct DatalinkRx {
    rx: Box<dyn DataLinkReceiver>,
}

/// The kernel queue is full: retry later
fn is_backpressure(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    ) || e.raw_os_error() == Some(libc::ENOBUFS)
}

pub fn find_interface(name: &str) -> Result<NetworkInterface> {
    let interfaces = datalink::interfaces();
    interfaces
        .iter()
        .find(|iface| iface.name == name)
        .cloned()
        .ok_or_else(|| {
            let known: Vec<&str> = interfaces.iter().map(|i| i.name.as_str()).collect();
            Error::Setup(format!(
                "no interface named {name} (available: {})",
                known.join(", ")
            ))
        })
}

fn check_count(count: usize) -> Result<()> {
    if count == 0 {
        return Err(Error::Config("at least one channel is needed".into()));
    }
    Ok(())
}

fn open_channel(iface: &NetworkInterface, config: Config) -> Result<Channel> {
    datalink::channel(iface, config)
        .map_err(|e| Error::Setup(format!("cannot open a channel on {}: {e}", iface.name)))
}

/// One transmit channel per worker
pub fn open_tx(iface_name: &str, count: usize) -> Result<Vec<DatalinkTx>> {
    check_count(count)?;
    let iface = find_interface(iface_name)?;
    let mut queues = Vec::with_capacity(count);
    for _ in 0..count {
        match open_channel(&iface, Config::default())? {
            Channel::Ethernet(tx, _) => queues.push(DatalinkTx { tx }),
            _ => return Err(Error::Setup(format!("{iface_name}: unsupported channel type"))),
        }
    }
    log::info!("{count} TX channels opened on {iface_name}");
    Ok(queues)
}

/// One receive channel per worker.
///
/// On Linux, the sockets join a fanout group hashing the flows, so that each packet is received
/// by exactly one worker.
pub fn open_rx(iface_name: &str, count: usize) -> Result<Vec<DatalinkRx>> {
    check_count(count)?;
    let iface = find_interface(iface_name)?;
    #[allow(unused_mut)]
    let mut config = Config {
        read_timeout: Some(Duration::ZERO),
        read_buffer_size: MAX_CAPTURE_LEN,
        promiscuous: true,
        ..Config::default()
    };
    #[cfg(target_os = "linux")]
    if count > 1 {
        config.linux_fanout = Some(datalink::FanoutOption {
            group_id: std::process::id() as u16,
            fanout_type: datalink::FanoutType::HASH,
            defrag: true,
            rollover: false,
        });
    }
    let mut queues = Vec::with_capacity(count);
    for _ in 0..count {
        match open_channel(&iface, config)? {
            Channel::Ethernet(_, rx) => queues.push(DatalinkRx { rx }),
            _ => return Err(Error::Setup(format!("{iface_name}: unsupported channel type"))),
        }
    }
    log::info!("{count} RX channels opened on {iface_name}");
    Ok(queues)
}

impl TxQueue for DatalinkTx {
    fn tx_burst(&mut self, frames: &[Frame]) -> io::Result<usize> {
        for (i, frame) in frames.iter().enumerate() {
            match self.tx.send_to(frame.as_slice(), None) {
                Some(Ok(())) => (),
                Some(Err(e)) if is_backpressure(&e) => return Ok(i),
                Some(Err(e)) => return Err(e),
                None => return Err(io::Error::other("channel closed")),
            }
        }
        Ok(frames.len())
    }
}

impl RxQueue for DatalinkRx {
    fn rx_burst(&mut self, bufs: &mut [Frame]) -> io::Result<usize> {
        for i in 0..bufs.len() {
            match self.rx.next() {
                Ok(packet) => {
                    bufs[i].fill_from(packet);
                }
                Err(e) if is_backpressure(&e) => return Ok(i),
                // report the error at the next poll
                Err(_) if i > 0 => return Ok(i),
                Err(e) => return Err(e),
            }
        }
        Ok(bufs.len())
    }
}
