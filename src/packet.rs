use crate::config::{FrameConfig, OtherProtocols};
use crate::error::{Error, Result};
use crate::structs::*;

use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocol;
use pnet_packet::ipv4::MutableIpv4Packet;
use pnet_packet::tcp::MutableTcpPacket;
use pnet_packet::udp::MutableUdpPacket;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// Offset of the IPv4 header in a frame
pub const IP_START: usize = ETHERNET_HEADER_LEN;
/// Offset of the transport header in a frame
pub const TRANSPORT_START: usize = IP_START + IPV4_HEADER_LEN;

/// Smallest frame that can hold the Ethernet, IPv4 and TCP headers
pub const MIN_FRAME_LEN: usize = TRANSPORT_START + TCP_HEADER_LEN;
/// Jumbo frame
pub const MAX_FRAME_LEN: usize = 9000;

/// Turns flow tuples into fixed-length Ethernet/IPv4/{TCP,UDP} frames.
///
/// Frames are meant to be reused: `template` writes the fields that never change, and `write`
/// only rewrites the fields that depend on the tuple.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    frame_len: usize,
    config: FrameConfig,
}

impl PacketBuilder {
    pub fn new(frame_len: usize, config: &FrameConfig) -> Result<Self> {
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&frame_len) {
            return Err(Error::Config(format!(
                "frame length must be between {MIN_FRAME_LEN} and {MAX_FRAME_LEN} bytes, not {frame_len}"
            )));
        }
        Ok(PacketBuilder {
            frame_len,
            config: config.clone(),
        })
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Sets the EtherType to IPv4 and the configured MAC addresses
    fn setup_ethernet_frame(&self, packet: &mut [u8]) -> Option<()> {
        let mut eth_packet = MutableEthernetPacket::new(packet)?;
        eth_packet.set_ethertype(EtherTypes::Ipv4);
        eth_packet.set_source(self.config.src_mac);
        eth_packet.set_destination(self.config.dst_mac);
        Some(())
    }

    /// Sets the IPv4 fields that are identical for every frame. The checksum stays zero.
    fn setup_static_ip(&self, packet: &mut [u8]) -> Option<()> {
        let len = packet.len();
        let mut ipv4_packet = MutableIpv4Packet::new(packet)?;
        ipv4_packet.set_version(4);
        ipv4_packet.set_header_length(5);
        ipv4_packet.set_total_length(len as u16);
        ipv4_packet.set_ttl(self.config.ttl);
        ipv4_packet.set_checksum(0);
        Some(())
    }

    fn setup_ip_packet(&self, packet: &mut [u8], tuple: &FlowTuple) -> Option<()> {
        let mut ipv4_packet = MutableIpv4Packet::new(packet)?;
        ipv4_packet.set_source(tuple.src_ip);
        ipv4_packet.set_destination(tuple.dst_ip);
        ipv4_packet.set_next_level_protocol(IpNextHeaderProtocol::new(tuple.proto));
        Some(())
    }

    /// A fixed 20-byte header: constant sequence number, no ACK, configured flags and window
    fn setup_tcp_packet(&self, packet: &mut [u8], tuple: &FlowTuple) -> Option<()> {
        let mut tcp_packet = MutableTcpPacket::new(packet)?;
        tcp_packet.set_source(tuple.src_port);
        tcp_packet.set_destination(tuple.dst_port);
        tcp_packet.set_sequence(self.config.tcp_sequence);
        tcp_packet.set_acknowledgement(0);
        tcp_packet.set_data_offset(5);
        tcp_packet.set_flags(self.config.tcp_flags);
        tcp_packet.set_window(self.config.tcp_window);
        tcp_packet.set_checksum(0);
        tcp_packet.set_urgent_ptr(0);
        Some(())
    }

    fn setup_udp_packet(&self, packet: &mut [u8], tuple: &FlowTuple) -> Option<()> {
        let len = packet.len();
        let mut udp_packet = MutableUdpPacket::new(packet)?;
        udp_packet.set_source(tuple.src_port);
        udp_packet.set_destination(tuple.dst_port);
        udp_packet.set_length(len as u16);
        udp_packet.set_checksum(0);
        Some(())
    }

    /// A zeroed frame of the target length with the static headers already written
    pub fn template(&self) -> Frame {
        let mut frame = Frame::zeroed(self.frame_len);
        let packet = frame.as_mut_slice();
        // the length has been checked in `new`, so both setups succeed
        let _ = self.setup_ethernet_frame(packet);
        let _ = self.setup_static_ip(&mut packet[IP_START..]);
        frame
    }

    /// Rewrite the per-tuple fields of a frame created by `template`.
    ///
    /// Returns the transport that was written, or `None` if the tuple is skipped because of
    /// the `drop` policy for protocols other than TCP and UDP.
    pub fn write(&self, tuple: &FlowTuple, frame: &mut Frame) -> Option<TransportKind> {
        debug_assert_eq!(frame.len(), self.frame_len);
        let kind = tuple.get_transport();
        if kind == TransportKind::RawIp && self.config.other_protocols == OtherProtocols::Drop {
            return None;
        }
        let packet = frame.as_mut_slice();

        // the previous tuple may have used another transport
        let transport_end = (TRANSPORT_START + TCP_HEADER_LEN).min(packet.len());
        packet[TRANSPORT_START..transport_end].fill(0);

        self.setup_ip_packet(&mut packet[IP_START..], tuple)?;
        match kind {
            TransportKind::TCP => self.setup_tcp_packet(&mut packet[TRANSPORT_START..], tuple)?,
            TransportKind::UDP => self.setup_udp_packet(&mut packet[TRANSPORT_START..], tuple)?,
            TransportKind::RawIp => (),
        }
        Some(kind)
    }

    /// Build a single frame from scratch
    pub fn build(&self, tuple: &FlowTuple) -> Option<Frame> {
        let mut frame = self.template();
        self.write(tuple, &mut frame)?;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_packet::ethernet::EthernetPacket;
    use pnet_packet::ip::IpNextHeaderProtocols;
    use pnet_packet::ipv4::Ipv4Packet;
    use pnet_packet::tcp::{TcpFlags, TcpPacket};
    use pnet_packet::udp::UdpPacket;
    use pnet_packet::Packet;
    use std::net::Ipv4Addr;

    fn tcp_tuple() -> FlowTuple {
        FlowTuple::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 1234, 80, 6)
    }

    fn udp_tuple() -> FlowTuple {
        FlowTuple::new(Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::new(10, 0, 0, 4), 5353, 53, 17)
    }

    #[test]
    fn frame_length_is_validated() {
        let config = FrameConfig::default();
        assert!(PacketBuilder::new(MIN_FRAME_LEN - 1, &config).is_err());
        assert!(PacketBuilder::new(MAX_FRAME_LEN + 1, &config).is_err());
        assert!(PacketBuilder::new(MIN_FRAME_LEN, &config).is_ok());
    }

    #[test]
    fn tcp_frame_layout() {
        let builder = PacketBuilder::new(64, &FrameConfig::default()).unwrap();
        let frame = builder.build(&tcp_tuple()).unwrap();
        assert_eq!(frame.len(), 64);

        let eth = EthernetPacket::new(frame.as_slice()).unwrap();
        assert_eq!(eth.get_ethertype(), EtherTypes::Ipv4);
        let ip = Ipv4Packet::new(eth.payload()).unwrap();
        assert_eq!(ip.get_version(), 4);
        assert_eq!(ip.get_header_length(), 5);
        assert_eq!(ip.get_total_length() as usize, 64 - ETHERNET_HEADER_LEN);
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Tcp);
        assert_eq!(ip.get_source(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ip.get_checksum(), 0);

        let tcp = TcpPacket::new(ip.payload()).unwrap();
        assert_eq!(tcp.get_source(), 1234);
        assert_eq!(tcp.get_destination(), 80);
        assert_eq!(tcp.get_sequence(), 1);
        assert_eq!(tcp.get_data_offset(), 5);
        assert_eq!(tcp.get_flags(), TcpFlags::SYN);
        assert!(tcp.payload().iter().all(|b| *b == 0));
    }

    #[test]
    fn udp_length_fields() {
        let builder = PacketBuilder::new(128, &FrameConfig::default()).unwrap();
        let frame = builder.build(&udp_tuple()).unwrap();
        assert_eq!(frame.len(), 128);
        let ip = Ipv4Packet::new(&frame.as_slice()[IP_START..]).unwrap();
        assert_eq!(ip.get_total_length(), 128 - 14);
        let udp = UdpPacket::new(ip.payload()).unwrap();
        assert_eq!(udp.get_length(), 128 - 14 - 20);
        assert_eq!(udp.get_source(), 5353);
    }

    #[test]
    fn reused_frame_does_not_leak_previous_header() {
        let builder = PacketBuilder::new(64, &FrameConfig::default()).unwrap();
        let mut frame = builder.template();
        assert_eq!(builder.write(&tcp_tuple(), &mut frame), Some(TransportKind::TCP));
        assert_eq!(builder.write(&udp_tuple(), &mut frame), Some(TransportKind::UDP));
        let fresh = builder.build(&udp_tuple()).unwrap();
        assert_eq!(frame, fresh);
        assert!(frame.as_slice()[TRANSPORT_START + UDP_HEADER_LEN..]
            .iter()
            .all(|b| *b == 0));
    }

    #[test]
    fn other_protocols_policy() {
        let icmp = FlowTuple::new(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), 0, 0, 1);
        let raw = PacketBuilder::new(60, &FrameConfig::default()).unwrap();
        let frame = raw.build(&icmp).unwrap();
        let ip = Ipv4Packet::new(&frame.as_slice()[IP_START..]).unwrap();
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Icmp);
        assert!(ip.payload().iter().all(|b| *b == 0));

        let config = FrameConfig {
            other_protocols: OtherProtocols::Drop,
            ..FrameConfig::default()
        };
        let dropping = PacketBuilder::new(60, &config).unwrap();
        assert!(dropping.build(&icmp).is_none());
        assert!(dropping.build(&tcp_tuple()).is_some());
    }
}
