//! Wrapping transport payloads back into IP packets addressed to the client.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::packet::{
    encode_tcp_segment, encode_udp_datagram, recalculate_ipv4_checksum,
    recalculate_transport_checksum, tcp_flags, IpPacketInfo, TcpSegment, TransportProtocol,
    IPV4_HEADER_LEN, IPV6_HEADER_LEN,
};

const DEFAULT_TTL: u8 = 64;

/// Builds return packets for one flow. `local` is the client address on the
/// tunnel side, `remote` the address the client was talking to.
#[derive(Debug, Clone)]
pub enum IpPacketBuilder {
    V4(Ipv4PacketBuilder),
    V6(Ipv6PacketBuilder),
}

#[derive(Debug, Clone)]
pub struct Ipv4PacketBuilder {
    local: Ipv4Addr,
    remote: Ipv4Addr,
    protocol: TransportProtocol,
    ident: u16,
    tos: u8,
}

#[derive(Debug, Clone)]
pub struct Ipv6PacketBuilder {
    local: Ipv6Addr,
    remote: Ipv6Addr,
    protocol: TransportProtocol,
    traffic_class: u8,
    flow_label: u32,
}

impl IpPacketBuilder {
    /// Capture addressing and per-version flow fields from a flow's first packet.
    pub fn from_packet(info: &IpPacketInfo) -> Self {
        match (info.src_addr, info.dst_addr) {
            (IpAddr::V4(local), IpAddr::V4(remote)) => IpPacketBuilder::V4(Ipv4PacketBuilder {
                local,
                remote,
                protocol: info.protocol,
                ident: info.ident,
                tos: info.tos,
            }),
            (local, remote) => IpPacketBuilder::V6(Ipv6PacketBuilder {
                local: to_v6(local),
                remote: to_v6(remote),
                protocol: info.protocol,
                traffic_class: info.tos,
                flow_label: info.flow_label,
            }),
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            IpPacketBuilder::V4(_) => 4,
            IpPacketBuilder::V6(_) => 6,
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            IpPacketBuilder::V4(_) => IPV4_HEADER_LEN,
            IpPacketBuilder::V6(_) => IPV6_HEADER_LEN,
        }
    }

    pub fn local_addr(&self) -> IpAddr {
        match self {
            IpPacketBuilder::V4(b) => IpAddr::V4(b.local),
            IpPacketBuilder::V6(b) => IpAddr::V6(b.local),
        }
    }

    pub fn remote_addr(&self) -> IpAddr {
        match self {
            IpPacketBuilder::V4(b) => IpAddr::V4(b.remote),
            IpPacketBuilder::V6(b) => IpAddr::V6(b.remote),
        }
    }

    pub fn protocol(&self) -> TransportProtocol {
        match self {
            IpPacketBuilder::V4(b) => b.protocol,
            IpPacketBuilder::V6(b) => b.protocol,
        }
    }

    /// Wrap a serialised transport segment into a packet from `remote` to
    /// `local`, filling in lengths and checksums.
    pub fn build_packet(&mut self, segment: &[u8]) -> Vec<u8> {
        let mut packet = match self {
            IpPacketBuilder::V4(b) => {
                b.ident = b.ident.wrapping_add(1);
                ipv4_header(b.remote, b.local, b.protocol, b.ident, b.tos, segment.len())
            }
            IpPacketBuilder::V6(b) => ipv6_header(
                b.remote,
                b.local,
                b.protocol,
                b.traffic_class,
                b.flow_label,
                segment.len(),
            ),
        };
        packet.extend_from_slice(segment);
        finish(&mut packet);
        packet
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_tcp(
        &mut self,
        local_port: u16,
        remote_port: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        window: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let segment = encode_tcp_segment(remote_port, local_port, seq, ack, flags, window, payload);
        self.build_packet(&segment)
    }

    pub fn build_udp(&mut self, local_port: u16, remote_port: u16, payload: &[u8]) -> Vec<u8> {
        let datagram = encode_udp_datagram(remote_port, local_port, payload);
        self.build_packet(&datagram)
    }

    /// RST answering a TCP segment that belongs to no known flow.
    ///
    /// Addressing is mirrored from the stray packet and its own flow fields
    /// are reused; no connection state is involved.
    pub fn build_stray(info: &IpPacketInfo, tcp: &TcpSegment<'_>) -> Vec<u8> {
        let segment = encode_tcp_segment(
            tcp.dst_port,
            tcp.src_port,
            tcp.ack,
            tcp.seq,
            tcp_flags::RST,
            tcp.window,
            &[],
        );
        let mut packet = match (info.dst_addr, info.src_addr) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => ipv4_header(
                src,
                dst,
                TransportProtocol::Tcp,
                info.ident.wrapping_add(1),
                info.tos,
                segment.len(),
            ),
            (src, dst) => ipv6_header(
                to_v6(src),
                to_v6(dst),
                TransportProtocol::Tcp,
                info.tos,
                info.flow_label,
                segment.len(),
            ),
        };
        packet.extend_from_slice(&segment);
        finish(&mut packet);
        packet
    }
}

fn to_v6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: TransportProtocol,
    ident: u16,
    tos: u8,
    payload_len: usize,
) -> Vec<u8> {
    let total_len = (IPV4_HEADER_LEN + payload_len) as u16;
    let mut header = Vec::with_capacity(IPV4_HEADER_LEN + payload_len);
    header.push(0x45);
    header.push(tos);
    header.extend_from_slice(&total_len.to_be_bytes());
    header.extend_from_slice(&ident.to_be_bytes());
    header.extend_from_slice(&[0x40, 0x00]); // DF, no fragment offset
    header.push(DEFAULT_TTL);
    header.push(protocol.number());
    header.extend_from_slice(&[0, 0]);
    header.extend_from_slice(&src.octets());
    header.extend_from_slice(&dst.octets());
    header
}

fn ipv6_header(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    protocol: TransportProtocol,
    traffic_class: u8,
    flow_label: u32,
    payload_len: usize,
) -> Vec<u8> {
    let mut header = Vec::with_capacity(IPV6_HEADER_LEN + payload_len);
    let word = (6u32 << 28) | ((traffic_class as u32) << 20) | (flow_label & 0x000F_FFFF);
    header.extend_from_slice(&word.to_be_bytes());
    header.extend_from_slice(&(payload_len as u16).to_be_bytes());
    header.push(protocol.number());
    header.push(DEFAULT_TTL);
    header.extend_from_slice(&src.octets());
    header.extend_from_slice(&dst.octets());
    header
}

fn finish(packet: &mut [u8]) {
    if packet[0] >> 4 == 4 {
        recalculate_ipv4_checksum(packet);
    }
    recalculate_transport_checksum(packet);
}
