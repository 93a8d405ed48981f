use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("unsupported IP version: {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported transport protocol: {0}")]
    UnsupportedProtocol(u8),
    #[error("stated length {stated} does not match {actual} bytes read")]
    LengthMismatch { stated: usize, actual: usize },
    #[error("packet addressed to broadcast")]
    Broadcast,
}

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// TCP flag bits as found in byte 13 of the header.
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

/// Parsed IP packet header info.
#[derive(Debug, Clone)]
pub struct IpPacketInfo {
    pub version: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: TransportProtocol,
    pub header_len: usize,
    pub total_len: usize,
    /// IPv4 type of service, IPv6 traffic class.
    pub tos: u8,
    /// IPv4 identification, zero for IPv6.
    pub ident: u16,
    /// IPv6 flow label, zero for IPv4.
    pub flow_label: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl TransportProtocol {
    pub fn from_number(number: u8, version: u8) -> Self {
        match (number, version) {
            (6, _) => TransportProtocol::Tcp,
            (17, _) => TransportProtocol::Udp,
            (1, 4) | (58, 6) => TransportProtocol::Icmp,
            (other, _) => TransportProtocol::Other(other),
        }
    }

    pub fn number(self) -> u8 {
        match self {
            TransportProtocol::Tcp => 6,
            TransportProtocol::Udp => 17,
            TransportProtocol::Icmp => 1,
            TransportProtocol::Other(p) => p,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Icmp => "ICMP",
            TransportProtocol::Other(_) => "OTHER",
        }
    }
}

/// Parsed transport layer info.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: TransportProtocol,
}

/// A TCP segment borrowed from a captured packet.
#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: usize,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

impl TcpSegment<'_> {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// A UDP datagram borrowed from a captured packet.
#[derive(Debug, Clone)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Parse an IP packet and extract header information.
pub fn parse_ip_packet(data: &[u8]) -> Result<IpPacketInfo, PacketError> {
    if data.is_empty() {
        return Err(PacketError::TooShort {
            expected: 1,
            actual: 0,
        });
    }

    let version = (data[0] >> 4) & 0x0F;

    match version {
        4 => parse_ipv4(data),
        6 => parse_ipv6(data),
        v => Err(PacketError::UnsupportedVersion(v)),
    }
}

/// Parse and check a frame read from the capture device.
///
/// Rejects frames whose stated length differs from the bytes read, frames
/// carrying anything but TCP or UDP, and IPv4 broadcasts.
pub fn validate_frame(data: &[u8]) -> Result<IpPacketInfo, PacketError> {
    let info = parse_ip_packet(data)?;

    if info.total_len != data.len() {
        return Err(PacketError::LengthMismatch {
            stated: info.total_len,
            actual: data.len(),
        });
    }

    match info.protocol {
        TransportProtocol::Tcp | TransportProtocol::Udp => {}
        other => return Err(PacketError::UnsupportedProtocol(other.number())),
    }

    if info.dst_addr == IpAddr::V4(Ipv4Addr::BROADCAST) {
        return Err(PacketError::Broadcast);
    }

    Ok(info)
}

fn parse_ipv4(data: &[u8]) -> Result<IpPacketInfo, PacketError> {
    if data.len() < IPV4_HEADER_LEN {
        return Err(PacketError::TooShort {
            expected: IPV4_HEADER_LEN,
            actual: data.len(),
        });
    }

    let ihl = (data[0] & 0x0F) as usize * 4;
    if ihl < IPV4_HEADER_LEN || data.len() < ihl {
        return Err(PacketError::TooShort {
            expected: ihl.max(IPV4_HEADER_LEN),
            actual: data.len(),
        });
    }
    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    Ok(IpPacketInfo {
        version: 4,
        src_addr: IpAddr::V4(src),
        dst_addr: IpAddr::V4(dst),
        protocol: TransportProtocol::from_number(data[9], 4),
        header_len: ihl,
        total_len,
        tos: data[1],
        ident: u16::from_be_bytes([data[4], data[5]]),
        flow_label: 0,
    })
}

fn parse_ipv6(data: &[u8]) -> Result<IpPacketInfo, PacketError> {
    if data.len() < IPV6_HEADER_LEN {
        return Err(PacketError::TooShort {
            expected: IPV6_HEADER_LEN,
            actual: data.len(),
        });
    }

    let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
    let traffic_class = ((data[0] & 0x0F) << 4) | (data[1] >> 4);
    let flow_label = u32::from_be_bytes([0, data[1] & 0x0F, data[2], data[3]]);

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    dst.copy_from_slice(&data[24..40]);

    Ok(IpPacketInfo {
        version: 6,
        src_addr: IpAddr::V6(Ipv6Addr::from(src)),
        dst_addr: IpAddr::V6(Ipv6Addr::from(dst)),
        protocol: TransportProtocol::from_number(data[6], 6),
        header_len: IPV6_HEADER_LEN,
        total_len: IPV6_HEADER_LEN + payload_len,
        tos: traffic_class,
        ident: 0,
        flow_label,
    })
}

/// Extract transport layer (TCP/UDP) port information from a packet.
pub fn parse_transport(data: &[u8], ip_info: &IpPacketInfo) -> Result<TransportInfo, PacketError> {
    match ip_info.protocol {
        TransportProtocol::Tcp | TransportProtocol::Udp => {
            let transport_data = data.get(ip_info.header_len..).unwrap_or(&[]);
            if transport_data.len() < 4 {
                return Err(PacketError::TooShort {
                    expected: ip_info.header_len + 4,
                    actual: data.len(),
                });
            }
            Ok(TransportInfo {
                src_port: u16::from_be_bytes([transport_data[0], transport_data[1]]),
                dst_port: u16::from_be_bytes([transport_data[2], transport_data[3]]),
                protocol: ip_info.protocol,
            })
        }
        other => Err(PacketError::UnsupportedProtocol(other.number())),
    }
}

/// Parse the TCP header and payload of a validated packet.
pub fn parse_tcp<'a>(data: &'a [u8], ip_info: &IpPacketInfo) -> Result<TcpSegment<'a>, PacketError> {
    let end = ip_info.total_len.min(data.len());
    let tcp = data.get(ip_info.header_len..end).unwrap_or(&[]);
    if tcp.len() < TCP_HEADER_LEN {
        return Err(PacketError::TooShort {
            expected: ip_info.header_len + TCP_HEADER_LEN,
            actual: data.len(),
        });
    }

    let data_offset = ((tcp[12] >> 4) as usize) * 4;
    if data_offset < TCP_HEADER_LEN || data_offset > tcp.len() {
        return Err(PacketError::TooShort {
            expected: ip_info.header_len + data_offset.max(TCP_HEADER_LEN),
            actual: data.len(),
        });
    }

    Ok(TcpSegment {
        src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
        dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
        seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
        ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
        data_offset,
        flags: tcp[13],
        window: u16::from_be_bytes([tcp[14], tcp[15]]),
        payload: &tcp[data_offset..],
    })
}

/// Parse the UDP header and payload of a validated packet.
pub fn parse_udp<'a>(data: &'a [u8], ip_info: &IpPacketInfo) -> Result<UdpDatagram<'a>, PacketError> {
    let end = ip_info.total_len.min(data.len());
    let udp = data.get(ip_info.header_len..end).unwrap_or(&[]);
    if udp.len() < UDP_HEADER_LEN {
        return Err(PacketError::TooShort {
            expected: ip_info.header_len + UDP_HEADER_LEN,
            actual: data.len(),
        });
    }

    let stated = (u16::from_be_bytes([udp[4], udp[5]]) as usize).clamp(UDP_HEADER_LEN, udp.len());
    Ok(UdpDatagram {
        src_port: u16::from_be_bytes([udp[0], udp[1]]),
        dst_port: u16::from_be_bytes([udp[2], udp[3]]),
        payload: &udp[UDP_HEADER_LEN..stated],
    })
}

/// Serialise a TCP header plus payload with a zero checksum.
pub fn encode_tcp_segment(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut segment = Vec::with_capacity(TCP_HEADER_LEN + payload.len());
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&seq.to_be_bytes());
    segment.extend_from_slice(&ack.to_be_bytes());
    segment.push(((TCP_HEADER_LEN / 4) as u8) << 4);
    segment.push(flags);
    segment.extend_from_slice(&window.to_be_bytes());
    segment.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent pointer
    segment.extend_from_slice(payload);
    segment
}

/// Serialise a UDP header plus payload with a zero checksum.
pub fn encode_udp_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let len = (UDP_HEADER_LEN + payload.len()) as u16;
    let mut datagram = Vec::with_capacity(len as usize);
    datagram.extend_from_slice(&src_port.to_be_bytes());
    datagram.extend_from_slice(&dst_port.to_be_bytes());
    datagram.extend_from_slice(&len.to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(payload);
    datagram
}

/// Recalculate the IPv4 header checksum (RFC 1071).
pub fn recalculate_ipv4_checksum(packet: &mut [u8]) {
    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    packet[10] = 0;
    packet[11] = 0;

    let checksum = internet_checksum(&packet[..ihl]);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());
}

/// Recalculate the TCP or UDP checksum of a complete IPv4 or IPv6 packet.
///
/// The checksum covers the version's pseudo-header plus the whole segment.
pub fn recalculate_transport_checksum(packet: &mut [u8]) {
    let (header_len, protocol) = match packet[0] >> 4 {
        4 => (((packet[0] & 0x0F) as usize) * 4, packet[9]),
        _ => (IPV6_HEADER_LEN, packet[6]),
    };
    let offset = match protocol {
        6 => 16,
        17 => 6,
        _ => return,
    };
    let segment_len = packet.len() - header_len;

    packet[header_len + offset] = 0;
    packet[header_len + offset + 1] = 0;

    let mut pseudo = Vec::with_capacity(40 + segment_len);
    if packet[0] >> 4 == 4 {
        pseudo.extend_from_slice(&packet[12..20]); // src, dst
        pseudo.push(0);
        pseudo.push(protocol);
        pseudo.extend_from_slice(&(segment_len as u16).to_be_bytes());
    } else {
        pseudo.extend_from_slice(&packet[8..40]); // src, dst
        pseudo.extend_from_slice(&(segment_len as u32).to_be_bytes());
        pseudo.extend_from_slice(&[0, 0, 0, protocol]);
    }
    pseudo.extend_from_slice(&packet[header_len..]);

    let mut checksum = internet_checksum(&pseudo);
    // a computed UDP checksum of zero is sent as all ones
    if protocol == 17 && checksum == 0 {
        checksum = 0xFFFF;
    }
    packet[header_len + offset..header_len + offset + 2].copy_from_slice(&checksum.to_be_bytes());
}

/// RFC 1071 internet checksum.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }

    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}
