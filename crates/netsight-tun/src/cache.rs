use std::collections::HashMap;
use std::net::IpAddr;

use crate::packet::{IpPacketInfo, TransportInfo};

/// Key no flow ever gets; its value doubles as the dispatch waker token.
pub const RESERVED_KEY: u32 = u32::MAX;

/// Cache key of a flow: the remote address hash folded with protocol and ports.
///
/// Distinct flows can share a key; callers check the flow's endpoints.
pub fn connection_key(remote: IpAddr, protocol: u8, local_port: u16, remote_port: u16) -> u32 {
    let address_hash = match remote {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            octets
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .fold(0, |acc, word| acc ^ word)
        }
    };
    let key = address_hash ^ ((protocol as u32) << 16) ^ ((local_port as u32) << 8) ^ remote_port as u32;
    if key == RESERVED_KEY {
        RESERVED_KEY - 1
    } else {
        key
    }
}

/// Key of the flow a captured client packet belongs to.
pub fn key_for_packet(info: &IpPacketInfo, transport: &TransportInfo) -> u32 {
    connection_key(
        info.dst_addr,
        info.protocol.number(),
        transport.src_port,
        transport.dst_port,
    )
}

/// Live flows of one engine, by key.
#[derive(Debug)]
pub struct ConnectionCache<C> {
    connections: HashMap<u32, C>,
}

impl<C> Default for ConnectionCache<C> {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }
}

impl<C> ConnectionCache<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a flow, returning the one it displaced.
    pub fn insert(&mut self, key: u32, connection: C) -> Option<C> {
        let displaced = self.connections.insert(key, connection);
        if displaced.is_some() {
            tracing::warn!(key, "connection key collision, displacing cached flow");
        }
        displaced
    }

    pub fn get(&self, key: u32) -> Option<&C> {
        self.connections.get(&key)
    }

    pub fn get_mut(&mut self, key: u32) -> Option<&mut C> {
        self.connections.get_mut(&key)
    }

    pub fn contains(&self, key: u32) -> bool {
        self.connections.contains_key(&key)
    }

    pub fn remove(&mut self, key: u32) -> Option<C> {
        self.connections.remove(&key)
    }

    pub fn keys(&self) -> Vec<u32> {
        self.connections.keys().copied().collect()
    }

    /// Remove every flow, handing them to the caller for teardown.
    pub fn drain(&mut self) -> Vec<C> {
        self.connections.drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{parse_ip_packet, parse_transport};
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[rustfmt::skip]
    fn udp_query() -> Vec<u8> {
        vec![
            0x45, 0x00, 0x00, 0x1D, // total len 29
            0x00, 0x01, 0x00, 0x00,
            0x40, 0x11, 0x00, 0x00, // UDP
            0x0A, 0x78, 0x00, 0x01, // src 10.120.0.1
            0x08, 0x08, 0x08, 0x08, // dst 8.8.8.8
            0xC3, 0x50, 0x00, 0x35, // 50000 -> 53
            0x00, 0x09, 0x00, 0x00,
            0x00,
        ]
    }

    #[test]
    fn test_key_is_stable() {
        let remote = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
        let a = connection_key(remote, 6, 40000, 443);
        let b = connection_key(remote, 6, 40000, 443);
        assert_eq!(a, b);
        assert_ne!(a, connection_key(remote, 17, 40000, 443));

        let v6 = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        assert_eq!(connection_key(v6, 6, 1, 2), connection_key(v6, 6, 1, 2));
    }

    #[test]
    fn test_key_matches_fields() {
        let remote = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(connection_key(remote, 17, 0x0102, 0x0035), (17 << 16) ^ (0x0102 << 8) ^ 0x35);
    }

    #[test]
    fn test_reserved_key_is_never_handed_out() {
        let address = RESERVED_KEY ^ (6 << 16) ^ (40000 << 8) ^ 443;
        let remote = IpAddr::V4(Ipv4Addr::from(address));
        assert_eq!(connection_key(remote, 6, 40000, 443), RESERVED_KEY - 1);
    }

    #[test]
    fn test_round_trip_by_packet() {
        let packet = udp_query();
        let info = parse_ip_packet(&packet).unwrap();
        let transport = parse_transport(&packet, &info).unwrap();
        let key = key_for_packet(&info, &transport);

        let mut cache = ConnectionCache::new();
        assert!(cache.insert(key, "flow-1").is_none());
        assert_eq!(cache.get(key_for_packet(&info, &transport)), Some(&"flow-1"));

        assert_eq!(cache.remove(key), Some("flow-1"));
        assert!(cache.get(key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_collision_displaces() {
        let mut cache = ConnectionCache::new();
        cache.insert(7, "old");
        assert_eq!(cache.insert(7, "new"), Some("old"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.drain(), vec!["new"]);
        assert!(cache.is_empty());
    }
}
