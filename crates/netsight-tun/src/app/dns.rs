use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::context::EngineContext;
use crate::transport::FlowMeta;

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const HEADER_LEN: usize = 12;
/// Compression pointers may nest; cap the walk.
const MAX_POINTER_HOPS: usize = 16;

/// Parsed DNS query.
#[derive(Debug)]
pub struct DnsQuery {
    pub id: u16,
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Addresses from a DNS response, with the question they answer.
#[derive(Debug, PartialEq, Eq)]
pub struct DnsAnswers {
    pub id: u16,
    pub domain: String,
    pub addresses: Vec<(IpAddr, u32)>,
}

/// Parse a single-question DNS query.
pub fn parse_dns_query(data: &[u8]) -> Option<DnsQuery> {
    if data.len() < HEADER_LEN {
        return None;
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let qdcount = u16::from_be_bytes([data[4], data[5]]);

    // Only standard queries (QR=0, OPCODE=0)
    if flags & 0xF800 != 0 || qdcount == 0 {
        return None;
    }

    let (domain, offset) = read_name(data, HEADER_LEN)?;
    let fixed = data.get(offset..offset + 4)?;

    Some(DnsQuery {
        id,
        domain,
        qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
        qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
    })
}

/// Parse A and AAAA answers out of a DNS response.
pub fn parse_dns_response(data: &[u8]) -> Option<DnsAnswers> {
    if data.len() < HEADER_LEN {
        return None;
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    let ancount = u16::from_be_bytes([data[6], data[7]]);

    if flags & 0x8000 == 0 || qdcount == 0 {
        return None;
    }

    let mut offset = HEADER_LEN;
    let mut domain = String::new();
    for i in 0..qdcount {
        let (name, next) = read_name(data, offset)?;
        if i == 0 {
            domain = name;
        }
        offset = next + 4;
    }

    let mut addresses = Vec::new();
    for _ in 0..ancount {
        let (_, next) = read_name(data, offset)?;
        let fixed = data.get(next..next + 10)?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        let rdata = data.get(next + 10..next + 10 + rdlength)?;

        match (rtype, rdlength) {
            (TYPE_A, 4) => {
                let ip = Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]);
                addresses.push((IpAddr::V4(ip), ttl));
            }
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                addresses.push((IpAddr::V6(Ipv6Addr::from(octets)), ttl));
            }
            _ => {}
        }
        offset = next + 10 + rdlength;
    }

    Some(DnsAnswers {
        id,
        domain,
        addresses,
    })
}

/// Read a possibly compressed name at `offset`, returning it and the offset
/// just past it in the original position.
fn read_name(data: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut labels = Vec::new();
    let mut pos = offset;
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos)? as usize;
        match len {
            0 => {
                end.get_or_insert(pos + 1);
                break;
            }
            l if l & 0xC0 == 0xC0 => {
                let target = ((l & 0x3F) << 8) | *data.get(pos + 1)? as usize;
                end.get_or_insert(pos + 2);
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return None;
                }
                pos = target;
            }
            l => {
                let label = data.get(pos + 1..pos + 1 + l)?;
                labels.push(String::from_utf8_lossy(label).to_string());
                pos += 1 + l;
            }
        }
    }

    Some((labels.join("."), end?))
}

/// Watches DNS exchanges and feeds answers into the DNS cache.
#[derive(Debug, Default)]
pub struct DnsHandler;

impl DnsHandler {
    pub fn unwrap_outbound(&mut self, meta: &FlowMeta, payload: &[u8]) {
        match parse_dns_query(payload) {
            Some(query) => tracing::debug!(id = meta.id, domain = %query.domain, qtype = query.qtype, "dns query"),
            None => tracing::debug!(id = meta.id, len = payload.len(), "dns unparsable query"),
        }
    }

    pub fn unwrap_inbound(&mut self, meta: &FlowMeta, ctx: &EngineContext, payload: &[u8]) {
        let Some(answers) = parse_dns_response(payload) else {
            tracing::debug!(id = meta.id, len = payload.len(), "dns unparsable response");
            return;
        };
        for (ip, ttl) in &answers.addresses {
            ctx.dns_cache
                .put(*ip, &answers.domain, Some(Duration::from_secs(u64::from(*ttl))));
        }
        tracing::debug!(
            id = meta.id,
            domain = %answers.domain,
            answers = answers.addresses.len(),
            "dns response"
        );
    }
}
