use std::net::IpAddr;
use std::time::{Duration, Instant};

use moka::sync::Cache;

/// Default number of cached addresses.
pub const DEFAULT_CAPACITY: u64 = 1000;

/// TTL applied when a record carries none.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct DnsRecord {
    hostname: String,
    expires_at: Instant,
}

/// Reverse map from resolved addresses to the hostname that was queried.
///
/// Filled from observed DNS answers and consulted when a new connection is
/// created so flows can be labelled with a hostname instead of a bare IP.
/// Entries are bounded by capacity (least recently used are evicted first)
/// and by the TTL of the answer they came from.
pub struct DnsCache {
    entries: Cache<IpAddr, DnsRecord>,
    default_ttl: Duration,
}

impl DnsCache {
    pub fn new(capacity: u64, default_ttl: Duration) -> Self {
        tracing::debug!(capacity, ttl_secs = default_ttl.as_secs(), "DNS cache initialised");
        Self {
            entries: Cache::builder().max_capacity(capacity).build(),
            default_ttl,
        }
    }

    /// Record a hostname for an address, valid for `ttl` (or the default TTL).
    pub fn put(&self, ip: IpAddr, hostname: &str, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.entries.insert(
            ip,
            DnsRecord {
                hostname: hostname.to_lowercase(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Look up the hostname for an address; expired records count as misses.
    pub fn get(&self, ip: &IpAddr) -> Option<String> {
        let record = self.entries.get(ip)?;
        if record.expires_at <= Instant::now() {
            self.entries.invalidate(ip);
            return None;
        }
        Some(record.hostname)
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}
