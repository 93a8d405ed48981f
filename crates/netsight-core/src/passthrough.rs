use moka::sync::Cache;

/// Default number of remembered `(app, host)` pairs.
pub const DEFAULT_CAPACITY: u64 = 4096;

/// Key of a passthrough decision: the owning app and the TLS hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PassthroughKey {
    app_id: i64,
    hostname: String,
}

impl PassthroughKey {
    fn new(app_id: i64, hostname: &str) -> Self {
        Self {
            app_id,
            hostname: hostname.to_lowercase(),
        }
    }
}

/// Hosts whose TLS traffic must not be intercepted for a given app.
///
/// An entry is added when an app refuses the forged certificate (typically
/// because it pins the real one). Later flows from that app to that host are
/// forwarded untouched. The set is bounded; the least recently used pairs
/// are forgotten first and get one more interception attempt.
pub struct TlsPassthroughCache {
    entries: Cache<PassthroughKey, ()>,
}

impl TlsPassthroughCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::new(capacity.max(1)),
        }
    }

    /// Mark `(app_id, hostname)` as passthrough.
    pub fn put(&self, app_id: i64, hostname: &str) {
        tracing::info!(app_id, hostname, "adding TLS passthrough entry");
        self.entries.insert(PassthroughKey::new(app_id, hostname), ());
    }

    /// Whether `(app_id, hostname)` is marked as passthrough.
    pub fn contains(&self, app_id: i64, hostname: &str) -> bool {
        self.entries.contains_key(&PassthroughKey::new(app_id, hostname))
    }

    /// Number of passthrough entries.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TlsPassthroughCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_contains() {
        let cache = TlsPassthroughCache::default();
        cache.put(1001, "pinned.example.com");

        assert!(cache.contains(1001, "pinned.example.com"));
        assert!(cache.contains(1001, "PINNED.example.com"));
        assert!(!cache.contains(1002, "pinned.example.com"));
        assert!(!cache.contains(1001, "other.example.com"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_duplicate_put() {
        let cache = TlsPassthroughCache::default();
        cache.put(7, "a.example");
        cache.put(7, "a.example");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = TlsPassthroughCache::new(4);
        for app_id in 0..64 {
            cache.put(app_id, "pinned.example");
        }
        assert!(cache.len() <= 4);
        assert!(!cache.is_empty());
    }
}
