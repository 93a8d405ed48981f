use std::sync::Arc;

use moka::sync::Cache;

use super::{CertificateAuthority, ForgedCertificate, MitmError, UpstreamIdentity};

/// Forged leaves keyed by common name, bounded with LRU-style eviction.
#[derive(Clone)]
pub struct CertificateStore {
    authority: Arc<CertificateAuthority>,
    leaves: Cache<String, Arc<ForgedCertificate>>,
}

impl CertificateStore {
    pub fn new(authority: Arc<CertificateAuthority>, capacity: u64) -> Self {
        Self {
            authority,
            leaves: Cache::new(capacity.max(1)),
        }
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    /// Cached leaf for a common name, if one was forged already.
    pub fn get(&self, common_name: &str) -> Option<Arc<ForgedCertificate>> {
        self.leaves.get(&common_name.to_lowercase())
    }

    /// Return the cached leaf for the identity's CN or forge and cache one.
    pub fn forge(&self, identity: &UpstreamIdentity) -> Result<Arc<ForgedCertificate>, MitmError> {
        let key = identity.common_name.to_lowercase();
        if let Some(leaf) = self.leaves.get(&key) {
            return Ok(leaf);
        }
        let leaf = Arc::new(self.authority.forge_leaf(identity)?);
        self.leaves.insert(key, leaf.clone());
        Ok(leaf)
    }

    pub fn cached(&self) -> u64 {
        self.leaves.run_pending_tasks();
        self.leaves.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::Authority;

    fn store(dir: &std::path::Path, capacity: u64) -> CertificateStore {
        let authority = Authority {
            key_store_dir: dir.to_path_buf(),
            alias: "store-test".to_string(),
            password: "changeit".to_string(),
            issuer_cn: "Store Root".to_string(),
            issuer_o: "Store".to_string(),
            issuer_ou: "Store".to_string(),
            subject_o: "Forged".to_string(),
            subject_ou: "Forged".to_string(),
        };
        let ca = CertificateAuthority::load_or_create(authority).unwrap();
        CertificateStore::new(Arc::new(ca), capacity)
    }

    #[test]
    fn test_forge_is_cached_by_common_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 16);

        assert!(store.get("example.com").is_none());
        let first = store.forge(&UpstreamIdentity::for_host("example.com")).unwrap();
        let second = store.forge(&UpstreamIdentity::for_host("Example.COM")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(store.get("example.com").is_some());
        assert_eq!(store.cached(), 1);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 2);

        for host in ["a.test", "b.test", "c.test", "d.test"] {
            store.forge(&UpstreamIdentity::for_host(host)).unwrap();
        }
        assert!(store.cached() <= 2);
    }
}
