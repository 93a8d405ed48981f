use std::path::PathBuf;

/// Where the root CA lives and how it and its leaves are named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    /// Directory holding `<alias>.pem` and `<alias>.key.pem`.
    pub key_store_dir: PathBuf,
    pub alias: String,
    /// Store password. Recorded for compatibility with key-store based
    /// deployments; the PEM store itself relies on file permissions.
    pub password: String,
    pub issuer_cn: String,
    pub issuer_o: String,
    pub issuer_ou: String,
    /// Organisation fields of forged leaves.
    pub subject_o: String,
    pub subject_ou: String,
}

impl Authority {
    pub fn cert_path(&self) -> PathBuf {
        self.key_store_dir.join(format!("{}.pem", self.alias))
    }

    pub fn key_path(&self) -> PathBuf {
        self.key_store_dir.join(format!("{}.key.pem", self.alias))
    }
}
