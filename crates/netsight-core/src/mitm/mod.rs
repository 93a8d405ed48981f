//! Root of trust and certificate forging for TLS interception.

mod authority;
mod ca;
mod store;
mod trust;

use thiserror::Error;

pub use authority::Authority;
pub use ca::{CertificateAuthority, ForgedCertificate, LeafName, UpstreamIdentity};
pub use store::CertificateStore;
pub use trust::{crypto_provider, server_config_for, upstream_client_config, MergeVerifier};

#[derive(Debug, Error)]
pub enum MitmError {
    #[error("key store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("invalid certificate: {0}")]
    Certificate(String),
    #[error("tls configuration failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("trust store setup failed: {0}")]
    TrustStore(String),
}
