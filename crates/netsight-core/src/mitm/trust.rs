use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use super::{ForgedCertificate, MitmError};

pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Verifies upstream servers against a custom trust store first and the
/// bundled web PKI roots second. A chain is rejected only when both reject it.
#[derive(Debug)]
pub struct MergeVerifier {
    custom: Option<Arc<WebPkiServerVerifier>>,
    platform: Arc<WebPkiServerVerifier>,
}

impl MergeVerifier {
    /// `trust_store` is an optional PEM bundle of additional trust anchors.
    pub fn new(trust_store: Option<&Path>) -> Result<Self, MitmError> {
        let custom = match trust_store {
            Some(path) => {
                let pem = std::fs::read(path)?;
                let roots = roots_from_pem(&pem)?;
                tracing::info!(path = %path.display(), anchors = roots.len(), "loaded custom trust store");
                Some(build_verifier(roots)?)
            }
            None => None,
        };
        Ok(Self {
            custom,
            platform: platform_verifier()?,
        })
    }

    /// Verifier whose custom half trusts exactly the given certificates.
    pub fn with_custom_roots(anchors: &[CertificateDer<'static>]) -> Result<Self, MitmError> {
        let mut roots = RootCertStore::empty();
        for anchor in anchors {
            roots
                .add(anchor.clone())
                .map_err(|e| MitmError::TrustStore(e.to_string()))?;
        }
        Ok(Self {
            custom: Some(build_verifier(roots)?),
            platform: platform_verifier()?,
        })
    }
}

fn roots_from_pem(pem: &[u8]) -> Result<RootCertStore, MitmError> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        roots
            .add(cert?)
            .map_err(|e| MitmError::TrustStore(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(MitmError::TrustStore("no certificates in trust store".to_string()));
    }
    Ok(roots)
}

fn platform_verifier() -> Result<Arc<WebPkiServerVerifier>, MitmError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    build_verifier(roots)
}

fn build_verifier(roots: RootCertStore) -> Result<Arc<WebPkiServerVerifier>, MitmError> {
    WebPkiServerVerifier::builder_with_provider(Arc::new(roots), crypto_provider())
        .build()
        .map_err(|e| MitmError::TrustStore(e.to_string()))
}

impl ServerCertVerifier for MergeVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(custom) = &self.custom {
            match custom.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
                Ok(verified) => return Ok(verified),
                Err(e) => tracing::debug!(error = %e, "custom trust store rejected chain, trying platform roots"),
            }
        }
        self.platform
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.platform.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.platform.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.platform.supported_verify_schemes()
    }
}

/// Client configuration for the server-facing half of an intercepted flow.
pub fn upstream_client_config(verifier: Arc<MergeVerifier>) -> Result<Arc<ClientConfig>, MitmError> {
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Server configuration presenting a forged leaf to the intercepted client.
pub fn server_config_for(forged: &ForgedCertificate) -> Result<Arc<ServerConfig>, MitmError> {
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(forged.chain.clone(), forged.key.clone_key())?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::{Authority, CertificateAuthority, UpstreamIdentity};

    fn authority(dir: &Path, alias: &str) -> CertificateAuthority {
        CertificateAuthority::load_or_create(Authority {
            key_store_dir: dir.to_path_buf(),
            alias: alias.to_string(),
            password: "changeit".to_string(),
            issuer_cn: format!("{alias} Root"),
            issuer_o: "Trust".to_string(),
            issuer_ou: "Trust".to_string(),
            subject_o: "Forged".to_string(),
            subject_ou: "Forged".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_forged_leaf_validates_against_root() {
        let dir = tempfile::tempdir().unwrap();
        let ca = authority(dir.path(), "trusted");
        let forged = ca.forge_leaf(&UpstreamIdentity::for_host("example.com")).unwrap();

        let verifier = MergeVerifier::with_custom_roots(&[ca.ca_cert_der().clone()]).unwrap();
        let name = ServerName::try_from("example.com").unwrap();
        let result = verifier.verify_server_cert(&forged.chain[0], &[], &name, &[], UnixTime::now());
        assert!(result.is_ok(), "{result:?}");

        let wrong = ServerName::try_from("other.example").unwrap();
        assert!(verifier
            .verify_server_cert(&forged.chain[0], &[], &wrong, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn test_unknown_root_rejected_by_both() {
        let dir = tempfile::tempdir().unwrap();
        let trusted = authority(dir.path(), "trusted");
        let rogue = authority(dir.path(), "rogue");
        let forged = rogue.forge_leaf(&UpstreamIdentity::for_host("example.com")).unwrap();

        let verifier = MergeVerifier::with_custom_roots(&[trusted.ca_cert_der().clone()]).unwrap();
        let name = ServerName::try_from("example.com").unwrap();
        assert!(verifier
            .verify_server_cert(&forged.chain[0], &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn test_trust_store_from_pem_file() {
        let dir = tempfile::tempdir().unwrap();
        let ca = authority(dir.path(), "pemstore");

        let verifier = MergeVerifier::new(Some(&ca.authority().cert_path())).unwrap();
        let forged = ca.forge_leaf(&UpstreamIdentity::for_host("pem.example")).unwrap();
        let name = ServerName::try_from("pem.example").unwrap();
        assert!(verifier
            .verify_server_cert(&forged.chain[0], &[], &name, &[], UnixTime::now())
            .is_ok());

        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, b"").unwrap();
        assert!(MergeVerifier::new(Some(&empty)).is_err());
    }

    #[test]
    fn test_configs_build() {
        let dir = tempfile::tempdir().unwrap();
        let ca = authority(dir.path(), "configs");
        let forged = ca.forge_leaf(&UpstreamIdentity::for_host("cfg.example")).unwrap();

        assert!(server_config_for(&forged).is_ok());
        let verifier = Arc::new(MergeVerifier::new(None).unwrap());
        assert!(upstream_client_config(verifier).is_ok());
    }
}
