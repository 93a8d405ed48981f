use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, RsaKeySize, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use super::{Authority, MitmError};

/// Root validity extends this far on both sides of its creation time.
const ROOT_VALIDITY_DAYS: i64 = 365;
/// Leaves are backdated like the root but expire a day after forging.
const LEAF_BACKDATE_DAYS: i64 = 365;
const LEAF_LIFETIME_DAYS: i64 = 1;
/// Serial numbers keep 48 random bits.
const SERIAL_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// A name carried in a subject alternative name extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafName {
    Dns(String),
    Ip(IpAddr),
}

/// The parts of a real server certificate that a forged leaf imitates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamIdentity {
    pub common_name: String,
    pub alt_names: Vec<LeafName>,
}

impl UpstreamIdentity {
    /// Extract CN and SANs from a DER certificate. When the subject has no CN
    /// the first DNS SAN is used, then `fallback_host`.
    pub fn from_der(der: &[u8], fallback_host: &str) -> Result<Self, MitmError> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| MitmError::Certificate(format!("unparsable upstream certificate: {e}")))?;

        let mut alt_names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => alt_names.push(LeafName::Dns(dns.to_string())),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            alt_names.push(LeafName::Ip(ip));
                        }
                    }
                    _ => {}
                }
            }
        }

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .or_else(|| {
                alt_names.iter().find_map(|n| match n {
                    LeafName::Dns(d) => Some(d.clone()),
                    LeafName::Ip(_) => None,
                })
            })
            .unwrap_or_else(|| fallback_host.to_string());

        Ok(Self {
            common_name,
            alt_names,
        })
    }

    /// Identity for a bare host name, with the host as its only SAN.
    pub fn for_host(host: &str) -> Self {
        let alt_name = match host.parse::<IpAddr>() {
            Ok(ip) => LeafName::Ip(ip),
            Err(_) => LeafName::Dns(host.to_string()),
        };
        Self {
            common_name: host.to_string(),
            alt_names: vec![alt_name],
        }
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => Some(IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// A leaf certificate chained to the local root, with its private key.
#[derive(Debug)]
pub struct ForgedCertificate {
    pub common_name: String,
    /// `[leaf, root]`.
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Locally trusted root CA that signs forged leaves.
pub struct CertificateAuthority {
    authority: Authority,
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("alias", &self.authority.alias)
            .field("dir", &self.authority.key_store_dir)
            .finish()
    }
}

impl CertificateAuthority {
    /// Load the root CA from the key store, creating and persisting a new one
    /// when none exists yet.
    pub fn load_or_create(authority: Authority) -> Result<Self, MitmError> {
        let cert_path = authority.cert_path();
        let key_path = authority.key_path();

        if cert_path.exists() && key_path.exists() {
            tracing::info!(path = %cert_path.display(), "loading root CA");
            let cert_pem = fs::read_to_string(&cert_path)?;
            let key_pem = fs::read_to_string(&key_path)?;
            return Self::from_pem(authority, cert_pem, &key_pem);
        }

        tracing::info!(dir = %authority.key_store_dir.display(), alias = %authority.alias, "creating root CA");
        fs::create_dir_all(&authority.key_store_dir)?;

        let (cert_pem, key_pem) = generate_root(&authority)?;
        write_private(&key_path, key_pem.as_bytes())?;
        fs::write(&cert_path, cert_pem.as_bytes())?;

        Self::from_pem(authority, cert_pem, &key_pem)
    }

    fn from_pem(authority: Authority, cert_pem: String, key_pem: &str) -> Result<Self, MitmError> {
        let key_pair = KeyPair::from_pem(key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;

        let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| MitmError::Certificate("no certificate in root CA PEM".to_string()))??;

        Ok(Self {
            authority,
            issuer,
            ca_cert_der,
            ca_cert_pem: cert_pem,
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Root certificate in PEM form, for installation on clients.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Sign a fresh leaf imitating `identity`.
    pub fn forge_leaf(&self, identity: &UpstreamIdentity) -> Result<ForgedCertificate, MitmError> {
        let mut params = CertificateParams::default();
        params.serial_number = Some(random_serial());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, identity.common_name.as_str());
        dn.push(DnType::OrganizationName, self.authority.subject_o.as_str());
        dn.push(DnType::OrganizationalUnitName, self.authority.subject_ou.as_str());
        params.distinguished_name = dn;

        let names = if identity.alt_names.is_empty() {
            UpstreamIdentity::for_host(&identity.common_name).alt_names
        } else {
            identity.alt_names.clone()
        };
        params.subject_alt_names = names
            .into_iter()
            .filter_map(|name| match name {
                LeafName::Ip(ip) => Some(SanType::IpAddress(ip)),
                LeafName::Dns(dns) => match dns.clone().try_into() {
                    Ok(ia5) => Some(SanType::DnsName(ia5)),
                    Err(_) => {
                        tracing::warn!(name = %dns, "skipping unencodable SAN");
                        None
                    }
                },
            })
            .collect();

        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(LEAF_BACKDATE_DAYS);
        params.not_after = now + Duration::days(LEAF_LIFETIME_DAYS);

        let key_pair = KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_2048)?;
        let cert = params.signed_by(&key_pair, &self.issuer)?;

        tracing::debug!(cn = %identity.common_name, "forged leaf certificate");

        Ok(ForgedCertificate {
            common_name: identity.common_name.clone(),
            chain: vec![cert.der().clone(), self.ca_cert_der.clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }
}

fn generate_root(authority: &Authority) -> Result<(String, String), MitmError> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, authority.issuer_cn.as_str());
    dn.push(DnType::OrganizationName, authority.issuer_o.as_str());
    dn.push(DnType::OrganizationalUnitName, authority.issuer_ou.as_str());
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
        KeyUsagePurpose::CrlSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::Any,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(ROOT_VALIDITY_DAYS);
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_2048)?;
    let cert = params.self_signed(&key_pair)?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// 48-bit serial from a time-seeded generator, so regenerated certificates
/// don't collide with serials cached by clients from earlier runs.
fn random_serial() -> SerialNumber {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);
    let serial = rng.gen::<u64>() & SERIAL_MASK;
    SerialNumber::from(serial.max(1))
}

fn write_private(path: &Path, contents: &[u8]) -> Result<(), MitmError> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::X509Certificate;
    use x509_parser::prelude::FromDer;

    fn test_authority(dir: &Path) -> Authority {
        Authority {
            key_store_dir: dir.to_path_buf(),
            alias: "test-ca".to_string(),
            password: "changeit".to_string(),
            issuer_cn: "Test Root".to_string(),
            issuer_o: "Test Org".to_string(),
            issuer_ou: "Test Unit".to_string(),
            subject_o: "Forged Org".to_string(),
            subject_ou: "Forged Unit".to_string(),
        }
    }

    #[test]
    fn test_root_is_persisted_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let authority = test_authority(dir.path());

        let first = CertificateAuthority::load_or_create(authority.clone()).unwrap();
        assert!(authority.cert_path().exists());
        assert!(authority.key_path().exists());

        let second = CertificateAuthority::load_or_create(authority).unwrap();
        assert_eq!(first.ca_cert_der(), second.ca_cert_der());
    }

    #[test]
    fn test_root_properties() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(test_authority(dir.path())).unwrap();

        let (_, cert) = X509Certificate::from_der(ca.ca_cert_der().as_ref()).unwrap();
        assert!(cert.is_ca());
        let cn = cert.subject().iter_common_name().next().unwrap().as_str().unwrap();
        assert_eq!(cn, "Test Root");

        let validity = cert.validity();
        let span = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert!(span >= 2 * 364 * 86400);

        let key_usage = cert.key_usage().unwrap().unwrap().value;
        assert!(key_usage.key_cert_sign());
        assert!(key_usage.crl_sign());
        assert!(key_usage.digital_signature());
        assert!(key_usage.key_encipherment());
    }

    #[test]
    fn test_forged_leaf_names() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(test_authority(dir.path())).unwrap();

        let identity = UpstreamIdentity {
            common_name: "example.com".to_string(),
            alt_names: vec![
                LeafName::Dns("example.com".to_string()),
                LeafName::Dns("www.example.com".to_string()),
                LeafName::Ip(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))),
            ],
        };
        let forged = ca.forge_leaf(&identity).unwrap();
        assert_eq!(forged.chain.len(), 2);
        assert_eq!(&forged.chain[1], ca.ca_cert_der());

        let (_, leaf) = X509Certificate::from_der(forged.chain[0].as_ref()).unwrap();
        let cn = leaf.subject().iter_common_name().next().unwrap().as_str().unwrap();
        assert_eq!(cn, "example.com");
        assert_eq!(
            leaf.issuer().iter_common_name().next().unwrap().as_str().unwrap(),
            "Test Root"
        );
        assert!(!leaf.is_ca());
        assert!(leaf.serial.bits() <= 48);

        // round-trip through the upstream parser
        let parsed = UpstreamIdentity::from_der(forged.chain[0].as_ref(), "fallback").unwrap();
        assert_eq!(parsed, identity);

        let validity = leaf.validity();
        let remaining = validity.not_after.timestamp() - OffsetDateTime::now_utc().unix_timestamp();
        assert!(remaining > 0 && remaining <= 86400);
    }

    #[test]
    fn test_leaf_without_sans_uses_common_name() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(test_authority(dir.path())).unwrap();

        let identity = UpstreamIdentity {
            common_name: "bare.example".to_string(),
            alt_names: vec![],
        };
        let forged = ca.forge_leaf(&identity).unwrap();
        let parsed = UpstreamIdentity::from_der(forged.chain[0].as_ref(), "fallback").unwrap();
        assert_eq!(parsed.alt_names, vec![LeafName::Dns("bare.example".to_string())]);
    }

    #[test]
    fn test_garbage_upstream_certificate() {
        assert!(UpstreamIdentity::from_der(&[0x30, 0x03, 0x01, 0x01], "host").is_err());
    }

    #[test]
    fn test_for_host_ip_literal() {
        let identity = UpstreamIdentity::for_host("10.0.0.5");
        assert_eq!(identity.alt_names, vec![LeafName::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)))]);
    }
}
