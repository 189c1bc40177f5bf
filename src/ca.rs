//! Certificate authority: loads or creates a root CA and mints short-lived
//! leaf certificates on demand for each intercepted host.

use crate::error::{ProxyError, ProxyResult};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType, PKCS_ECDSA_P521_SHA512,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

const CA_MAX_AGE_DAYS: i64 = 5 * 365;
const LEAF_MAX_AGE_HOURS: i64 = 24;

/// Root certificate authority used to mint leaf certs for MITM'd hosts.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// A freshly minted leaf certificate chain plus its private key, ready to
/// feed into a `rustls::ServerConfig`.
pub struct LeafCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl CertificateAuthority {
    /// Load the CA from `cert_path`/`key_path`, generating and writing a
    /// fresh one (with `0400` permissions) if the files don't exist yet.
    pub fn load_or_create(cert_path: &Path, key_path: &Path, common_name: &str) -> ProxyResult<Self> {
        if cert_path.exists() && key_path.exists() {
            info!(cert = %cert_path.display(), "loading existing CA");
            Self::load(key_path, common_name)
        } else {
            warn!(cert = %cert_path.display(), "CA not found, generating a new one");
            Self::generate_and_write(cert_path, key_path, common_name)
        }
    }

    /// Rebuild the signing `rcgen::Certificate` from a previously-written
    /// key. The key alone is sufficient to re-derive a self-signed CA with
    /// the same parameters, which is all signing operations need.
    fn load(key_path: &Path, common_name: &str) -> ProxyResult<Self> {
        let key_pem = std::fs::read_to_string(key_path)?;
        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| ProxyError::Certificate(format!("parsing CA key: {e}")))?;

        let params = ca_params(common_name)?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| ProxyError::Certificate(format!("re-deriving CA cert: {e}")))?;

        Ok(Self { cert, key })
    }

    fn generate_and_write(cert_path: &Path, key_path: &Path, common_name: &str) -> ProxyResult<Self> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P521_SHA512)
            .map_err(|e| ProxyError::Certificate(format!("generating CA key: {e}")))?;
        let params = ca_params(common_name)?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| ProxyError::Certificate(format!("self-signing CA cert: {e}")))?;

        if let Some(parent) = cert_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(cert_path, cert.pem().as_bytes())?;
        write_private(key_path, key.serialize_pem().as_bytes())?;

        Ok(Self { cert, key })
    }

    /// Mint a short-lived leaf certificate for `domain`, signed by this CA.
    /// `NotBefore` is backdated an hour to tolerate client/server clock
    /// skew at the start of the validity window.
    pub fn mint_leaf(&self, domain: &str) -> ProxyResult<LeafCertificate> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        params.distinguished_name = dn;

        params.subject_alt_names = vec![SanType::DnsName(
            domain
                .to_owned()
                .try_into()
                .map_err(|_| ProxyError::Certificate(format!("invalid domain name: {domain}")))?,
        )];

        let now = OffsetDateTime::now_utc() - Duration::hours(1);
        params.not_before = now;
        params.not_after = now + Duration::hours(LEAF_MAX_AGE_HOURS);

        let key = KeyPair::generate_for(&PKCS_ECDSA_P521_SHA512)
            .map_err(|e| ProxyError::Certificate(format!("generating leaf key: {e}")))?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(|e| ProxyError::Certificate(format!("signing leaf cert for {domain}: {e}")))?;

        let leaf_der = CertificateDer::from(cert.der().to_vec());
        let ca_der = CertificateDer::from(self.cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key.serialize_der())
            .map_err(|e| ProxyError::Certificate(format!("converting leaf key: {e:?}")))?;

        Ok(LeafCertificate {
            chain: vec![leaf_der, ca_der],
            key: key_der,
        })
    }

    /// PEM-encoded root certificate, for clients that need to trust it.
    pub fn root_cert_pem(&self) -> String {
        self.cert.pem()
    }
}

fn ca_params(common_name: &str) -> ProxyResult<CertificateParams> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(2));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::ContentCommitment,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
        KeyUsagePurpose::KeyAgreement,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_MAX_AGE_DAYS);
    Ok(params)
}

#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> ProxyResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, content)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> ProxyResult<()> {
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_and_reload_ca() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca-cert.pem");
        let key_path = dir.path().join("ca-key.pem");

        let ca = CertificateAuthority::load_or_create(&cert_path, &key_path, "test CA").unwrap();
        assert!(cert_path.exists());
        assert!(key_path.exists());

        let reloaded = CertificateAuthority::load_or_create(&cert_path, &key_path, "test CA").unwrap();
        assert_eq!(ca.root_cert_pem(), reloaded.root_cert_pem());
    }

    #[test]
    fn test_mint_leaf_for_domain() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(
            &dir.path().join("ca-cert.pem"),
            &dir.path().join("ca-key.pem"),
            "test CA",
        )
        .unwrap();

        let leaf = ca.mint_leaf("example.com").unwrap();
        assert_eq!(leaf.chain.len(), 2);
    }
}
