//! PKI helpers for agent TLS identity.
//!
//! The agent never signs anything itself; the cluster's servers do. This
//! module covers what the agent needs locally: parsing validity windows out
//! of delivered certificates, checking that a leaf chains to one of a set of
//! trust roots, and minting throwaway CAs and leaves for test harnesses and
//! local tooling.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// PKI errors.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),
}

/// Result type for PKI operations.
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes.
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is after 1970")
        .as_secs() as i64
}

/// Information about a certificate's validity window.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Serial number, colon-separated hex
    pub serial: String,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate.
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            serial: cert.raw_serial_as_string(),
        })
    }

    /// Seconds remaining until the certificate expires.
    pub fn remaining_secs(&self) -> i64 {
        self.not_after - unix_now()
    }

    /// Check if the certificate has expired.
    pub fn is_expired(&self) -> bool {
        self.remaining_secs() <= 0
    }
}

/// Verify that `leaf_pem` was signed by one of `root_pems`.
///
/// Only the signature is checked; validity windows are the caller's concern
/// (an expired-but-chained leaf is still useful to install while a fresh one
/// is being fetched).
pub fn leaf_chains_to_any(leaf_pem: &str, root_pems: &[String]) -> Result<bool> {
    let leaf_der = parse_pem(leaf_pem)?;
    let (_, leaf) = X509Certificate::from_der(&leaf_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse leaf: {}", e)))?;

    for root_pem in root_pems {
        let root_der = match parse_pem(root_pem) {
            Ok(der) => der,
            Err(_) => continue,
        };
        let Ok((_, root)) = X509Certificate::from_der(&root_der) else {
            continue;
        };
        if leaf.verify_signature(Some(root.public_key())).is_ok() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Material for a freshly issued leaf certificate.
#[derive(Debug, Clone)]
pub struct LeafMaterial {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
    /// Start of validity (Unix timestamp)
    pub not_before: i64,
    /// End of validity (Unix timestamp)
    pub not_after: i64,
    /// Serial number assigned to the leaf
    pub serial: u64,
}

/// A self-signed certificate authority.
///
/// Test harnesses and local tooling use this to mint trust roots and leaves;
/// in production the cluster's servers play this role.
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
    serial: u64,
}

impl CertificateAuthority {
    /// Create a new self-signed CA with the given common name.
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now - ::time::Duration::minutes(1);
        params.not_after = now + ::time::Duration::days(10 * 365);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
            serial: 1,
        })
    }

    /// The CA certificate in PEM format.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Issue a leaf certificate for `common_name` valid for `ttl` from now.
    ///
    /// A zero or negative `ttl` produces an already-expired leaf, which is
    /// how expiry handling gets exercised without waiting out a real
    /// validity window.
    pub fn issue_leaf(&mut self, common_name: &str, ttl: ::time::Duration) -> Result<LeafMaterial> {
        let serial = self.serial;
        self.serial += 1;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.serial_number = Some(SerialNumber::from(serial));

        let now = ::time::OffsetDateTime::now_utc();
        let not_before = now - ::time::Duration::minutes(1);
        let not_after = now + ttl;
        params.not_before = not_before;
        params.not_after = not_after;

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate leaf key: {}", e))
        })?;
        let key_pem = leaf_key.serialize_pem();

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign leaf: {}", e))
        })?;

        Ok(LeafMaterial {
            cert_pem: cert.pem(),
            key_pem,
            not_before: not_before.unix_timestamp(),
            not_after: not_after.unix_timestamp(),
            serial,
        })
    }
}
