//! Issued certificate chain as returned by the authority.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::{extensions::GeneralName, parse_x509_certificate, prelude::X509Certificate};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    #[error("failed to parse certificate chain PEM: {0}")]
    Pem(String),
    #[error("no certificate PEM blocks found")]
    Empty,
    #[error("invalid leaf certificate: {0}")]
    Invalid(String),
}

/// PEM chain with the leaf first, plus the leaf's DER for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    chain_pem: String,
    leaf_der: Vec<u8>,
    chain_len: usize,
}

impl Certificate {
    pub fn from_pem_chain(chain_pem: &str) -> Result<Self, CertificateError> {
        let blocks =
            pem::parse_many(chain_pem).map_err(|e| CertificateError::Pem(e.to_string()))?;
        let mut certificates = blocks
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE");
        let leaf = certificates.next().ok_or(CertificateError::Empty)?;
        let chain_len = 1 + certificates.count();

        let certificate = Self {
            chain_pem: chain_pem.trim().to_string() + "\n",
            leaf_der: leaf.into_contents(),
            chain_len,
        };
        certificate.leaf()?;
        Ok(certificate)
    }

    /// Full chain exactly as it will be uploaded.
    pub fn pem(&self) -> &str {
        &self.chain_pem
    }

    pub fn leaf_der(&self) -> &[u8] {
        &self.leaf_der
    }

    pub fn chain_len(&self) -> usize {
        self.chain_len
    }

    /// DER SubjectPublicKeyInfo of the leaf.
    pub fn public_key_der(&self) -> Result<Vec<u8>, CertificateError> {
        Ok(self.leaf()?.public_key().raw.to_vec())
    }

    pub fn summary(&self) -> Result<CertificateSummary, CertificateError> {
        let cert = self.leaf()?;
        let sans = match cert.subject_alternative_name() {
            Ok(Some(ext)) => ext
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => return Err(CertificateError::Invalid(e.to_string())),
        };

        Ok(CertificateSummary {
            serial: cert.raw_serial_as_string(),
            fingerprint_sha256: hex::encode(Sha256::digest(&self.leaf_der)),
            issuer: cert.issuer().to_string(),
            not_before: timestamp(cert.validity().not_before.timestamp())?,
            not_after: timestamp(cert.validity().not_after.timestamp())?,
            sans,
        })
    }

    fn leaf(&self) -> Result<X509Certificate<'_>, CertificateError> {
        parse_x509_certificate(&self.leaf_der)
            .map(|(_, cert)| cert)
            .map_err(|e| CertificateError::Invalid(e.to_string()))
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, CertificateError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| CertificateError::Invalid(format!("validity timestamp {secs} out of range")))
}

/// Operator-facing facts about an installed certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateSummary {
    pub serial: String,
    pub fingerprint_sha256: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub sans: Vec<String>,
}
