use std::fmt;

use log::info;
use openssl::{
    bn::BigNum,
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    stack::Stack,
    x509::{X509NameBuilder, X509ReqBuilder, extension::SubjectAlternativeName},
};
use thiserror::Error;
use x509_parser::{
    certification_request::X509CertificationRequest, extensions::GeneralName,
    extensions::ParsedExtension, prelude::FromDer,
};
use zeroize::Zeroizing;

pub const SUPPORTED_KEY_SIZES: [u32; 3] = [2048, 3072, 4096];
pub const PUBLIC_EXPONENT: u32 = 65537;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Unsupported RSA key size {0}. Allowed: 2048, 3072, 4096")]
    UnsupportedKeySize(u32),
    #[error("key generation failed: {0}")]
    Generation(String),
    #[error("failed to build signing request for {domain}: {reason}")]
    SigningRequest { domain: String, reason: String },
    #[error("failed to serialize key material: {0}")]
    Serialize(String),
}

/// RSA key pair for the certificate being issued. Lives only in memory.
pub struct KeyPair {
    pkey: PKey<Private>,
    bits: u32,
    public_exponent: u32,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("bits", &self.bits)
            .field("public_exponent", &self.public_exponent)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl KeyPair {
    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn public_exponent(&self) -> u32 {
        self.public_exponent
    }

    /// DER-encoded SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> Result<Vec<u8>, KeyError> {
        self.pkey
            .public_key_to_der()
            .map_err(|e| KeyError::Serialize(e.to_string()))
    }

    /// Traditional (PKCS#1) PEM encoding, the form the storage provider accepts.
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>, KeyError> {
        let rsa = self
            .pkey
            .rsa()
            .map_err(|e| KeyError::Serialize(e.to_string()))?;
        let pem = Zeroizing::new(
            rsa.private_key_to_pem()
                .map_err(|e| KeyError::Serialize(e.to_string()))?,
        );
        let pem = std::str::from_utf8(&pem)
            .map_err(|_| KeyError::Serialize("private key PEM contained invalid UTF-8".into()))?;
        Ok(Zeroizing::new(pem.to_string()))
    }
}

/// Certificate signing request bound to a single domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    domain: String,
    der: Vec<u8>,
}

impl SigningRequest {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// DNS names listed in the request's subjectAltName extension.
    pub fn subject_alt_names(&self) -> Result<Vec<String>, KeyError> {
        let csr = self.parse()?;
        let mut names = Vec::new();
        if let Some(extensions) = csr.requested_extensions() {
            for extension in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = extension {
                    for name in &san.general_names {
                        if let GeneralName::DNSName(dns) = name {
                            names.push(dns.to_string());
                        }
                    }
                }
            }
        }
        Ok(names)
    }

    /// DER-encoded SubjectPublicKeyInfo embedded in the request.
    pub fn public_key_der(&self) -> Result<Vec<u8>, KeyError> {
        let csr = self.parse()?;
        Ok(csr.certification_request_info.subject_pki.raw.to_vec())
    }

    fn parse(&self) -> Result<X509CertificationRequest<'_>, KeyError> {
        X509CertificationRequest::from_der(&self.der)
            .map(|(_, csr)| csr)
            .map_err(|e| self.error(e.to_string()))
    }

    fn error(&self, reason: String) -> KeyError {
        KeyError::SigningRequest {
            domain: self.domain.clone(),
            reason,
        }
    }
}

/// Generates an RSA key pair. Sizes outside [`SUPPORTED_KEY_SIZES`] are rejected.
pub fn generate(key_size_bits: u32) -> Result<KeyPair, KeyError> {
    if !SUPPORTED_KEY_SIZES.contains(&key_size_bits) {
        return Err(KeyError::UnsupportedKeySize(key_size_bits));
    }
    info!("[keys] generating {key_size_bits}-bit RSA private key");

    let generation = |e: ErrorStack| KeyError::Generation(e.to_string());
    let exponent = BigNum::from_u32(PUBLIC_EXPONENT).map_err(generation)?;
    let rsa = Rsa::generate_with_e(key_size_bits, &exponent).map_err(generation)?;
    let pkey = PKey::from_rsa(rsa).map_err(generation)?;

    Ok(KeyPair {
        pkey,
        bits: key_size_bits,
        public_exponent: PUBLIC_EXPONENT,
    })
}

/// Builds a SHA-256 signed request whose common name and only DNS
/// subjectAltName are `domain`.
pub fn build_signing_request(domain: &str, key: &KeyPair) -> Result<SigningRequest, KeyError> {
    info!("[keys] creating signing request for {domain}");
    let failed = |e: ErrorStack| KeyError::SigningRequest {
        domain: domain.to_string(),
        reason: e.to_string(),
    };

    let mut name = X509NameBuilder::new().map_err(failed)?;
    name.append_entry_by_nid(Nid::COMMONNAME, domain)
        .map_err(failed)?;
    let name = name.build();

    let mut builder = X509ReqBuilder::new().map_err(failed)?;
    builder.set_version(0).map_err(failed)?;
    builder.set_subject_name(&name).map_err(failed)?;
    builder.set_pubkey(&key.pkey).map_err(failed)?;

    let san = SubjectAlternativeName::new()
        .dns(domain)
        .build(&builder.x509v3_context(None))
        .map_err(failed)?;
    let mut extensions = Stack::new().map_err(failed)?;
    extensions.push(san).map_err(failed)?;
    builder.add_extensions(&extensions).map_err(failed)?;

    builder
        .sign(&key.pkey, MessageDigest::sha256())
        .map_err(failed)?;
    let der = builder.build().to_der().map_err(failed)?;

    let request = SigningRequest {
        domain: domain.to_string(),
        der,
    };
    let names = request.subject_alt_names()?;
    if names != [domain] {
        return Err(request.error(format!("unexpected subjectAltName list {names:?}")));
    }
    Ok(request)
}
