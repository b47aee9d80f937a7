//! Certificate authority collaborator.
//!
//! The orchestration code only talks to the authority through [`AcmeProtocol`],
//! so the real RFC 8555 client and test doubles are interchangeable.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use super::keys::SigningRequest;

/// Challenge type proven by publishing a file under `/.well-known/acme-challenge/`.
pub const HTTP_01: &str = "http-01";

/// Status shared by ACME orders, authorizations and challenges.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Status {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Other(String),
}

impl From<String> for Status {
    fn from(value: String) -> Self {
        match value.as_str() {
            "pending" => Status::Pending,
            "ready" => Status::Ready,
            "processing" => Status::Processing,
            "valid" => Status::Valid,
            "invalid" => Status::Invalid,
            _ => Status::Other(value),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => f.write_str("pending"),
            Status::Ready => f.write_str("ready"),
            Status::Processing => f.write_str("processing"),
            Status::Valid => f.write_str("valid"),
            Status::Invalid => f.write_str("invalid"),
            Status::Other(raw) => f.write_str(raw),
        }
    }
}

impl Status {
    /// Challenge and authorization states the authority may still move out of.
    pub fn is_transient(&self) -> bool {
        matches!(self, Status::Pending | Status::Processing)
    }
}

/// Registered account; the thumbprint binds challenge proofs to the account key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub url: String,
    pub key_thumbprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub url: String,
    pub status: Status,
    pub identifiers: Vec<String>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    pub certificate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub url: String,
    pub domain: String,
    pub status: Status,
    pub challenges: Vec<Challenge>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub url: String,
    pub kind: String,
    pub token: String,
    pub status: Status,
}

/// RFC 7807 problem document returned by the authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub detail: String,
}

impl Problem {
    pub fn is_bad_nonce(&self) -> bool {
        self.kind == "urn:ietf:params:acme:error:badNonce"
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind.is_empty(), self.detail.is_empty()) {
            (true, _) => f.write_str(&self.detail),
            (false, true) => f.write_str(&self.kind),
            (false, false) => write!(f, "{}: {}", self.kind, self.detail),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("certificate authority rejected {operation} ({status}): {problem}")]
    Rejected {
        operation: &'static str,
        status: u16,
        problem: Problem,
    },
    #[error("certificate authority rate limit exceeded during {operation}: {problem}")]
    RateLimited {
        operation: &'static str,
        problem: Problem,
    },
    #[error("transport error during {operation}: {detail}")]
    Transport {
        operation: &'static str,
        detail: String,
    },
    #[error("unexpected response to {operation}: {detail}")]
    Malformed {
        operation: &'static str,
        detail: String,
    },
    #[error("account key error: {0}")]
    Key(String),
}

/// Operations the provisioning flow needs from a certificate authority.
pub trait AcmeProtocol {
    /// Registers (or looks up) the account bound to the client's key.
    fn register(&mut self, terms_agreed: bool, contacts: &[String])
    -> Result<Account, ProtocolError>;

    fn new_order(&mut self, domains: &[String]) -> Result<Order, ProtocolError>;

    fn authorization(&mut self, url: &str) -> Result<Authorization, ProtocolError>;

    /// Tells the authority the challenge is ready to be validated.
    fn respond(&mut self, challenge: &Challenge) -> Result<Challenge, ProtocolError>;

    fn refresh_challenge(&mut self, challenge: &Challenge) -> Result<Challenge, ProtocolError>;

    fn finalize(&mut self, order: &Order, csr: &SigningRequest) -> Result<Order, ProtocolError>;

    fn refresh_order(&mut self, order: &Order) -> Result<Order, ProtocolError>;

    /// Downloads the PEM certificate chain of a valid order.
    fn certificate(&mut self, order: &Order) -> Result<String, ProtocolError>;
}
