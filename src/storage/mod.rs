//! Object storage collaborator.
//!
//! [`ObjectStorage`] covers the provider API calls, [`SignedTransfer`] the
//! uploads and deletions performed through pre-signed URLs, and
//! [`PublicProbe`] the unauthenticated reachability check.

pub mod linode;
pub mod transfer;

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::http::{StatusClass, classify_status};

pub use linode::LinodeObjectStorage;
pub use transfer::{HttpProbe, PresignedTransfer};

/// Bucket addressed by cluster and label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRef {
    pub cluster: String,
    pub label: String,
}

impl BucketRef {
    pub fn new(cluster: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            label: label.into(),
        }
    }
}

impl fmt::Display for BucketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Bucket {
    pub cluster: String,
    pub label: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Bucket {
    pub fn matches(&self, target: &BucketRef) -> bool {
        self.cluster == target.cluster && self.label == target.label
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectMethod {
    Put,
    Delete,
}

impl ObjectMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectMethod::Put => "PUT",
            ObjectMethod::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectAcl {
    PublicRead,
}

impl ObjectAcl {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectAcl::PublicRead => "public-read",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage provider authentication failed during {operation} ({status}): {detail}")]
    Unauthorized {
        operation: &'static str,
        status: u16,
        detail: String,
    },
    #[error("storage provider rate limit exceeded during {operation} ({status}): {detail}")]
    RateLimited {
        operation: &'static str,
        status: u16,
        detail: String,
    },
    #[error("storage provider rejected {operation} ({status}): {detail}")]
    Api {
        operation: &'static str,
        status: u16,
        detail: String,
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
}

impl StorageError {
    pub fn from_status(operation: &'static str, status: StatusCode, detail: String) -> Self {
        let status_code = status.as_u16();
        match classify_status(status) {
            StatusClass::Unauthorized => StorageError::Unauthorized {
                operation,
                status: status_code,
                detail,
            },
            StatusClass::RateLimited => StorageError::RateLimited {
                operation,
                status: status_code,
                detail,
            },
            StatusClass::Other => StorageError::Api {
                operation,
                status: status_code,
                detail,
            },
        }
    }
}

/// Failure of the public reachability probe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{url} answered {}: {detail}", describe_status(.status))]
pub struct ProbeError {
    pub url: String,
    pub status: Option<u16>,
    pub detail: String,
}

fn describe_status(status: &Option<u16>) -> String {
    status.map_or_else(|| "no response".to_string(), |s| s.to_string())
}

/// Provider API surface needed to publish proofs and rotate the bucket certificate.
pub trait ObjectStorage {
    fn buckets(&self) -> Result<Vec<Bucket>, StorageError>;

    /// Pre-signed URL allowing `method` on object `name` for `expires_in`.
    fn object_url(
        &self,
        bucket: &BucketRef,
        name: &str,
        method: ObjectMethod,
        content_type: Option<&str>,
        expires_in: Duration,
    ) -> Result<String, StorageError>;

    fn set_object_acl(
        &self,
        bucket: &BucketRef,
        name: &str,
        acl: ObjectAcl,
    ) -> Result<(), StorageError>;

    fn certificate_installed(&self, bucket: &BucketRef) -> Result<bool, StorageError>;

    fn upload_certificate(
        &self,
        bucket: &BucketRef,
        certificate: &str,
        private_key: &str,
    ) -> Result<(), StorageError>;

    fn delete_certificate(&self, bucket: &BucketRef) -> Result<(), StorageError>;
}

/// Requests performed against pre-signed URLs.
pub trait SignedTransfer {
    fn put(&self, url: &str, body: &[u8], content_type: &str) -> Result<(), StorageError>;

    fn delete(&self, url: &str) -> Result<(), StorageError>;
}

/// Unauthenticated check that a URL answers with a success status.
pub trait PublicProbe {
    fn head(&self, url: &str) -> Result<(), ProbeError>;
}
