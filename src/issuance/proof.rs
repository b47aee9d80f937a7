//! Proof object channel for HTTP-01 challenges.
//!
//! Every mutation of the bucket goes through a pre-signed URL that expires
//! after `ttl`, so the long-lived storage token never touches object data.

use std::time::Duration;

use log::{debug, info, warn};
use reqwest::Url;
use thiserror::Error;

use crate::logging::RunScope;
use crate::storage::{
    BucketRef, ObjectAcl, ObjectMethod, ObjectStorage, ProbeError, PublicProbe, SignedTransfer,
    StorageError,
};

pub const PROOF_CONTENT_TYPE: &str = "text/plain";

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("could not obtain a pre-signed {method} url for {name}: {source}")]
    Grant {
        name: String,
        method: &'static str,
        #[source]
        source: StorageError,
    },
    #[error("upload of {name} failed: {source}")]
    Upload {
        name: String,
        #[source]
        source: StorageError,
    },
    #[error("could not make {name} publicly readable: {source}")]
    Acl {
        name: String,
        #[source]
        source: StorageError,
    },
    #[error("cannot derive a proof location for {domain}: {detail}")]
    Location { domain: String, detail: String },
}

/// The proof object exists in the bucket but the public URL does not serve it.
#[derive(Error, Debug)]
#[error("proof object is not publicly reachable: {probe}")]
pub struct VerificationError {
    #[source]
    pub probe: ProbeError,
}

#[derive(Error, Debug)]
#[error("failed to remove proof object {name}: {source}")]
pub struct CleanupFailed {
    pub name: String,
    #[source]
    pub source: StorageError,
}

/// Name and body of the object answering one HTTP-01 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofObject {
    name: String,
    content: String,
}

impl ProofObject {
    /// `name` is `.well-known/acme-challenge/<token>` with the token
    /// percent-escaped; `content` is the key authorization
    /// `<token>.<thumbprint>`.
    pub fn new(domain: &str, token: &str, thumbprint: &str) -> Result<Self, ChannelError> {
        let location = |detail: String| ChannelError::Location {
            domain: domain.to_string(),
            detail,
        };
        let mut url = Url::parse(&format!("http://{domain}/")).map_err(|e| location(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| location("url cannot carry a path".into()))?
            .clear()
            .extend([".well-known", "acme-challenge", token]);

        Ok(Self {
            name: url.path().trim_start_matches('/').to_string(),
            content: format!("{token}.{thumbprint}"),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

pub struct ProofObjectChannel<'a> {
    storage: &'a dyn ObjectStorage,
    transfer: &'a dyn SignedTransfer,
    probe: &'a dyn PublicProbe,
    bucket: BucketRef,
    ttl: Duration,
    scope: RunScope,
}

impl<'a> ProofObjectChannel<'a> {
    pub fn new(
        storage: &'a dyn ObjectStorage,
        transfer: &'a dyn SignedTransfer,
        probe: &'a dyn PublicProbe,
        bucket: BucketRef,
        ttl: Duration,
        scope: RunScope,
    ) -> Self {
        Self {
            storage,
            transfer,
            probe,
            bucket,
            ttl,
            scope,
        }
    }

    /// Uploads `content` as `name` through a PUT url valid for the channel's ttl.
    pub fn publish(
        &self,
        name: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<(), ChannelError> {
        info!("[proof {}] publishing {} to {}", self.scope, name, self.bucket);
        let url = self
            .storage
            .object_url(
                &self.bucket,
                name,
                ObjectMethod::Put,
                Some(content_type),
                self.ttl,
            )
            .map_err(|source| ChannelError::Grant {
                name: name.to_string(),
                method: ObjectMethod::Put.as_str(),
                source,
            })?;
        self.transfer
            .put(&url, content, content_type)
            .map_err(|source| ChannelError::Upload {
                name: name.to_string(),
                source,
            })
    }

    pub fn make_public(&self, name: &str) -> Result<(), ChannelError> {
        debug!("[proof {}] setting {} public-read", self.scope, name);
        self.storage
            .set_object_acl(&self.bucket, name, ObjectAcl::PublicRead)
            .map_err(|source| ChannelError::Acl {
                name: name.to_string(),
                source,
            })
    }

    /// Unauthenticated HEAD of `http://<domain>/<name>`.
    pub fn verify_reachable(&self, domain: &str, name: &str) -> Result<(), VerificationError> {
        let url = format!("http://{domain}/{name}");
        debug!("[proof {}] checking {} is reachable", self.scope, url);
        self.probe
            .head(&url)
            .map_err(|probe| VerificationError { probe })
    }

    /// Deletes `name` through a DELETE url valid for the channel's ttl.
    pub fn remove(&self, name: &str) -> Result<(), CleanupFailed> {
        info!("[proof {}] removing {} from {}", self.scope, name, self.bucket);
        let failed = |source| CleanupFailed {
            name: name.to_string(),
            source,
        };
        let url = self
            .storage
            .object_url(&self.bucket, name, ObjectMethod::Delete, None, self.ttl)
            .map_err(failed)?;
        self.transfer.delete(&url).map_err(failed)
    }

    /// Opens the cleanup region for `name`. The object is removed exactly
    /// once: by [`ProofCleanup::release`] or, failing that, when the guard
    /// is dropped.
    pub fn cleanup_guard<'c>(&'c self, name: &str) -> ProofCleanup<'c, 'a> {
        ProofCleanup {
            channel: self,
            name: name.to_string(),
            armed: true,
        }
    }
}

#[must_use = "dropping the guard removes the proof object immediately"]
pub struct ProofCleanup<'c, 'a> {
    channel: &'c ProofObjectChannel<'a>,
    name: String,
    armed: bool,
}

impl ProofCleanup<'_, '_> {
    /// Removes the proof object now and reports the outcome to the caller.
    pub fn release(mut self) -> Result<(), CleanupFailed> {
        self.armed = false;
        self.channel.remove(&self.name)
    }
}

impl Drop for ProofCleanup<'_, '_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.channel.remove(&self.name) {
            warn!("[proof {}] {}", self.channel.scope, err);
        }
    }
}
