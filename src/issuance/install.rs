//! Certificate Installer.
//!
//! The provider keeps one certificate per bucket and refuses an upload onto
//! an occupied slot, so rotation is delete-then-upload. Between the two calls
//! the bucket has no certificate; an upload failure in that window is
//! reported as [`InstallError::SlotLeftEmpty`].

use log::{error, info};
use thiserror::Error;

use crate::certificate::{Certificate, CertificateError};
use crate::logging::RunScope;
use crate::storage::{BucketRef, ObjectStorage, StorageError};

use super::keys::{KeyError, KeyPair};

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("certificate does not match the generated private key")]
    KeyMismatch,
    #[error("certificate cannot be installed: {0}")]
    InvalidCertificate(#[source] CertificateError),
    #[error("private key cannot be exported: {0}")]
    Key(#[source] KeyError),
    #[error("could not determine the installed certificate of {bucket}: {source}")]
    StatusCheckFailed {
        bucket: BucketRef,
        #[source]
        source: StorageError,
    },
    #[error("could not remove the installed certificate of {bucket}: {source}")]
    RemoveFailed {
        bucket: BucketRef,
        #[source]
        source: StorageError,
    },
    #[error("could not upload the certificate to {bucket}: {source}")]
    UploadFailed {
        bucket: BucketRef,
        #[source]
        source: StorageError,
    },
    #[error(
        "old certificate of {bucket} was removed but the new one was not uploaded; \
         the bucket has no certificate and needs manual remediation: {source}"
    )]
    SlotLeftEmpty {
        bucket: BucketRef,
        #[source]
        source: StorageError,
    },
}

impl InstallError {
    pub fn requires_manual_remediation(&self) -> bool {
        matches!(self, InstallError::SlotLeftEmpty { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
    pub replaced_existing: bool,
}

pub struct CertificateInstaller<'a> {
    storage: &'a dyn ObjectStorage,
    scope: RunScope,
}

impl<'a> CertificateInstaller<'a> {
    pub fn new(storage: &'a dyn ObjectStorage, scope: RunScope) -> Self {
        Self { storage, scope }
    }

    /// Replaces the certificate installed on `bucket`. Nothing is retried.
    pub fn install(
        &self,
        bucket: &BucketRef,
        certificate: &Certificate,
        key: &KeyPair,
    ) -> Result<InstallOutcome, InstallError> {
        let leaf_key = certificate
            .public_key_der()
            .map_err(InstallError::InvalidCertificate)?;
        if leaf_key != key.public_key_der().map_err(InstallError::Key)? {
            return Err(InstallError::KeyMismatch);
        }
        let private_key = key.private_key_pem().map_err(InstallError::Key)?;

        let occupied = self
            .storage
            .certificate_installed(bucket)
            .map_err(|source| InstallError::StatusCheckFailed {
                bucket: bucket.clone(),
                source,
            })?;
        if occupied {
            info!("[install {}] removing installed certificate from {}", self.scope, bucket);
            self.storage
                .delete_certificate(bucket)
                .map_err(|source| InstallError::RemoveFailed {
                    bucket: bucket.clone(),
                    source,
                })?;
        }

        info!("[install {}] uploading certificate to {}", self.scope, bucket);
        if let Err(source) =
            self.storage
                .upload_certificate(bucket, certificate.pem(), private_key.as_str())
        {
            if occupied {
                let err = InstallError::SlotLeftEmpty {
                    bucket: bucket.clone(),
                    source,
                };
                error!("[install {}] {}", self.scope, err);
                return Err(err);
            }
            return Err(InstallError::UploadFailed {
                bucket: bucket.clone(),
                source,
            });
        }

        info!("[install {}] certificate installed on {}", self.scope, bucket);
        Ok(InstallOutcome {
            replaced_existing: occupied,
        })
    }
}
