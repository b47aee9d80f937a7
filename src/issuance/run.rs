//! Provisioning Run: one end-to-end issuance and installation.

use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::account_key::{self, AccountKeyError};
use crate::certificate::{CertificateError, CertificateSummary};
use crate::config::{ConfigError, ProvisionConfig};
use crate::http;
use crate::logging::RunScope;
use crate::poll::PollPolicy;
use crate::storage::{
    BucketRef, HttpProbe, LinodeObjectStorage, ObjectStorage, PresignedTransfer, PublicProbe,
    SignedTransfer, StorageError,
};

use super::acme_client::AcmeClient;
use super::authorization::AuthorizationResolver;
use super::install::{CertificateInstaller, InstallError};
use super::keys::{self, KeyError};
use super::order::{OrderError, OrderOrchestrator, Registration};
use super::proof::ProofObjectChannel;
use super::protocol::AcmeProtocol;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    AccountKey(#[from] AccountKeyError),
    #[error("key material error: {0}")]
    Key(#[from] KeyError),
    #[error("failed to open {service} session: {detail}")]
    Session {
        service: &'static str,
        detail: String,
    },
    #[error("failed to look up bucket {bucket}: {source}")]
    BucketLookup {
        bucket: BucketRef,
        #[source]
        source: StorageError,
    },
    #[error("no bucket {0} found for this access token")]
    BucketNotFound(BucketRef),
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error("issued certificate cannot be summarized: {0}")]
    Certificate(#[from] CertificateError),
}

impl RunError {
    /// True when the bucket was left without a certificate and an operator
    /// has to restore one.
    pub fn requires_manual_remediation(&self) -> bool {
        matches!(self, RunError::Install(err) if err.requires_manual_remediation())
    }
}

/// Inputs of one run, independent of where they were read from.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub domain: String,
    pub bucket: BucketRef,
    pub key_size: u32,
    pub registration: Registration,
    pub supported_challenges: Vec<String>,
    pub proof_ttl: Duration,
    pub challenge_poll: PollPolicy,
    pub order_poll: PollPolicy,
}

impl RunSettings {
    pub fn from_config(config: &ProvisionConfig) -> Self {
        Self {
            domain: config.domain.clone(),
            bucket: config.bucket_ref(),
            key_size: config.key_size,
            registration: Registration::new(config.agree_terms, config.contact_email.as_deref()),
            supported_challenges: config.supported_challenges.clone(),
            proof_ttl: config.proof_ttl(),
            challenge_poll: config.challenge_poll,
            order_poll: config.order_poll,
        }
    }

    /// Checks that need no network access.
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.registration.terms_agreed {
            return Err(ConfigError::TermsNotAgreed);
        }
        if self.supported_challenges.is_empty() {
            return Err(ConfigError::NoChallenges);
        }
        self.challenge_poll
            .validate()
            .map_err(|source| ConfigError::Poll {
                which: "challenge_poll",
                source,
            })?;
        self.order_poll
            .validate()
            .map_err(|source| ConfigError::Poll {
                which: "order_poll",
                source,
            })?;
        Ok(())
    }
}

/// Remote parties a run talks to.
pub struct Collaborators<'a> {
    pub acme: &'a mut dyn AcmeProtocol,
    pub storage: &'a dyn ObjectStorage,
    pub transfer: &'a dyn SignedTransfer,
    pub probe: &'a dyn PublicProbe,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub domain: String,
    pub bucket: String,
    pub replaced_existing: bool,
    pub cleanup_warnings: usize,
    pub certificate: CertificateSummary,
}

pub struct ProvisioningRun {
    settings: RunSettings,
    scope: RunScope,
}

impl ProvisioningRun {
    pub fn new(settings: RunSettings, scope: RunScope) -> Self {
        Self { settings, scope }
    }

    pub fn scope(&self) -> &RunScope {
        &self.scope
    }

    /// Generates key material, obtains a certificate and installs it.
    pub fn execute(&self, remote: Collaborators<'_>) -> Result<RunReport, RunError> {
        let settings = &self.settings;
        settings.validate()?;

        let key = keys::generate(settings.key_size)?;
        let csr = keys::build_signing_request(&settings.domain, &key)?;

        info!("[run {}] looking up bucket {}", self.scope, settings.bucket);
        let buckets = remote
            .storage
            .buckets()
            .map_err(|source| RunError::BucketLookup {
                bucket: settings.bucket.clone(),
                source,
            })?;
        if !buckets.iter().any(|b| b.matches(&settings.bucket)) {
            return Err(RunError::BucketNotFound(settings.bucket.clone()));
        }

        let channel = ProofObjectChannel::new(
            remote.storage,
            remote.transfer,
            remote.probe,
            settings.bucket.clone(),
            settings.proof_ttl,
            self.scope.clone(),
        );
        let resolver =
            AuthorizationResolver::new(&channel, settings.challenge_poll, self.scope.clone());
        let orchestrator =
            OrderOrchestrator::new(&resolver, settings.order_poll, self.scope.clone());

        let issued = orchestrator.provision(
            remote.acme,
            &settings.domain,
            &settings.registration,
            &csr,
            &settings.supported_challenges,
        )?;
        for failure in &issued.authorizations.cleanup_failures {
            warn!("[run {}] leftover proof object: {}", self.scope, failure);
        }

        let summary = issued.certificate.summary()?;
        let installer = CertificateInstaller::new(remote.storage, self.scope.clone());
        let outcome = installer.install(&settings.bucket, &issued.certificate, &key)?;

        info!(
            "[run {}] installed certificate {} for {} (expires {})",
            self.scope, summary.serial, settings.domain, summary.not_after
        );
        Ok(RunReport {
            run_id: self.scope.id().to_string(),
            domain: settings.domain.clone(),
            bucket: settings.bucket.to_string(),
            replaced_existing: outcome.replaced_existing,
            cleanup_warnings: issued.authorizations.cleanup_failures.len(),
            certificate: summary,
        })
    }
}

/// Runs against the configured authority and storage provider. Both HTTP
/// sessions belong to this call and are closed when it returns.
pub fn provision(config: &ProvisionConfig) -> Result<RunReport, RunError> {
    let scope = RunScope::new();
    info!(
        "[run {}] provisioning {} on {}",
        scope,
        config.domain,
        config.bucket_ref()
    );
    config.require_terms()?;

    let account_key = account_key::load_or_create(config.account_key_path.as_deref())?;
    let acme_http = session("certificate authority", config)?;
    let storage_http = session("storage provider", config)?;

    let mut acme = AcmeClient::new(acme_http, config.directory_url.clone(), account_key);
    let storage = LinodeObjectStorage::new(
        storage_http.clone(),
        &config.storage_api_url,
        config.access_token().clone(),
    )
    .map_err(|source| RunError::Session {
        service: "storage provider",
        detail: source.to_string(),
    })?;
    let transfer = PresignedTransfer::new(storage_http);
    let probe = HttpProbe::new(&config.user_agent, config.http_timeout());

    let run = ProvisioningRun::new(RunSettings::from_config(config), scope);
    let result = run.execute(Collaborators {
        acme: &mut acme,
        storage: &storage,
        transfer: &transfer,
        probe: &probe,
    });
    if let Err(err) = &result
        && err.requires_manual_remediation()
    {
        error!("[run {}] manual remediation required: {}", run.scope(), err);
    }
    result
}

/// Whether the configured bucket currently has a certificate installed.
pub fn certificate_status(config: &ProvisionConfig) -> Result<bool, RunError> {
    let bucket = config.bucket_ref();
    let storage = LinodeObjectStorage::new(
        session("storage provider", config)?,
        &config.storage_api_url,
        config.access_token().clone(),
    )
    .map_err(|source| RunError::Session {
        service: "storage provider",
        detail: source.to_string(),
    })?;
    storage
        .certificate_installed(&bucket)
        .map_err(|source| RunError::BucketLookup { bucket, source })
}

fn session(
    service: &'static str,
    config: &ProvisionConfig,
) -> Result<reqwest::blocking::Client, RunError> {
    http::session(&config.user_agent, config.http_timeout()).map_err(|e| RunError::Session {
        service,
        detail: e.to_string(),
    })
}
