//! Authorization Resolver: proves control of each domain on an order.

use log::{debug, info, warn};
use thiserror::Error;

use crate::logging::RunScope;
use crate::poll::{PollError, PollPolicy};

use super::proof::{
    ChannelError, CleanupFailed, PROOF_CONTENT_TYPE, ProofObject, ProofObjectChannel,
    VerificationError,
};
use super::protocol::{
    AcmeProtocol, Account, Authorization, Challenge, Order, ProtocolError, Status,
};

#[derive(Error, Debug)]
pub enum AuthorizationError {
    #[error("failed to fetch authorization {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: ProtocolError,
    },
    #[error("no supported challenge for {domain}; offered {offered:?}, supported {supported:?}")]
    UnsupportedChallenge {
        domain: String,
        offered: Vec<String>,
        supported: Vec<String>,
    },
    #[error("failed to publish proof for {domain}: {source}")]
    PublishFailed {
        domain: String,
        #[source]
        source: ChannelError,
    },
    #[error("proof for {domain} could not be verified: {source}")]
    VerificationFailed {
        domain: String,
        #[source]
        source: VerificationError,
    },
    #[error("challenge for {domain} could not be submitted: {source}")]
    RespondFailed {
        domain: String,
        #[source]
        source: ProtocolError,
    },
    #[error("challenge for {domain} ended with status {status}")]
    ChallengeFailed { domain: String, status: Status },
    #[error("challenge for {domain} still unsettled after {attempts} status checks")]
    ChallengeTimedOut { domain: String, attempts: u32 },
    #[error("authorization for {domain} is {status}")]
    AuthorizationInvalid { domain: String, status: Status },
}

/// Outcome of a successful resolution. Cleanup failures do not fail the
/// authorization but are carried here so the caller can surface them.
#[derive(Debug, Default)]
pub struct ResolutionReport {
    pub validated: Vec<String>,
    pub already_valid: Vec<String>,
    pub cleanup_failures: Vec<CleanupFailed>,
}

pub struct AuthorizationResolver<'a> {
    channel: &'a ProofObjectChannel<'a>,
    challenge_poll: PollPolicy,
    scope: RunScope,
}

impl<'a> AuthorizationResolver<'a> {
    pub fn new(
        channel: &'a ProofObjectChannel<'a>,
        challenge_poll: PollPolicy,
        scope: RunScope,
    ) -> Self {
        Self {
            channel,
            challenge_poll,
            scope,
        }
    }

    /// Resolves every authorization on `order` in sequence, stopping at the
    /// first failure.
    pub fn resolve(
        &self,
        acme: &mut dyn AcmeProtocol,
        order: &Order,
        account: &Account,
        supported: &[String],
    ) -> Result<ResolutionReport, AuthorizationError> {
        let mut report = ResolutionReport::default();
        for url in &order.authorizations {
            let authorization =
                acme.authorization(url)
                    .map_err(|source| AuthorizationError::Fetch {
                        url: url.clone(),
                        source,
                    })?;

            if authorization.status == Status::Valid {
                info!(
                    "[authz {}] {} already authorized",
                    self.scope, authorization.domain
                );
                report.already_valid.push(authorization.domain);
                continue;
            }
            if authorization.status != Status::Pending {
                return Err(AuthorizationError::AuthorizationInvalid {
                    domain: authorization.domain,
                    status: authorization.status,
                });
            }

            let challenge = select_challenge(&authorization, supported)?;
            if let Some(failure) = self.prove(acme, &authorization, challenge, account)? {
                report.cleanup_failures.push(failure);
            }
            report.validated.push(authorization.domain);
        }
        Ok(report)
    }

    /// Publishes, verifies and submits one challenge. Returns the cleanup
    /// failure, if any, of an otherwise successful proof.
    fn prove(
        &self,
        acme: &mut dyn AcmeProtocol,
        authorization: &Authorization,
        challenge: &Challenge,
        account: &Account,
    ) -> Result<Option<CleanupFailed>, AuthorizationError> {
        let domain = &authorization.domain;
        let proof = ProofObject::new(domain, &challenge.token, &account.key_thumbprint)
            .map_err(|source| AuthorizationError::PublishFailed {
                domain: domain.clone(),
                source,
            })?;
        info!(
            "[authz {}] proving {} with {} challenge",
            self.scope, domain, challenge.kind
        );

        let cleanup = self.channel.cleanup_guard(proof.name());
        let outcome = self.publish_and_validate(acme, domain, &proof, challenge);
        let cleaned = cleanup.release();

        match (outcome, cleaned) {
            (Ok(()), Ok(())) => Ok(None),
            (Ok(()), Err(failure)) => {
                warn!("[authz {}] {}", self.scope, failure);
                Ok(Some(failure))
            }
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(failure)) => {
                warn!("[authz {}] {}", self.scope, failure);
                Err(err)
            }
        }
    }

    fn publish_and_validate(
        &self,
        acme: &mut dyn AcmeProtocol,
        domain: &str,
        proof: &ProofObject,
        challenge: &Challenge,
    ) -> Result<(), AuthorizationError> {
        let publish_failed = |source| AuthorizationError::PublishFailed {
            domain: domain.to_string(),
            source,
        };
        self.channel
            .publish(
                proof.name(),
                proof.content().as_bytes(),
                PROOF_CONTENT_TYPE,
            )
            .map_err(publish_failed)?;
        self.channel
            .make_public(proof.name())
            .map_err(publish_failed)?;
        self.channel
            .verify_reachable(domain, proof.name())
            .map_err(|source| AuthorizationError::VerificationFailed {
                domain: domain.to_string(),
                source,
            })?;

        let submitted = acme
            .respond(challenge)
            .map_err(|source| AuthorizationError::RespondFailed {
                domain: domain.to_string(),
                source,
            })?;
        debug!(
            "[authz {}] challenge for {} submitted, status {}",
            self.scope, domain, submitted.status
        );

        let settled = self
            .challenge_poll
            .poll(
                "challenge",
                submitted,
                || acme.refresh_challenge(challenge),
                |c: &Challenge| !c.status.is_transient(),
            )
            .map_err(|err| match err {
                PollError::Exhausted { attempts } => AuthorizationError::ChallengeTimedOut {
                    domain: domain.to_string(),
                    attempts,
                },
                PollError::Failed(source) => AuthorizationError::RespondFailed {
                    domain: domain.to_string(),
                    source,
                },
            })?;

        if settled.status != Status::Valid {
            return Err(AuthorizationError::ChallengeFailed {
                domain: domain.to_string(),
                status: settled.status,
            });
        }
        info!("[authz {}] {} validated", self.scope, domain);
        Ok(())
    }
}

/// First challenge, in the authority's order, whose type is supported.
pub fn select_challenge<'z>(
    authorization: &'z Authorization,
    supported: &[String],
) -> Result<&'z Challenge, AuthorizationError> {
    authorization
        .challenges
        .iter()
        .find(|c| supported.iter().any(|s| s == &c.kind))
        .ok_or_else(|| AuthorizationError::UnsupportedChallenge {
            domain: authorization.domain.clone(),
            offered: authorization
                .challenges
                .iter()
                .map(|c| c.kind.clone())
                .collect(),
            supported: supported.to_vec(),
        })
}
