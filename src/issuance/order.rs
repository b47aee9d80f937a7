//! Order Orchestrator.
//!
//! START -> ACCOUNT_READY -> ORDER_CREATED -> AUTHORIZING -> FINALIZING -> CERT_READY.
//! The machine only moves forward; any failure abandons the order.

use log::{debug, info};
use thiserror::Error;

use crate::certificate::{Certificate, CertificateError};
use crate::logging::RunScope;
use crate::poll::{PollError, PollPolicy};

use super::authorization::{AuthorizationError, AuthorizationResolver, ResolutionReport};
use super::keys::SigningRequest;
use super::protocol::{AcmeProtocol, Account, Order, ProtocolError, Status};

/// Why no account handle could be obtained.
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// Refused locally; no request was sent.
    #[error("terms of service were not agreed to")]
    TermsNotAgreed,
    #[error(transparent)]
    Rejected(#[from] ProtocolError),
}

#[derive(Error, Debug)]
pub enum OrderError {
    #[error("account registration failed: {0}")]
    AccountRegistrationFailed(#[source] RegistrationError),
    #[error("signing request is for {csr_domain}, order is for {domain}")]
    SigningRequestMismatch { domain: String, csr_domain: String },
    #[error("order creation failed: {0}")]
    OrderCreationFailed(#[source] ProtocolError),
    #[error("authorization failed: {0}")]
    AuthorizationFailed(#[from] AuthorizationError),
    #[error("order status check failed: {0}")]
    StatusCheckFailed(#[source] ProtocolError),
    #[error("order is {0} after authorization; cannot finalize")]
    NotReady(Status),
    #[error("order still pending after {attempts} status checks")]
    ReadinessTimedOut { attempts: u32 },
    #[error("finalize request failed: {0}")]
    FinalizeRequestFailed(#[source] ProtocolError),
    #[error("finalization ended with status {0}")]
    FinalizationFailed(Status),
    #[error("order still processing after {attempts} status checks")]
    FinalizationTimedOut { attempts: u32 },
    #[error("certificate download failed: {0}")]
    CertificateFetchFailed(#[source] ProtocolError),
    #[error("authority returned an unusable certificate: {0}")]
    CertificateUnreadable(#[source] CertificateError),
}

/// Account registration parameters supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub terms_agreed: bool,
    pub contacts: Vec<String>,
}

impl Registration {
    pub fn new(terms_agreed: bool, contact_email: Option<&str>) -> Self {
        Self {
            terms_agreed,
            contacts: contact_email
                .map(|email| vec![format!("mailto:{email}")])
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug)]
pub struct Issued {
    pub certificate: Certificate,
    pub authorizations: ResolutionReport,
}

pub struct OrderOrchestrator<'a> {
    resolver: &'a AuthorizationResolver<'a>,
    order_poll: PollPolicy,
    scope: RunScope,
}

impl<'a> OrderOrchestrator<'a> {
    pub fn new(
        resolver: &'a AuthorizationResolver<'a>,
        order_poll: PollPolicy,
        scope: RunScope,
    ) -> Self {
        Self {
            resolver,
            order_poll,
            scope,
        }
    }

    /// START -> ACCOUNT_READY. Refuses before any request when terms are not agreed.
    pub fn register(
        &self,
        acme: &mut dyn AcmeProtocol,
        registration: &Registration,
    ) -> Result<Account, OrderError> {
        if !registration.terms_agreed {
            return Err(OrderError::AccountRegistrationFailed(
                RegistrationError::TermsNotAgreed,
            ));
        }
        info!("[order {}] registering account", self.scope);
        let account = acme
            .register(true, &registration.contacts)
            .map_err(|e| OrderError::AccountRegistrationFailed(e.into()))?;
        debug!("[order {}] account {}", self.scope, account.url);
        Ok(account)
    }

    /// Runs the full machine and returns the issued certificate.
    pub fn provision(
        &self,
        acme: &mut dyn AcmeProtocol,
        domain: &str,
        registration: &Registration,
        csr: &SigningRequest,
        supported: &[String],
    ) -> Result<Issued, OrderError> {
        if csr.domain() != domain {
            return Err(OrderError::SigningRequestMismatch {
                domain: domain.to_string(),
                csr_domain: csr.domain().to_string(),
            });
        }
        let account = self.register(acme, registration)?;

        info!("[order {}] creating order for {}", self.scope, domain);
        let order = acme
            .new_order(&[domain.to_string()])
            .map_err(OrderError::OrderCreationFailed)?;
        debug!(
            "[order {}] order {} is {} with {} authorizations",
            self.scope,
            order.url,
            order.status,
            order.authorizations.len()
        );

        let authorizations = if order.status == Status::Pending {
            self.resolver.resolve(acme, &order, &account, supported)?
        } else {
            ResolutionReport::default()
        };

        let order = self.await_ready(acme, order)?;
        let order = self.finalize(acme, order, csr)?;

        info!("[order {}] downloading certificate", self.scope);
        let chain = acme
            .certificate(&order)
            .map_err(OrderError::CertificateFetchFailed)?;
        let certificate =
            Certificate::from_pem_chain(&chain).map_err(OrderError::CertificateUnreadable)?;

        Ok(Issued {
            certificate,
            authorizations,
        })
    }

    /// Waits for the order to leave `pending` once all authorizations are done.
    fn await_ready(&self, acme: &mut dyn AcmeProtocol, order: Order) -> Result<Order, OrderError> {
        let handle = order.clone();
        let order = self
            .order_poll
            .poll(
                "order readiness",
                order,
                || acme.refresh_order(&handle),
                |o: &Order| o.status != Status::Pending,
            )
            .map_err(|err| match err {
                PollError::Exhausted { attempts } => OrderError::ReadinessTimedOut { attempts },
                PollError::Failed(source) => OrderError::StatusCheckFailed(source),
            })?;
        if matches!(
            order.status,
            Status::Ready | Status::Processing | Status::Valid
        ) {
            Ok(order)
        } else {
            Err(OrderError::NotReady(order.status))
        }
    }

    /// FINALIZING: submits the request when the order is `ready`, then waits
    /// for it to leave `processing`.
    fn finalize(
        &self,
        acme: &mut dyn AcmeProtocol,
        order: Order,
        csr: &SigningRequest,
    ) -> Result<Order, OrderError> {
        let order = if order.status == Status::Ready {
            info!("[order {}] finalizing order", self.scope);
            acme.finalize(&order, csr)
                .map_err(OrderError::FinalizeRequestFailed)?
        } else {
            order
        };

        let handle = order.clone();
        let order = self
            .order_poll
            .poll(
                "order finalization",
                order,
                || acme.refresh_order(&handle),
                |o: &Order| o.status != Status::Processing,
            )
            .map_err(|err| match err {
                PollError::Exhausted { attempts } => OrderError::FinalizationTimedOut { attempts },
                PollError::Failed(source) => OrderError::StatusCheckFailed(source),
            })?;

        if order.status != Status::Valid {
            return Err(OrderError::FinalizationFailed(order.status));
        }
        info!("[order {}] order is valid", self.scope);
        Ok(order)
    }
}
