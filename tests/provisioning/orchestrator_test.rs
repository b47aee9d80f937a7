use std::time::Duration;

use anyhow::Result;

use bucket_cert_lib::issuance::{
    AuthorizationError, AuthorizationResolver, Issued, OrderError, OrderOrchestrator,
    ProofObjectChannel, Registration, RegistrationError, Status, keys,
};
use bucket_cert_lib::logging::RunScope;
use bucket_cert_lib::poll::PollPolicy;

use super::test_utils::{
    DOMAIN, FakeAuthority, FakeProbe, FakeStorage, FakeTransfer, bucket, public_key_of_chain,
    supported,
};

/// Drives one order for `DOMAIN` against `authority` with fresh fakes.
fn provision(
    authority: &mut FakeAuthority,
    registration: &Registration,
    transfer: &FakeTransfer,
) -> Result<Result<(Issued, Vec<u8>), OrderError>> {
    let storage = FakeStorage::default();
    let probe = FakeProbe::default();
    let scope = RunScope::with_id("order");
    let channel = ProofObjectChannel::new(
        &storage,
        transfer,
        &probe,
        bucket(),
        Duration::from_secs(360),
        scope.clone(),
    );
    let resolver = AuthorizationResolver::new(&channel, PollPolicy::immediate(5), scope.clone());
    let orchestrator = OrderOrchestrator::new(&resolver, PollPolicy::immediate(3), scope);

    let key = keys::generate(2048)?;
    let csr = keys::build_signing_request(DOMAIN, &key)?;
    let public_key = key.public_key_der()?;
    Ok(orchestrator
        .provision(authority, DOMAIN, registration, &csr, &supported())
        .map(|issued| (issued, public_key)))
}

fn agreed() -> Registration {
    Registration::new(true, Some("ops@example.com"))
}

#[test]
fn issues_certificate_for_signing_request_key() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    let transfer = FakeTransfer::default();

    let (issued, public_key) = provision(&mut authority, &agreed(), &transfer)??;
    assert_eq!(issued.certificate.public_key_der()?, public_key);
    assert_eq!(
        public_key_of_chain(issued.certificate.pem())?,
        public_key
    );
    assert_eq!(issued.certificate.chain_len(), 2);
    assert_eq!(issued.authorizations.validated, vec![DOMAIN.to_string()]);
    assert_eq!(transfer.delete_count(), 1);

    assert_eq!(
        authority.calls,
        vec![
            "register",
            "new_order",
            "authorization",
            "respond",
            "refresh_challenge",
            "refresh_order",
            "finalize",
            "refresh_order",
            "certificate",
        ]
    );
    Ok(())
}

#[test]
fn refuses_without_terms_before_any_request() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    let transfer = FakeTransfer::default();

    let err = provision(&mut authority, &Registration::new(false, None), &transfer)?
        .expect_err("terms refused");
    assert!(matches!(
        err,
        OrderError::AccountRegistrationFailed(RegistrationError::TermsNotAgreed)
    ));
    assert!(authority.calls.is_empty());
    assert_eq!(transfer.put_count(), 0);
    Ok(())
}

#[test]
fn already_authorized_order_goes_straight_to_finalize() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    authority.authorization_status = Status::Valid;
    let transfer = FakeTransfer::default();

    let (issued, _) = provision(&mut authority, &agreed(), &transfer)??;
    assert!(issued.authorizations.validated.is_empty());
    assert_eq!(authority.count("authorization"), 0);
    assert_eq!(authority.count("finalize"), 1);
    assert_eq!(transfer.put_count(), 0);
    Ok(())
}

#[test]
fn invalid_finalization_skips_download() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    authority.finalize_outcome = Some(Status::Invalid);
    let transfer = FakeTransfer::default();

    let err = provision(&mut authority, &agreed(), &transfer)?.expect_err("order invalid");
    assert!(matches!(err, OrderError::FinalizationFailed(Status::Invalid)));
    assert_eq!(authority.count("certificate"), 0);
    Ok(())
}

#[test]
fn finalization_polling_is_bounded() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    authority.finalize_outcome = None;
    let transfer = FakeTransfer::default();

    let err = provision(&mut authority, &agreed(), &transfer)?.expect_err("never finishes");
    assert!(matches!(
        err,
        OrderError::FinalizationTimedOut { attempts: 3 }
    ));
    assert_eq!(authority.count("certificate"), 0);
    Ok(())
}

#[test]
fn order_creation_failure_is_reported() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    authority.fail_new_order = true;
    let transfer = FakeTransfer::default();

    let err = provision(&mut authority, &agreed(), &transfer)?.expect_err("order refused");
    assert!(matches!(err, OrderError::OrderCreationFailed(_)));
    assert_eq!(authority.count("authorization"), 0);
    Ok(())
}

#[test]
fn unsupported_challenges_abandon_the_order() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    authority.offered = vec!["dns-01".to_string()];
    let transfer = FakeTransfer::default();

    let err = provision(&mut authority, &agreed(), &transfer)?.expect_err("no http-01");
    assert!(matches!(
        err,
        OrderError::AuthorizationFailed(AuthorizationError::UnsupportedChallenge { .. })
    ));
    assert_eq!(authority.count("finalize"), 0);
    assert_eq!(transfer.put_count(), 0);
    Ok(())
}

#[test]
fn download_failure_is_reported() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    authority.fail_certificate = true;
    let transfer = FakeTransfer::default();

    let err = provision(&mut authority, &agreed(), &transfer)?.expect_err("download fails");
    assert!(matches!(err, OrderError::CertificateFetchFailed(_)));
    Ok(())
}
