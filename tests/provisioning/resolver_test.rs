use std::time::Duration;

use anyhow::{Result, anyhow};

use bucket_cert_lib::issuance::{
    AuthorizationError, AuthorizationResolver, ProofObjectChannel, ResolutionReport, Status,
};
use bucket_cert_lib::logging::RunScope;
use bucket_cert_lib::poll::PollPolicy;
use bucket_cert_lib::storage::{ObjectAcl, ObjectMethod};

use super::test_utils::{
    DOMAIN, FakeAuthority, FakeProbe, FakeStorage, FakeTransfer, StorageCall, THUMBPRINT, bucket,
    supported,
};

const PROOF_NAME: &str = ".well-known/acme-challenge/token-http-01";

fn resolve(
    storage: &FakeStorage,
    transfer: &FakeTransfer,
    probe: &FakeProbe,
    authority: &mut FakeAuthority,
    poll: PollPolicy,
) -> Result<ResolutionReport, AuthorizationError> {
    let scope = RunScope::with_id("resolver");
    let channel = ProofObjectChannel::new(
        storage,
        transfer,
        probe,
        bucket(),
        Duration::from_secs(360),
        scope.clone(),
    );
    let resolver = AuthorizationResolver::new(&channel, poll, scope);
    let order = authority.pending_order();
    let account = authority.account();
    resolver.resolve(authority, &order, &account, &supported())
}

#[test]
fn publishes_verifies_and_cleans_up() -> Result<()> {
    let storage = FakeStorage::default();
    let transfer = FakeTransfer::default();
    let probe = FakeProbe::default();
    let mut authority = FakeAuthority::new()?;

    let report = resolve(&storage, &transfer, &probe, &mut authority, PollPolicy::immediate(5))?;
    assert_eq!(report.validated, vec![DOMAIN.to_string()]);
    assert!(report.cleanup_failures.is_empty());

    assert_eq!(
        storage.calls(),
        vec![
            StorageCall::ObjectUrl {
                name: PROOF_NAME.to_string(),
                method: ObjectMethod::Put,
            },
            StorageCall::SetAcl {
                name: PROOF_NAME.to_string(),
                acl: ObjectAcl::PublicRead,
            },
            StorageCall::ObjectUrl {
                name: PROOF_NAME.to_string(),
                method: ObjectMethod::Delete,
            },
        ]
    );

    let puts = transfer.puts.borrow();
    let (_, body, content_type) = puts.first().ok_or_else(|| anyhow!("no upload"))?;
    assert_eq!(
        String::from_utf8(body.clone())?,
        format!("token-http-01.{THUMBPRINT}")
    );
    assert_eq!(content_type, "text/plain");
    assert_eq!(transfer.delete_count(), 1);

    assert_eq!(
        probe.heads.borrow().as_slice(),
        [format!("http://{DOMAIN}/{PROOF_NAME}")]
    );
    assert_eq!(
        authority.calls,
        vec!["authorization", "respond", "refresh_challenge"]
    );
    Ok(())
}

#[test]
fn unsupported_challenge_makes_no_storage_calls() -> Result<()> {
    let storage = FakeStorage::default();
    let transfer = FakeTransfer::default();
    let probe = FakeProbe::default();
    let mut authority = FakeAuthority::new()?;
    authority.offered = vec!["dns-01".to_string(), "tls-alpn-01".to_string()];

    let err = resolve(&storage, &transfer, &probe, &mut authority, PollPolicy::immediate(5))
        .expect_err("no supported challenge");
    assert!(matches!(err, AuthorizationError::UnsupportedChallenge { .. }));
    assert!(storage.calls().is_empty());
    assert_eq!(transfer.put_count() + transfer.delete_count(), 0);
    assert!(probe.heads.borrow().is_empty());
    assert_eq!(authority.count("respond"), 0);
    Ok(())
}

#[test]
fn unreachable_proof_is_never_submitted() -> Result<()> {
    let storage = FakeStorage::default();
    let transfer = FakeTransfer::default();
    let probe = FakeProbe {
        unreachable: true,
        ..FakeProbe::default()
    };
    let mut authority = FakeAuthority::new()?;

    let err = resolve(&storage, &transfer, &probe, &mut authority, PollPolicy::immediate(5))
        .expect_err("probe fails");
    assert!(matches!(err, AuthorizationError::VerificationFailed { .. }));
    assert_eq!(authority.count("respond"), 0);
    assert_eq!(transfer.put_count(), 1);
    assert_eq!(transfer.delete_count(), 1);
    Ok(())
}

#[test]
fn acl_failure_still_removes_proof() -> Result<()> {
    let storage = FakeStorage {
        fail_acl: true,
        ..FakeStorage::default()
    };
    let transfer = FakeTransfer::default();
    let probe = FakeProbe::default();
    let mut authority = FakeAuthority::new()?;

    let err = resolve(&storage, &transfer, &probe, &mut authority, PollPolicy::immediate(5))
        .expect_err("acl rejected");
    assert!(matches!(err, AuthorizationError::PublishFailed { .. }));
    assert_eq!(transfer.delete_count(), 1);
    assert_eq!(
        storage.count(|c| matches!(
            c,
            StorageCall::ObjectUrl { name, method: ObjectMethod::Delete } if name == PROOF_NAME
        )),
        1
    );
    assert!(probe.heads.borrow().is_empty());
    assert_eq!(authority.count("respond"), 0);
    Ok(())
}

#[test]
fn failed_upload_is_paired_with_a_delete() -> Result<()> {
    let storage = FakeStorage::default();
    let transfer = FakeTransfer {
        fail_put: true,
        ..FakeTransfer::default()
    };
    let probe = FakeProbe::default();
    let mut authority = FakeAuthority::new()?;

    let err = resolve(&storage, &transfer, &probe, &mut authority, PollPolicy::immediate(5))
        .expect_err("upload rejected");
    assert!(matches!(err, AuthorizationError::PublishFailed { .. }));
    assert_eq!(transfer.put_count(), 1);
    assert_eq!(transfer.delete_count(), 1);
    Ok(())
}

#[test]
fn challenge_that_never_settles_times_out() -> Result<()> {
    let storage = FakeStorage::default();
    let transfer = FakeTransfer::default();
    let probe = FakeProbe::default();
    let mut authority = FakeAuthority::new()?;
    authority.challenge_settles_after = None;

    let err = resolve(&storage, &transfer, &probe, &mut authority, PollPolicy::immediate(3))
        .expect_err("poll exhausted");
    assert!(matches!(
        err,
        AuthorizationError::ChallengeTimedOut { attempts: 3, .. }
    ));
    assert_eq!(authority.count("refresh_challenge"), 3);
    assert_eq!(transfer.delete_count(), 1);
    Ok(())
}

#[test]
fn invalid_challenge_is_reported_with_status() -> Result<()> {
    let storage = FakeStorage::default();
    let transfer = FakeTransfer::default();
    let probe = FakeProbe::default();
    let mut authority = FakeAuthority::new()?;
    authority.challenge_outcome = Status::Invalid;

    let err = resolve(&storage, &transfer, &probe, &mut authority, PollPolicy::immediate(5))
        .expect_err("challenge invalid");
    match err {
        AuthorizationError::ChallengeFailed { status, .. } => assert_eq!(status, Status::Invalid),
        other => return Err(anyhow!("unexpected error {other}")),
    }
    assert_eq!(transfer.delete_count(), 1);
    Ok(())
}

#[test]
fn already_valid_authorization_is_skipped() -> Result<()> {
    let storage = FakeStorage::default();
    let transfer = FakeTransfer::default();
    let probe = FakeProbe::default();
    let mut authority = FakeAuthority::new()?;
    authority.authorization_status = Status::Valid;

    let report = resolve(&storage, &transfer, &probe, &mut authority, PollPolicy::immediate(5))?;
    assert_eq!(report.already_valid, vec![DOMAIN.to_string()]);
    assert!(report.validated.is_empty());
    assert!(storage.calls().is_empty());
    assert_eq!(authority.count("respond"), 0);
    Ok(())
}

#[test]
fn cleanup_failure_does_not_mask_success() -> Result<()> {
    let storage = FakeStorage::default();
    let transfer = FakeTransfer {
        fail_delete: true,
        ..FakeTransfer::default()
    };
    let probe = FakeProbe::default();
    let mut authority = FakeAuthority::new()?;

    let report = resolve(&storage, &transfer, &probe, &mut authority, PollPolicy::immediate(5))?;
    assert_eq!(report.validated, vec![DOMAIN.to_string()]);
    assert_eq!(report.cleanup_failures.len(), 1);
    assert_eq!(report.cleanup_failures[0].name, PROOF_NAME);
    assert_eq!(transfer.delete_count(), 1);
    Ok(())
}
