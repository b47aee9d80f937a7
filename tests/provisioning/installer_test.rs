use anyhow::Result;

use bucket_cert_lib::certificate::Certificate;
use bucket_cert_lib::issuance::{CertificateInstaller, InstallError, KeyPair, keys};
use bucket_cert_lib::logging::RunScope;

use super::test_utils::{
    DOMAIN, FakeStorage, StorageCall, TestCa, bucket, public_key_of_chain,
    public_key_of_private_pem,
};

/// A key pair and a certificate issued for it by a throwaway CA.
fn issued_pair(ca: &TestCa) -> Result<(Certificate, KeyPair)> {
    let key = keys::generate(2048)?;
    let csr = keys::build_signing_request(DOMAIN, &key)?;
    let chain = ca.issue(csr.der(), DOMAIN, 7)?;
    Ok((Certificate::from_pem_chain(&chain)?, key))
}

fn install(storage: &FakeStorage, certificate: &Certificate, key: &KeyPair) -> Result<bool, InstallError> {
    CertificateInstaller::new(storage, RunScope::with_id("install"))
        .install(&bucket(), certificate, key)
        .map(|outcome| outcome.replaced_existing)
}

#[test]
fn replaces_installed_certificate() -> Result<()> {
    let (certificate, key) = issued_pair(&TestCa::new()?)?;
    let storage = FakeStorage::default();

    assert!(install(&storage, &certificate, &key)?);
    let calls = storage.calls();
    assert_eq!(calls[0], StorageCall::CertificateInstalled);
    assert_eq!(calls[1], StorageCall::DeleteCertificate);
    assert!(matches!(calls[2], StorageCall::UploadCertificate { .. }));
    assert_eq!(calls.len(), 3);

    let uploads = storage.uploads();
    let (uploaded_cert, uploaded_key) = &uploads[0];
    assert_eq!(uploaded_cert, certificate.pem());
    assert_eq!(
        public_key_of_private_pem(uploaded_key)?,
        public_key_of_chain(uploaded_cert)?
    );
    assert!(storage.installed.get());
    Ok(())
}

#[test]
fn empty_slot_skips_delete() -> Result<()> {
    let (certificate, key) = issued_pair(&TestCa::new()?)?;
    let storage = FakeStorage::default();
    storage.installed.set(false);

    assert!(!install(&storage, &certificate, &key)?);
    assert_eq!(storage.count(|c| *c == StorageCall::DeleteCertificate), 0);
    assert_eq!(storage.uploads().len(), 1);
    Ok(())
}

#[test]
fn upload_failure_after_delete_needs_remediation() -> Result<()> {
    let (certificate, key) = issued_pair(&TestCa::new()?)?;
    let storage = FakeStorage {
        fail_upload: true,
        ..FakeStorage::default()
    };

    let err = install(&storage, &certificate, &key).expect_err("upload rejected");
    assert!(matches!(err, InstallError::SlotLeftEmpty { .. }));
    assert!(err.requires_manual_remediation());
    assert!(!storage.installed.get());
    Ok(())
}

#[test]
fn upload_failure_on_empty_slot_is_plain_failure() -> Result<()> {
    let (certificate, key) = issued_pair(&TestCa::new()?)?;
    let storage = FakeStorage {
        fail_upload: true,
        ..FakeStorage::default()
    };
    storage.installed.set(false);

    let err = install(&storage, &certificate, &key).expect_err("upload rejected");
    assert!(matches!(err, InstallError::UploadFailed { .. }));
    assert!(!err.requires_manual_remediation());
    Ok(())
}

#[test]
fn delete_failure_leaves_old_certificate() -> Result<()> {
    let (certificate, key) = issued_pair(&TestCa::new()?)?;
    let storage = FakeStorage {
        fail_delete: true,
        ..FakeStorage::default()
    };

    let err = install(&storage, &certificate, &key).expect_err("delete rejected");
    assert!(matches!(err, InstallError::RemoveFailed { .. }));
    assert!(storage.uploads().is_empty());
    assert!(storage.installed.get());
    Ok(())
}

#[test]
fn mismatched_key_touches_nothing() -> Result<()> {
    let ca = TestCa::new()?;
    let (certificate, _) = issued_pair(&ca)?;
    let other_key = keys::generate(2048)?;
    let storage = FakeStorage::default();

    let err = install(&storage, &certificate, &other_key).expect_err("key mismatch");
    assert!(matches!(err, InstallError::KeyMismatch));
    assert!(storage.calls().is_empty());
    Ok(())
}
