use anyhow::{Result, anyhow};

use bucket_cert_lib::config::{ConfigError, ProvisionConfig};
use bucket_cert_lib::issuance::{
    Collaborators, InstallError, KeyError, ProvisioningRun, RunError, RunSettings,
};
use bucket_cert_lib::logging::RunScope;

use super::test_utils::{
    BUCKET, CLUSTER, DOMAIN, FakeAuthority, FakeProbe, FakeStorage, FakeTransfer, StorageCall,
    public_key_of_chain, public_key_of_private_pem, settings,
};

fn execute(
    settings: RunSettings,
    authority: &mut FakeAuthority,
    storage: &FakeStorage,
    transfer: &FakeTransfer,
) -> Result<bucket_cert_lib::issuance::RunReport, RunError> {
    let probe = FakeProbe::default();
    let run = ProvisioningRun::new(settings, RunScope::with_id("e2e"));
    run.execute(Collaborators {
        acme: authority,
        storage,
        transfer,
        probe: &probe,
    })
}

#[test]
fn provisions_and_installs_certificate() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    let storage = FakeStorage::default();
    let transfer = FakeTransfer::default();

    let report = execute(settings(), &mut authority, &storage, &transfer)?;
    assert_eq!(report.run_id, "e2e");
    assert_eq!(report.domain, DOMAIN);
    assert_eq!(report.bucket, format!("{CLUSTER}/{BUCKET}"));
    assert!(report.replaced_existing);
    assert_eq!(report.cleanup_warnings, 0);
    assert_eq!(report.certificate.sans, vec![DOMAIN.to_string()]);

    let uploads = storage.uploads();
    assert_eq!(uploads.len(), 1);
    let (certificate, private_key) = &uploads[0];
    let issued = authority
        .issued
        .as_deref()
        .ok_or_else(|| anyhow!("authority issued nothing"))?;
    assert_eq!(certificate.trim(), issued.trim());
    assert_eq!(
        public_key_of_private_pem(private_key)?,
        public_key_of_chain(certificate)?
    );

    assert_eq!(transfer.put_count(), 1);
    assert_eq!(transfer.delete_count(), 1);
    assert_eq!(storage.calls()[0], StorageCall::Buckets);
    Ok(())
}

#[test]
fn missing_bucket_stops_before_ordering() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    let storage = FakeStorage {
        buckets: Vec::new(),
        ..FakeStorage::default()
    };
    let transfer = FakeTransfer::default();

    let err = execute(settings(), &mut authority, &storage, &transfer).expect_err("no bucket");
    assert!(matches!(err, RunError::BucketNotFound(_)));
    assert!(authority.calls.is_empty());
    assert_eq!(storage.calls(), vec![StorageCall::Buckets]);
    Ok(())
}

#[test]
fn unagreed_terms_make_no_requests() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    let storage = FakeStorage::default();
    let transfer = FakeTransfer::default();
    let mut settings = settings();
    settings.registration.terms_agreed = false;

    let err = execute(settings, &mut authority, &storage, &transfer).expect_err("terms");
    assert!(matches!(err, RunError::Config(ConfigError::TermsNotAgreed)));
    assert!(authority.calls.is_empty());
    assert!(storage.calls().is_empty());
    Ok(())
}

#[test]
fn unsupported_key_size_fails_offline() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    let storage = FakeStorage::default();
    let transfer = FakeTransfer::default();
    let mut settings = settings();
    settings.key_size = 1024;

    let err = execute(settings, &mut authority, &storage, &transfer).expect_err("key size");
    assert!(matches!(err, RunError::Key(KeyError::UnsupportedKeySize(1024))));
    assert!(authority.calls.is_empty());
    assert!(storage.calls().is_empty());
    Ok(())
}

#[test]
fn failed_upload_after_delete_is_flagged_for_remediation() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    let storage = FakeStorage {
        fail_upload: true,
        ..FakeStorage::default()
    };
    let transfer = FakeTransfer::default();

    let err = execute(settings(), &mut authority, &storage, &transfer).expect_err("upload");
    assert!(matches!(
        err,
        RunError::Install(InstallError::SlotLeftEmpty { .. })
    ));
    assert!(err.requires_manual_remediation());
    assert_eq!(transfer.delete_count(), 1);
    Ok(())
}

#[test]
fn unreadable_certificate_never_touches_installed_slot() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    authority.duplicate_san = true;
    let storage = FakeStorage::default();
    let transfer = FakeTransfer::default();

    let err = execute(settings(), &mut authority, &storage, &transfer).expect_err("summary");
    assert!(matches!(err, RunError::Certificate(_)));
    assert!(!err.requires_manual_remediation());
    assert_eq!(
        storage.count(|c| matches!(
            c,
            StorageCall::CertificateInstalled
                | StorageCall::DeleteCertificate
                | StorageCall::UploadCertificate { .. }
        )),
        0
    );
    assert!(storage.installed.get());
    Ok(())
}

#[test]
fn leftover_proof_is_reported_not_fatal() -> Result<()> {
    let mut authority = FakeAuthority::new()?;
    let storage = FakeStorage::default();
    let transfer = FakeTransfer {
        fail_delete: true,
        ..FakeTransfer::default()
    };

    let report = execute(settings(), &mut authority, &storage, &transfer)?;
    assert_eq!(report.cleanup_warnings, 1);
    assert_eq!(storage.uploads().len(), 1);
    Ok(())
}

#[test]
fn settings_follow_configuration() -> Result<()> {
    let config = ProvisionConfig::from_sources(
        r#"{"domain": "Example.com", "cluster": "us-east", "bucket": "my-site",
            "agree_terms": true, "contact_email": "ops@example.com", "key_size": 3072}"#,
        |name| (name == "BUCKET_CERT_ACCESS_TOKEN").then(|| "token".to_string()),
    )?;
    let settings = RunSettings::from_config(&config);
    assert_eq!(settings.domain, "example.com");
    assert_eq!(settings.bucket, config.bucket_ref());
    assert_eq!(settings.key_size, 3072);
    assert!(settings.registration.terms_agreed);
    assert_eq!(
        settings.registration.contacts,
        vec!["mailto:ops@example.com".to_string()]
    );
    assert_eq!(settings.proof_ttl, config.proof_ttl());
    Ok(())
}
