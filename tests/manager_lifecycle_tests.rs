// Copyright (c) 2025 - Cowboy AI, LLC.

//! Manager lifecycle: master lock arbitration, restart, revocation
//! flows, CRL generation and configuration import/export

mod common;

use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use x509_cert::name::Name;

use cim_ca::issuance::{CertTemplateData, PublicKeyRequest};
use cim_ca::manager::{CaManager, CaManagerConf, CaSystemStatus};
use cim_ca::profile::RequestedExtensions;
use cim_ca::store::{CertStore, MemoryCertStore};
use cim_ca::types::{CrlReason, RevocationInfo, EVENT_LOCK};
use cim_ca::CaError;

use common::{ee_profile, setup_env};

fn presented_key() -> PublicKeyRequest {
    use der::Decode as _;
    use p256::pkcs8::EncodePublicKey as _;
    let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
    let der = secret.public_key().to_public_key_der().unwrap();
    PublicKeyRequest::Presented(
        x509_cert::spki::SubjectPublicKeyInfoOwned::from_der(der.as_bytes()).unwrap(),
    )
}

fn request(subject: &str) -> CertTemplateData {
    CertTemplateData {
        subject: Name::from_str(subject).unwrap(),
        public_key: presented_key(),
        extensions: RequestedExtensions::new(),
        not_before: None,
        not_after: None,
        profile_name: "ee".to_string(),
        cross_cert: false,
        cert_req_id: Some(42),
    }
}

#[tokio::test]
async fn master_lock_refuses_second_instance() {
    let store = Arc::new(MemoryCertStore::new());
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();

    let first = CaManager::new(
        CaManagerConf {
            master: true,
            shard_id: 1,
            lock_file_dir: dir1.path().to_path_buf(),
        },
        store.clone(),
    );
    first.init().await.unwrap();
    assert_eq!(first.status(), CaSystemStatus::StartedAsMaster);

    // A second master with its own lock-id token must refuse to start.
    let second = CaManager::new(
        CaManagerConf {
            master: true,
            shard_id: 2,
            lock_file_dir: dir2.path().to_path_buf(),
        },
        store.clone(),
    );
    let err = second.init().await.unwrap_err();
    assert!(matches!(err, CaError::LockFailed(_)));
    assert_eq!(second.status(), CaSystemStatus::LockFailed);

    // After the operator unlocks, the second instance may start.
    second.unlock().await.unwrap();
    assert!(store.get_system_event(EVENT_LOCK).await.unwrap().is_none());
    second.init().await.unwrap();
    assert_eq!(second.status(), CaSystemStatus::StartedAsMaster);

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn restart_preserves_registered_cas() {
    let env = setup_env(BTreeMap::from([("ee", ee_profile(365))])).await;

    assert_eq!(env.manager.ca_names(), vec!["test-ca".to_string()]);
    env.manager.restart_ca_system().await.unwrap();
    assert_eq!(env.manager.ca_names(), vec!["test-ca".to_string()]);
    assert!(env.manager.failed_ca_names().is_empty());

    // Issuance still works against the rebuilt instance.
    let issued = env
        .manager
        .generate_certificate("test-ca", "ee", request("CN=after-restart"))
        .await
        .unwrap();
    assert_eq!(issued.cert_req_id, Some(42));
}

#[tokio::test]
async fn revoke_unsuspend_and_crl_flow() {
    let env = setup_env(BTreeMap::from([("ee", ee_profile(365))])).await;

    let issued = env
        .manager
        .generate_certificate("test-ca", "ee", request("CN=revocation-target"))
        .await
        .unwrap();

    // Suspend, release, revoke for good.
    env.manager
        .revoke_certificate("test-ca", &issued.serial, CrlReason::CertificateHold, None)
        .await
        .unwrap();
    env.manager
        .unsuspend_certificate("test-ca", &issued.serial)
        .await
        .unwrap();
    env.manager
        .revoke_certificate(
            "test-ca",
            &issued.serial,
            CrlReason::KeyCompromise,
            Some(Utc::now() - Duration::days(1)),
        )
        .await
        .unwrap();

    // A second revocation is refused.
    let err = env
        .manager
        .revoke_certificate("test-ca", &issued.serial, CrlReason::Superseded, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::NotPermitted(_)));

    // The CRL carries the entry and is persisted.
    let crl_der = env.manager.generate_crl("test-ca").await.unwrap();
    assert!(!crl_der.is_empty());
    let stored = env.manager.get_current_crl("test-ca").await.unwrap();
    assert_eq!(stored.unwrap(), crl_der);

    use der::Decode as _;
    let crl = x509_cert::crl::CertificateList::from_der(&crl_der).unwrap();
    let entries = crl.tbs_cert_list.revoked_certificates.unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn ca_revocation_round_trip() {
    let env = setup_env(BTreeMap::from([("ee", ee_profile(365))])).await;

    env.manager
        .revoke_ca(
            "test-ca",
            RevocationInfo::new(CrlReason::CaCompromise, Utc::now()),
        )
        .await
        .unwrap();

    let err = env
        .manager
        .generate_certificate("test-ca", "ee", request("CN=blocked"))
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::NotPermitted(_)));

    env.manager.unrevoke_ca("test-ca").await.unwrap();
    env.manager
        .generate_certificate("test-ca", "ee", request("CN=unblocked"))
        .await
        .unwrap();
}

#[tokio::test]
async fn alias_resolution_and_unknown_profile() {
    let env = setup_env(BTreeMap::from([("ee", ee_profile(365))])).await;

    env.manager.add_ca_alias("default", "test-ca").unwrap();
    env.manager
        .generate_certificate("default", "ee", request("CN=via-alias"))
        .await
        .unwrap();

    let err = env
        .manager
        .generate_certificate("test-ca", "nonexistent", request("CN=x"))
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::UnknownCertProfile(_)));
    assert_eq!(err.code(), "UNKNOWN_CERT_PROFILE");
}

#[tokio::test]
async fn export_import_round_trips_configuration() {
    let env = setup_env(BTreeMap::from([("ee", ee_profile(365))])).await;
    env.manager.add_ca_alias("default", "test-ca").unwrap();

    let archive = env.manager.export_conf().unwrap();

    // Import into a fresh manager over a fresh store.
    let store = Arc::new(MemoryCertStore::new().with_certhash_algo("SHA256"));
    let dir = tempfile::tempdir().unwrap();
    let manager = CaManager::new(
        CaManagerConf {
            master: true,
            shard_id: 3,
            lock_file_dir: dir.path().to_path_buf(),
        },
        store,
    );
    manager.import_conf(&archive, true).await.unwrap();

    assert_eq!(manager.ca_names(), vec!["test-ca".to_string()]);
    manager
        .generate_certificate("default", "ee", request("CN=imported"))
        .await
        .unwrap();
}

#[tokio::test]
async fn import_of_broken_archive_preserves_state() {
    let env = setup_env(BTreeMap::from([("ee", ee_profile(365))])).await;
    let before = env.manager.ca_names();

    let err = env.manager.import_conf(&[1, 2, 3], true).await.unwrap_err();
    assert!(matches!(err, CaError::InvalidConf(_)));
    assert_eq!(env.manager.ca_names(), before);

    // Live issuance is unaffected.
    env.manager
        .generate_certificate("test-ca", "ee", request("CN=still-alive"))
        .await
        .unwrap();
}

#[tokio::test]
async fn system_summary_reports_sets() {
    let env = setup_env(BTreeMap::from([("ee", ee_profile(365))])).await;
    let summary = env.manager.system_summary();
    assert_eq!(summary.ca_names, vec!["test-ca".to_string()]);
    assert!(summary.failed_ca_names.is_empty());
    assert!(summary.inactive_ca_names.is_empty());
}

#[tokio::test]
async fn duplicate_registrations_are_rejected() {
    let env = setup_env(BTreeMap::from([("ee", ee_profile(365))])).await;

    let err = env
        .manager
        .add_profile(cim_ca::manager::ProfileEntry {
            name: "EE".to_string(),
            conf: ee_profile(30),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::AlreadyExists(_)));
}
