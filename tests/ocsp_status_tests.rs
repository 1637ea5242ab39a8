// Copyright (c) 2025 - Cowboy AI, LLC.

//! OCSP status resolution: serial guards, CRL freshness, CA-revocation
//! inheritance and snapshot consistency

mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use cim_ca::ocsp::{
    CertStatus, IssuerStore, OcspCertStore, OcspStoreOptions, RequestIssuer, StoreRefresher,
    UnknownCertBehaviour,
};
use cim_ca::store::{CertRecord, CertStore, IssuerRecord, MemoryCertStore};
use cim_ca::types::{CrlInfo, CrlReason, HashAlgo, RevocationInfo, Serial};

use common::build_test_ca;

struct OcspFixture {
    store: Arc<MemoryCertStore>,
    issuer_store: Arc<IssuerStore>,
    refresher: Arc<StoreRefresher>,
    request_issuer: RequestIssuer,
    issuer_id: u32,
}

async fn ocsp_fixture(ca_revocation: Option<RevocationInfo>) -> OcspFixture {
    let ca = build_test_ca(
        "CN=OCSP Issuer,O=Acme,C=DE",
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2034, 1, 1, 0, 0, 0).unwrap(),
        Some(0),
    )
    .await;

    let store = Arc::new(MemoryCertStore::new().with_certhash_algo("SHA256"));
    store
        .add_issuer(IssuerRecord {
            id: 1,
            cert_der: ca.cert_der.clone(),
            sha1_fp: HashAlgo::Sha1.digest(&ca.cert_der),
            revocation: ca_revocation,
            crl_id: None,
        })
        .await
        .unwrap();

    let issuer_store = Arc::new(IssuerStore::new());
    let refresher = StoreRefresher::new(
        store.clone(),
        issuer_store.clone(),
        std::time::Duration::from_secs(300),
    );
    refresher.refresh_once(false).await.unwrap();

    let request_issuer = RequestIssuer::from_cert_der(HashAlgo::Sha1, &ca.cert_der).unwrap();

    OcspFixture {
        store,
        issuer_store,
        refresher,
        request_issuer,
        issuer_id: 1,
    }
}

fn options(name: &str) -> OcspStoreOptions {
    OcspStoreOptions {
        name: name.to_string(),
        update_interval_secs: 300,
        ignore_expired_crls: false,
        ignore_not_yet_valid_certs: false,
        ignore_expired_certs: false,
        retention_interval_days: None,
        unknown_cert_behaviour: UnknownCertBehaviour::Unknown,
        support_cert_hash: true,
    }
}

fn good_record(issuer_id: u32, serial: u64, not_before: DateTime<Utc>) -> CertRecord {
    CertRecord {
        id: serial as i64,
        issuer_id,
        serial: Serial::from_u64(serial),
        subject: format!("CN=cert-{}", serial),
        not_before,
        not_after: not_before + Duration::days(365),
        revocation: None,
        profile_id: 1,
        requestor_id: None,
        cert_hash: Some(vec![0xAB; 32]),
        cert_der: vec![0x30, 0x03, 0x02, 0x01, 0x01],
        crl_id: None,
    }
}

/// S6: a zero serial is answered `unknown` without touching the store
#[tokio::test]
async fn s6_zero_serial_is_unknown() {
    let fixture = ocsp_fixture(None).await;
    let engine = OcspCertStore::initialize(
        options("s6"),
        fixture.store.clone(),
        fixture.issuer_store.clone(),
    )
    .await
    .unwrap();

    let status = engine
        .get_cert_status(
            Utc::now(),
            &fixture.request_issuer,
            &Serial::from_u64(0),
            false,
            false,
            false,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, CertStatus::Unknown);
}

/// An unknown issuer is not our responsibility
#[tokio::test]
async fn unknown_issuer_returns_none() {
    let fixture = ocsp_fixture(None).await;
    let engine = OcspCertStore::initialize(
        options("unknown-issuer"),
        fixture.store.clone(),
        fixture.issuer_store.clone(),
    )
    .await
    .unwrap();

    let other = RequestIssuer {
        hash_algo: HashAlgo::Sha1,
        name_hash: vec![0; 20],
        key_hash: vec![0; 20],
    };
    assert!(!engine.knows_issuer(&other));
    let status = engine
        .get_cert_status(Utc::now(), &other, &Serial::from_u64(5), false, false, false)
        .await
        .unwrap();
    assert!(status.is_none());
}

/// S7: with `ignoreExpiredCrls`, a CRL expiring within five minutes
/// refuses the answer
#[tokio::test]
async fn s7_near_expired_crl_is_refused() {
    let fixture = ocsp_fixture(None).await;
    let now = Utc::now();
    fixture
        .store
        .add_crl(
            fixture.issuer_id,
            CrlInfo {
                crl_id: 10,
                crl_number: 1,
                this_update: now - Duration::days(1),
                next_update: Some(now + Duration::minutes(3)),
            },
            vec![],
        )
        .await
        .unwrap();
    fixture.refresher.refresh_once(true).await.unwrap();

    let mut opts = options("s7");
    opts.ignore_expired_crls = true;
    let engine = OcspCertStore::initialize(
        opts,
        fixture.store.clone(),
        fixture.issuer_store.clone(),
    )
    .await
    .unwrap();

    fixture
        .store
        .add_cert(good_record(fixture.issuer_id, 0xAB, now - Duration::days(10)))
        .await
        .unwrap();

    let status = engine
        .get_cert_status(
            now,
            &fixture.request_issuer,
            &Serial::from_u64(0xAB),
            false,
            false,
            false,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, CertStatus::CrlExpired);
}

/// S5: a good certificate of a revoked CA inherits the revocation
#[tokio::test]
async fn s5_ca_revocation_is_inherited() {
    let ca_revoked_at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let fixture = ocsp_fixture(Some(RevocationInfo::new(
        CrlReason::CessationOfOperation,
        ca_revoked_at,
    )))
    .await;
    let engine = OcspCertStore::initialize(
        options("s5"),
        fixture.store.clone(),
        fixture.issuer_store.clone(),
    )
    .await
    .unwrap();

    fixture
        .store
        .add_cert(good_record(
            fixture.issuer_id,
            0xAB,
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        ))
        .await
        .unwrap();

    let time = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let status = engine
        .get_cert_status(
            time,
            &fixture.request_issuer,
            &Serial::from_u64(0xAB),
            false,
            true,
            true,
        )
        .await
        .unwrap()
        .unwrap();

    match status.status {
        CertStatus::Revoked(revocation) => {
            assert_eq!(revocation.reason, CrlReason::CaCompromise);
            assert_eq!(revocation.revocation_time, ca_revoked_at);
        }
        other => panic!("expected inherited revocation, got {:?}", other),
    }

    // Without inheritance the underlying status is still good.
    let status = engine
        .get_cert_status(
            time,
            &fixture.request_issuer,
            &Serial::from_u64(0xAB),
            false,
            false,
            false,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, CertStatus::Good);
}

/// The inheritance table over every `(underlying, behaviour)` pair
#[tokio::test]
async fn inheritance_table_is_exhaustive() {
    let ca_revoked_at = Utc::now() - Duration::days(30);

    for behaviour in [UnknownCertBehaviour::Unknown, UnknownCertBehaviour::Good] {
        let fixture = ocsp_fixture(Some(RevocationInfo::new(
            CrlReason::CaCompromise,
            ca_revoked_at,
        )))
        .await;
        let mut opts = options("table");
        opts.unknown_cert_behaviour = behaviour;
        let engine = OcspCertStore::initialize(
            opts,
            fixture.store.clone(),
            fixture.issuer_store.clone(),
        )
        .await
        .unwrap();
        let now = Utc::now();

        // Good: always replaced.
        fixture
            .store
            .add_cert(good_record(fixture.issuer_id, 1, now - Duration::days(60)))
            .await
            .unwrap();
        let status = engine
            .get_cert_status(now, &fixture.request_issuer, &Serial::from_u64(1), false, true, true)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(status.status, CertStatus::Revoked(_)));

        // Unknown: replaced only under the `good` behaviour.
        let status = engine
            .get_cert_status(now, &fixture.request_issuer, &Serial::from_u64(2), false, true, true)
            .await
            .unwrap()
            .unwrap();
        match behaviour {
            UnknownCertBehaviour::Good => {
                assert!(matches!(status.status, CertStatus::Revoked(_)))
            }
            UnknownCertBehaviour::Unknown => assert_eq!(status.status, CertStatus::Unknown),
        }

        // Revoked before the CA: kept.
        let mut earlier = good_record(fixture.issuer_id, 3, now - Duration::days(60));
        earlier.revocation = Some(RevocationInfo::new(
            CrlReason::KeyCompromise,
            ca_revoked_at - Duration::days(10),
        ));
        fixture.store.add_cert(earlier).await.unwrap();
        let status = engine
            .get_cert_status(now, &fixture.request_issuer, &Serial::from_u64(3), false, true, true)
            .await
            .unwrap()
            .unwrap();
        match status.status {
            CertStatus::Revoked(revocation) => {
                assert_eq!(revocation.reason, CrlReason::KeyCompromise)
            }
            other => panic!("expected kept revocation, got {:?}", other),
        }

        // Revoked after the CA: replaced.
        let mut later = good_record(fixture.issuer_id, 4, now - Duration::days(60));
        later.revocation = Some(RevocationInfo::new(
            CrlReason::Superseded,
            ca_revoked_at + Duration::days(10),
        ));
        fixture.store.add_cert(later).await.unwrap();
        let status = engine
            .get_cert_status(now, &fixture.request_issuer, &Serial::from_u64(4), false, true, true)
            .await
            .unwrap()
            .unwrap();
        match status.status {
            CertStatus::Revoked(revocation) => {
                assert_eq!(revocation.reason, CrlReason::CaCompromise);
                assert_eq!(revocation.revocation_time, ca_revoked_at);
            }
            other => panic!("expected inherited revocation, got {:?}", other),
        }
    }
}

/// Archive cutoff: negative retention means the issuer's notBefore
#[tokio::test]
async fn archive_cutoff_modes() {
    let fixture = ocsp_fixture(None).await;
    let now = Utc::now();
    fixture
        .store
        .add_cert(good_record(fixture.issuer_id, 7, now - Duration::days(10)))
        .await
        .unwrap();

    let mut opts = options("cutoff-negative");
    opts.retention_interval_days = Some(-1);
    let engine = OcspCertStore::initialize(
        opts,
        fixture.store.clone(),
        fixture.issuer_store.clone(),
    )
    .await
    .unwrap();
    let status = engine
        .get_cert_status(now, &fixture.request_issuer, &Serial::from_u64(7), false, false, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        status.archive_cutoff.unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    );

    let mut opts = options("cutoff-positive");
    opts.retention_interval_days = Some(30);
    let engine = OcspCertStore::initialize(
        opts,
        fixture.store.clone(),
        fixture.issuer_store.clone(),
    )
    .await
    .unwrap();
    let status = engine
        .get_cert_status(now, &fixture.request_issuer, &Serial::from_u64(7), false, false, false)
        .await
        .unwrap()
        .unwrap();
    // min(issuer notBefore, now - 30d) is the issuer's notBefore here.
    assert_eq!(
        status.archive_cutoff.unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    );
}

/// Cert hashes are only attached when requested and configured
#[tokio::test]
async fn cert_hash_attachment() {
    let fixture = ocsp_fixture(None).await;
    let now = Utc::now();
    fixture
        .store
        .add_cert(good_record(fixture.issuer_id, 8, now - Duration::days(1)))
        .await
        .unwrap();
    let engine = OcspCertStore::initialize(
        options("hash"),
        fixture.store.clone(),
        fixture.issuer_store.clone(),
    )
    .await
    .unwrap();

    let with = engine
        .get_cert_status(now, &fixture.request_issuer, &Serial::from_u64(8), true, false, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(with.cert_hash.unwrap().algo, HashAlgo::Sha256);

    let without = engine
        .get_cert_status(now, &fixture.request_issuer, &Serial::from_u64(8), false, false, false)
        .await
        .unwrap()
        .unwrap();
    assert!(without.cert_hash.is_none());
}

/// Initialization fails when cert hashes are promised but the schema
/// does not name an algorithm
#[tokio::test]
async fn missing_certhash_algo_fails_initialization() {
    let store = Arc::new(MemoryCertStore::new());
    let issuer_store = Arc::new(IssuerStore::new());
    let result = OcspCertStore::initialize(options("no-algo"), store, issuer_store).await;
    assert!(result.is_err());
}

/// Store-policy filters produce `ignore` answers
#[tokio::test]
async fn ignore_filters_apply() {
    let fixture = ocsp_fixture(None).await;
    let now = Utc::now();
    fixture
        .store
        .add_cert(good_record(fixture.issuer_id, 9, now + Duration::days(1)))
        .await
        .unwrap();

    let mut opts = options("filters");
    opts.ignore_not_yet_valid_certs = true;
    let engine = OcspCertStore::initialize(
        opts,
        fixture.store.clone(),
        fixture.issuer_store.clone(),
    )
    .await
    .unwrap();
    let status = engine
        .get_cert_status(now, &fixture.request_issuer, &Serial::from_u64(9), false, false, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, CertStatus::Ignore);
}

/// Readers never observe `ids` and `issuers` of different generations
#[tokio::test]
async fn snapshot_swaps_are_atomic() {
    let fixture = ocsp_fixture(None).await;
    let issuer_store = fixture.issuer_store.clone();

    let writer = {
        let issuer_store = issuer_store.clone();
        let base = issuer_store.snapshot().issuers.clone();
        std::thread::spawn(move || {
            for _ in 0..2_000 {
                issuer_store.set_issuers(base.clone(), std::collections::HashMap::new());
            }
        })
    };

    let mut last_generation = 0;
    for _ in 0..2_000 {
        let snapshot = issuer_store.snapshot();
        let expected: std::collections::BTreeSet<u32> =
            snapshot.issuers.iter().map(|e| e.id).collect();
        assert_eq!(
            expected, snapshot.ids,
            "ids and issuers diverged within one snapshot"
        );
        assert!(snapshot.generation >= last_generation);
        last_generation = snapshot.generation;
    }
    writer.join().unwrap();
}

/// A forced refresh waits for the running one instead of skipping
#[tokio::test]
async fn forced_refresh_runs_after_current() {
    let fixture = ocsp_fixture(None).await;
    let generation_before = fixture.issuer_store.snapshot().generation;
    assert!(fixture.refresher.refresh_once(true).await.unwrap());
    assert!(fixture.issuer_store.snapshot().generation > generation_before);
}
