// Copyright (c) 2025 - Cowboy AI, LLC.

//! Property-based tests for issuance and status invariants

mod common;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::str::FromStr;
use x509_cert::name::Name;

use cim_ca::asn1;
use cim_ca::idgen::UniqueIdGenerator;
use cim_ca::issuance::{build_granted_template, CertTemplateData, PublicKeyRequest};
use cim_ca::profile::{CertProfile, RequestedExtension, RequestedExtensions};
use cim_ca::store::{CertListFilter, CertListOrder, CertRecord, CertStore, MemoryCertStore};
use cim_ca::types::{end_of_time, CrlReason, RevocationInfo, Serial, SignatureAlgo, ValidityMode};

use common::{build_test_ca, ca_info_of, ee_profile};

// ============================================================================
// Generators
// ============================================================================

fn arb_label() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{1,24}").unwrap()
}

fn arb_key_usage_request() -> impl Strategy<Value = bool> {
    any::<bool>()
}

// ============================================================================
// Unique id generator
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn idgen_is_strictly_increasing(count in 10usize..500) {
        let generator = UniqueIdGenerator::new(7);
        let mut last = 0;
        for _ in 0..count {
            let id = generator.next_id().unwrap();
            prop_assert!(id > last);
            last = id;
        }
    }
}

// ============================================================================
// Deterministic extension encoding
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Building the extension set twice from the same inputs yields the
    /// same bytes, extension for extension.
    #[test]
    fn extension_encoding_is_deterministic(cn in arb_label(), want_ke in arb_key_usage_request()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let ca = build_test_ca(
                "CN=Det CA,O=Acme,C=DE",
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2034, 1, 1, 0, 0, 0).unwrap(),
                Some(1),
            )
            .await;
            let info = ca_info_of(&ca, "det-ca", ValidityMode::Cutoff);
            let profile = CertProfile::initialize(&ee_profile(365)).unwrap();

            let subject = Name::from_str(&format!("CN={}", cn)).unwrap();
            let granted = profile.subject_info(&subject).unwrap();

            let mut requested = RequestedExtensions::new();
            if want_ke {
                let mut bits = std::collections::BTreeSet::new();
                bits.insert(cim_ca::profile::KeyUsageBit::KeyEncipherment);
                requested.insert(
                    asn1::ext::KEY_USAGE,
                    RequestedExtension {
                        critical: true,
                        value: cim_ca::profile::extensions::encode_key_usage(&bits).unwrap(),
                    },
                );
            }

            use p256::pkcs8::EncodePublicKey as _;
            use der::Decode as _;
            let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
            let spki_der = secret.public_key().to_public_key_der().unwrap();
            let spki = x509_cert::spki::SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes())
                .unwrap();

            let first = profile
                .extensions(&info.issuer_context(), &granted.granted, &requested, &spki)
                .unwrap();
            let second = profile
                .extensions(&info.issuer_context(), &granted.granted, &requested, &spki)
                .unwrap();

            assert_eq!(first.extensions.len(), second.extensions.len());
            for (a, b) in first.extensions.iter().zip(second.extensions.iter()) {
                assert_eq!(a.extn_id, b.extn_id);
                assert_eq!(a.critical, b.critical);
                assert_eq!(a.extn_value, b.extn_value);
            }
        });
    }
}

// ============================================================================
// Validity bounds
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Granted validity always sits inside the CA window under the
    /// cutoff mode, and never beyond the end of time.
    #[test]
    fn granted_validity_is_bounded(
        offset_days in 0i64..4000,
        requested_days in 1i64..5000,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let ca_not_before = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let ca_not_after = Utc.with_ymd_and_hms(2034, 1, 1, 0, 0, 0).unwrap();
            let ca = build_test_ca("CN=Bound CA,O=Acme,C=DE", ca_not_before, ca_not_after, Some(1))
                .await;
            let info = ca_info_of(&ca, "bound-ca", ValidityMode::Cutoff);
            let profile = CertProfile::initialize(&ee_profile(365)).unwrap();

            use p256::pkcs8::EncodePublicKey as _;
            use der::Decode as _;
            let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
            let spki_der = secret.public_key().to_public_key_der().unwrap();
            let spki = x509_cert::spki::SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes())
                .unwrap();

            let now = ca_not_before + Duration::days(offset_days.min(3600));
            let request = CertTemplateData {
                subject: Name::from_str("CN=bounded").unwrap(),
                public_key: PublicKeyRequest::Presented(spki),
                extensions: RequestedExtensions::new(),
                not_before: Some(now),
                not_after: Some(now + Duration::days(requested_days)),
                profile_name: "ee".to_string(),
                cross_cert: false,
                cert_req_id: None,
            };

            match build_granted_template(
                &info,
                &profile,
                &request,
                &[SignatureAlgo::EcdsaSha256],
                &[],
                now,
            )
            .await
            {
                Ok(template) => {
                    assert!(template.not_before >= info.cert.not_before);
                    assert!(template.not_after <= info.cert.not_after);
                    assert!(template.not_after <= end_of_time());
                    assert!(template.not_before < template.not_after);
                }
                Err(e) => {
                    // The only acceptable refusal in this setup is the
                    // no-new-certificates bound.
                    assert!(
                        matches!(e, cim_ca::CaError::NotPermitted(_)),
                        "unexpected error: {}",
                        e
                    );
                }
            }
        });
    }
}

// ============================================================================
// CRL ordering
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Revoked listings are ordered by (revocationTime, serial).
    #[test]
    fn revocation_listing_is_ordered(entries in prop::collection::vec((1u64..100_000, 0i64..1000), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = MemoryCertStore::new();
            let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
            let mut id = 1i64;
            for (serial, offset) in &entries {
                let record = CertRecord {
                    id,
                    issuer_id: 1,
                    serial: Serial::from_u64(*serial),
                    subject: format!("CN=c{}", id),
                    not_before: t0,
                    not_after: t0 + Duration::days(3650),
                    revocation: Some(RevocationInfo::new(
                        CrlReason::KeyCompromise,
                        t0 + Duration::seconds(*offset),
                    )),
                    profile_id: 1,
                    requestor_id: None,
                    cert_hash: None,
                    cert_der: vec![0x30],
                    crl_id: None,
                };
                id += 1;
                // Duplicate serials may collide; that is fine here.
                let _ = store.add_cert(record).await;
            }

            let listed = store
                .list_certs(
                    &CertListFilter {
                        issuer_id: Some(1),
                        revoked: Some(true),
                        ..Default::default()
                    },
                    CertListOrder::RevocationTimeSerial,
                    usize::MAX,
                )
                .await
                .unwrap();

            for pair in listed.windows(2) {
                let ta = pair[0].revocation.as_ref().unwrap().revocation_time;
                let tb = pair[1].revocation.as_ref().unwrap().revocation_time;
                assert!(ta < tb || (ta == tb && pair[0].serial <= pair[1].serial));
            }
        });
    }
}

// ============================================================================
// No well-defined expiration
// ============================================================================

#[tokio::test]
async fn no_well_defined_expiration_pins_not_after() {
    let ca = build_test_ca(
        "CN=Eternal CA,O=Acme,C=DE",
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2034, 1, 1, 0, 0, 0).unwrap(),
        Some(1),
    )
    .await;
    // Lax mode: the pinned notAfter is allowed to outlive the CA.
    let info = ca_info_of(&ca, "eternal-ca", ValidityMode::Lax);
    let mut conf = ee_profile(365);
    conf.no_well_defined_expiration = true;
    conf.validity_days = 0;
    let profile = CertProfile::initialize(&conf).unwrap();

    use der::Decode as _;
    use p256::pkcs8::EncodePublicKey as _;
    let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
    let spki_der = secret.public_key().to_public_key_der().unwrap();
    let spki =
        x509_cert::spki::SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).unwrap();

    let request = CertTemplateData {
        subject: Name::from_str("CN=eternal").unwrap(),
        public_key: PublicKeyRequest::Presented(spki),
        extensions: RequestedExtensions::new(),
        not_before: None,
        not_after: None,
        profile_name: "ee".to_string(),
        cross_cert: false,
        cert_req_id: None,
    };
    let template = build_granted_template(
        &info,
        &profile,
        &request,
        &[SignatureAlgo::EcdsaSha256],
        &[],
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(template.not_after, end_of_time());
}
