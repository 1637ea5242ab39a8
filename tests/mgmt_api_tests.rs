// Copyright (c) 2025 - Cowboy AI, LLC.

//! Management/issuance API shapes: CSR decoding and cross certification

mod common;

use chrono::{TimeZone, Utc};
use der::asn1::{BitString, SetOfVec};
use der::{Any, Decode, Encode};
use std::collections::BTreeMap;
use std::str::FromStr;
use x509_cert::attr::Attribute;
use x509_cert::name::Name;
use x509_cert::request::{CertReq, CertReqInfo};

use cim_ca::mgmt::{csr_to_template, GenerateCertRequest, GenerateCrossCertRequest};
use cim_ca::types::CertLevel;

use common::{br_dv_profile, build_test_ca, san_value, setup_env, sub_ca_profile};

/// Build an unsigned-but-shaped PKCS#10 request
///
/// Proof-of-possession is verified by the wire front ends, so the core
/// accepts a syntactically valid CSR with an arbitrary signature.
fn build_csr(subject: &str, san_dns: Option<&[&str]>) -> Vec<u8> {
    use p256::pkcs8::EncodePublicKey as _;
    let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
    let spki_der = secret.public_key().to_public_key_der().unwrap();
    let public_key =
        x509_cert::spki::SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).unwrap();

    let mut attributes: SetOfVec<Attribute> = SetOfVec::new();
    if let Some(dns) = san_dns {
        let extension = cim_ca::asn1::raw_extension(
            cim_ca::asn1::ext::SUBJECT_ALT_NAME,
            false,
            san_value(dns),
        )
        .unwrap();
        let extensions_der = vec![extension].to_der().unwrap();
        let value = Any::from_der(&extensions_der).unwrap();
        let mut values = SetOfVec::new();
        values.insert(value).unwrap();
        attributes
            .insert(Attribute {
                oid: der::asn1::ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14"),
                values,
            })
            .unwrap();
    }

    let info = CertReqInfo {
        version: x509_cert::request::Version::V1,
        subject: Name::from_str(subject).unwrap(),
        public_key,
        attributes,
    };
    let csr = CertReq {
        info,
        algorithm: cim_ca::asn1::signature_algorithm_identifier(
            cim_ca::types::SignatureAlgo::EcdsaSha256,
        ),
        signature: BitString::from_bytes(&[0]).unwrap(),
    };
    csr.to_der().unwrap()
}

#[test]
fn csr_decoding_extracts_subject_and_extensions() {
    let csr_der = build_csr("CN=example.com", Some(&["example.com", "www.example.com"]));
    let template = csr_to_template(&csr_der, "dv", None, None).unwrap();

    assert_eq!(template.profile_name, "dv");
    assert!(template
        .extensions
        .contains_key(&cim_ca::asn1::ext::SUBJECT_ALT_NAME));
    assert!(csr_to_template(&[0x00], "dv", None, None).is_err());
}

#[tokio::test]
async fn issue_from_csr_end_to_end() {
    let env = setup_env(BTreeMap::from([("dv", br_dv_profile(90))])).await;

    let csr_der = build_csr("CN=example.com", Some(&["example.com"]));
    let response = env
        .manager
        .generate_certificate_from_csr(GenerateCertRequest {
            ca: "test-ca".to_string(),
            profile: "dv".to_string(),
            csr_der,
            not_before: None,
            not_after: None,
        })
        .await
        .unwrap();

    use x509_parser::prelude::*;
    let (_, cert) = X509Certificate::from_der(&response.cert_der).unwrap();
    let cn = cert
        .tbs_certificate
        .subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok());
    assert_eq!(cn, Some("example.com"));
    assert!(!response.serial.is_zero());
}

#[tokio::test]
async fn cross_certification_reuses_subject_and_key() {
    let mut cross = sub_ca_profile(1800, Some(0));
    cross.cert_level = CertLevel::Cross;
    let env = setup_env(BTreeMap::from([("cross", cross)])).await;

    let target = build_test_ca(
        "CN=Partner CA,O=Partner,C=FR",
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        Some(0),
    )
    .await;

    let response = env
        .manager
        .generate_cross_certificate(GenerateCrossCertRequest {
            ca: "test-ca".to_string(),
            profile: "cross".to_string(),
            target_cert_der: target.cert_der.clone(),
            not_before: None,
            not_after: None,
        })
        .await
        .unwrap();

    use x509_parser::prelude::*;
    let (_, issued) = X509Certificate::from_der(&response.cert_der).unwrap();
    let (_, original) = X509Certificate::from_der(&target.cert_der).unwrap();
    assert_eq!(
        issued.tbs_certificate.subject.as_raw(),
        original.tbs_certificate.subject.as_raw()
    );
    assert_eq!(
        issued.tbs_certificate.subject_pki.raw,
        original.tbs_certificate.subject_pki.raw
    );
    // Issued by our CA, not self-signed any more.
    assert_ne!(
        issued.tbs_certificate.issuer.as_raw(),
        original.tbs_certificate.issuer.as_raw()
    );
}
