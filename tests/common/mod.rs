// Copyright (c) 2025 - Cowboy AI, LLC.

//! Shared fixtures: self-signed test CAs, profiles and a wired manager

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use der::asn1::BitString;
use der::{Decode, Encode};
use p256::pkcs8::{EncodePrivateKey as _, EncodePublicKey as _};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use x509_cert::certificate::{Certificate, TbsCertificate, Version};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::time::Validity;

use cim_ca::asn1;
use cim_ca::ca::{CaCert, CaInfo};
use cim_ca::manager::{CaEntry, CaManager, CaManagerConf, KeypairGenEntry, ProfileEntry,
    SignerEntry};
use cim_ca::profile::extensions::{ExtensionControlConf, KeyUsageConf};
use cim_ca::profile::subject::RdnConf;
use cim_ca::profile::{
    ExtensionControl, ExtensionsConf, KeyUsageBit, KeypairGenControl, ProfileConf, SubjectConf,
};
use cim_ca::signer::{SignerConf, SoftwareSigner};
use cim_ca::store::MemoryCertStore;
use cim_ca::traits::Signer;
use cim_ca::types::{CaStatus, CertDomain, CertLevel, NotAfterMode, NotBeforeOption, Serial,
    SignatureAlgo, ValidityMode};

/// A self-signed CA certificate together with its signing key
pub struct TestCa {
    /// PEM of the CA certificate
    pub cert_pem: String,
    /// DER of the CA certificate
    pub cert_der: Vec<u8>,
    /// Signer conf loading the CA key
    pub signer_conf: SignerConf,
}

/// Build a self-signed EC P-256 CA certificate
pub async fn build_test_ca(
    subject: &str,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    path_len: Option<u8>,
) -> TestCa {
    let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
    let key_der = secret.to_pkcs8_der().unwrap();
    let signer = SoftwareSigner::from_pkcs8_der(SignatureAlgo::EcdsaSha256, key_der.as_bytes())
        .unwrap();
    let spki_der = secret.public_key().to_public_key_der().unwrap();
    let spki =
        x509_cert::spki::SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).unwrap();

    let name = Name::from_str(subject).unwrap();
    let ski = asn1::key_identifier(&spki);

    let mut key_usage = std::collections::BTreeSet::new();
    key_usage.insert(KeyUsageBit::KeyCertSign);
    key_usage.insert(KeyUsageBit::CrlSign);

    let extensions: Vec<Extension> = vec![
        asn1::raw_extension(
            asn1::ext::SUBJECT_KEY_IDENTIFIER,
            false,
            der::asn1::OctetString::new(ski).unwrap().to_der().unwrap(),
        )
        .unwrap(),
        asn1::extension(
            asn1::ext::BASIC_CONSTRAINTS,
            true,
            &x509_cert::ext::pkix::BasicConstraints {
                ca: true,
                path_len_constraint: path_len,
            },
        )
        .unwrap(),
        asn1::raw_extension(
            asn1::ext::KEY_USAGE,
            true,
            cim_ca::profile::extensions::encode_key_usage(&key_usage).unwrap(),
        )
        .unwrap(),
    ];

    let signature_algorithm = asn1::signature_algorithm_identifier(SignatureAlgo::EcdsaSha256);
    let tbs = TbsCertificate {
        version: Version::V3,
        serial_number: asn1::serial_to_x509(&Serial::from_u64(1)).unwrap(),
        signature: signature_algorithm.clone(),
        issuer: name.clone(),
        validity: Validity {
            not_before: asn1::to_asn1_time(not_before).unwrap(),
            not_after: asn1::to_asn1_time(not_after).unwrap(),
        },
        subject: name,
        subject_public_key_info: spki,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions),
    };
    let signature = signer.sign(&tbs.to_der().unwrap()).await.unwrap();
    let certificate = Certificate {
        tbs_certificate: tbs,
        signature_algorithm,
        signature: BitString::from_bytes(&signature).unwrap(),
    };
    let cert_der = certificate.to_der().unwrap();
    let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", cert_der.clone()));
    let key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", key_der.as_bytes().to_vec()));

    TestCa {
        cert_pem,
        cert_der,
        signer_conf: SignerConf {
            r#type: "software".to_string(),
            algorithm: SignatureAlgo::EcdsaSha256,
            private_key_pem: key_pem,
        },
    }
}

/// Standalone CaInfo for driving the template builder directly
pub fn ca_info_of(test_ca: &TestCa, name: &str, validity_mode: ValidityMode) -> CaInfo {
    let cert = CaCert::parse(&test_ca.cert_der).unwrap();
    CaInfo {
        ident: cim_ca::types::NameId::new(1, name).unwrap(),
        no_new_certificate_after: cert.not_after,
        cert,
        cert_chain: Vec::new(),
        status: CaStatus::Active,
        validity_mode,
        max_validity_days: None,
        revocation_info: None,
        extra_control: None,
        crl_control: None,
        ocsp_uris: vec!["http://ocsp.example.com".to_string()],
        ca_issuer_uris: Vec::new(),
        crl_uris: vec!["http://crl.example.com/ca.crl".to_string()],
        delta_crl_uris: Vec::new(),
    }
}

fn control(ty: &str, critical: bool, required: bool, in_request: bool) -> ExtensionControlConf {
    ExtensionControlConf {
        r#type: ty.to_string(),
        control: ExtensionControl {
            critical,
            required,
            permitted_in_request: in_request,
        },
    }
}

fn rdn(ty: &str, min: u32, max: u32) -> RdnConf {
    RdnConf {
        r#type: ty.to_string(),
        min_occurs: min,
        max_occurs: max,
        value: None,
    }
}

/// A generic end-entity profile
pub fn ee_profile(validity_days: u32) -> ProfileConf {
    ProfileConf {
        r#type: "x509".to_string(),
        cert_level: CertLevel::EndEntity,
        cert_domain: CertDomain::Generic,
        version: 3,
        validity_days,
        not_before: NotBeforeOption::Current,
        not_after_mode: NotAfterMode::ByCa,
        no_well_defined_expiration: false,
        keypair_generation: KeypairGenControl::InheritCa,
        serial_number: Default::default(),
        signature_algorithms: vec![SignatureAlgo::EcdsaSha256],
        allowed_keys: vec![],
        subject: SubjectConf {
            rdns: vec![rdn("cn", 1, 1), rdn("o", 0, 1), rdn("c", 0, 1)],
            keep_rdn_order: false,
        },
        extensions: ExtensionsConf {
            controls: vec![
                control("subjectKeyIdentifier", false, true, false),
                control("authorityKeyIdentifier", false, true, false),
                control("keyUsage", true, true, true),
                control("subjectAltName", false, false, true),
                control("crlDistributionPoints", false, false, false),
                control("authorityInfoAccess", false, false, false),
            ],
            key_usage: vec![
                KeyUsageConf {
                    usage: KeyUsageBit::DigitalSignature,
                    required: true,
                },
                KeyUsageConf {
                    usage: KeyUsageBit::KeyEncipherment,
                    required: false,
                },
            ],
            ..Default::default()
        },
    }
}

/// A CAB-Forum domain-validated end-entity profile
pub fn br_dv_profile(validity_days: u32) -> ProfileConf {
    let mut conf = ee_profile(validity_days);
    conf.cert_domain = CertDomain::CabForumBr;
    conf.extensions.certificate_policies = vec![cim_ca::profile::extensions::PolicyConf {
        oid: "2.23.140.1.2.1".to_string(),
        cps_uri: None,
    }];
    conf
}

/// A subordinate-CA profile with a path-length constraint
pub fn sub_ca_profile(validity_days: u32, path_len: Option<u8>) -> ProfileConf {
    let mut conf = ee_profile(validity_days);
    conf.cert_level = CertLevel::SubCa;
    conf.subject = SubjectConf {
        rdns: vec![rdn("cn", 1, 1), rdn("o", 0, 1), rdn("c", 0, 1)],
        keep_rdn_order: false,
    };
    conf.extensions.controls.push(control("basicConstraints", true, true, false));
    conf.extensions.basic_constraints_path_len = path_len;
    conf.extensions.key_usage = vec![
        KeyUsageConf {
            usage: KeyUsageBit::KeyCertSign,
            required: true,
        },
        KeyUsageConf {
            usage: KeyUsageBit::CrlSign,
            required: true,
        },
    ];
    conf
}

/// A fully wired manager over an in-memory store
pub struct TestEnv {
    /// The manager
    pub manager: Arc<CaManager>,
    /// The shared store
    pub store: Arc<MemoryCertStore>,
    /// The test CA
    pub ca: TestCa,
    _lock_dir: tempfile::TempDir,
}

static TRACING: std::sync::Once = std::sync::Once::new();

/// Install the test log subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Wire a manager with one CA (`test-ca`), one signer, one software
/// keypair generator, and the given profiles bound to the CA
pub async fn setup_env(profiles: BTreeMap<&str, ProfileConf>) -> TestEnv {
    init_tracing();
    let store = Arc::new(MemoryCertStore::new().with_certhash_algo("SHA256"));
    let lock_dir = tempfile::tempdir().unwrap();
    let manager = CaManager::new(
        CaManagerConf {
            master: true,
            shard_id: 0,
            lock_file_dir: lock_dir.path().to_path_buf(),
        },
        store.clone(),
    );

    let ca = build_test_ca(
        "CN=Test Issuing CA,O=Acme,C=DE",
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2034, 1, 1, 0, 0, 0).unwrap(),
        Some(1),
    )
    .await;

    manager
        .add_signer(SignerEntry {
            name: "ca-signer".to_string(),
            conf: ca.signer_conf.clone(),
        })
        .await
        .unwrap();
    manager
        .add_keypair_gen(KeypairGenEntry {
            name: "softgen".to_string(),
            r#type: "software".to_string(),
        })
        .await
        .unwrap();

    manager
        .add_ca(CaEntry {
            name: "test-ca".to_string(),
            cert_pem: ca.cert_pem.clone(),
            cert_chain_pem: vec![],
            status: CaStatus::Active,
            validity_mode: ValidityMode::Cutoff,
            max_validity_days: None,
            no_new_certificate_after: None,
            revocation: None,
            extra_control: None,
            crl_control: Some(cim_ca::ca::CrlControl {
                interval_hours: 24,
                overlap_hours: 6,
                include_expired_certs: false,
            }),
            ocsp_uris: vec!["http://ocsp.example.com".to_string()],
            ca_issuer_uris: vec![],
            crl_uris: vec!["http://crl.example.com/ca.crl".to_string()],
            delta_crl_uris: vec![],
            signer_names: vec!["ca-signer".to_string()],
            keypair_gen_names: vec!["softgen".to_string()],
            sign_parallelism: Some(4),
        })
        .await
        .unwrap();

    for (name, conf) in profiles {
        manager
            .add_profile(ProfileEntry {
                name: name.to_string(),
                conf,
            })
            .await
            .unwrap();
        manager.add_ca_profile("test-ca", name).unwrap();
    }

    TestEnv {
        manager,
        store,
        ca,
        _lock_dir: lock_dir,
    }
}

/// Encode a dNSName-only SAN value
pub fn san_value(dns_names: &[&str]) -> Vec<u8> {
    let names: Vec<x509_cert::ext::pkix::name::GeneralName> = dns_names
        .iter()
        .map(|n| asn1::dns_general_name(n).unwrap())
        .collect();
    names.to_der().unwrap()
}
