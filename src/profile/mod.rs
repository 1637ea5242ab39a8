// Copyright (c) 2025 - Cowboy AI, LLC.

//! Certificate profile engine
//!
//! A profile definition ([`ProfileConf`]) is parsed and validated once
//! into an immutable [`CertProfile`]; contradictions fail at load, never
//! at issuance. The profile then grants subjects, screens public keys,
//! computes the extension matrix and generates serial numbers.
//!
//! Profile engines are instantiated by type through
//! [`create_profile_engine`]; the set of types is the closed
//! [`BuiltinProfileType`] enum, not a runtime registry.

pub mod cabforum;
pub mod extensions;
pub mod publickey;
pub mod subject;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use x509_cert::name::Name;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::asn1::ext;
use crate::types::{CertDomain, CertLevel, KeySpec, NotAfterMode, NotBeforeOption, Serial,
    SignatureAlgo};
use crate::{CaError, Result};

pub use extensions::{
    build_extensions, ExtensionControl, ExtensionPolicy, ExtensionValues, ExtensionsConf,
    IssuerContext, KeyUsageBit, RequestedExtension, RequestedExtensions,
};
pub use subject::{SubjectConf, SubjectControl, SubjectInfo};

/// Control of server-side keypair generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum KeypairGenControl {
    /// Generate keys of the CA's own key spec
    #[default]
    InheritCa,
    /// Server-side generation is forbidden; the request must carry a key
    Forbidden,
    /// Generate keys of an explicit spec
    Explicit {
        /// The key spec to generate
        keyspec: KeySpec,
    },
}

/// Profile-driven serial number generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum SerialNumberMode {
    /// Fresh random serial
    Random {
        /// Serial length in octets (8..=20)
        #[serde(default = "default_serial_bytes")]
        num_bytes: u8,
    },
    /// Serial derived from CA and request key material, reproducible for
    /// idempotent re-submission
    Derived {
        /// Serial length in octets (8..=20)
        #[serde(default = "default_serial_bytes")]
        num_bytes: u8,
    },
}

fn default_serial_bytes() -> u8 {
    16
}

impl Default for SerialNumberMode {
    fn default() -> Self {
        SerialNumberMode::Random {
            num_bytes: default_serial_bytes(),
        }
    }
}

impl SerialNumberMode {
    fn num_bytes(&self) -> u8 {
        match self {
            SerialNumberMode::Random { num_bytes } | SerialNumberMode::Derived { num_bytes } => {
                *num_bytes
            }
        }
    }
}

/// Serialized profile definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConf {
    /// Profile engine type
    #[serde(default = "default_profile_type")]
    pub r#type: String,
    /// Level of the issued certificates
    pub cert_level: CertLevel,
    /// Policy domain
    #[serde(default)]
    pub cert_domain: CertDomain,
    /// Certificate version; only 3 is valid
    #[serde(default = "default_version")]
    pub version: u32,
    /// Validity in days
    #[serde(default)]
    pub validity_days: u32,
    /// notBefore policy
    #[serde(default)]
    pub not_before: NotBeforeOption,
    /// notAfter mode
    #[serde(default)]
    pub not_after_mode: NotAfterMode,
    /// Force `notAfter = 9999-12-31T23:59:59Z`
    #[serde(default)]
    pub no_well_defined_expiration: bool,
    /// Server-side keypair generation control
    #[serde(default)]
    pub keypair_generation: KeypairGenControl,
    /// Serial number generation
    #[serde(default)]
    pub serial_number: SerialNumberMode,
    /// Allowed signature algorithms, ordered by preference
    pub signature_algorithms: Vec<SignatureAlgo>,
    /// Accepted subject key specs; empty accepts every supported one
    #[serde(default)]
    pub allowed_keys: Vec<KeySpec>,
    /// Subject template
    #[serde(default)]
    pub subject: SubjectConf,
    /// Extension policy
    #[serde(default)]
    pub extensions: ExtensionsConf,
}

fn default_profile_type() -> String {
    "x509".to_string()
}

fn default_version() -> u32 {
    3
}

/// A validated, immutable certificate profile
#[derive(Debug, Clone)]
pub struct CertProfile {
    /// Level of the issued certificates
    pub cert_level: CertLevel,
    /// Policy domain
    pub cert_domain: CertDomain,
    /// Validity granted to issued certificates
    pub validity: chrono::Duration,
    /// notBefore policy
    pub not_before: NotBeforeOption,
    /// notAfter mode
    pub not_after_mode: NotAfterMode,
    /// Force `notAfter = 9999-12-31T23:59:59Z`
    pub no_well_defined_expiration: bool,
    /// Server-side keypair generation control
    pub keypair_generation: KeypairGenControl,
    /// Serial number generation
    pub serial_number_mode: SerialNumberMode,
    /// Allowed signature algorithms, ordered by preference
    pub signature_algorithms: Vec<SignatureAlgo>,
    /// Accepted subject key specs
    pub allowed_keys: Vec<KeySpec>,
    /// Subject template
    pub subject_control: SubjectControl,
    /// Extension policy
    pub extension_policy: ExtensionPolicy,
}

impl CertProfile {
    /// Parse and validate a profile definition
    ///
    /// Contradictory configurations fail here with `ProfileConfig`.
    pub fn initialize(conf: &ProfileConf) -> Result<Self> {
        if conf.version != 3 {
            return Err(CaError::ProfileConfig(format!(
                "only certificate version v3 is supported, got v{}",
                conf.version
            )));
        }
        if conf.no_well_defined_expiration && conf.cert_level != CertLevel::EndEntity {
            return Err(CaError::ProfileConfig(
                "a CA-level profile must have a well-defined expiration date".to_string(),
            ));
        }
        if !conf.no_well_defined_expiration && conf.validity_days == 0 {
            return Err(CaError::ProfileConfig("validity must be positive".to_string()));
        }
        if conf.signature_algorithms.is_empty() {
            return Err(CaError::ProfileConfig(
                "at least one signature algorithm must be allowed".to_string(),
            ));
        }
        let num_bytes = conf.serial_number.num_bytes();
        if !(8..=20).contains(&num_bytes) {
            return Err(CaError::ProfileConfig(format!(
                "serial number length {} outside 8..=20 octets",
                num_bytes
            )));
        }

        let subject_control = SubjectControl::from_conf(&conf.subject)?;
        let extension_policy = ExtensionPolicy::from_conf(&conf.extensions, conf.cert_level)?;

        if conf.cert_level.is_ca() {
            if extension_policy.control(&ext::BASIC_CONSTRAINTS).is_none() {
                return Err(CaError::ProfileConfig(
                    "a CA profile requires a basicConstraints extension control".to_string(),
                ));
            }
            if !extension_policy
                .key_usage_required
                .contains(&KeyUsageBit::KeyCertSign)
            {
                return Err(CaError::ProfileConfig(
                    "a CA profile requires the keyCertSign key usage".to_string(),
                ));
            }
        }

        if conf.cert_domain == CertDomain::CabForumBr && conf.cert_level == CertLevel::EndEntity {
            let san_ok = extension_policy
                .control(&ext::SUBJECT_ALT_NAME)
                .map(|c| c.permitted_in_request)
                .unwrap_or(false);
            if !san_ok {
                return Err(CaError::ProfileConfig(
                    "a CAB-Forum end-entity profile requires a request-suppliable \
                     subjectAltName extension control"
                        .to_string(),
                ));
            }
        }

        Ok(Self {
            cert_level: conf.cert_level,
            cert_domain: conf.cert_domain,
            validity: chrono::Duration::days(conf.validity_days as i64),
            not_before: conf.not_before,
            not_after_mode: conf.not_after_mode,
            no_well_defined_expiration: conf.no_well_defined_expiration,
            keypair_generation: conf.keypair_generation,
            serial_number_mode: conf.serial_number,
            signature_algorithms: conf.signature_algorithms.clone(),
            allowed_keys: conf.allowed_keys.clone(),
            subject_control,
            extension_policy,
        })
    }

    /// True for CAB-Forum end-entity profiles
    pub fn is_cabforum_end_entity(&self) -> bool {
        self.cert_domain == CertDomain::CabForumBr && self.cert_level == CertLevel::EndEntity
    }

    /// Grant a subject for a request
    pub fn subject_info(&self, requested: &Name) -> Result<SubjectInfo> {
        subject::grant_subject(&self.subject_control, requested)
    }

    /// Enforce the key whitelist and weak-key screening
    pub fn check_public_key(&self, spki: &SubjectPublicKeyInfoOwned) -> Result<KeySpec> {
        publickey::check_public_key(&self.allowed_keys, spki)
    }

    /// Compute the extension set for a to-be-signed certificate
    pub fn extensions(
        &self,
        issuer: &IssuerContext<'_>,
        granted_subject: &Name,
        requested: &RequestedExtensions,
        granted_spki: &SubjectPublicKeyInfoOwned,
    ) -> Result<ExtensionValues> {
        build_extensions(self, issuer, granted_subject, requested, granted_spki)
    }

    /// Generate a serial number per the profile's mode
    pub fn generate_serial(
        &self,
        ca_subject_der: &[u8],
        ca_spki_der: &[u8],
        req_subject_der: &[u8],
        req_spki_der: &[u8],
        extra_control: Option<&str>,
    ) -> Result<Serial> {
        let num_bytes = self.serial_number_mode.num_bytes() as usize;
        let mut bytes = match self.serial_number_mode {
            SerialNumberMode::Random { .. } => {
                let mut buf = vec![0u8; num_bytes];
                rand::rngs::OsRng.fill_bytes(&mut buf);
                buf
            }
            SerialNumberMode::Derived { .. } => {
                let mut hasher = Sha256::new();
                hasher.update(ca_subject_der);
                hasher.update(ca_spki_der);
                hasher.update(req_subject_der);
                hasher.update(req_spki_der);
                if let Some(extra) = extra_control {
                    hasher.update(extra.as_bytes());
                }
                let digest = hasher.finalize();
                let mut buf = digest.to_vec();
                while buf.len() < num_bytes {
                    let next = Sha256::digest(&buf);
                    buf.extend_from_slice(&next);
                }
                buf.truncate(num_bytes);
                buf
            }
        };
        // Keep the value positive and non-zero.
        bytes[0] &= 0x7F;
        if bytes.iter().all(|&b| b == 0) {
            *bytes.last_mut().unwrap() = 1;
        }
        Serial::from_be_bytes(&bytes)
    }
}

/// The closed set of built-in profile engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinProfileType {
    /// The general X.509 profile engine
    X509,
}

impl FromStr for BuiltinProfileType {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "x509" | "xijson" => Ok(BuiltinProfileType::X509),
            other => Err(CaError::ProfileConfig(format!(
                "unknown profile type: {}",
                other
            ))),
        }
    }
}

/// A profile engine: an initialized profile behind a stable interface
pub trait ProfileEngine: Send + Sync {
    /// The validated profile
    fn profile(&self) -> &CertProfile;
}

/// The built-in X.509 profile engine
pub struct X509ProfileEngine {
    profile: CertProfile,
}

impl X509ProfileEngine {
    /// Initialize from a profile definition
    pub fn new(conf: &ProfileConf) -> Result<Self> {
        Ok(Self {
            profile: CertProfile::initialize(conf)?,
        })
    }
}

impl ProfileEngine for X509ProfileEngine {
    fn profile(&self) -> &CertProfile {
        &self.profile
    }
}

/// Instantiate the profile engine named by the conf's type field
pub fn create_profile_engine(conf: &ProfileConf) -> Result<Arc<dyn ProfileEngine>> {
    match BuiltinProfileType::from_str(&conf.r#type)? {
        BuiltinProfileType::X509 => Ok(Arc::new(X509ProfileEngine::new(conf)?)),
    }
}

/// Parse a profile definition from its TOML form
pub fn parse_profile_conf_toml(input: &str) -> Result<ProfileConf> {
    toml::from_str(input)
        .map_err(|e| CaError::InvalidConf(format!("invalid profile conf: {}", e)))
}

/// Parse a profile definition from its JSON form
pub fn parse_profile_conf_json(input: &str) -> Result<ProfileConf> {
    serde_json::from_str(input)
        .map_err(|e| CaError::InvalidConf(format!("invalid profile conf: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::extensions::{ExtensionControlConf, KeyUsageConf};
    use crate::profile::subject::RdnConf;

    pub(crate) fn minimal_ee_conf() -> ProfileConf {
        ProfileConf {
            r#type: "x509".to_string(),
            cert_level: CertLevel::EndEntity,
            cert_domain: CertDomain::Generic,
            version: 3,
            validity_days: 365,
            not_before: NotBeforeOption::Current,
            not_after_mode: NotAfterMode::ByCa,
            no_well_defined_expiration: false,
            keypair_generation: KeypairGenControl::InheritCa,
            serial_number: SerialNumberMode::default(),
            signature_algorithms: vec![SignatureAlgo::EcdsaSha256, SignatureAlgo::RsaSha256],
            allowed_keys: vec![],
            subject: SubjectConf {
                rdns: vec![RdnConf {
                    r#type: "cn".to_string(),
                    min_occurs: 1,
                    max_occurs: 1,
                    value: None,
                }],
                keep_rdn_order: false,
            },
            extensions: ExtensionsConf {
                controls: vec![
                    ExtensionControlConf {
                        r#type: "subjectKeyIdentifier".to_string(),
                        control: ExtensionControl {
                            critical: false,
                            required: true,
                            permitted_in_request: false,
                        },
                    },
                    ExtensionControlConf {
                        r#type: "authorityKeyIdentifier".to_string(),
                        control: ExtensionControl {
                            critical: false,
                            required: true,
                            permitted_in_request: false,
                        },
                    },
                    ExtensionControlConf {
                        r#type: "keyUsage".to_string(),
                        control: ExtensionControl {
                            critical: true,
                            required: true,
                            permitted_in_request: true,
                        },
                    },
                ],
                key_usage: vec![KeyUsageConf {
                    usage: KeyUsageBit::DigitalSignature,
                    required: true,
                }],
                ..Default::default()
            },
        }
    }

    #[test]
    fn rejects_non_v3() {
        let mut conf = minimal_ee_conf();
        conf.version = 2;
        assert!(matches!(
            CertProfile::initialize(&conf),
            Err(CaError::ProfileConfig(_))
        ));
    }

    #[test]
    fn rejects_no_expiration_on_ca_profile() {
        let mut conf = minimal_ee_conf();
        conf.cert_level = CertLevel::SubCa;
        conf.no_well_defined_expiration = true;
        assert!(matches!(
            CertProfile::initialize(&conf),
            Err(CaError::ProfileConfig(_))
        ));
    }

    #[test]
    fn accepts_no_expiration_on_ee_profile() {
        let mut conf = minimal_ee_conf();
        conf.no_well_defined_expiration = true;
        conf.validity_days = 0;
        assert!(CertProfile::initialize(&conf).is_ok());
    }

    #[test]
    fn rejects_br_ee_without_san_control() {
        let mut conf = minimal_ee_conf();
        conf.cert_domain = CertDomain::CabForumBr;
        assert!(matches!(
            CertProfile::initialize(&conf),
            Err(CaError::ProfileConfig(_))
        ));
    }

    #[test]
    fn derived_serials_are_reproducible() {
        let mut conf = minimal_ee_conf();
        conf.serial_number = SerialNumberMode::Derived { num_bytes: 16 };
        let profile = CertProfile::initialize(&conf).unwrap();

        let a = profile
            .generate_serial(b"ca", b"cak", b"req", b"reqk", None)
            .unwrap();
        let b = profile
            .generate_serial(b"ca", b"cak", b"req", b"reqk", None)
            .unwrap();
        assert_eq!(a, b);
        assert!(!a.is_zero());

        let c = profile
            .generate_serial(b"ca", b"cak", b"other", b"reqk", None)
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn random_serials_are_bounded_and_positive() {
        let profile = CertProfile::initialize(&minimal_ee_conf()).unwrap();
        for _ in 0..100 {
            let serial = profile.generate_serial(b"", b"", b"", b"", None).unwrap();
            assert!(!serial.is_zero());
            assert!(serial.as_bytes().len() <= 16);
            assert!(serial.as_bytes()[0] & 0x80 == 0 || serial.as_bytes().len() < 16);
        }
    }

    #[test]
    fn unknown_profile_type_rejected() {
        let mut conf = minimal_ee_conf();
        conf.r#type = "magic".to_string();
        assert!(create_profile_engine(&conf).is_err());
    }

    #[test]
    fn profile_conf_parses_from_toml() {
        let conf = parse_profile_conf_toml(
            r#"
            cert_level = "endentity"
            validity_days = 365
            signature_algorithms = ["ecdsa-sha256", "rsa-sha256"]

            [subject]
            rdns = [{ type = "cn" }, { type = "o", min_occurs = 0 }]

            [[extensions.controls]]
            type = "keyUsage"
            critical = true
            required = true

            [[extensions.key_usage]]
            usage = "digitalSignature"
            required = true
            "#,
        )
        .unwrap();
        assert_eq!(conf.cert_level, CertLevel::EndEntity);
        assert_eq!(conf.validity_days, 365);
        assert!(CertProfile::initialize(&conf).is_ok());
    }
}
