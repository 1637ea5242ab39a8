// Copyright (c) 2025 - Cowboy AI, LLC.

//! Extension computation engine
//!
//! Computes the extension set of a to-be-signed certificate from the
//! profile's extension policy, the request, and the issuing CA's state.
//! The composition order is fixed so encodings are reproducible:
//!
//! 1. SubjectKeyIdentifier
//! 2. AuthorityKeyIdentifier
//! 3. IssuerAltName
//! 4. AuthorityInfoAccess
//! 5. CRLDistributionPoints / FreshestCRL
//! 6. BasicConstraints
//! 7. KeyUsage
//! 8. ExtendedKeyUsage
//! 9. OCSP-nocheck
//! 10. SubjectAltName
//! 11. SubjectInfoAccess
//! 12. CertificatePolicies
//! 13. NameConstraints
//! 14. Profile-provided extras (QC statements, admission, biometric
//!     info, GM/T 0015 identity fields, constant extensions)

use der::asn1::{BitString, ObjectIdentifier, OctetString};
use der::{Any, Decode, Encode, Sequence, Tag};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use x509_cert::ext::pkix::name::{GeneralName, GeneralNames};
use x509_cert::ext::pkix::{AccessDescription, AuthorityKeyIdentifier, BasicConstraints};
use x509_cert::ext::pkix::certpolicy::PolicyInformation;
use x509_cert::ext::pkix::crl::dp::DistributionPoint;
use x509_cert::ext::pkix::name::DistributionPointName;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

use crate::asn1::{self, access, eku, ext};
use crate::types::{CertLevel, HashAlgo, Serial};
use crate::{CaError, Result};

use super::cabforum;
use super::CertProfile;

// ---------------------------------------------------------------------------
// Key usage
// ---------------------------------------------------------------------------

/// Named key-usage bits (RFC 5280 section 4.2.1.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyUsageBit {
    /// digitalSignature
    DigitalSignature,
    /// contentCommitment (nonRepudiation)
    ContentCommitment,
    /// keyEncipherment
    KeyEncipherment,
    /// dataEncipherment
    DataEncipherment,
    /// keyAgreement
    KeyAgreement,
    /// keyCertSign
    KeyCertSign,
    /// cRLSign
    CrlSign,
    /// encipherOnly
    EncipherOnly,
    /// decipherOnly
    DecipherOnly,
}

impl KeyUsageBit {
    /// Bit index in the named BIT STRING
    pub fn bit_index(&self) -> usize {
        match self {
            KeyUsageBit::DigitalSignature => 0,
            KeyUsageBit::ContentCommitment => 1,
            KeyUsageBit::KeyEncipherment => 2,
            KeyUsageBit::DataEncipherment => 3,
            KeyUsageBit::KeyAgreement => 4,
            KeyUsageBit::KeyCertSign => 5,
            KeyUsageBit::CrlSign => 6,
            KeyUsageBit::EncipherOnly => 7,
            KeyUsageBit::DecipherOnly => 8,
        }
    }

    /// All bits, index-ordered
    pub fn all() -> [KeyUsageBit; 9] {
        [
            KeyUsageBit::DigitalSignature,
            KeyUsageBit::ContentCommitment,
            KeyUsageBit::KeyEncipherment,
            KeyUsageBit::DataEncipherment,
            KeyUsageBit::KeyAgreement,
            KeyUsageBit::KeyCertSign,
            KeyUsageBit::CrlSign,
            KeyUsageBit::EncipherOnly,
            KeyUsageBit::DecipherOnly,
        ]
    }
}

/// Encode a key-usage set as the DER value of the extension
pub fn encode_key_usage(bits: &BTreeSet<KeyUsageBit>) -> Result<Vec<u8>> {
    let highest = bits
        .iter()
        .map(|b| b.bit_index())
        .max()
        .ok_or_else(|| CaError::ProfileConfig("empty key usage".to_string()))?;
    let num_bytes = highest / 8 + 1;
    let mut bytes = vec![0u8; num_bytes];
    for bit in bits {
        let i = bit.bit_index();
        bytes[i / 8] |= 0x80 >> (i % 8);
    }
    let unused = (7 - highest % 8) as u8;
    Ok(BitString::new(unused, bytes)?.to_der()?)
}

/// Parse the DER value of a key-usage extension
pub fn decode_key_usage(value: &[u8]) -> Result<BTreeSet<KeyUsageBit>> {
    let bs = BitString::from_der(value)
        .map_err(|e| CaError::BadCertTemplate(format!("malformed KeyUsage: {}", e)))?;
    let bytes = bs.raw_bytes();
    let mut out = BTreeSet::new();
    for bit in KeyUsageBit::all() {
        let i = bit.bit_index();
        if i / 8 < bytes.len() && bytes[i / 8] & (0x80 >> (i % 8)) != 0 {
            out.insert(bit);
        }
    }
    Ok(out)
}

/// Extended-key-usage purposes accepted by name in profile confs
pub fn eku_oid_by_name(name: &str) -> Option<ObjectIdentifier> {
    match name {
        "any" | "anyExtendedKeyUsage" => Some(eku::ANY),
        "serverAuth" => Some(eku::SERVER_AUTH),
        "clientAuth" => Some(eku::CLIENT_AUTH),
        "codeSigning" => Some(eku::CODE_SIGNING),
        "emailProtection" => Some(eku::EMAIL_PROTECTION),
        "timeStamping" => Some(eku::TIME_STAMPING),
        "ocspSigning" => Some(eku::OCSP_SIGNING),
        _ => ObjectIdentifier::new(name).ok(),
    }
}

/// Extension types accepted by name in profile confs
pub fn ext_oid_by_name(name: &str) -> Option<ObjectIdentifier> {
    match name {
        "subjectKeyIdentifier" => Some(ext::SUBJECT_KEY_IDENTIFIER),
        "authorityKeyIdentifier" => Some(ext::AUTHORITY_KEY_IDENTIFIER),
        "issuerAltName" => Some(ext::ISSUER_ALT_NAME),
        "authorityInfoAccess" => Some(ext::AUTHORITY_INFO_ACCESS),
        "crlDistributionPoints" => Some(ext::CRL_DISTRIBUTION_POINTS),
        "freshestCrl" => Some(ext::FRESHEST_CRL),
        "basicConstraints" => Some(ext::BASIC_CONSTRAINTS),
        "keyUsage" => Some(ext::KEY_USAGE),
        "extendedKeyUsage" => Some(ext::EXTENDED_KEY_USAGE),
        "ocspNoCheck" => Some(ext::OCSP_NOCHECK),
        "subjectAltName" => Some(ext::SUBJECT_ALT_NAME),
        "subjectInfoAccess" => Some(ext::SUBJECT_INFO_ACCESS),
        "certificatePolicies" => Some(ext::CERTIFICATE_POLICIES),
        "nameConstraints" => Some(ext::NAME_CONSTRAINTS),
        "qcStatements" => Some(ext::QC_STATEMENTS),
        "admission" => Some(ext::ADMISSION),
        "biometricInfo" => Some(ext::BIOMETRIC_INFO),
        _ => ObjectIdentifier::new(name).ok(),
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Control flags of one extension type
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExtensionControl {
    /// Mark the extension critical
    #[serde(default)]
    pub critical: bool,
    /// The extension must be present in the issued certificate
    #[serde(default)]
    pub required: bool,
    /// The request may supply the extension value
    #[serde(default)]
    pub permitted_in_request: bool,
}

/// One extension-control line of a profile conf
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionControlConf {
    /// Extension type: well-known name or dotted OID
    pub r#type: String,
    /// Control flags
    #[serde(flatten)]
    pub control: ExtensionControl,
}

/// One key-usage line of a profile conf
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyUsageConf {
    /// The bit
    pub usage: KeyUsageBit,
    /// Required bits are always set; optional ones only when requested
    #[serde(default)]
    pub required: bool,
}

/// One extended-key-usage line of a profile conf
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EkuConf {
    /// Purpose: well-known name or dotted OID
    pub usage: String,
    /// Required purposes are always present; optional ones only when
    /// requested
    #[serde(default)]
    pub required: bool,
}

/// One certificate-policy line of a profile conf
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConf {
    /// Policy identifier (dotted OID)
    pub oid: String,
    /// Optional CPS URI qualifier
    #[serde(default)]
    pub cps_uri: Option<String>,
}

/// Name-constraints conf: dNSName subtrees
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NameConstraintsConf {
    /// Permitted DNS subtrees
    #[serde(default)]
    pub permitted_dns: Vec<String>,
    /// Excluded DNS subtrees
    #[serde(default)]
    pub excluded_dns: Vec<String>,
}

/// One QC statement of a profile conf
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcStatementConf {
    /// Statement id (dotted OID)
    pub oid: String,
}

/// Admission (TeleTrusT) conf
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConf {
    /// Profession items
    pub profession_items: Vec<String>,
    /// Registration number
    #[serde(default)]
    pub registration_number: Option<String>,
}

/// One biometric-data entry of a profile conf
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiometricDataConf {
    /// Type of biometric data (dotted OID)
    pub type_oid: String,
    /// Hash algorithm of the biometric hash
    pub hash_algo: HashAlgo,
    /// Hash value, hex encoded
    pub hash_hex: String,
    /// Source data URI
    #[serde(default)]
    pub source_data_uri: Option<String>,
}

/// GM/T 0015 identity extension values
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Gmt0015Conf {
    /// Identity code of the subject
    #[serde(default)]
    pub identity_code: Option<String>,
    /// Insurance number
    #[serde(default)]
    pub insurance_number: Option<String>,
    /// Industrial/commercial registration number
    #[serde(default)]
    pub ic_registration_number: Option<String>,
    /// Organization code
    #[serde(default)]
    pub organization_code: Option<String>,
    /// Taxation number
    #[serde(default)]
    pub taxation_number: Option<String>,
}

/// Constant extension: pre-encoded DER emitted verbatim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantExtnConf {
    /// Extension OID
    pub oid: String,
    /// Criticality
    #[serde(default)]
    pub critical: bool,
    /// Base64 of the DER extension value
    pub value_b64: String,
}

/// Extension section of a profile conf
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtensionsConf {
    /// Per-extension control flags
    #[serde(default)]
    pub controls: Vec<ExtensionControlConf>,
    /// Path-length constraint for CA profiles
    #[serde(default)]
    pub basic_constraints_path_len: Option<u8>,
    /// Include issuer DN and serial in the AuthorityKeyIdentifier
    #[serde(default)]
    pub aki_include_issuer_serial: bool,
    /// Key-usage bits
    #[serde(default)]
    pub key_usage: Vec<KeyUsageConf>,
    /// Extended-key-usage purposes
    #[serde(default)]
    pub extended_key_usage: Vec<EkuConf>,
    /// Permitted URI schemes in AuthorityInfoAccess
    #[serde(default = "default_protocols")]
    pub aia_protocols: Vec<String>,
    /// Permitted URI schemes in CRL distribution points
    #[serde(default = "default_protocols")]
    pub crldp_protocols: Vec<String>,
    /// Permitted access methods in SubjectInfoAccess (dotted OIDs)
    #[serde(default)]
    pub sia_access_methods: Vec<String>,
    /// Certificate policies
    #[serde(default)]
    pub certificate_policies: Vec<PolicyConf>,
    /// Name constraints
    #[serde(default)]
    pub name_constraints: Option<NameConstraintsConf>,
    /// QC statements
    #[serde(default)]
    pub qc_statements: Vec<QcStatementConf>,
    /// Admission
    #[serde(default)]
    pub admission: Option<AdmissionConf>,
    /// Biometric info
    #[serde(default)]
    pub biometric_info: Vec<BiometricDataConf>,
    /// GM/T 0015 identity extensions
    #[serde(default)]
    pub gmt0015: Option<Gmt0015Conf>,
    /// Constant extensions
    #[serde(default)]
    pub constant: Vec<ConstantExtnConf>,
}

fn default_protocols() -> Vec<String> {
    vec!["http".to_string(), "https".to_string(), "ldap".to_string()]
}

// ---------------------------------------------------------------------------
// DER structures not provided by x509-cert
// ---------------------------------------------------------------------------

/// GeneralSubtree (RFC 5280 section 4.2.1.10); minimum/maximum stay at
/// their defaults and are never encoded
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct GeneralSubtree {
    /// Subtree base
    pub base: GeneralName,
}

/// NameConstraints (RFC 5280 section 4.2.1.10)
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct NameConstraintsValue {
    /// Permitted subtrees
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
    pub permitted_subtrees: Option<Vec<GeneralSubtree>>,
    /// Excluded subtrees
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", optional = "true")]
    pub excluded_subtrees: Option<Vec<GeneralSubtree>>,
}

/// QCStatement (RFC 3739 section 3.2.6), statement info omitted
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct QcStatement {
    /// Statement id
    pub statement_id: ObjectIdentifier,
}

/// BiometricData (RFC 3739 section 3.2.3), OID form of the type
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct BiometricData {
    /// Type of biometric data
    pub type_of_biometric_data: ObjectIdentifier,
    /// Hash algorithm
    pub hash_algorithm: AlgorithmIdentifierOwned,
    /// Hash of the source data
    pub biometric_data_hash: OctetString,
    /// Source data URI
    #[asn1(optional = "true")]
    pub source_data_uri: Option<der::asn1::Ia5String>,
}

/// ProfessionInfo of the TeleTrusT admission extension, reduced to the
/// fields this CA issues
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct ProfessionInfo {
    /// Profession items
    pub profession_items: Vec<String>,
    /// Registration number
    #[asn1(optional = "true")]
    pub registration_number: Option<der::asn1::PrintableString>,
}

/// Admissions of the TeleTrusT admission extension
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct Admissions {
    /// Profession infos
    pub profession_infos: Vec<ProfessionInfo>,
}

/// AdmissionSyntax of the TeleTrusT admission extension
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct AdmissionSyntax {
    /// Contents of admissions
    pub contents_of_admissions: Vec<Admissions>,
}

// ---------------------------------------------------------------------------
// Resolved policy
// ---------------------------------------------------------------------------

/// Extension policy of a profile after validation; structured extension
/// values are pre-encoded so issuance only assembles
#[derive(Debug, Clone)]
pub struct ExtensionPolicy {
    /// Control flags by extension type
    pub controls: HashMap<ObjectIdentifier, ExtensionControl>,
    /// Path-length constraint for CA profiles
    pub path_len: Option<u8>,
    /// Include issuer DN and serial in the AKI
    pub aki_include_issuer_serial: bool,
    /// Always-set key-usage bits
    pub key_usage_required: BTreeSet<KeyUsageBit>,
    /// Request-selectable key-usage bits
    pub key_usage_optional: BTreeSet<KeyUsageBit>,
    /// Always-present EKU purposes
    pub eku_required: Vec<ObjectIdentifier>,
    /// Request-selectable EKU purposes
    pub eku_optional: Vec<ObjectIdentifier>,
    /// Permitted URI schemes in the AIA
    pub aia_protocols: Vec<String>,
    /// Permitted URI schemes in CRL distribution points
    pub crldp_protocols: Vec<String>,
    /// Permitted SIA access methods
    pub sia_access_methods: Vec<ObjectIdentifier>,
    /// Certificate policy identifiers (for BR validation-level detection)
    pub policy_oids: Vec<ObjectIdentifier>,
    /// Pre-encoded certificatePolicies value
    pub certificate_policies: Option<Vec<u8>>,
    /// Pre-encoded nameConstraints value
    pub name_constraints: Option<Vec<u8>>,
    /// Pre-encoded qcStatements value
    pub qc_statements: Option<Vec<u8>>,
    /// Pre-encoded admission value
    pub admission: Option<Vec<u8>>,
    /// Pre-encoded biometricInfo value
    pub biometric_info: Option<Vec<u8>>,
    /// Pre-encoded GM/T 0015 values
    pub gmt0015: Vec<(ObjectIdentifier, Vec<u8>)>,
    /// Constant extensions: `(oid, critical, value)`
    pub constants: Vec<(ObjectIdentifier, bool, Vec<u8>)>,
}

impl ExtensionPolicy {
    /// Resolve and pre-encode an extensions conf
    pub fn from_conf(conf: &ExtensionsConf, cert_level: CertLevel) -> Result<Self> {
        let mut controls = HashMap::new();
        for line in &conf.controls {
            let oid = ext_oid_by_name(&line.r#type).ok_or_else(|| {
                CaError::ProfileConfig(format!("unknown extension type: {}", line.r#type))
            })?;
            if controls.insert(oid, line.control).is_some() {
                return Err(CaError::ProfileConfig(format!(
                    "duplicate extension control: {}",
                    line.r#type
                )));
            }
        }

        if cert_level == CertLevel::EndEntity && conf.basic_constraints_path_len.is_some() {
            return Err(CaError::ProfileConfig(
                "pathLen constraint configured for an end-entity profile".to_string(),
            ));
        }

        let mut key_usage_required = BTreeSet::new();
        let mut key_usage_optional = BTreeSet::new();
        for ku in &conf.key_usage {
            if ku.required {
                key_usage_required.insert(ku.usage);
            } else {
                key_usage_optional.insert(ku.usage);
            }
        }

        let mut eku_required = Vec::new();
        let mut eku_optional = Vec::new();
        for e in &conf.extended_key_usage {
            let oid = eku_oid_by_name(&e.usage).ok_or_else(|| {
                CaError::ProfileConfig(format!("unknown extended key usage: {}", e.usage))
            })?;
            let target = if e.required {
                &mut eku_required
            } else {
                &mut eku_optional
            };
            if !target.contains(&oid) {
                target.push(oid);
            }
        }

        let mut sia_access_methods = Vec::new();
        for m in &conf.sia_access_methods {
            let oid = match m.as_str() {
                "caRepository" => access::CA_REPOSITORY,
                other => ObjectIdentifier::new(other).map_err(|_| {
                    CaError::ProfileConfig(format!("invalid SIA access method: {}", other))
                })?,
            };
            sia_access_methods.push(oid);
        }

        let mut policy_oids = Vec::new();
        let certificate_policies = if conf.certificate_policies.is_empty() {
            None
        } else {
            let mut infos = Vec::new();
            for p in &conf.certificate_policies {
                let oid = ObjectIdentifier::new(&p.oid).map_err(|_| {
                    CaError::ProfileConfig(format!("invalid policy oid: {}", p.oid))
                })?;
                policy_oids.push(oid);
                let qualifiers = match &p.cps_uri {
                    None => None,
                    Some(uri) => Some(vec![x509_cert::ext::pkix::certpolicy::PolicyQualifierInfo {
                        policy_qualifier_id: ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.2.1"),
                        qualifier: Some(Any::new(Tag::Ia5String, uri.as_bytes().to_vec())?),
                    }]),
                };
                infos.push(PolicyInformation {
                    policy_identifier: oid,
                    policy_qualifiers: qualifiers,
                });
            }
            Some(infos.to_der()?)
        };

        let name_constraints = match &conf.name_constraints {
            None => None,
            Some(nc) => {
                if nc.permitted_dns.is_empty() && nc.excluded_dns.is_empty() {
                    return Err(CaError::ProfileConfig(
                        "empty nameConstraints configured".to_string(),
                    ));
                }
                let subtrees = |names: &[String]| -> Result<Option<Vec<GeneralSubtree>>> {
                    if names.is_empty() {
                        return Ok(None);
                    }
                    let mut out = Vec::new();
                    for n in names {
                        out.push(GeneralSubtree {
                            base: asn1::dns_general_name(n)?,
                        });
                    }
                    Ok(Some(out))
                };
                let value = NameConstraintsValue {
                    permitted_subtrees: subtrees(&nc.permitted_dns)?,
                    excluded_subtrees: subtrees(&nc.excluded_dns)?,
                };
                Some(value.to_der()?)
            }
        };

        let qc_statements = if conf.qc_statements.is_empty() {
            None
        } else {
            let mut statements = Vec::new();
            for s in &conf.qc_statements {
                statements.push(QcStatement {
                    statement_id: ObjectIdentifier::new(&s.oid).map_err(|_| {
                        CaError::ProfileConfig(format!("invalid QC statement oid: {}", s.oid))
                    })?,
                });
            }
            Some(statements.to_der()?)
        };

        let admission = match &conf.admission {
            None => None,
            Some(a) => {
                let registration_number = match &a.registration_number {
                    None => None,
                    Some(rn) => Some(der::asn1::PrintableString::new(rn).map_err(|_| {
                        CaError::ProfileConfig(format!(
                            "registration number is not printable: {}",
                            rn
                        ))
                    })?),
                };
                let value = AdmissionSyntax {
                    contents_of_admissions: vec![Admissions {
                        profession_infos: vec![ProfessionInfo {
                            profession_items: a.profession_items.clone(),
                            registration_number,
                        }],
                    }],
                };
                Some(value.to_der()?)
            }
        };

        let biometric_info = if conf.biometric_info.is_empty() {
            None
        } else {
            let mut entries = Vec::new();
            for b in &conf.biometric_info {
                let hash = hex::decode(&b.hash_hex).map_err(|_| {
                    CaError::ProfileConfig("invalid biometric hash hex".to_string())
                })?;
                let source_data_uri = match &b.source_data_uri {
                    None => None,
                    Some(uri) => Some(der::asn1::Ia5String::new(uri)?),
                };
                entries.push(BiometricData {
                    type_of_biometric_data: ObjectIdentifier::new(&b.type_oid).map_err(|_| {
                        CaError::ProfileConfig(format!("invalid biometric type: {}", b.type_oid))
                    })?,
                    hash_algorithm: AlgorithmIdentifierOwned {
                        oid: biometric_hash_oid(b.hash_algo),
                        parameters: None,
                    },
                    biometric_data_hash: OctetString::new(hash)?,
                    source_data_uri,
                });
            }
            Some(entries.to_der()?)
        };

        let mut gmt0015 = Vec::new();
        if let Some(gmt) = &conf.gmt0015 {
            let entries = [
                (ext::GMT0015_IDENTITY_CODE, &gmt.identity_code),
                (ext::GMT0015_INSURANCE_NUMBER, &gmt.insurance_number),
                (
                    ext::GMT0015_IC_REGISTRATION_NUMBER,
                    &gmt.ic_registration_number,
                ),
                (ext::GMT0015_ORGANIZATION_CODE, &gmt.organization_code),
                (ext::GMT0015_TAXATION_NUMBER, &gmt.taxation_number),
            ];
            for (oid, value) in entries {
                if let Some(v) = value {
                    gmt0015.push((oid, asn1::printable_string_value(v)?));
                }
            }
        }

        let mut constants = Vec::new();
        let mut ccc_count = 0usize;
        for c in &conf.constant {
            let oid = ObjectIdentifier::new(&c.oid).map_err(|_| {
                CaError::ProfileConfig(format!("invalid constant extension oid: {}", c.oid))
            })?;
            use base64::Engine;
            let value = base64::engine::general_purpose::STANDARD
                .decode(&c.value_b64)
                .map_err(|_| {
                    CaError::ProfileConfig(format!(
                        "invalid base64 in constant extension {}",
                        c.oid
                    ))
                })?;
            if ext::is_ccc(&oid) {
                ccc_count += 1;
                if !c.critical {
                    return Err(CaError::ProfileConfig(
                        "CCC extension must be critical".to_string(),
                    ));
                }
            }
            constants.push((oid, c.critical, value));
        }
        if ccc_count > 1 {
            return Err(CaError::ProfileConfig(
                "at most one CCC extension is permitted".to_string(),
            ));
        }

        Ok(Self {
            controls,
            path_len: conf.basic_constraints_path_len,
            aki_include_issuer_serial: conf.aki_include_issuer_serial,
            key_usage_required,
            key_usage_optional,
            eku_required,
            eku_optional,
            aia_protocols: conf.aia_protocols.clone(),
            crldp_protocols: conf.crldp_protocols.clone(),
            sia_access_methods,
            policy_oids,
            certificate_policies,
            name_constraints,
            qc_statements,
            admission,
            biometric_info,
            gmt0015,
            constants,
        })
    }

    /// Control of an extension type, if configured
    pub fn control(&self, oid: &ObjectIdentifier) -> Option<&ExtensionControl> {
        self.controls.get(oid)
    }

    fn criticality(&self, oid: &ObjectIdentifier, default: bool) -> bool {
        self.controls.get(oid).map(|c| c.critical).unwrap_or(default)
    }
}

fn biometric_hash_oid(algo: HashAlgo) -> ObjectIdentifier {
    match algo {
        HashAlgo::Sha1 => ObjectIdentifier::new_unwrap("1.3.14.3.2.26"),
        HashAlgo::Sha256 => ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1"),
        HashAlgo::Sha384 => ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.2"),
        HashAlgo::Sha512 => ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.3"),
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// State of the issuing CA the extension engine consumes
#[derive(Debug, Clone)]
pub struct IssuerContext<'a> {
    /// CA subject
    pub subject: &'a Name,
    /// CA subject key identifier
    pub ski: &'a [u8],
    /// CA certificate serial
    pub serial: &'a Serial,
    /// Raw value of the CA certificate's subjectAltName, if any
    pub subject_alt_name_value: Option<&'a [u8]>,
    /// OCSP responder URIs of the CA
    pub ocsp_uris: &'a [String],
    /// CA-certificate download URIs
    pub ca_issuer_uris: &'a [String],
    /// CRL distribution URIs
    pub crl_uris: &'a [String],
    /// Delta-CRL distribution URIs
    pub delta_crl_uris: &'a [String],
    /// Path-length constraint of the CA certificate (None = unlimited)
    pub path_len: Option<u8>,
}

/// A requested extension: criticality and raw DER value
#[derive(Debug, Clone)]
pub struct RequestedExtension {
    /// Requested criticality
    pub critical: bool,
    /// Raw DER value (the extnValue content)
    pub value: Vec<u8>,
}

/// Requested extensions by type
pub type RequestedExtensions = HashMap<ObjectIdentifier, RequestedExtension>;

/// The computed, ordered extension set
#[derive(Debug, Clone, Default)]
pub struct ExtensionValues {
    /// Extensions in composition order
    pub extensions: Vec<Extension>,
}

impl ExtensionValues {
    /// Extension of a type, if present
    pub fn get(&self, oid: &ObjectIdentifier) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.extn_id == *oid)
    }

    fn push(&mut self, ext: Extension) {
        self.extensions.push(ext);
    }
}

fn uri_scheme(uri: &str) -> &str {
    uri.split("://").next().unwrap_or("")
}

fn filter_uris<'a>(uris: &'a [String], protocols: &[String]) -> Vec<&'a String> {
    uris.iter()
        .filter(|u| {
            protocols
                .iter()
                .any(|p| p.eq_ignore_ascii_case(uri_scheme(u)))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Compute the extension set for a to-be-signed certificate
pub fn build_extensions(
    profile: &CertProfile,
    issuer: &IssuerContext<'_>,
    granted_subject: &Name,
    requested: &RequestedExtensions,
    granted_spki: &SubjectPublicKeyInfoOwned,
) -> Result<ExtensionValues> {
    let policy = &profile.extension_policy;
    let mut out = ExtensionValues::default();

    // 1. SubjectKeyIdentifier
    if let Some(ctl) = policy.control(&ext::SUBJECT_KEY_IDENTIFIER) {
        let ki = match requested.get(&ext::SUBJECT_KEY_IDENTIFIER) {
            Some(req) if ctl.permitted_in_request => {
                let os = OctetString::from_der(&req.value).map_err(|e| {
                    CaError::BadCertTemplate(format!("malformed requested SKI: {}", e))
                })?;
                os.as_bytes().to_vec()
            }
            _ => asn1::key_identifier(granted_spki),
        };
        let value = OctetString::new(ki)?;
        out.push(asn1::extension(ext::SUBJECT_KEY_IDENTIFIER, ctl.critical, &value)?);
    }

    // 2. AuthorityKeyIdentifier: always the CA's SKI, optionally with the
    // CA issuer and serial
    if let Some(ctl) = policy.control(&ext::AUTHORITY_KEY_IDENTIFIER) {
        let (cert_issuer, cert_serial) = if policy.aki_include_issuer_serial {
            let names: GeneralNames = vec![GeneralName::DirectoryName(issuer.subject.clone())];
            (Some(names), Some(asn1::serial_to_x509(issuer.serial)?))
        } else {
            (None, None)
        };
        let value = AuthorityKeyIdentifier {
            key_identifier: Some(OctetString::new(issuer.ski)?),
            authority_cert_issuer: cert_issuer,
            authority_cert_serial_number: cert_serial,
        };
        out.push(asn1::extension(ext::AUTHORITY_KEY_IDENTIFIER, ctl.critical, &value)?);
    }

    // 3. IssuerAltName from the CA certificate's subjectAltName
    if let Some(ctl) = policy.control(&ext::ISSUER_ALT_NAME) {
        if let Some(san) = issuer.subject_alt_name_value {
            out.push(asn1::raw_extension(
                ext::ISSUER_ALT_NAME,
                ctl.critical,
                san.to_vec(),
            )?);
        }
    }

    // 4. AuthorityInfoAccess; empty access list omits the extension
    if let Some(ctl) = policy.control(&ext::AUTHORITY_INFO_ACCESS) {
        let mut descriptions: Vec<AccessDescription> = Vec::new();
        for uri in filter_uris(issuer.ca_issuer_uris, &policy.aia_protocols) {
            descriptions.push(AccessDescription {
                access_method: access::CA_ISSUERS,
                access_location: asn1::uri_general_name(uri)?,
            });
        }
        for uri in filter_uris(issuer.ocsp_uris, &policy.aia_protocols) {
            descriptions.push(AccessDescription {
                access_method: access::OCSP,
                access_location: asn1::uri_general_name(uri)?,
            });
        }
        if !descriptions.is_empty() {
            out.push(asn1::raw_extension(
                ext::AUTHORITY_INFO_ACCESS,
                ctl.critical,
                descriptions.to_der()?,
            )?);
        }
    }

    // 5. CRLDistributionPoints / FreshestCRL
    for (oid, uris) in [
        (ext::CRL_DISTRIBUTION_POINTS, issuer.crl_uris),
        (ext::FRESHEST_CRL, issuer.delta_crl_uris),
    ] {
        if let Some(ctl) = policy.control(&oid) {
            let permitted = filter_uris(uris, &policy.crldp_protocols);
            if !permitted.is_empty() {
                let mut names: GeneralNames = Vec::new();
                for uri in permitted {
                    names.push(asn1::uri_general_name(uri)?);
                }
                let dp = DistributionPoint {
                    distribution_point: Some(DistributionPointName::FullName(names)),
                    reasons: None,
                    crl_issuer: None,
                };
                out.push(asn1::raw_extension(oid, ctl.critical, vec![dp].to_der()?)?);
            }
        }
    }

    // 6. BasicConstraints
    let requested_bc = match requested.get(&ext::BASIC_CONSTRAINTS) {
        None => None,
        Some(req) => Some(BasicConstraints::from_der(&req.value).map_err(|e| {
            CaError::BadCertTemplate(format!("malformed requested BasicConstraints: {}", e))
        })?),
    };
    if profile.cert_level == CertLevel::EndEntity {
        if requested_bc.as_ref().map(|bc| bc.ca).unwrap_or(false) {
            return Err(CaError::BadCertTemplate(
                "request asks for a CA certificate but the profile issues end entities"
                    .to_string(),
            ));
        }
        if let Some(ctl) = policy.control(&ext::BASIC_CONSTRAINTS) {
            let value = BasicConstraints {
                ca: false,
                path_len_constraint: None,
            };
            out.push(asn1::extension(ext::BASIC_CONSTRAINTS, ctl.critical, &value)?);
        }
    } else {
        let ctl = policy.control(&ext::BASIC_CONSTRAINTS).ok_or_else(|| {
            CaError::ProfileConfig("CA profile without basicConstraints control".to_string())
        })?;
        let mut path_len = policy.path_len;
        if let Some(req_len) = requested_bc.as_ref().and_then(|bc| bc.path_len_constraint) {
            path_len = Some(path_len.map_or(req_len, |p| p.min(req_len)));
        }
        if let Some(parent) = issuer.path_len {
            let inherited = parent.saturating_sub(1);
            path_len = Some(path_len.map_or(inherited, |p| p.min(inherited)));
        }
        let value = BasicConstraints {
            ca: true,
            path_len_constraint: path_len,
        };
        out.push(asn1::extension(ext::BASIC_CONSTRAINTS, ctl.critical, &value)?);
    }

    // 7. KeyUsage: profile-required plus permitted requested bits
    if let Some(ctl) = policy.control(&ext::KEY_USAGE) {
        let mut bits = policy.key_usage_required.clone();
        if let Some(req) = requested.get(&ext::KEY_USAGE) {
            if ctl.permitted_in_request {
                for bit in decode_key_usage(&req.value)? {
                    if policy.key_usage_required.contains(&bit)
                        || policy.key_usage_optional.contains(&bit)
                    {
                        bits.insert(bit);
                    } else {
                        return Err(CaError::BadCertTemplate(format!(
                            "requested key usage {:?} not permitted by the profile",
                            bit
                        )));
                    }
                }
            }
        }
        if !bits.is_empty() {
            out.push(asn1::raw_extension(
                ext::KEY_USAGE,
                ctl.critical,
                encode_key_usage(&bits)?,
            )?);
        }
    }

    // 8. ExtendedKeyUsage: same union rule; anyExtendedKeyUsage forces
    // non-critical, timeStamping forces critical
    if let Some(ctl) = policy.control(&ext::EXTENDED_KEY_USAGE) {
        let mut purposes = policy.eku_required.clone();
        if let Some(req) = requested.get(&ext::EXTENDED_KEY_USAGE) {
            if ctl.permitted_in_request {
                let requested_purposes: Vec<ObjectIdentifier> =
                    Vec::<ObjectIdentifier>::from_der(&req.value).map_err(|e| {
                        CaError::BadCertTemplate(format!("malformed requested EKU: {}", e))
                    })?;
                for oid in requested_purposes {
                    if policy.eku_required.contains(&oid) || policy.eku_optional.contains(&oid) {
                        if !purposes.contains(&oid) {
                            purposes.push(oid);
                        }
                    } else {
                        return Err(CaError::BadCertTemplate(format!(
                            "requested extended key usage {} not permitted by the profile",
                            oid
                        )));
                    }
                }
            }
        }
        if !purposes.is_empty() {
            let critical = if purposes.contains(&eku::ANY) {
                false
            } else if purposes.contains(&eku::TIME_STAMPING) {
                true
            } else {
                ctl.critical
            };
            out.push(asn1::raw_extension(
                ext::EXTENDED_KEY_USAGE,
                critical,
                purposes.to_der()?,
            )?);
        }
    }

    // 9. OCSP-nocheck, only when requested (or forced by the profile)
    if let Some(ctl) = policy.control(&ext::OCSP_NOCHECK) {
        let requested_nocheck =
            requested.contains_key(&ext::OCSP_NOCHECK) && ctl.permitted_in_request;
        if requested_nocheck || ctl.required {
            out.push(asn1::raw_extension(
                ext::OCSP_NOCHECK,
                ctl.critical,
                vec![0x05, 0x00],
            )?);
        }
    }

    // 10. SubjectAltName from the request
    let mut granted_san: Option<GeneralNames> = None;
    if let Some(ctl) = policy.control(&ext::SUBJECT_ALT_NAME) {
        if let Some(req) = requested.get(&ext::SUBJECT_ALT_NAME) {
            if ctl.permitted_in_request {
                let names: GeneralNames =
                    Vec::<GeneralName>::from_der(&req.value).map_err(|e| {
                        CaError::BadCertTemplate(format!("malformed requested SAN: {}", e))
                    })?;
                if names.is_empty() {
                    return Err(CaError::BadCertTemplate(
                        "requested SubjectAltName is empty".to_string(),
                    ));
                }
                if profile.is_cabforum_end_entity() {
                    cabforum::check_san_names(&names)?;
                }
                out.push(asn1::raw_extension(
                    ext::SUBJECT_ALT_NAME,
                    ctl.critical,
                    names.to_der()?,
                )?);
                granted_san = Some(names);
            }
        }
    }

    // 11. SubjectInfoAccess from the request, filtered by allowed access
    // methods
    if let Some(ctl) = policy.control(&ext::SUBJECT_INFO_ACCESS) {
        if let Some(req) = requested.get(&ext::SUBJECT_INFO_ACCESS) {
            if ctl.permitted_in_request {
                let descriptions: Vec<AccessDescription> =
                    Vec::<AccessDescription>::from_der(&req.value).map_err(|e| {
                        CaError::BadCertTemplate(format!("malformed requested SIA: {}", e))
                    })?;
                let permitted: Vec<AccessDescription> = descriptions
                    .into_iter()
                    .filter(|d| policy.sia_access_methods.contains(&d.access_method))
                    .collect();
                if !permitted.is_empty() {
                    out.push(asn1::raw_extension(
                        ext::SUBJECT_INFO_ACCESS,
                        ctl.critical,
                        permitted.to_der()?,
                    )?);
                }
            }
        }
    }

    // 12. CertificatePolicies from the profile
    if let Some(value) = &policy.certificate_policies {
        out.push(asn1::raw_extension(
            ext::CERTIFICATE_POLICIES,
            policy.criticality(&ext::CERTIFICATE_POLICIES, false),
            value.clone(),
        )?);
    }

    // 13. NameConstraints from the profile
    if let Some(value) = &policy.name_constraints {
        out.push(asn1::raw_extension(
            ext::NAME_CONSTRAINTS,
            policy.criticality(&ext::NAME_CONSTRAINTS, true),
            value.clone(),
        )?);
    }

    // 14. Profile-provided extras
    if let Some(value) = &policy.qc_statements {
        out.push(asn1::raw_extension(
            ext::QC_STATEMENTS,
            policy.criticality(&ext::QC_STATEMENTS, false),
            value.clone(),
        )?);
    }
    if let Some(value) = &policy.admission {
        out.push(asn1::raw_extension(
            ext::ADMISSION,
            policy.criticality(&ext::ADMISSION, false),
            value.clone(),
        )?);
    }
    if let Some(value) = &policy.biometric_info {
        out.push(asn1::raw_extension(
            ext::BIOMETRIC_INFO,
            policy.criticality(&ext::BIOMETRIC_INFO, false),
            value.clone(),
        )?);
    }
    for (oid, value) in &policy.gmt0015 {
        out.push(asn1::raw_extension(
            *oid,
            policy.criticality(oid, false),
            value.clone(),
        )?);
    }
    for (oid, critical, value) in &policy.constants {
        out.push(asn1::raw_extension(*oid, *critical, value.clone())?);
    }

    // CA/Browser-Forum end-entity rules apply after composition.
    if profile.is_cabforum_end_entity() {
        cabforum::check_end_entity(granted_subject, granted_san.as_deref(), &policy.policy_oids)?;
    }

    // Every required extension must have been produced.
    let missing: Vec<String> = policy
        .controls
        .iter()
        .filter(|(oid, ctl)| ctl.required && out.get(oid).is_none())
        .map(|(oid, _)| oid.to_string())
        .collect();
    if !missing.is_empty() {
        let mut sorted = missing;
        sorted.sort();
        return Err(CaError::ProfileConfig(format!(
            "could not add required extensions {}",
            sorted.join(", ")
        )));
    }

    Ok(out)
}
