//! Common types used throughout the cim-ca crate

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::cmp::Ordering;
use std::fmt;

use crate::{CaError, Result};

/// Maximum accepted length for registry names
pub const MAX_NAME_LEN: usize = 100;

/// `notAfter` used for certificates without a well-defined expiration date
/// (RFC 5280 section 4.1.2.5)
pub fn end_of_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap()
}

/// Pair of a stable numeric id and a lowercase name
///
/// Names are compared case-insensitively and stored normalised to
/// lowercase. Validation: non-blank, `[a-z0-9._:/-]`, length-bounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameId {
    /// Stable numeric id
    pub id: u32,
    /// Normalised (lowercase) name
    pub name: String,
}

impl NameId {
    /// Create a validated, normalised name/id pair
    pub fn new(id: u32, name: &str) -> Result<Self> {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return Err(CaError::BadRequest("name must not be blank".to_string()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(CaError::BadRequest(format!(
                "name exceeds {} characters: {}",
                MAX_NAME_LEN, name
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._:/-".contains(c))
        {
            return Err(CaError::BadRequest(format!(
                "name contains invalid characters: {}",
                name
            )));
        }
        Ok(Self { id, name })
    }
}

impl fmt::Display for NameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id={})", self.name, self.id)
    }
}

/// Level of the certificate a profile issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertLevel {
    /// Self-signed root CA
    RootCa,
    /// Subordinate CA
    SubCa,
    /// Cross certificate for an external CA
    Cross,
    /// End-entity certificate
    EndEntity,
}

impl CertLevel {
    /// True for every level that carries `CA=true` basic constraints
    pub fn is_ca(&self) -> bool {
        !matches!(self, CertLevel::EndEntity)
    }
}

/// Policy domain the profile is validated against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CertDomain {
    /// No domain-specific rules beyond RFC 5280
    #[default]
    Generic,
    /// CA/Browser-Forum baseline requirements
    #[serde(rename = "cabforumbr")]
    CabForumBr,
}

/// CA-side handling of a granted `notAfter` beyond the CA's own `notAfter`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidityMode {
    /// Reject any certificate outliving the CA
    #[default]
    Strict,
    /// Clamp to the CA's `notAfter`
    Cutoff,
    /// Allow certificates to outlive the CA
    Lax,
}

/// Profile-side `notAfter` mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotAfterMode {
    /// Defer to the CA's validity mode
    #[default]
    ByCa,
    /// Reject when the CA's `notAfter` would be exceeded
    Strict,
    /// Clamp to the CA's `notAfter`
    Cutoff,
}

/// Profile-side `notBefore` policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum NotBeforeOption {
    /// Use the requested `notBefore`, clamped into the permitted window
    #[default]
    Current,
    /// Truncate to UTC midnight of the granted day
    Midnight,
    /// Fixed offset in seconds from the time of issuance
    Offset {
        /// Offset from now, in seconds (may be negative)
        seconds: i64,
    },
}

/// Operational status of a CA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaStatus {
    /// Accepting requests
    #[default]
    Active,
    /// Registered but not serving
    Inactive,
}

/// CRL revocation reasons (RFC 5280 section 5.3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CrlReason {
    /// Reason not specified
    Unspecified,
    /// Subject key compromised
    KeyCompromise,
    /// Issuing CA key compromised
    CaCompromise,
    /// Subject affiliation changed
    AffiliationChanged,
    /// Certificate superseded
    Superseded,
    /// Operation ceased
    CessationOfOperation,
    /// Certificate placed on hold
    CertificateHold,
    /// Release from hold (only valid in revocation requests)
    RemoveFromCrl,
    /// Privileges withdrawn
    PrivilegeWithdrawn,
    /// Attribute authority compromised
    AaCompromise,
}

impl CrlReason {
    /// Numeric reason code as encoded in CRL entries
    pub fn code(&self) -> u32 {
        match self {
            CrlReason::Unspecified => 0,
            CrlReason::KeyCompromise => 1,
            CrlReason::CaCompromise => 2,
            CrlReason::AffiliationChanged => 3,
            CrlReason::Superseded => 4,
            CrlReason::CessationOfOperation => 5,
            CrlReason::CertificateHold => 6,
            CrlReason::RemoveFromCrl => 8,
            CrlReason::PrivilegeWithdrawn => 9,
            CrlReason::AaCompromise => 10,
        }
    }

    /// Reverse of [`CrlReason::code`]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(CrlReason::Unspecified),
            1 => Some(CrlReason::KeyCompromise),
            2 => Some(CrlReason::CaCompromise),
            3 => Some(CrlReason::AffiliationChanged),
            4 => Some(CrlReason::Superseded),
            5 => Some(CrlReason::CessationOfOperation),
            6 => Some(CrlReason::CertificateHold),
            8 => Some(CrlReason::RemoveFromCrl),
            9 => Some(CrlReason::PrivilegeWithdrawn),
            10 => Some(CrlReason::AaCompromise),
            _ => None,
        }
    }
}

/// Revocation details of a certificate or CA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationInfo {
    /// Revocation reason
    pub reason: CrlReason,
    /// When the revocation became effective
    pub revocation_time: DateTime<Utc>,
    /// When the key is suspected to have become invalid
    pub invalidity_time: Option<DateTime<Utc>>,
}

impl RevocationInfo {
    /// Revocation without an invalidity date
    pub fn new(reason: CrlReason, revocation_time: DateTime<Utc>) -> Self {
        Self {
            reason,
            revocation_time,
            invalidity_time: None,
        }
    }
}

/// Hash algorithms used for issuer hashes, key identifiers and cert hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HashAlgo {
    /// SHA-1 (issuer hashes and legacy key identifiers only)
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgo {
    /// Digest `data` with this algorithm
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgo::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgo::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgo::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgo::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Digest length in octets
    pub fn len(&self) -> usize {
        match self {
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha384 => 48,
            HashAlgo::Sha512 => 64,
        }
    }

    /// Parse the uppercase name used in the DBSCHEMA table
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "SHA1" => Some(HashAlgo::Sha1),
            "SHA256" => Some(HashAlgo::Sha256),
            "SHA384" => Some(HashAlgo::Sha384),
            "SHA512" => Some(HashAlgo::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgo::Sha1 => "SHA1",
            HashAlgo::Sha256 => "SHA256",
            HashAlgo::Sha384 => "SHA384",
            HashAlgo::Sha512 => "SHA512",
        };
        write!(f, "{}", name)
    }
}

/// Certificate serial number: unsigned, minimal big-endian, at most 20 octets
///
/// Ordering is numeric. The zero serial is representable (empty significant
/// bytes) but rejected everywhere a real serial is required.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Serial(Vec<u8>);

impl Serial {
    /// Construct from big-endian bytes, stripping leading zero octets
    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self> {
        let stripped: Vec<u8> = bytes.iter().copied().skip_while(|&b| b == 0).collect();
        if stripped.len() > 20 {
            return Err(CaError::BadRequest(format!(
                "serial number exceeds 20 octets: {} octets",
                stripped.len()
            )));
        }
        Ok(Self(stripped))
    }

    /// Construct from a non-negative integer
    pub fn from_u64(value: u64) -> Self {
        Self(
            value
                .to_be_bytes()
                .iter()
                .copied()
                .skip_while(|&b| b == 0)
                .collect(),
        )
    }

    /// Minimal big-endian magnitude (empty for zero)
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True for the (invalid) zero serial
    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    /// DER INTEGER content octets: minimal, with a leading 0x00 when the
    /// top bit would otherwise mark the value negative
    pub fn to_der_content(&self) -> Vec<u8> {
        if self.0.is_empty() {
            return vec![0];
        }
        let mut out = Vec::with_capacity(self.0.len() + 1);
        if self.0[0] & 0x80 != 0 {
            out.push(0);
        }
        out.extend_from_slice(&self.0);
        out
    }
}

impl Ord for Serial {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Serial {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "0x00")
        } else {
            write!(f, "0x{}", hex::encode(&self.0))
        }
    }
}

/// Key specification of a public or to-be-generated key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum KeySpec {
    /// RSA with modulus length in bits
    Rsa {
        /// Modulus length in bits
        bits: u32,
    },
    /// EC on a named curve
    Ec {
        /// Named curve
        curve: EcCurve,
    },
    /// Ed25519
    Ed25519,
    /// Ed448
    Ed448,
    /// X25519 (key agreement only)
    X25519,
    /// X448 (key agreement only)
    X448,
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Rsa { bits } => write!(f, "RSA/{}", bits),
            KeySpec::Ec { curve } => write!(f, "EC/{}", curve),
            KeySpec::Ed25519 => write!(f, "ED25519"),
            KeySpec::Ed448 => write!(f, "ED448"),
            KeySpec::X25519 => write!(f, "X25519"),
            KeySpec::X448 => write!(f, "X448"),
        }
    }
}

/// Named EC curves accepted by the profile engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcCurve {
    /// NIST P-256 (secp256r1)
    P256,
    /// NIST P-384 (secp384r1)
    P384,
    /// NIST P-521 (secp521r1)
    P521,
}

impl fmt::Display for EcCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EcCurve::P256 => "secp256r1",
            EcCurve::P384 => "secp384r1",
            EcCurve::P521 => "secp521r1",
        };
        write!(f, "{}", name)
    }
}

/// Signature algorithms a CA signer can offer and a profile can allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgo {
    /// RSA PKCS#1 v1.5 with SHA-256
    RsaSha256,
    /// RSA PKCS#1 v1.5 with SHA-384
    RsaSha384,
    /// RSA PKCS#1 v1.5 with SHA-512
    RsaSha512,
    /// ECDSA with SHA-256
    EcdsaSha256,
    /// ECDSA with SHA-384
    EcdsaSha384,
    /// Ed25519 (pure)
    Ed25519,
}

/// Metadata of a published CRL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrlInfo {
    /// Store row id of the CRL
    pub crl_id: i64,
    /// CRL number
    pub crl_number: u64,
    /// thisUpdate of the CRL
    pub this_update: DateTime<Utc>,
    /// nextUpdate of the CRL
    pub next_update: Option<DateTime<Utc>>,
}

/// Name of the cluster master lock system event
pub const EVENT_LOCK: &str = "LOCK";

/// Name of the CA-configuration-change system event
pub const EVENT_CA_CHANGE: &str = "CA_CHANGE";

/// A named system event row: `(name, owner, epoch seconds)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Event name, e.g. `LOCK` or `CA_CHANGE`
    pub name: String,
    /// Owning instance id
    pub owner: String,
    /// Event time as epoch seconds
    pub event_time: i64,
}

impl SystemEvent {
    /// Create an event stamped `now`
    pub fn now(name: &str, owner: &str) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            event_time: Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_id_normalises_to_lowercase() {
        let id = NameId::new(7, "My-Profile").unwrap();
        assert_eq!(id.name, "my-profile");
    }

    #[test]
    fn name_id_rejects_blank_and_invalid() {
        assert!(NameId::new(1, "  ").is_err());
        assert!(NameId::new(1, "white space").is_err());
        assert!(NameId::new(1, &"a".repeat(101)).is_err());
    }

    #[test]
    fn serial_ordering_is_numeric() {
        let small = Serial::from_u64(0xFF);
        let big = Serial::from_u64(0x100);
        assert!(small < big);
        assert!(Serial::from_u64(0).is_zero());
    }

    #[test]
    fn serial_der_content_keeps_value_positive() {
        let s = Serial::from_be_bytes(&[0x80, 0x01]).unwrap();
        assert_eq!(s.to_der_content(), vec![0x00, 0x80, 0x01]);
    }

    #[test]
    fn crl_reason_codes_round_trip() {
        for code in [0, 1, 2, 3, 4, 5, 6, 8, 9, 10] {
            assert_eq!(CrlReason::from_code(code).unwrap().code(), code);
        }
        assert!(CrlReason::from_code(7).is_none());
    }
}
