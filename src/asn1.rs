// Copyright (c) 2025 - Cowboy AI, LLC.

//! Thin strongly-typed ASN.1/PKIX layer
//!
//! Encodes and decodes only the subset of X.509 the CA and OCSP paths
//! need, on top of the RustCrypto `der`/`x509-cert` stack. DER is
//! canonical, so every value produced here is byte-reproducible.

use chrono::{DateTime, Datelike, Utc};
use der::asn1::{Ia5String, ObjectIdentifier, OctetString};
use der::{Any, AnyRef, Encode, Tag, Tagged};
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::Extension;
use x509_cert::name::RelativeDistinguishedName;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::Time;

use crate::types::{EcCurve, HashAlgo, Serial, SignatureAlgo};
use crate::{CaError, Result};

// ---------------------------------------------------------------------------
// Object identifiers
// ---------------------------------------------------------------------------

/// Distinguished-name attribute types
pub mod dn {
    use der::asn1::ObjectIdentifier;

    pub const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
    pub const SURNAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.4");
    pub const SERIAL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.5");
    pub const COUNTRY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
    pub const LOCALITY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
    pub const STATE_OR_PROVINCE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.8");
    pub const STREET_ADDRESS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.9");
    pub const ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
    pub const ORGANIZATIONAL_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");
    pub const BUSINESS_CATEGORY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.15");
    pub const POSTAL_CODE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.17");
    pub const GIVEN_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.42");
    pub const ORGANIZATION_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.97");
    pub const DOMAIN_COMPONENT: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("0.9.2342.19200300.100.1.25");
    pub const EMAIL_ADDRESS: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.1");
    pub const COUNTRY_OF_CITIZENSHIP: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.9.4");
    pub const COUNTRY_OF_RESIDENCE: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.9.5");
    pub const JURISDICTION_LOCALITY: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.60.2.1.1");
    pub const JURISDICTION_STATE: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.60.2.1.2");
    pub const JURISDICTION_COUNTRY: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.60.2.1.3");
}

/// Certificate and CRL extensions
pub mod ext {
    use der::asn1::ObjectIdentifier;

    pub const SUBJECT_KEY_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.14");
    pub const KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");
    pub const SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
    pub const ISSUER_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.18");
    pub const BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");
    pub const CRL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.20");
    pub const REASON_CODE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.21");
    pub const INVALIDITY_DATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.24");
    pub const NAME_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.30");
    pub const CRL_DISTRIBUTION_POINTS: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("2.5.29.31");
    pub const CERTIFICATE_POLICIES: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.32");
    pub const AUTHORITY_KEY_IDENTIFIER: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("2.5.29.35");
    pub const EXTENDED_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37");
    pub const FRESHEST_CRL: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.46");
    pub const EXPIRED_CERTS_ON_CRL: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.60");
    pub const AUTHORITY_INFO_ACCESS: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.1");
    pub const BIOMETRIC_INFO: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.2");
    pub const QC_STATEMENTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.3");
    pub const SUBJECT_INFO_ACCESS: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.11");
    pub const ADMISSION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.36.8.3.3");
    pub const OCSP_NOCHECK: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1.5");

    /// GM/T 0015 identity extensions
    pub const GMT0015_IDENTITY_CODE: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.156.10260.4.1.1");
    pub const GMT0015_INSURANCE_NUMBER: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.156.10260.4.1.2");
    pub const GMT0015_IC_REGISTRATION_NUMBER: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.156.10260.4.1.3");
    pub const GMT0015_ORGANIZATION_CODE: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.156.10260.4.1.4");
    pub const GMT0015_TAXATION_NUMBER: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.156.10260.4.1.5");

    /// Car Connectivity Consortium private enterprise arc
    pub const CCC_ARC: &str = "1.3.6.1.4.1.41577";

    /// True when `oid` sits below the CCC enterprise arc
    pub fn is_ccc(oid: &ObjectIdentifier) -> bool {
        let s = oid.to_string();
        s == CCC_ARC || s.starts_with("1.3.6.1.4.1.41577.")
    }
}

/// Extended-key-usage purposes
pub mod eku {
    use der::asn1::ObjectIdentifier;

    pub const ANY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37.0");
    pub const SERVER_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1");
    pub const CLIENT_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.2");
    pub const CODE_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.3");
    pub const EMAIL_PROTECTION: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.4");
    pub const TIME_STAMPING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.8");
    pub const OCSP_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.9");
}

/// Access methods for AIA / SIA
pub mod access {
    use der::asn1::ObjectIdentifier;

    pub const OCSP: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1");
    pub const CA_ISSUERS: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.2");
    pub const CA_REPOSITORY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.5");
}

/// CA/Browser-Forum certificate policy identifiers
pub mod cabf {
    use der::asn1::ObjectIdentifier;

    pub const DOMAIN_VALIDATED: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.23.140.1.2.1");
    pub const ORGANIZATION_VALIDATED: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("2.23.140.1.2.2");
    pub const INDIVIDUAL_VALIDATED: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("2.23.140.1.2.3");
}

/// Public-key and signature algorithm identifiers
pub mod alg {
    use der::asn1::ObjectIdentifier;

    pub const RSA_ENCRYPTION: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
    pub const SHA256_WITH_RSA: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
    pub const SHA384_WITH_RSA: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
    pub const SHA512_WITH_RSA: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");
    pub const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
    pub const ECDSA_WITH_SHA256: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
    pub const ECDSA_WITH_SHA384: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
    pub const ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");
    pub const ED448: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.113");
    pub const X25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.110");
    pub const X448: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.111");
    pub const SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
    pub const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");
    pub const SECP521R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.35");
}

/// OID of the named curve
pub fn curve_oid(curve: EcCurve) -> ObjectIdentifier {
    match curve {
        EcCurve::P256 => alg::SECP256R1,
        EcCurve::P384 => alg::SECP384R1,
        EcCurve::P521 => alg::SECP521R1,
    }
}

/// Reverse of [`curve_oid`]
pub fn curve_from_oid(oid: &ObjectIdentifier) -> Option<EcCurve> {
    if *oid == alg::SECP256R1 {
        Some(EcCurve::P256)
    } else if *oid == alg::SECP384R1 {
        Some(EcCurve::P384)
    } else if *oid == alg::SECP521R1 {
        Some(EcCurve::P521)
    } else {
        None
    }
}

/// AlgorithmIdentifier for a signature algorithm, with the parameter
/// conventions of RFC 5754 / RFC 8410 (NULL for RSA, absent for ECDSA
/// and EdDSA)
pub fn signature_algorithm_identifier(algo: SignatureAlgo) -> AlgorithmIdentifierOwned {
    let (oid, null_params) = match algo {
        SignatureAlgo::RsaSha256 => (alg::SHA256_WITH_RSA, true),
        SignatureAlgo::RsaSha384 => (alg::SHA384_WITH_RSA, true),
        SignatureAlgo::RsaSha512 => (alg::SHA512_WITH_RSA, true),
        SignatureAlgo::EcdsaSha256 => (alg::ECDSA_WITH_SHA256, false),
        SignatureAlgo::EcdsaSha384 => (alg::ECDSA_WITH_SHA384, false),
        SignatureAlgo::Ed25519 => (alg::ED25519, false),
    };
    AlgorithmIdentifierOwned {
        oid,
        parameters: null_params.then(|| Any::from(AnyRef::NULL)),
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Convert a UTC timestamp into an X.509 `Time`, using UTCTime up to 2049
/// and GeneralizedTime from 2050 on (RFC 5280 section 4.1.2.5)
pub fn to_asn1_time(t: DateTime<Utc>) -> Result<Time> {
    let secs = u64::try_from(t.timestamp())
        .map_err(|_| CaError::BadRequest(format!("pre-epoch timestamp: {}", t)))?;
    let dt = der::DateTime::from_unix_duration(std::time::Duration::from_secs(secs))?;
    if t.year() >= 2050 {
        Ok(Time::GeneralTime(der::asn1::GeneralizedTime::from_date_time(dt)))
    } else {
        Ok(Time::UtcTime(der::asn1::UtcTime::from_date_time(dt)?))
    }
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// DER string tag conventionally used for a DN attribute type
fn dn_value_tag(oid: &ObjectIdentifier) -> Tag {
    if *oid == dn::COUNTRY
        || *oid == dn::SERIAL_NUMBER
        || *oid == dn::JURISDICTION_COUNTRY
        || *oid == dn::COUNTRY_OF_CITIZENSHIP
        || *oid == dn::COUNTRY_OF_RESIDENCE
    {
        Tag::PrintableString
    } else if *oid == dn::DOMAIN_COMPONENT || *oid == dn::EMAIL_ADDRESS {
        Tag::Ia5String
    } else {
        Tag::Utf8String
    }
}

/// Build an AttributeTypeAndValue with the conventional string type
pub fn dn_attribute(oid: ObjectIdentifier, value: &str) -> Result<AttributeTypeAndValue> {
    let any = Any::new(dn_value_tag(&oid), value.as_bytes().to_vec())?;
    Ok(AttributeTypeAndValue { oid, value: any })
}

/// Wrap a single attribute into a relative distinguished name
pub fn single_rdn(atv: AttributeTypeAndValue) -> Result<RelativeDistinguishedName> {
    let mut set = der::asn1::SetOfVec::new();
    set.insert(atv)?;
    Ok(RelativeDistinguishedName(set))
}

/// Short names accepted in subject templates, mapped to attribute OIDs
pub fn dn_oid_by_short_name(name: &str) -> Option<ObjectIdentifier> {
    match name.to_ascii_lowercase().as_str() {
        "cn" | "commonname" => Some(dn::COMMON_NAME),
        "c" | "country" => Some(dn::COUNTRY),
        "o" | "organization" => Some(dn::ORGANIZATION),
        "ou" | "organizationalunit" => Some(dn::ORGANIZATIONAL_UNIT),
        "l" | "locality" => Some(dn::LOCALITY),
        "st" | "stateorprovince" => Some(dn::STATE_OR_PROVINCE),
        "street" => Some(dn::STREET_ADDRESS),
        "postalcode" => Some(dn::POSTAL_CODE),
        "serialnumber" => Some(dn::SERIAL_NUMBER),
        "givenname" => Some(dn::GIVEN_NAME),
        "surname" => Some(dn::SURNAME),
        "dc" | "domaincomponent" => Some(dn::DOMAIN_COMPONENT),
        "emailaddress" | "e" => Some(dn::EMAIL_ADDRESS),
        "businesscategory" => Some(dn::BUSINESS_CATEGORY),
        "organizationidentifier" => Some(dn::ORGANIZATION_IDENTIFIER),
        "jurisdictionc" | "jurisdictioncountry" => Some(dn::JURISDICTION_COUNTRY),
        "jurisdictionst" => Some(dn::JURISDICTION_STATE),
        "jurisdictionl" => Some(dn::JURISDICTION_LOCALITY),
        "countryofcitizenship" => Some(dn::COUNTRY_OF_CITIZENSHIP),
        "countryofresidence" => Some(dn::COUNTRY_OF_RESIDENCE),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// General names
// ---------------------------------------------------------------------------

/// dNSName general name
pub fn dns_general_name(name: &str) -> Result<GeneralName> {
    Ok(GeneralName::DnsName(Ia5String::new(name)?))
}

/// uniformResourceIdentifier general name
pub fn uri_general_name(uri: &str) -> Result<GeneralName> {
    Ok(GeneralName::UniformResourceIdentifier(Ia5String::new(uri)?))
}

/// rfc822Name general name
pub fn email_general_name(addr: &str) -> Result<GeneralName> {
    Ok(GeneralName::Rfc822Name(Ia5String::new(addr)?))
}

/// iPAddress general name from the raw address octets (4 or 16)
pub fn ip_general_name(octets: &[u8]) -> Result<GeneralName> {
    Ok(GeneralName::IpAddress(OctetString::new(octets)?))
}

// ---------------------------------------------------------------------------
// Extensions
// ---------------------------------------------------------------------------

/// Build an extension from an encodable PKIX value
pub fn extension<T: Encode>(oid: ObjectIdentifier, critical: bool, value: &T) -> Result<Extension> {
    raw_extension(oid, critical, value.to_der()?)
}

/// Build an extension from pre-encoded DER value bytes
pub fn raw_extension(oid: ObjectIdentifier, critical: bool, value: Vec<u8>) -> Result<Extension> {
    Ok(Extension {
        extn_id: oid,
        critical,
        extn_value: OctetString::new(value)?,
    })
}

/// DER value of a CRL-entry reasonCode (ENUMERATED)
pub fn crl_reason_value(code: u32) -> Vec<u8> {
    vec![0x0A, 0x01, code as u8]
}

/// DER value of a PrintableString (GM/T 0015 identity extensions)
pub fn printable_string_value(value: &str) -> Result<Vec<u8>> {
    Ok(Any::new(Tag::PrintableString, value.as_bytes().to_vec())?.to_der()?)
}

/// DER value of an unsigned INTEGER from a u64 (CRL numbers)
pub fn uint_value(value: u64) -> Result<Vec<u8>> {
    let be = value.to_be_bytes();
    let first = be.iter().position(|&b| b != 0).unwrap_or(7);
    Ok(der::asn1::Uint::new(&be[first..])?.to_der()?)
}

// ---------------------------------------------------------------------------
// Keys and serials
// ---------------------------------------------------------------------------

/// RFC 5280 key identifier: SHA-1 over the subjectPublicKey BIT STRING
/// contents
pub fn key_identifier(spki: &SubjectPublicKeyInfoOwned) -> Vec<u8> {
    HashAlgo::Sha1.digest(spki.subject_public_key.raw_bytes())
}

/// Convert a domain serial into the x509-cert representation
pub fn serial_to_x509(serial: &Serial) -> Result<SerialNumber> {
    let bytes = if serial.as_bytes().is_empty() {
        vec![0]
    } else {
        serial.as_bytes().to_vec()
    };
    Ok(SerialNumber::new(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use der::Decode;

    #[test]
    fn utc_time_before_2050_generalized_after() {
        let t1 = Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap();
        assert!(matches!(to_asn1_time(t1).unwrap(), Time::UtcTime(_)));
        let t2 = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        assert!(matches!(to_asn1_time(t2).unwrap(), Time::GeneralTime(_)));
    }

    #[test]
    fn country_attribute_is_printable_string() {
        let atv = dn_attribute(dn::COUNTRY, "DE").unwrap();
        assert_eq!(atv.value.tag(), Tag::PrintableString);
        let atv = dn_attribute(dn::COMMON_NAME, "Example").unwrap();
        assert_eq!(atv.value.tag(), Tag::Utf8String);
    }

    #[test]
    fn crl_reason_value_is_enumerated() {
        assert_eq!(crl_reason_value(6), vec![0x0A, 0x01, 0x06]);
    }

    #[test]
    fn uint_value_round_trips() {
        let der_bytes = uint_value(0x01_00).unwrap();
        let decoded = der::asn1::Uint::from_der(&der_bytes).unwrap();
        assert_eq!(decoded.as_bytes(), &[0x01, 0x00]);
    }

    #[test]
    fn ccc_arc_detection() {
        let oid = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.41577.4.1.3");
        assert!(ext::is_ccc(&oid));
        assert!(!ext::is_ccc(&ext::BASIC_CONSTRAINTS));
    }
}
