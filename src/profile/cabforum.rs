// Copyright (c) 2025 - Cowboy AI, LLC.

//! CA/Browser-Forum baseline-requirement checks for end-entity
//! certificates
//!
//! Applied after extension composition when the profile's domain is
//! `CabForumBr` and the level is `EndEntity`:
//!
//! - a commonName, when present, must appear in the subjectAltName as a
//!   dNSName, a dotted IPv4 address or an (expanded) IPv6 address
//! - dNSNames must not contain `_` and must be public domain names
//! - the subject-DN attribute set is constrained by the validation level
//!   carried in the certificate-policy identifiers

use der::asn1::ObjectIdentifier;
use std::net::IpAddr;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::name::Name;

use crate::asn1::{cabf, dn};
use crate::profile::subject::{first_attribute, has_attribute};
use crate::{CaError, Result};

/// Validation level derived from the certificate-policy identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrValidation {
    /// domain-validated (2.23.140.1.2.1)
    DomainValidated,
    /// organization-validated (2.23.140.1.2.2)
    OrganizationValidated,
    /// individual-validated (2.23.140.1.2.3)
    IndividualValidated,
}

/// Detect the validation level from the profile's policy identifiers
pub fn validation_level(policy_oids: &[ObjectIdentifier]) -> Option<BrValidation> {
    if policy_oids.contains(&cabf::DOMAIN_VALIDATED) {
        Some(BrValidation::DomainValidated)
    } else if policy_oids.contains(&cabf::ORGANIZATION_VALIDATED) {
        Some(BrValidation::OrganizationValidated)
    } else if policy_oids.contains(&cabf::INDIVIDUAL_VALIDATED) {
        Some(BrValidation::IndividualValidated)
    } else {
        None
    }
}

/// Top-level labels never delegated publicly
const RESERVED_TLDS: &[&str] = &[
    "local",
    "localhost",
    "localdomain",
    "internal",
    "intranet",
    "corp",
    "home",
    "lan",
    "test",
    "example",
    "invalid",
];

/// Validate one dNSName against the baseline requirements
pub fn check_dns_name(name: &str) -> Result<()> {
    if name.contains('_') {
        return Err(CaError::BadCertTemplate(format!(
            "dNSName {} contains an underscore",
            name
        )));
    }
    let effective = name.strip_prefix("*.").unwrap_or(name);
    if effective.is_empty() || effective.parse::<IpAddr>().is_ok() {
        return Err(CaError::BadCertTemplate(format!(
            "dNSName {} is not a domain name",
            name
        )));
    }
    let labels: Vec<&str> = effective.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(CaError::BadCertTemplate(format!(
            "dNSName {} is not a public domain name",
            name
        )));
    }
    let tld = labels.last().unwrap().to_ascii_lowercase();
    if RESERVED_TLDS.contains(&tld.as_str()) {
        return Err(CaError::BadCertTemplate(format!(
            "dNSName {} is not publicly resolvable",
            name
        )));
    }
    Ok(())
}

/// Validate every SAN entry type the baseline requirements constrain
pub fn check_san_names(names: &[GeneralName]) -> Result<()> {
    for name in names {
        match name {
            GeneralName::DnsName(dns) => check_dns_name(dns.as_str())?,
            GeneralName::IpAddress(octets) => {
                let len = octets.as_bytes().len();
                if len != 4 && len != 16 {
                    return Err(CaError::BadCertTemplate(
                        "iPAddress in SAN must be 4 or 16 octets".to_string(),
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// True when the commonName matches one of the SAN entries, either as a
/// dNSName or as a literal IP address
fn cn_in_san(cn: &str, san: &[GeneralName]) -> bool {
    let cn_ip: Option<IpAddr> = cn.parse().ok();
    for name in san {
        match name {
            GeneralName::DnsName(dns) => {
                if dns.as_str().eq_ignore_ascii_case(cn) {
                    return true;
                }
            }
            GeneralName::IpAddress(octets) => {
                if let Some(ip) = cn_ip {
                    let bytes = octets.as_bytes();
                    let matches = match ip {
                        IpAddr::V4(v4) => bytes == v4.octets(),
                        IpAddr::V6(v6) => bytes == v6.octets(),
                    };
                    if matches {
                        return true;
                    }
                }
            }
            _ => {}
        }
    }
    false
}

fn prohibited(attr: &str, level: &str) -> CaError {
    CaError::BadCertTemplate(format!(
        "subject attribute {} prohibited in {} certificates",
        attr, level
    ))
}

fn required(attr: &str, level: &str) -> CaError {
    CaError::BadCertTemplate(format!(
        "subject attribute {} required in {} certificates",
        attr, level
    ))
}

/// Post-composition end-entity checks
pub fn check_end_entity(
    subject: &Name,
    san: Option<&[GeneralName]>,
    policy_oids: &[ObjectIdentifier],
) -> Result<()> {
    if let Some(cn) = first_attribute(subject, &dn::COMMON_NAME) {
        let found = san.map(|names| cn_in_san(&cn, names)).unwrap_or(false);
        if !found {
            return Err(CaError::BadCertTemplate(format!(
                "commonName {} does not appear in the subjectAltName",
                cn
            )));
        }
    }

    let has_org = has_attribute(subject, &dn::ORGANIZATION);
    let has_given = has_attribute(subject, &dn::GIVEN_NAME);
    let has_surname = has_attribute(subject, &dn::SURNAME);
    let has_street = has_attribute(subject, &dn::STREET_ADDRESS);
    let has_locality = has_attribute(subject, &dn::LOCALITY);
    let has_state = has_attribute(subject, &dn::STATE_OR_PROVINCE);
    let has_postal = has_attribute(subject, &dn::POSTAL_CODE);
    let has_country = has_attribute(subject, &dn::COUNTRY);

    match validation_level(policy_oids) {
        Some(BrValidation::DomainValidated) => {
            let forbidden = [
                (has_org, "organizationName"),
                (has_given, "givenName"),
                (has_surname, "surname"),
                (has_street, "streetAddress"),
                (has_locality, "localityName"),
                (has_state, "stateOrProvinceName"),
                (has_postal, "postalCode"),
                (has_country, "countryName"),
            ];
            for (present, attr) in forbidden {
                if present {
                    return Err(prohibited(attr, "domain-validated"));
                }
            }
        }
        Some(BrValidation::OrganizationValidated) => {
            if !has_org {
                return Err(required("organizationName", "organization-validated"));
            }
            if has_given || has_surname {
                return Err(prohibited("givenName/surname", "organization-validated"));
            }
            if !has_country {
                return Err(required("countryName", "organization-validated"));
            }
            if !has_locality && !has_state {
                return Err(required(
                    "localityName or stateOrProvinceName",
                    "organization-validated",
                ));
            }
        }
        Some(BrValidation::IndividualValidated) => {
            if !has_given || !has_surname {
                return Err(required("givenName and surname", "individual-validated"));
            }
            if has_org {
                return Err(prohibited("organizationName", "individual-validated"));
            }
            if !has_country {
                return Err(required("countryName", "individual-validated"));
            }
            if !has_locality && !has_state {
                return Err(required(
                    "localityName or stateOrProvinceName",
                    "individual-validated",
                ));
            }
        }
        None => {
            // Address attributes are meaningless without a validated
            // organization or person.
            if (has_street || has_locality || has_state || has_postal)
                && !has_org
                && !has_given
                && !has_surname
            {
                return Err(CaError::BadCertTemplate(
                    "address attributes require organizationName or a personal name".to_string(),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1;
    use std::str::FromStr;

    fn dns(name: &str) -> GeneralName {
        asn1::dns_general_name(name).unwrap()
    }

    #[test]
    fn underscore_in_dns_name_rejected() {
        assert!(check_dns_name("my_host.example.com").is_err());
        assert!(check_dns_name("myhost.example.com").is_ok());
    }

    #[test]
    fn non_public_domains_rejected() {
        assert!(check_dns_name("server.local").is_err());
        assert!(check_dns_name("intranet").is_err());
        assert!(check_dns_name("printer.corp").is_err());
        assert!(check_dns_name("foo.test").is_err());
        assert!(check_dns_name("shop.acme.de").is_ok());
        assert!(check_dns_name("www.example.com").is_ok());
    }

    #[test]
    fn wildcard_names_accepted() {
        assert!(check_dns_name("*.acme.de").is_ok());
        assert!(check_dns_name("*.local").is_err());
    }

    #[test]
    fn cn_matches_dns_case_insensitively() {
        let san = vec![dns("WWW.Acme.DE")];
        assert!(cn_in_san("www.acme.de", &san));
        assert!(!cn_in_san("other.acme.de", &san));
    }

    #[test]
    fn cn_matches_ip_literals() {
        let v4 = asn1::ip_general_name(&[192, 0, 2, 1]).unwrap();
        assert!(cn_in_san("192.0.2.1", &[v4]));

        let addr: std::net::Ipv6Addr = "2001:db8::1".parse().unwrap();
        let v6 = asn1::ip_general_name(&addr.octets()).unwrap();
        assert!(cn_in_san("2001:0db8:0000:0000:0000:0000:0000:0001", &[v6]));
    }

    #[test]
    fn dv_forbids_organization() {
        let subject = Name::from_str("CN=shop.acme.de,O=Acme").unwrap();
        let san = vec![dns("shop.acme.de")];
        let err =
            check_end_entity(&subject, Some(&san), &[cabf::DOMAIN_VALIDATED]).unwrap_err();
        assert!(matches!(err, CaError::BadCertTemplate(_)));
    }

    #[test]
    fn dv_accepts_cn_only() {
        let subject = Name::from_str("CN=shop.acme.de").unwrap();
        let san = vec![dns("shop.acme.de")];
        assert!(check_end_entity(&subject, Some(&san), &[cabf::DOMAIN_VALIDATED]).is_ok());
    }

    #[test]
    fn ov_requires_organization_and_country() {
        let san = vec![dns("shop.acme.de")];
        let no_org = Name::from_str("CN=shop.acme.de,C=DE").unwrap();
        assert!(
            check_end_entity(&no_org, Some(&san), &[cabf::ORGANIZATION_VALIDATED]).is_err()
        );
        let ok = Name::from_str("CN=shop.acme.de,O=Acme,L=Berlin,C=DE").unwrap();
        assert!(check_end_entity(&ok, Some(&san), &[cabf::ORGANIZATION_VALIDATED]).is_ok());
    }

    #[test]
    fn cn_must_appear_in_san() {
        let subject = Name::from_str("CN=shop.acme.de").unwrap();
        let san = vec![dns("other.acme.de")];
        assert!(check_end_entity(&subject, Some(&san), &[cabf::DOMAIN_VALIDATED]).is_err());
        assert!(check_end_entity(&subject, None, &[cabf::DOMAIN_VALIDATED]).is_err());
    }
}
