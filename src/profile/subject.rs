// Copyright (c) 2025 - Cowboy AI, LLC.

//! Subject templates and distinguished-name normalisation
//!
//! A profile's subject control lists the permitted RDN types with
//! occurrence bounds and optional fixed values. Granting a subject
//! normalises the requested DN against that template; non-fatal drift
//! (trimmed whitespace, case-folded country codes) is reported as a
//! warning, policy violations fail with `BadCertTemplate`.

use der::asn1::ObjectIdentifier;
use der::{Tag, Tagged};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use x509_cert::name::{Name, RdnSequence};

use crate::asn1::{self, dn};
use crate::{CaError, Result};

/// ISO 3166-1 alpha-2 country codes
const ISO_3166_ALPHA2: &[&str] = &[
    "AD", "AE", "AF", "AG", "AI", "AL", "AM", "AO", "AQ", "AR", "AS", "AT", "AU", "AW", "AX",
    "AZ", "BA", "BB", "BD", "BE", "BF", "BG", "BH", "BI", "BJ", "BL", "BM", "BN", "BO", "BQ",
    "BR", "BS", "BT", "BV", "BW", "BY", "BZ", "CA", "CC", "CD", "CF", "CG", "CH", "CI", "CK",
    "CL", "CM", "CN", "CO", "CR", "CU", "CV", "CW", "CX", "CY", "CZ", "DE", "DJ", "DK", "DM",
    "DO", "DZ", "EC", "EE", "EG", "EH", "ER", "ES", "ET", "FI", "FJ", "FK", "FM", "FO", "FR",
    "GA", "GB", "GD", "GE", "GF", "GG", "GH", "GI", "GL", "GM", "GN", "GP", "GQ", "GR", "GS",
    "GT", "GU", "GW", "GY", "HK", "HM", "HN", "HR", "HT", "HU", "ID", "IE", "IL", "IM", "IN",
    "IO", "IQ", "IR", "IS", "IT", "JE", "JM", "JO", "JP", "KE", "KG", "KH", "KI", "KM", "KN",
    "KP", "KR", "KW", "KY", "KZ", "LA", "LB", "LC", "LI", "LK", "LR", "LS", "LT", "LU", "LV",
    "LY", "MA", "MC", "MD", "ME", "MF", "MG", "MH", "MK", "ML", "MM", "MN", "MO", "MP", "MQ",
    "MR", "MS", "MT", "MU", "MV", "MW", "MX", "MY", "MZ", "NA", "NC", "NE", "NF", "NG", "NI",
    "NL", "NO", "NP", "NR", "NU", "NZ", "OM", "PA", "PE", "PF", "PG", "PH", "PK", "PL", "PM",
    "PN", "PR", "PS", "PT", "PW", "PY", "QA", "RE", "RO", "RS", "RU", "RW", "SA", "SB", "SC",
    "SD", "SE", "SG", "SH", "SI", "SJ", "SK", "SL", "SM", "SN", "SO", "SR", "SS", "ST", "SV",
    "SX", "SY", "SZ", "TC", "TD", "TF", "TG", "TH", "TJ", "TK", "TL", "TM", "TN", "TO", "TR",
    "TT", "TV", "TW", "TZ", "UA", "UG", "UM", "US", "UY", "UZ", "VA", "VC", "VE", "VG", "VI",
    "VN", "VU", "WF", "WS", "YE", "YT", "ZA", "ZM", "ZW",
];

/// True when `code` is a valid ISO 3166-1 alpha-2 country code
/// (case-insensitive)
pub fn is_valid_country_code(code: &str) -> bool {
    code.len() == 2 && ISO_3166_ALPHA2.contains(&code.to_ascii_uppercase().as_str())
}

/// DN attribute types holding a country code
pub fn is_country_attribute(oid: &ObjectIdentifier) -> bool {
    *oid == dn::COUNTRY
        || *oid == dn::COUNTRY_OF_CITIZENSHIP
        || *oid == dn::COUNTRY_OF_RESIDENCE
        || *oid == dn::JURISDICTION_COUNTRY
}

/// One RDN line of a profile's subject template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdnConf {
    /// Attribute type: short name (`cn`, `o`, …) or dotted OID
    pub r#type: String,
    /// Minimum occurrences (default 1)
    #[serde(default = "default_occurs")]
    pub min_occurs: u32,
    /// Maximum occurrences (default 1)
    #[serde(default = "default_occurs")]
    pub max_occurs: u32,
    /// Fixed value overriding whatever the request carries
    #[serde(default)]
    pub value: Option<String>,
}

fn default_occurs() -> u32 {
    1
}

/// Subject template of a profile
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubjectConf {
    /// Permitted RDNs, in the order the granted subject will carry them
    pub rdns: Vec<RdnConf>,
    /// Keep the request's RDN order instead of the template order
    #[serde(default)]
    pub keep_rdn_order: bool,
}

/// Resolved control for one attribute type
#[derive(Debug, Clone)]
pub struct RdnControl {
    /// Attribute type
    pub oid: ObjectIdentifier,
    /// Minimum occurrences
    pub min_occurs: u32,
    /// Maximum occurrences
    pub max_occurs: u32,
    /// Fixed value
    pub fixed_value: Option<String>,
}

/// Validated subject control of a profile
#[derive(Debug, Clone)]
pub struct SubjectControl {
    controls: Vec<RdnControl>,
    by_oid: HashMap<ObjectIdentifier, usize>,
    keep_rdn_order: bool,
}

impl SubjectControl {
    /// Resolve and validate a subject conf
    pub fn from_conf(conf: &SubjectConf) -> Result<Self> {
        let mut controls = Vec::with_capacity(conf.rdns.len());
        let mut by_oid = HashMap::new();

        for rdn in &conf.rdns {
            let oid = asn1::dn_oid_by_short_name(&rdn.r#type)
                .or_else(|| ObjectIdentifier::new(&rdn.r#type).ok())
                .ok_or_else(|| {
                    CaError::ProfileConfig(format!("unknown RDN type: {}", rdn.r#type))
                })?;
            if rdn.max_occurs < rdn.min_occurs {
                return Err(CaError::ProfileConfig(format!(
                    "maxOccurs < minOccurs for RDN type {}",
                    rdn.r#type
                )));
            }
            if let Some(value) = &rdn.value {
                if is_country_attribute(&oid) && !is_valid_country_code(value) {
                    return Err(CaError::ProfileConfig(format!(
                        "invalid country code in subject template: {}",
                        value
                    )));
                }
            }
            if by_oid.insert(oid, controls.len()).is_some() {
                return Err(CaError::ProfileConfig(format!(
                    "duplicate RDN type in subject template: {}",
                    rdn.r#type
                )));
            }
            controls.push(RdnControl {
                oid,
                min_occurs: rdn.min_occurs,
                max_occurs: rdn.max_occurs,
                fixed_value: rdn.value.clone(),
            });
        }

        Ok(Self {
            controls,
            by_oid,
            keep_rdn_order: conf.keep_rdn_order,
        })
    }

    /// Control for an attribute type, if the template permits it
    pub fn control_for(&self, oid: &ObjectIdentifier) -> Option<&RdnControl> {
        self.by_oid.get(oid).map(|&i| &self.controls[i])
    }

    /// All controls in template order
    pub fn controls(&self) -> &[RdnControl] {
        &self.controls
    }
}

/// Result of granting a subject
#[derive(Debug, Clone)]
pub struct SubjectInfo {
    /// The granted subject DN
    pub granted: Name,
    /// Non-fatal drift between request and grant
    pub warning: Option<String>,
}

/// Extract the text of a DN attribute value
///
/// Accepts the string types RFC 5280 permits for directory strings plus
/// IA5String; anything else is a malformed request.
pub fn attribute_text(value: &der::Any) -> Result<String> {
    let tag = value.tag();
    match tag {
        Tag::Utf8String | Tag::PrintableString | Tag::Ia5String | Tag::TeletexString
        | Tag::BmpString => {
            let bytes = value.value();
            match tag {
                Tag::BmpString => {
                    // UCS-2 big endian
                    if bytes.len() % 2 != 0 {
                        return Err(CaError::BadCertTemplate(
                            "malformed BMPString in subject".to_string(),
                        ));
                    }
                    let units: Vec<u16> = bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect();
                    String::from_utf16(&units).map_err(|_| {
                        CaError::BadCertTemplate("malformed BMPString in subject".to_string())
                    })
                }
                _ => String::from_utf8(bytes.to_vec()).map_err(|_| {
                    CaError::BadCertTemplate("malformed string in subject".to_string())
                }),
            }
        }
        other => Err(CaError::BadCertTemplate(format!(
            "unsupported subject attribute encoding: {}",
            other
        ))),
    }
}

/// Requested subject flattened into `(type, text)` pairs in request order
pub fn flatten_name(name: &Name) -> Result<Vec<(ObjectIdentifier, String)>> {
    let mut out = Vec::new();
    for rdn in name.0.iter() {
        for atv in rdn.0.iter() {
            out.push((atv.oid, attribute_text(&atv.value)?));
        }
    }
    Ok(out)
}

/// Apply the subject template to a requested subject
pub fn grant_subject(control: &SubjectControl, requested: &Name) -> Result<SubjectInfo> {
    let flat = flatten_name(requested)?;
    let mut warnings: Vec<String> = Vec::new();

    // Every requested attribute must be permitted, and occurrence bounds
    // must hold.
    let mut counts: HashMap<ObjectIdentifier, u32> = HashMap::new();
    for (oid, _) in &flat {
        if control.control_for(oid).is_none() {
            return Err(CaError::BadCertTemplate(format!(
                "subject attribute type {} not permitted by the profile",
                oid
            )));
        }
        *counts.entry(*oid).or_insert(0) += 1;
    }
    for rc in control.controls() {
        let n = counts.get(&rc.oid).copied().unwrap_or(0);
        let effective = if rc.fixed_value.is_some() { n.max(1) } else { n };
        if effective < rc.min_occurs {
            return Err(CaError::BadCertTemplate(format!(
                "required subject attribute type {} absent",
                rc.oid
            )));
        }
        if effective > rc.max_occurs {
            return Err(CaError::BadCertTemplate(format!(
                "subject attribute type {} occurs {} times, at most {} permitted",
                rc.oid, effective, rc.max_occurs
            )));
        }
    }

    // Normalise a single value against its control.
    let mut normalise = |rc: &RdnControl, requested_value: Option<&str>| -> Result<String> {
        let raw = match (&rc.fixed_value, requested_value) {
            (Some(fixed), Some(req)) => {
                if fixed != req {
                    warnings.push(format!(
                        "value of {} replaced by the profile-fixed value",
                        rc.oid
                    ));
                }
                fixed.clone()
            }
            (Some(fixed), None) => fixed.clone(),
            (None, Some(req)) => req.to_string(),
            (None, None) => unreachable!("occurrence check guarantees a value"),
        };
        let trimmed = raw.trim();
        if trimmed != raw {
            warnings.push(format!("leading/trailing blanks removed from {}", rc.oid));
        }
        if trimmed.is_empty() {
            return Err(CaError::BadCertTemplate(format!(
                "blank value for subject attribute type {}",
                rc.oid
            )));
        }
        if is_country_attribute(&rc.oid) {
            if !is_valid_country_code(trimmed) {
                return Err(CaError::BadCertTemplate(format!(
                    "invalid country code: {}",
                    trimmed
                )));
            }
            let upper = trimmed.to_ascii_uppercase();
            if upper != trimmed {
                warnings.push(format!("country code {} normalised to uppercase", trimmed));
            }
            return Ok(upper);
        }
        Ok(trimmed.to_string())
    };

    let mut granted_attrs: Vec<(ObjectIdentifier, String)> = Vec::new();
    if control.keep_rdn_order {
        let mut fixed_emitted: HashMap<ObjectIdentifier, bool> = HashMap::new();
        for (oid, value) in &flat {
            let rc = control.control_for(oid).expect("checked above");
            granted_attrs.push((*oid, normalise(rc, Some(value))?));
            fixed_emitted.insert(*oid, true);
        }
        // Fixed-value attributes the request did not carry still appear.
        for rc in control.controls() {
            if rc.fixed_value.is_some() && !fixed_emitted.contains_key(&rc.oid) {
                granted_attrs.push((rc.oid, normalise(rc, None)?));
            }
        }
    } else {
        for rc in control.controls() {
            let values: Vec<&str> = flat
                .iter()
                .filter(|(oid, _)| *oid == rc.oid)
                .map(|(_, v)| v.as_str())
                .collect();
            if values.is_empty() {
                if rc.fixed_value.is_some() {
                    granted_attrs.push((rc.oid, normalise(rc, None)?));
                }
                continue;
            }
            for value in values {
                granted_attrs.push((rc.oid, normalise(rc, Some(value))?));
            }
        }
    }

    let mut rdns = Vec::with_capacity(granted_attrs.len());
    for (oid, value) in &granted_attrs {
        rdns.push(asn1::single_rdn(asn1::dn_attribute(*oid, value)?)?);
    }
    let granted = RdnSequence(rdns);

    let warning = if warnings.is_empty() {
        None
    } else {
        Some(warnings.join("; "))
    };
    Ok(SubjectInfo { granted, warning })
}

/// First value of an attribute type in a DN
pub fn first_attribute(name: &Name, oid: &ObjectIdentifier) -> Option<String> {
    for rdn in name.0.iter() {
        for atv in rdn.0.iter() {
            if atv.oid == *oid {
                return attribute_text(&atv.value).ok();
            }
        }
    }
    None
}

/// True when the DN contains the attribute type at all
pub fn has_attribute(name: &Name, oid: &ObjectIdentifier) -> bool {
    name.0
        .iter()
        .any(|rdn| rdn.0.iter().any(|atv| atv.oid == *oid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn control(rdns: Vec<RdnConf>) -> SubjectControl {
        SubjectControl::from_conf(&SubjectConf {
            rdns,
            keep_rdn_order: false,
        })
        .unwrap()
    }

    fn rdn(ty: &str) -> RdnConf {
        RdnConf {
            r#type: ty.to_string(),
            min_occurs: 1,
            max_occurs: 1,
            value: None,
        }
    }

    #[test]
    fn grants_template_order() {
        let ctl = control(vec![rdn("c"), rdn("o"), rdn("cn")]);
        let requested = Name::from_str("CN=example,O=Acme,C=de").unwrap();

        let info = grant_subject(&ctl, &requested).unwrap();
        let flat = flatten_name(&info.granted).unwrap();
        assert_eq!(flat[0].0, dn::COUNTRY);
        assert_eq!(flat[0].1, "DE");
        assert_eq!(flat[2].0, dn::COMMON_NAME);
        // lowercase country was normalised, so a warning is emitted
        assert!(info.warning.is_some());
    }

    #[test]
    fn rejects_unpermitted_attribute() {
        let ctl = control(vec![rdn("cn")]);
        let requested = Name::from_str("CN=x,O=Acme").unwrap();

        let err = grant_subject(&ctl, &requested).unwrap_err();
        assert!(matches!(err, CaError::BadCertTemplate(_)));
    }

    #[test]
    fn rejects_missing_required_attribute() {
        let mut cn = rdn("cn");
        cn.min_occurs = 1;
        let ctl = control(vec![cn]);
        let requested = Name::default();

        assert!(grant_subject(&ctl, &requested).is_err());
    }

    #[test]
    fn fixed_value_overrides_request() {
        let mut o = rdn("o");
        o.value = Some("Example Org".to_string());
        let ctl = control(vec![rdn("cn"), o]);
        let requested = Name::from_str("CN=x,O=Other").unwrap();

        let info = grant_subject(&ctl, &requested).unwrap();
        let flat = flatten_name(&info.granted).unwrap();
        assert!(flat.iter().any(|(_, v)| v == "Example Org"));
        assert!(info.warning.is_some());
    }

    #[test]
    fn invalid_country_rejected() {
        let ctl = control(vec![rdn("c")]);
        let requested = Name::from_str("C=ZZ").unwrap();

        assert!(grant_subject(&ctl, &requested).is_err());
    }

    #[test]
    fn country_code_table_sanity() {
        assert!(is_valid_country_code("de"));
        assert!(is_valid_country_code("US"));
        assert!(!is_valid_country_code("ZZ"));
        assert!(!is_valid_country_code("DEU"));
    }
}
