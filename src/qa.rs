// Copyright (c) 2025 - Cowboy AI, LLC.

//! Extension checker
//!
//! Recomputes the expected extension set of an issued certificate from
//! the active profile and the original request, and compares it
//! bit-exactly against what the certificate carries. Used as a test
//! oracle and by the QA service.

use crate::ca::CaInfo;
use crate::issuance::CertTemplateData;
use crate::profile::publickey::parse_spki;
use crate::profile::CertProfile;
use crate::{CaError, Result};

/// One validation finding
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Stable tag of the check, e.g. `ext.keyUsage`
    pub tag: String,
    /// What the check verifies
    pub description: String,
    /// Failure message; `None` means the check passed
    pub failure: Option<String>,
}

impl ValidationIssue {
    fn ok(tag: &str, description: &str) -> Self {
        Self {
            tag: tag.to_string(),
            description: description.to_string(),
            failure: None,
        }
    }

    fn failed(tag: &str, description: &str, failure: String) -> Self {
        Self {
            tag: tag.to_string(),
            description: description.to_string(),
            failure: Some(failure),
        }
    }

    /// True when the check failed
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Check an issued certificate against its profile and request
///
/// The expected extension set is recomputed with the same engine that
/// issued the certificate, so the comparison is byte-exact.
pub fn check_certificate(
    cert_der: &[u8],
    profile: &CertProfile,
    ca: &CaInfo,
    request: &CertTemplateData,
) -> Result<Vec<ValidationIssue>> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| CaError::BadRequest(format!("invalid certificate: {}", e)))?;
    let tbs = &cert.tbs_certificate;

    let mut issues = Vec::new();

    // Subject: the certificate must carry exactly the granted subject.
    let subject_info = profile.subject_info(&request.subject)?;
    let granted_subject_der = {
        use der::Encode;
        subject_info.granted.to_der()?
    };
    if tbs.subject.as_raw() == granted_subject_der.as_slice() {
        issues.push(ValidationIssue::ok("subject", "granted subject"));
    } else {
        issues.push(ValidationIssue::failed(
            "subject",
            "granted subject",
            "subject differs from the profile grant".to_string(),
        ));
    }

    // Recompute the expected extension set.
    let spki = parse_spki(tbs.subject_pki.raw)?;
    let issuer_ctx = ca.issuer_context();
    let expected = profile.extensions(
        &issuer_ctx,
        &subject_info.granted,
        &request.extensions,
        &spki,
    )?;

    let actual: Vec<(String, bool, Vec<u8>)> = cert
        .extensions()
        .iter()
        .map(|e| (e.oid.to_id_string(), e.critical, e.value.to_vec()))
        .collect();

    for expected_ext in &expected.extensions {
        let oid = expected_ext.extn_id.to_string();
        let tag = format!("ext.{}", oid);
        match actual.iter().find(|(actual_oid, _, _)| *actual_oid == oid) {
            None => issues.push(ValidationIssue::failed(
                &tag,
                "required extension present",
                "extension absent from the certificate".to_string(),
            )),
            Some((_, critical, value)) => {
                if *critical != expected_ext.critical {
                    issues.push(ValidationIssue::failed(
                        &tag,
                        "extension criticality",
                        format!(
                            "criticality is {}, expected {}",
                            critical, expected_ext.critical
                        ),
                    ));
                } else if value != expected_ext.extn_value.as_bytes() {
                    issues.push(ValidationIssue::failed(
                        &tag,
                        "extension encoding",
                        "encoding differs from the computed extension".to_string(),
                    ));
                } else {
                    issues.push(ValidationIssue::ok(&tag, "extension matches"));
                }
            }
        }
    }

    // Anything the certificate carries beyond the computed set is a
    // defect too.
    for (oid, _, _) in &actual {
        let expected_has = expected
            .extensions
            .iter()
            .any(|e| e.extn_id.to_string() == *oid);
        if !expected_has {
            issues.push(ValidationIssue::failed(
                &format!("ext.{}", oid),
                "no unexpected extensions",
                "extension not produced by the profile".to_string(),
            ));
        }
    }

    Ok(issues)
}

/// True when every check passed
pub fn all_passed(issues: &[ValidationIssue]) -> bool {
    issues.iter().all(|i| !i.is_failed())
}
