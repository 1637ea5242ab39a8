// Copyright (c) 2025 - Cowboy AI, LLC.

//! Granted template builder
//!
//! Reconciles the request, the profile and the CA state into the final
//! to-be-signed template. The step order is part of the contract because
//! it fixes error precedence: CA state first, then signer selection,
//! cert-level rules, notBefore, public key, subject, notAfter.

use chrono::{DateTime, Duration, Utc};
use der::Encode;
use std::sync::Arc;
use x509_cert::name::Name;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use zeroize::Zeroizing;

use crate::ca::CaInfo;
use crate::profile::publickey::{canonicalize_spki, spki_to_der};
use crate::profile::{
    CertProfile, ExtensionValues, KeypairGenControl, RequestedExtensions,
};
use crate::traits::KeypairGenerator;
use crate::types::{end_of_time, CertLevel, NotAfterMode, NotBeforeOption, Serial, SignatureAlgo,
    ValidityMode};
use crate::{CaError, Result};

/// Largest backdating accepted for a requested notBefore
const NOT_BEFORE_SLACK: i64 = 600;

/// The public key of an issuance request
#[derive(Debug, Clone)]
pub enum PublicKeyRequest {
    /// The request presents a key
    Presented(SubjectPublicKeyInfoOwned),
    /// The CA generates the keypair server-side
    ServerGenerate,
}

/// An issuance request as the CA core consumes it
#[derive(Debug, Clone)]
pub struct CertTemplateData {
    /// Requested subject
    pub subject: Name,
    /// Requested public key or server-side generation
    pub public_key: PublicKeyRequest,
    /// Requested extensions (raw values by OID)
    pub extensions: RequestedExtensions,
    /// Requested notBefore
    pub not_before: Option<DateTime<Utc>>,
    /// Requested notAfter
    pub not_after: Option<DateTime<Utc>>,
    /// Name of the certificate profile
    pub profile_name: String,
    /// Cross-certification request
    pub cross_cert: bool,
    /// Caller-chosen request id, echoed in responses
    pub cert_req_id: Option<u64>,
}

/// The reconciled to-be-signed template
#[derive(Debug)]
pub struct GrantedCertTemplate {
    /// Granted subject
    pub subject: Name,
    /// Granted public key
    pub spki: SubjectPublicKeyInfoOwned,
    /// Private key when the keypair was generated server-side
    pub private_key: Option<Zeroizing<Vec<u8>>>,
    /// Granted notBefore
    pub not_before: DateTime<Utc>,
    /// Granted notAfter
    pub not_after: DateTime<Utc>,
    /// Serial number
    pub serial: Serial,
    /// Chosen signature algorithm
    pub signature_algo: SignatureAlgo,
    /// Computed extension set
    pub extensions: ExtensionValues,
    /// Non-fatal drift between request and grant
    pub warning: Option<String>,
}

/// Build the granted template for a request
pub async fn build_granted_template(
    ca: &CaInfo,
    profile: &CertProfile,
    request: &CertTemplateData,
    available_signer_algos: &[SignatureAlgo],
    keypair_generators: &[Arc<dyn KeypairGenerator>],
    now: DateTime<Utc>,
) -> Result<GrantedCertTemplate> {
    let mut warnings: Vec<String> = Vec::new();

    // 1. The CA must not be revoked.
    if ca.revocation_info.is_some() {
        return Err(CaError::NotPermitted(format!(
            "CA {} is revoked",
            ca.ident.name
        )));
    }

    // 2. Signer selection: the CA must offer an algorithm the profile
    // allows, in the profile's preference order.
    let signature_algo = profile
        .signature_algorithms
        .iter()
        .copied()
        .find(|a| available_signer_algos.contains(a))
        .ok_or_else(|| {
            CaError::SystemFailure(format!(
                "CA {} owns no signer for the profile's signature algorithms",
                ca.ident.name
            ))
        })?;

    // 3. Cert-level rules.
    match profile.cert_level {
        CertLevel::RootCa => {
            return Err(CaError::NotPermitted(
                "root CA certificates are generated self-signed, not issued".to_string(),
            ));
        }
        CertLevel::SubCa | CertLevel::Cross => {
            if let Some(ca_path_len) = ca.cert.path_len {
                let profile_path_len = profile.extension_policy.path_len;
                let ok = profile_path_len.map(|p| p < ca_path_len).unwrap_or(false);
                if !ok {
                    return Err(CaError::NotPermitted(format!(
                        "subordinate path length {:?} not strictly below the CA's {}",
                        profile_path_len, ca_path_len
                    )));
                }
            }
        }
        CertLevel::EndEntity => {}
    }
    if request.cross_cert != (profile.cert_level == CertLevel::Cross) {
        return Err(CaError::BadCertTemplate(
            "cross-certification flag does not match the profile's level".to_string(),
        ));
    }

    // 4. notBefore: profile policy, then clamp into the permitted window.
    let mut not_before = match profile.not_before {
        NotBeforeOption::Current => request.not_before.unwrap_or(now),
        NotBeforeOption::Midnight => {
            let candidate = request.not_before.unwrap_or(now);
            candidate
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
                .unwrap_or(candidate)
        }
        NotBeforeOption::Offset { seconds } => now + Duration::seconds(seconds),
    };
    let floor = now - Duration::seconds(NOT_BEFORE_SLACK);
    if not_before < floor {
        warnings.push("notBefore raised to the permitted window".to_string());
        not_before = floor;
    }
    if not_before < ca.cert.not_before {
        warnings.push("notBefore raised to the CA's notBefore".to_string());
        not_before = ca.cert.not_before;
    }
    if not_before > ca.no_new_certificate_after {
        return Err(CaError::NotPermitted(format!(
            "CA {} does not issue new certificates after {}",
            ca.ident.name, ca.no_new_certificate_after
        )));
    }

    // 5. Public key: presented (canonicalised and screened) or generated
    // server-side.
    let (spki, private_key) = match &request.public_key {
        PublicKeyRequest::Presented(presented) => {
            let canonical = canonicalize_spki(presented)?;
            profile.check_public_key(&canonical)?;
            (canonical, None)
        }
        PublicKeyRequest::ServerGenerate => {
            let spec = match profile.keypair_generation {
                KeypairGenControl::Forbidden => {
                    return Err(CaError::BadCertTemplate(
                        "no public key specified".to_string(),
                    ));
                }
                KeypairGenControl::InheritCa => ca.cert.keyspec,
                KeypairGenControl::Explicit { keyspec } => keyspec,
            };
            let generator = keypair_generators
                .iter()
                .find(|g| g.supports(&spec))
                .ok_or_else(|| {
                    CaError::SystemFailure(format!("no keypair generator supports {}", spec))
                })?;
            let keypair = generator.generate(&spec).await?;
            (keypair.spki, Some(keypair.private_key_der))
        }
    };

    // 6. Subject normalisation; issuing the CA's own subject is refused.
    let subject_info = profile.subject_info(&request.subject)?;
    if let Some(warning) = &subject_info.warning {
        warnings.push(warning.clone());
    }
    let granted_subject_der = subject_info.granted.to_der()?;
    if granted_subject_der == ca.cert.subject_der {
        return Err(CaError::AlreadyIssued(
            "granted subject equals the CA's own subject".to_string(),
        ));
    }

    // 7. notAfter.
    let not_after = if profile.no_well_defined_expiration {
        end_of_time()
    } else {
        let mut validity = profile.validity;
        if let Some(days) = ca.max_validity_days {
            validity = validity.min(Duration::days(days as i64));
        }
        let max_not_after = (not_before + validity).min(end_of_time());
        let mut granted = match request.not_after {
            Some(requested) if requested <= max_not_after => {
                if requested <= not_before {
                    return Err(CaError::BadCertTemplate(
                        "requested notAfter is not after notBefore".to_string(),
                    ));
                }
                requested
            }
            Some(_) => {
                warnings.push("notAfter clamped to the profile validity".to_string());
                max_not_after
            }
            None => max_not_after,
        };
        if granted > ca.cert.not_after {
            granted = resolve_not_after_overflow(
                ca.validity_mode,
                profile.not_after_mode,
                granted,
                ca.cert.not_after,
                &mut warnings,
            )?;
        }
        granted
    };

    // 8. Serial number, profile-driven.
    let req_subject_der = request.subject.to_der()?;
    let req_spki_der = spki_to_der(&spki)?;
    let serial = profile.generate_serial(
        &ca.cert.subject_der,
        &ca.cert.spki_der,
        &req_subject_der,
        &req_spki_der,
        ca.extra_control.as_deref(),
    )?;

    // 9. Extension matrix.
    let issuer_ctx = ca.issuer_context();
    let extensions = profile.extensions(
        &issuer_ctx,
        &subject_info.granted,
        &request.extensions,
        &spki,
    )?;

    let warning = if warnings.is_empty() {
        None
    } else {
        Some(warnings.join("; "))
    };

    Ok(GrantedCertTemplate {
        subject: subject_info.granted,
        spki,
        private_key,
        not_before,
        not_after,
        serial,
        signature_algo,
        extensions,
        warning,
    })
}

/// Apply the `(caMode, profileMode)` table for a notAfter beyond the
/// CA's own
fn resolve_not_after_overflow(
    ca_mode: ValidityMode,
    profile_mode: NotAfterMode,
    granted: DateTime<Utc>,
    ca_not_after: DateTime<Utc>,
    warnings: &mut Vec<String>,
) -> Result<DateTime<Utc>> {
    match (ca_mode, profile_mode) {
        (ValidityMode::Strict, _) | (_, NotAfterMode::Strict) => Err(CaError::NotPermitted(
            format!(
                "notAfter {} exceeds the CA's notAfter {}",
                granted, ca_not_after
            ),
        )),
        (ValidityMode::Cutoff, _) | (ValidityMode::Lax, NotAfterMode::Cutoff) => {
            warnings.push("notAfter cut off at the CA's notAfter".to_string());
            Ok(ca_not_after)
        }
        (ValidityMode::Lax, NotAfterMode::ByCa) => Ok(granted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_after_matrix_matches_contract() {
        use NotAfterMode::{ByCa, Cutoff as PCutoff, Strict as PStrict};
        use ValidityMode::{Cutoff, Lax, Strict};
        let granted = Utc::now() + Duration::days(400);
        let ca_edge = Utc::now() + Duration::days(100);

        let cases: [(ValidityMode, NotAfterMode, Option<DateTime<Utc>>); 9] = [
            (Strict, PStrict, None),
            (Strict, PCutoff, None),
            (Strict, ByCa, None),
            (Cutoff, PStrict, None),
            (Cutoff, PCutoff, Some(ca_edge)),
            (Cutoff, ByCa, Some(ca_edge)),
            (Lax, PStrict, None),
            (Lax, PCutoff, Some(ca_edge)),
            (Lax, ByCa, Some(granted)),
        ];
        for (ca_mode, profile_mode, expected) in cases {
            let mut warnings = Vec::new();
            let got =
                resolve_not_after_overflow(ca_mode, profile_mode, granted, ca_edge, &mut warnings);
            match expected {
                None => assert!(
                    got.is_err(),
                    "expected failure for ({:?}, {:?})",
                    ca_mode,
                    profile_mode
                ),
                Some(t) => assert_eq!(got.unwrap(), t),
            }
        }
    }
}
