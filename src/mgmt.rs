// Copyright (c) 2025 - Cowboy AI, LLC.

//! Typed management and issuance API records
//!
//! The request/response shapes the wire front ends (CMP, EST, REST, …)
//! hand to the core. The wire protocols themselves are out of scope;
//! everything here is already authenticated and decoded.

use chrono::{DateTime, Utc};
use der::asn1::ObjectIdentifier;
use der::Decode;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::request::CertReq;
use zeroize::Zeroizing;

use crate::manager::{CaManager, CaSystemStatus};
use crate::issuance::{CertTemplateData, PublicKeyRequest};
use crate::profile::publickey::parse_spki;
use crate::profile::{RequestedExtension, RequestedExtensions};
use crate::types::{CrlReason, Serial};
use crate::{CaError, Result};

/// PKCS#9 extensionRequest attribute
const OID_EXTENSION_REQUEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

/// Issue a certificate from a CSR
#[derive(Debug, Clone)]
pub struct GenerateCertRequest {
    /// CA name or alias
    pub ca: String,
    /// Profile name
    pub profile: String,
    /// DER of the PKCS#10 request
    pub csr_der: Vec<u8>,
    /// Requested notBefore
    pub not_before: Option<DateTime<Utc>>,
    /// Requested notAfter
    pub not_after: Option<DateTime<Utc>>,
}

/// Response of a certificate issuance
pub struct GenerateCertResponse {
    /// DER of the issued certificate
    pub cert_der: Vec<u8>,
    /// Serial number
    pub serial: Serial,
    /// Non-fatal drift between request and grant
    pub warning: Option<String>,
}

/// Issue a certificate with a server-generated keypair
#[derive(Debug, Clone)]
pub struct GenerateKeyCertRequest {
    /// CA name or alias
    pub ca: String,
    /// Profile name
    pub profile: String,
    /// Subject as an RFC 4514 string
    pub subject: String,
    /// Requested notBefore
    pub not_before: Option<DateTime<Utc>>,
    /// Requested notAfter
    pub not_after: Option<DateTime<Utc>>,
}

/// Response of a key-and-certificate issuance
pub struct GenerateKeyCertResponse {
    /// PKCS#8 DER of the generated private key
    pub private_key_der: Zeroizing<Vec<u8>>,
    /// DER of the issued certificate
    pub cert_der: Vec<u8>,
    /// Serial number
    pub serial: Serial,
}

/// Issue a cross certificate for an existing certificate
#[derive(Debug, Clone)]
pub struct GenerateCrossCertRequest {
    /// CA name or alias
    pub ca: String,
    /// Profile name (must be a cross profile)
    pub profile: String,
    /// DER of the certificate to cross-sign
    pub target_cert_der: Vec<u8>,
    /// Requested notBefore
    pub not_before: Option<DateTime<Utc>>,
    /// Requested notAfter
    pub not_after: Option<DateTime<Utc>>,
}

/// Revoke, suspend or unsuspend a certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeCertRequest {
    /// CA name or alias
    pub ca: String,
    /// Serial of the certificate
    pub serial: Serial,
    /// Revocation reason
    pub reason: CrlReason,
    /// Suspected key-invalidity time
    #[serde(default)]
    pub invalidity_time: Option<DateTime<Utc>>,
}

/// Summary of the running system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaSystemSummary {
    /// Overall status
    pub status: CaSystemStatus,
    /// Successfully started CAs
    pub ca_names: Vec<String>,
    /// CAs that failed to start
    pub failed_ca_names: Vec<String>,
    /// Registered but inactive CAs
    pub inactive_ca_names: Vec<String>,
}

/// Decode a PKCS#10 request into a template
///
/// The caller is expected to have verified proof-of-possession at the
/// protocol layer.
pub fn csr_to_template(
    csr_der: &[u8],
    profile_name: &str,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
) -> Result<CertTemplateData> {
    let csr = CertReq::from_der(csr_der)
        .map_err(|e| CaError::BadRequest(format!("malformed PKCS#10 request: {}", e)))?;

    let mut extensions = RequestedExtensions::new();
    for attribute in csr.info.attributes.iter() {
        if attribute.oid != OID_EXTENSION_REQUEST {
            continue;
        }
        for value in attribute.values.iter() {
            let requested: Vec<Extension> = value.decode_as().map_err(|e| {
                CaError::BadRequest(format!("malformed extensionRequest attribute: {}", e))
            })?;
            for extension in requested {
                extensions.insert(
                    extension.extn_id,
                    RequestedExtension {
                        critical: extension.critical,
                        value: extension.extn_value.as_bytes().to_vec(),
                    },
                );
            }
        }
    }

    Ok(CertTemplateData {
        subject: csr.info.subject.clone(),
        public_key: PublicKeyRequest::Presented(csr.info.public_key.clone()),
        extensions,
        not_before,
        not_after,
        profile_name: profile_name.to_string(),
        cross_cert: false,
        cert_req_id: None,
    })
}

impl CaManager {
    /// Issue a certificate from a CSR
    pub async fn generate_certificate_from_csr(
        &self,
        request: GenerateCertRequest,
    ) -> Result<GenerateCertResponse> {
        let template = csr_to_template(
            &request.csr_der,
            &request.profile,
            request.not_before,
            request.not_after,
        )?;
        let issued = self
            .generate_certificate(&request.ca, &request.profile, template)
            .await?;
        Ok(GenerateCertResponse {
            cert_der: issued.cert_der,
            serial: issued.serial,
            warning: issued.warning,
        })
    }

    /// Issue a certificate with a server-generated keypair
    pub async fn generate_key_cert(
        &self,
        request: GenerateKeyCertRequest,
    ) -> Result<GenerateKeyCertResponse> {
        let subject = Name::from_str(&request.subject)
            .map_err(|e| CaError::BadRequest(format!("invalid subject: {}", e)))?;
        let template = CertTemplateData {
            subject,
            public_key: PublicKeyRequest::ServerGenerate,
            extensions: RequestedExtensions::new(),
            not_before: request.not_before,
            not_after: request.not_after,
            profile_name: request.profile.clone(),
            cross_cert: false,
            cert_req_id: None,
        };
        let issued = self
            .generate_certificate(&request.ca, &request.profile, template)
            .await?;
        let private_key_der = issued.private_key.ok_or_else(|| {
            CaError::SystemFailure("server-side keypair generation yielded no key".to_string())
        })?;
        Ok(GenerateKeyCertResponse {
            private_key_der,
            cert_der: issued.cert_der,
            serial: issued.serial,
        })
    }

    /// Cross-sign the subject and key of an existing certificate
    pub async fn generate_cross_certificate(
        &self,
        request: GenerateCrossCertRequest,
    ) -> Result<GenerateCertResponse> {
        use x509_parser::prelude::*;

        let (_, target) = X509Certificate::from_der(&request.target_cert_der)
            .map_err(|e| CaError::BadRequest(format!("invalid target certificate: {}", e)))?;
        let subject = Name::from_der(target.tbs_certificate.subject.as_raw())?;
        let spki = parse_spki(target.tbs_certificate.subject_pki.raw)?;

        let template = CertTemplateData {
            subject,
            public_key: PublicKeyRequest::Presented(spki),
            extensions: RequestedExtensions::new(),
            not_before: request.not_before,
            not_after: request.not_after,
            profile_name: request.profile.clone(),
            cross_cert: true,
            cert_req_id: None,
        };
        let issued = self
            .generate_certificate(&request.ca, &request.profile, template)
            .await?;
        Ok(GenerateCertResponse {
            cert_der: issued.cert_der,
            serial: issued.serial,
            warning: issued.warning,
        })
    }

    /// Apply a typed revocation request
    pub async fn apply_revocation(&self, request: RevokeCertRequest) -> Result<()> {
        if request.reason == CrlReason::RemoveFromCrl {
            self.unsuspend_certificate(&request.ca, &request.serial)
                .await
        } else {
            self.revoke_certificate(
                &request.ca,
                &request.serial,
                request.reason,
                request.invalidity_time,
            )
            .await
        }
    }

    /// Summary of the running system
    pub fn system_summary(&self) -> CaSystemSummary {
        CaSystemSummary {
            status: self.status(),
            ca_names: self.ca_names(),
            failed_ca_names: self.failed_ca_names(),
            inactive_ca_names: self.inactive_ca_names(),
        }
    }
}
