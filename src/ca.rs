// Copyright (c) 2025 - Cowboy AI, LLC.

//! Per-CA lifecycle: signing, revocation, CRL generation, publisher
//! fan-out
//!
//! An [`X509Ca`] is created when the CA manager activates a CA and
//! destroyed on restart or removal; the manager owns it exclusively.
//! Operations are atomic per certificate; bulk republish reports
//! per-certificate failures without aborting the batch.

use chrono::{DateTime, Duration, Utc};
use der::asn1::BitString;
use der::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use x509_cert::certificate::{Certificate, TbsCertificate, Version};
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::time::Validity;
use zeroize::Zeroizing;

use crate::asn1::{self, ext};
use crate::idgen::UniqueIdGenerator;
use crate::issuance::{build_granted_template, CertTemplateData};
use crate::profile::publickey::key_spec_of;
use crate::profile::{CertProfile, IssuerContext};
use crate::signer::SignerPool;
use crate::store::{CertListFilter, CertListOrder, CertRecord, CertStore, PublishQueueEntry,
    RevocationOp};
use crate::traits::{CertPublishEvent, CertPublisher, KeypairGenerator, PublishEventKind};
use crate::types::{CaStatus, CrlInfo, CrlReason, HashAlgo, KeySpec, NameId, RevocationInfo,
    Serial, ValidityMode};
use crate::{CaError, Result};

/// CRL generation control of a CA
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrlControl {
    /// Interval between scheduled CRLs, in hours
    #[serde(default = "default_crl_interval")]
    pub interval_hours: u32,
    /// Overlap added to nextUpdate, in hours
    #[serde(default = "default_crl_overlap")]
    pub overlap_hours: u32,
    /// Keep expired certificates on the CRL
    #[serde(default)]
    pub include_expired_certs: bool,
}

fn default_crl_interval() -> u32 {
    24
}

fn default_crl_overlap() -> u32 {
    6
}

/// Parsed fields of a CA certificate the issuance paths consume
#[derive(Debug, Clone)]
pub struct CaCert {
    /// DER of the CA certificate
    pub der: Vec<u8>,
    /// Subject DN
    pub subject: Name,
    /// DER of the subject DN
    pub subject_der: Vec<u8>,
    /// DER of the SubjectPublicKeyInfo
    pub spki_der: Vec<u8>,
    /// Subject key identifier
    pub ski: Vec<u8>,
    /// Serial number
    pub serial: Serial,
    /// notBefore
    pub not_before: DateTime<Utc>,
    /// notAfter
    pub not_after: DateTime<Utc>,
    /// Path-length constraint; `None` means unlimited
    pub path_len: Option<u8>,
    /// Raw value of the subjectAltName extension, if any
    pub subject_alt_name_value: Option<Vec<u8>>,
    /// Key spec of the CA key
    pub keyspec: KeySpec,
}

impl CaCert {
    /// Parse a CA certificate from DER
    pub fn parse(der_bytes: &[u8]) -> Result<Self> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(der_bytes)
            .map_err(|e| CaError::InvalidConf(format!("invalid CA certificate: {}", e)))?;
        let tbs = &cert.tbs_certificate;

        let subject_der = tbs.subject.as_raw().to_vec();
        let spki_der = tbs.subject_pki.raw.to_vec();
        let serial = Serial::from_be_bytes(tbs.raw_serial())?;
        let not_before = DateTime::<Utc>::from_timestamp(tbs.validity.not_before.timestamp(), 0)
            .ok_or_else(|| CaError::InvalidConf("invalid notBefore".to_string()))?;
        let not_after = DateTime::<Utc>::from_timestamp(tbs.validity.not_after.timestamp(), 0)
            .ok_or_else(|| CaError::InvalidConf("invalid notAfter".to_string()))?;

        let mut ski: Option<Vec<u8>> = None;
        let mut path_len: Option<u8> = None;
        let mut is_ca = false;
        let mut subject_alt_name_value: Option<Vec<u8>> = None;
        for extension in cert.extensions() {
            match extension.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(ki) => {
                    ski = Some(ki.0.to_vec());
                }
                ParsedExtension::BasicConstraints(bc) => {
                    is_ca = bc.ca;
                    path_len = bc.path_len_constraint.map(|l| l.min(u8::MAX as u32) as u8);
                }
                ParsedExtension::SubjectAlternativeName(_) => {
                    subject_alt_name_value = Some(extension.value.to_vec());
                }
                _ => {}
            }
        }
        if !is_ca {
            return Err(CaError::InvalidConf(
                "certificate is not a CA certificate".to_string(),
            ));
        }

        let ski = ski.unwrap_or_else(|| {
            HashAlgo::Sha1.digest(&tbs.subject_pki.subject_public_key.data)
        });

        let spki = x509_cert::spki::SubjectPublicKeyInfoOwned::from_der(&spki_der)?;
        let keyspec = key_spec_of(&spki)?;
        let subject = Name::from_der(&subject_der)?;

        Ok(Self {
            der: der_bytes.to_vec(),
            subject,
            subject_der,
            spki_der,
            ski,
            serial,
            not_before,
            not_after,
            path_len,
            subject_alt_name_value,
            keyspec,
        })
    }
}

/// Runtime state of one CA
#[derive(Debug, Clone)]
pub struct CaInfo {
    /// CA identity
    pub ident: NameId,
    /// Parsed CA certificate
    pub cert: CaCert,
    /// Certificate chain up to the root, DER encoded
    pub cert_chain: Vec<Vec<u8>>,
    /// Operational status
    pub status: CaStatus,
    /// Validity mode applied to granted notAfter values
    pub validity_mode: ValidityMode,
    /// Upper bound on granted validity, in days
    pub max_validity_days: Option<u32>,
    /// No new certificates after this time
    pub no_new_certificate_after: DateTime<Utc>,
    /// CA-level revocation
    pub revocation_info: Option<RevocationInfo>,
    /// Issuer-policy extra-control bag
    pub extra_control: Option<String>,
    /// CRL generation control
    pub crl_control: Option<CrlControl>,
    /// OCSP responder URIs
    pub ocsp_uris: Vec<String>,
    /// CA certificate download URIs
    pub ca_issuer_uris: Vec<String>,
    /// CRL distribution URIs
    pub crl_uris: Vec<String>,
    /// Delta-CRL distribution URIs
    pub delta_crl_uris: Vec<String>,
}

impl CaInfo {
    /// View of this CA as the extension engine consumes it
    pub fn issuer_context(&self) -> IssuerContext<'_> {
        IssuerContext {
            subject: &self.cert.subject,
            ski: &self.cert.ski,
            serial: &self.cert.serial,
            subject_alt_name_value: self.cert.subject_alt_name_value.as_deref(),
            ocsp_uris: &self.ocsp_uris,
            ca_issuer_uris: &self.ca_issuer_uris,
            crl_uris: &self.crl_uris,
            delta_crl_uris: &self.delta_crl_uris,
            path_len: self.cert.path_len,
        }
    }
}

/// An issued certificate as returned to the caller
#[derive(Debug)]
pub struct IssuedCertificate {
    /// DER of the certificate
    pub cert_der: Vec<u8>,
    /// Serial number
    pub serial: Serial,
    /// PKCS#8 private key for server-generated keypairs
    pub private_key: Option<Zeroizing<Vec<u8>>>,
    /// Non-fatal drift between request and grant
    pub warning: Option<String>,
    /// Echo of the caller's request id
    pub cert_req_id: Option<u64>,
}

/// Report of a bulk republish
#[derive(Debug, Default)]
pub struct RepublishReport {
    /// Number of certificates delivered to every publisher
    pub published: usize,
    /// Per-certificate failures `(serial, message)`
    pub failures: Vec<(Serial, String)>,
}

/// A live CA instance
pub struct X509Ca {
    info: RwLock<CaInfo>,
    store: Arc<dyn CertStore>,
    signer_pool: Arc<SignerPool>,
    publishers: Vec<Arc<dyn CertPublisher>>,
    keypair_generators: Vec<Arc<dyn KeypairGenerator>>,
    id_generator: Arc<UniqueIdGenerator>,
    certhash_algo: Option<HashAlgo>,
}

impl X509Ca {
    /// Create a CA instance
    pub fn new(
        info: CaInfo,
        store: Arc<dyn CertStore>,
        signer_pool: Arc<SignerPool>,
        publishers: Vec<Arc<dyn CertPublisher>>,
        keypair_generators: Vec<Arc<dyn KeypairGenerator>>,
        id_generator: Arc<UniqueIdGenerator>,
        certhash_algo: Option<HashAlgo>,
    ) -> Self {
        Self {
            info: RwLock::new(info),
            store,
            signer_pool,
            publishers,
            keypair_generators,
            id_generator,
            certhash_algo,
        }
    }

    /// Snapshot of the CA state
    pub fn info(&self) -> CaInfo {
        self.info.read().unwrap().clone()
    }

    /// CA identity
    pub fn ident(&self) -> NameId {
        self.info.read().unwrap().ident.clone()
    }

    async fn notify_publishers(&self, event: &CertPublishEvent, cert_id: i64) {
        let issuer_id = event.ca.id;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(event).await {
                warn!(
                    publisher = publisher.name(),
                    serial = %event.serial,
                    "publisher delivery failed, queueing: {}",
                    e
                );
                let _ = self
                    .store
                    .queue_publish(PublishQueueEntry {
                        publisher: publisher.name().to_string(),
                        issuer_id,
                        cert_id,
                    })
                    .await;
            }
        }
    }

    /// Issue a certificate for the granted template of `request`
    ///
    /// Idempotent by `(issuerId, serial)`: re-submission of a request
    /// whose profile derives the serial returns the stored certificate.
    pub async fn generate(
        &self,
        profile_ident: &NameId,
        profile: &CertProfile,
        request: &CertTemplateData,
        requestor_id: Option<u32>,
    ) -> Result<IssuedCertificate> {
        if self.info.read().unwrap().status != CaStatus::Active {
            return Err(CaError::NotPermitted(format!(
                "CA {} is not active",
                self.ident().name
            )));
        }
        let info = self.info();
        let template = build_granted_template(
            &info,
            profile,
            request,
            &self.signer_pool.algorithms(),
            &self.keypair_generators,
            Utc::now(),
        )
        .await?;

        if let Some(existing) = self.store.get_cert(info.ident.id, &template.serial).await? {
            debug!(serial = %template.serial, "issuance is idempotent, returning stored certificate");
            return Ok(IssuedCertificate {
                cert_der: existing.cert_der,
                serial: existing.serial,
                private_key: None,
                warning: template.warning,
                cert_req_id: request.cert_req_id,
            });
        }

        let signature_algorithm = asn1::signature_algorithm_identifier(template.signature_algo);
        let tbs = TbsCertificate {
            version: Version::V3,
            serial_number: asn1::serial_to_x509(&template.serial)?,
            signature: signature_algorithm.clone(),
            issuer: info.cert.subject.clone(),
            validity: Validity {
                not_before: asn1::to_asn1_time(template.not_before)?,
                not_after: asn1::to_asn1_time(template.not_after)?,
            },
            subject: template.subject.clone(),
            subject_public_key_info: template.spki.clone(),
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: Some(template.extensions.extensions.clone()),
        };
        let tbs_der = tbs.to_der()?;

        let signer = self
            .signer_pool
            .select(&[template.signature_algo])
            .ok_or_else(|| {
                CaError::SystemFailure("selected signer vanished from the pool".to_string())
            })?;
        let signature = self.signer_pool.sign(&signer, &tbs_der).await?;

        let certificate = Certificate {
            tbs_certificate: tbs,
            signature_algorithm,
            signature: BitString::from_bytes(&signature)?,
        };
        let cert_der = certificate.to_der()?;

        let record = CertRecord {
            id: self.id_generator.next_id()?,
            issuer_id: info.ident.id,
            serial: template.serial.clone(),
            subject: template.subject.to_string(),
            not_before: template.not_before,
            not_after: template.not_after,
            revocation: None,
            profile_id: profile_ident.id,
            requestor_id,
            cert_hash: self.certhash_algo.map(|algo| algo.digest(&cert_der)),
            cert_der: cert_der.clone(),
            crl_id: None,
        };
        let cert_id = record.id;
        self.store
            .add_cert(record)
            .await
            .map_err(|e| match e {
                CaError::AlreadyExists(msg) => CaError::AlreadyIssued(msg),
                other => other,
            })?;
        info!(ca = %info.ident.name, serial = %template.serial, "issued certificate");

        self.notify_publishers(
            &CertPublishEvent {
                ca: info.ident.clone(),
                serial: template.serial.clone(),
                cert_der: Some(cert_der.clone()),
                kind: PublishEventKind::Issued,
            },
            cert_id,
        )
        .await;

        Ok(IssuedCertificate {
            cert_der,
            serial: template.serial,
            private_key: template.private_key,
            warning: template.warning,
            cert_req_id: request.cert_req_id,
        })
    }

    /// Revoke (or suspend) a certificate
    pub async fn revoke(
        &self,
        serial: &Serial,
        reason: CrlReason,
        invalidity_time: Option<DateTime<Utc>>,
    ) -> Result<CertRecord> {
        let info = self.info();
        let revocation = RevocationInfo {
            reason,
            revocation_time: Utc::now(),
            invalidity_time,
        };
        let record = self
            .store
            .change_revocation(info.ident.id, serial, RevocationOp::Revoke(revocation.clone()))
            .await?;
        info!(ca = %info.ident.name, serial = %serial, reason = ?reason, "changed revocation");

        let kind = if reason == CrlReason::RemoveFromCrl {
            PublishEventKind::Unrevoked
        } else {
            PublishEventKind::Revoked(revocation)
        };
        self.notify_publishers(
            &CertPublishEvent {
                ca: info.ident.clone(),
                serial: serial.clone(),
                cert_der: Some(record.cert_der.clone()),
                kind,
            },
            record.id,
        )
        .await;
        Ok(record)
    }

    /// Release a certificate from `certificateHold`
    pub async fn unsuspend(&self, serial: &Serial) -> Result<CertRecord> {
        let info = self.info();
        let record = self
            .store
            .change_revocation(info.ident.id, serial, RevocationOp::Unsuspend)
            .await?;
        info!(ca = %info.ident.name, serial = %serial, "unsuspended certificate");

        self.notify_publishers(
            &CertPublishEvent {
                ca: info.ident.clone(),
                serial: serial.clone(),
                cert_der: Some(record.cert_der.clone()),
                kind: PublishEventKind::Unrevoked,
            },
            record.id,
        )
        .await;
        Ok(record)
    }

    /// Physically remove a certificate
    pub async fn remove(&self, serial: &Serial) -> Result<()> {
        let info = self.info();
        let record = self.store.remove_cert(info.ident.id, serial).await?;

        self.notify_publishers(
            &CertPublishEvent {
                ca: info.ident.clone(),
                serial: serial.clone(),
                cert_der: None,
                kind: PublishEventKind::Removed,
            },
            record.id,
        )
        .await;
        Ok(())
    }

    /// Re-deliver stored certificates to every publisher
    ///
    /// Pages through the store by row id; a per-certificate failure is
    /// recorded and the batch continues. `stop` is polled between
    /// certificates.
    pub async fn publish_certs(
        &self,
        batch_size: usize,
        stop: &AtomicBool,
    ) -> Result<RepublishReport> {
        let info = self.info();
        let mut report = RepublishReport::default();
        let mut min_id: Option<i64> = None;

        loop {
            let batch = self
                .store
                .list_certs(
                    &CertListFilter {
                        issuer_id: Some(info.ident.id),
                        min_id,
                        ..Default::default()
                    },
                    CertListOrder::Id,
                    batch_size.max(1),
                )
                .await?;
            if batch.is_empty() {
                break;
            }
            for record in &batch {
                if stop.load(Ordering::Relaxed) {
                    return Ok(report);
                }
                let kind = match &record.revocation {
                    Some(revocation) => PublishEventKind::Revoked(revocation.clone()),
                    None => PublishEventKind::Issued,
                };
                let event = CertPublishEvent {
                    ca: info.ident.clone(),
                    serial: record.serial.clone(),
                    cert_der: Some(record.cert_der.clone()),
                    kind,
                };
                let mut failed = false;
                for publisher in &self.publishers {
                    if let Err(e) = publisher.publish(&event).await {
                        report
                            .failures
                            .push((record.serial.clone(), format!("{}: {}", publisher.name(), e)));
                        failed = true;
                    }
                }
                if !failed {
                    report.published += 1;
                }
            }
            min_id = batch.last().map(|r| r.id);
        }
        Ok(report)
    }

    /// Generate and store a CRL
    pub async fn generate_crl(&self, on_demand: bool) -> Result<Vec<u8>> {
        let info = self.info();
        let control = info.crl_control.clone().ok_or_else(|| {
            CaError::CrlFailure(format!("CA {} has no CRL control", info.ident.name))
        })?;
        if on_demand {
            debug!(ca = %info.ident.name, "generating on-demand CRL");
        }

        let now = Utc::now();
        let crl_number = self
            .store
            .next_crl_number(info.ident.id)
            .await
            .map_err(|e| CaError::CrlFailure(e.to_string()))?;

        let mut revoked = self
            .store
            .list_certs(
                &CertListFilter {
                    issuer_id: Some(info.ident.id),
                    revoked: Some(true),
                    ..Default::default()
                },
                CertListOrder::RevocationTimeSerial,
                usize::MAX,
            )
            .await?;
        if !control.include_expired_certs {
            revoked.retain(|r| r.not_after >= now);
        }

        let mut entries: Vec<RevokedCert> = Vec::with_capacity(revoked.len());
        for record in &revoked {
            let revocation = record.revocation.as_ref().expect("filtered on revoked");
            let mut crl_entry_extensions: Vec<Extension> = vec![asn1::raw_extension(
                ext::REASON_CODE,
                false,
                asn1::crl_reason_value(revocation.reason.code()),
            )?];
            if let Some(invalidity) = revocation.invalidity_time {
                // invalidityDate is always a GeneralizedTime (RFC 5280
                // section 5.3.2), unlike the Time of the entry itself.
                let gt = der::asn1::GeneralizedTime::from_date_time(
                    der::DateTime::from_unix_duration(std::time::Duration::from_secs(
                        invalidity.timestamp().max(0) as u64,
                    ))?,
                );
                crl_entry_extensions.push(asn1::raw_extension(
                    ext::INVALIDITY_DATE,
                    false,
                    gt.to_der()?,
                )?);
            }
            entries.push(RevokedCert {
                serial_number: asn1::serial_to_x509(&record.serial)?,
                revocation_date: asn1::to_asn1_time(revocation.revocation_time)?,
                crl_entry_extensions: Some(crl_entry_extensions),
            });
        }

        let this_update = now;
        let next_update =
            now + Duration::hours((control.interval_hours + control.overlap_hours) as i64);

        let crl_extensions: Vec<Extension> = vec![
            asn1::extension(
                ext::AUTHORITY_KEY_IDENTIFIER,
                false,
                &x509_cert::ext::pkix::AuthorityKeyIdentifier {
                    key_identifier: Some(der::asn1::OctetString::new(info.cert.ski.clone())?),
                    authority_cert_issuer: None,
                    authority_cert_serial_number: None,
                },
            )?,
            asn1::raw_extension(ext::CRL_NUMBER, false, asn1::uint_value(crl_number)?)?,
        ];

        let preferred: Vec<_> = self.signer_pool.algorithms();
        let signer = self.signer_pool.select(&preferred).ok_or_else(|| {
            CaError::CrlFailure("CA owns no signer for CRL generation".to_string())
        })?;
        let signature_algorithm = asn1::signature_algorithm_identifier(signer.algorithm());

        let tbs = TbsCertList {
            version: Version::V2,
            signature: signature_algorithm.clone(),
            issuer: info.cert.subject.clone(),
            this_update: asn1::to_asn1_time(this_update)?,
            next_update: Some(asn1::to_asn1_time(next_update)?),
            revoked_certificates: if entries.is_empty() {
                None
            } else {
                Some(entries)
            },
            crl_extensions: Some(crl_extensions),
        };
        let tbs_der = tbs.to_der().map_err(|e| CaError::CrlFailure(e.to_string()))?;
        let signature = self
            .signer_pool
            .sign(&signer, &tbs_der)
            .await
            .map_err(|e| CaError::CrlFailure(e.to_string()))?;
        let crl = CertificateList {
            tbs_cert_list: tbs,
            signature_algorithm,
            signature: BitString::from_bytes(&signature)?,
        };
        let crl_der = crl.to_der().map_err(|e| CaError::CrlFailure(e.to_string()))?;

        let crl_info = CrlInfo {
            crl_id: self.id_generator.next_id()?,
            crl_number,
            this_update,
            next_update: Some(next_update),
        };
        self.store
            .add_crl(info.ident.id, crl_info, crl_der.clone())
            .await
            .map_err(|e| CaError::CrlFailure(e.to_string()))?;
        info!(ca = %info.ident.name, crl_number, "generated CRL");

        for publisher in &self.publishers {
            if let Err(e) = publisher.publish_crl(&info.ident, &crl_der).await {
                warn!(publisher = publisher.name(), "CRL delivery failed: {}", e);
            }
        }
        Ok(crl_der)
    }

    /// Revoke the CA itself; issued certificates inherit the revocation
    /// at OCSP time
    pub async fn revoke_ca(&self, revocation: RevocationInfo) -> Result<()> {
        let ident = {
            let mut info = self.info.write().unwrap();
            if info.revocation_info.is_some() {
                return Err(CaError::NotPermitted(format!(
                    "CA {} is already revoked",
                    info.ident.name
                )));
            }
            info.revocation_info = Some(revocation.clone());
            info.ident.clone()
        };
        self.store
            .update_issuer_revocation(ident.id, Some(revocation))
            .await?;
        warn!(ca = %ident.name, "CA revoked");
        Ok(())
    }

    /// Lift a CA-level revocation
    pub async fn unrevoke_ca(&self) -> Result<()> {
        let ident = {
            let mut info = self.info.write().unwrap();
            if info.revocation_info.is_none() {
                return Err(CaError::NotPermitted(format!(
                    "CA {} is not revoked",
                    info.ident.name
                )));
            }
            info.revocation_info = None;
            info.ident.clone()
        };
        self.store.update_issuer_revocation(ident.id, None).await?;
        info!(ca = %ident.name, "CA revocation lifted");
        Ok(())
    }
}
