// Copyright (c) 2025 - Cowboy AI, LLC.

//! OCSP status engine
//!
//! Resolves `(issuer, serial)` to a certificate status with
//! CRL-freshness awareness, archive-cutoff and CA-revocation
//! inheritance. The RFC 6960 wire encoder is out of scope; this layer
//! returns typed [`CertStatusInfo`] values.

pub mod issuer;
pub mod refresh;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::OcspStoreError;
use crate::store::{CertStore, DBSCHEMA_CERTHASH_ALGO};
use crate::types::{CrlReason, HashAlgo, RevocationInfo, Serial};

pub use issuer::{IssuerEntry, IssuerSnapshot, IssuerStore, RequestIssuer};
pub use refresh::{RefresherHandle, StoreRefresher};

/// Margin before `nextUpdate` at which a CRL already counts as expired
const CRL_EXPIRY_MARGIN_SECS: i64 = 300;

/// Underlying status of a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertStatus {
    /// Certificate is good
    Good,
    /// Certificate is revoked
    Revoked(RevocationInfo),
    /// Certificate is unknown to this responder
    Unknown,
    /// Certificate exists but is ignored by store policy
    Ignore,
    /// The issuer's CRL is expired and the store refuses to answer
    CrlExpired,
}

/// Certificate hash attached to a status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertHash {
    /// Hash algorithm
    pub algo: HashAlgo,
    /// Hash value
    pub value: Vec<u8>,
}

/// A resolved certificate status with its freshness metadata
#[derive(Debug, Clone)]
pub struct CertStatusInfo {
    /// The status
    pub status: CertStatus,
    /// thisUpdate of the answer
    pub this_update: DateTime<Utc>,
    /// nextUpdate of the answer
    pub next_update: Option<DateTime<Utc>>,
    /// Certificate hash, when requested and available
    pub cert_hash: Option<CertHash>,
    /// Archive cutoff, when configured
    pub archive_cutoff: Option<DateTime<Utc>>,
}

impl CertStatusInfo {
    fn new(status: CertStatus, this_update: DateTime<Utc>, next_update: Option<DateTime<Utc>>) -> Self {
        Self {
            status,
            this_update,
            next_update,
            cert_hash: None,
            archive_cutoff: None,
        }
    }
}

/// Behaviour for certificates the store does not know
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnknownCertBehaviour {
    /// Answer `unknown`
    #[default]
    Unknown,
    /// Answer `good` (closed PKI hierarchies)
    Good,
}

/// Options of one OCSP certificate store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcspStoreOptions {
    /// Store name
    pub name: String,
    /// Issuer-index refresh interval in seconds
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    /// Refuse to answer from expired CRLs
    #[serde(default)]
    pub ignore_expired_crls: bool,
    /// Ignore certificates that are not yet valid
    #[serde(default)]
    pub ignore_not_yet_valid_certs: bool,
    /// Ignore expired certificates
    #[serde(default)]
    pub ignore_expired_certs: bool,
    /// Archive-cutoff retention in days; negative means "the CA's
    /// notBefore"
    #[serde(default)]
    pub retention_interval_days: Option<i32>,
    /// Behaviour for unknown certificates
    #[serde(default)]
    pub unknown_cert_behaviour: UnknownCertBehaviour,
    /// The store answers with certificate hashes
    #[serde(default)]
    pub support_cert_hash: bool,
}

fn default_update_interval() -> u64 {
    300
}

/// The OCSP status engine over one certificate store
pub struct OcspCertStore {
    options: OcspStoreOptions,
    store: Arc<dyn CertStore>,
    issuer_store: Arc<IssuerStore>,
    certhash_algo: Option<HashAlgo>,
}

impl OcspCertStore {
    /// Initialize the engine
    ///
    /// Fails when `support_cert_hash` is set but the store's DBSCHEMA
    /// carries no `CERTHASH_ALGO`.
    pub async fn initialize(
        options: OcspStoreOptions,
        store: Arc<dyn CertStore>,
        issuer_store: Arc<IssuerStore>,
    ) -> Result<Self, OcspStoreError> {
        let certhash_algo = match store.get_dbschema(DBSCHEMA_CERTHASH_ALGO).await? {
            Some(name) => Some(HashAlgo::from_name(&name).ok_or_else(|| {
                OcspStoreError::NotInitialized(format!("unsupported CERTHASH_ALGO {}", name))
            })?),
            None => None,
        };
        if options.support_cert_hash && certhash_algo.is_none() {
            return Err(OcspStoreError::NotInitialized(
                "CERTHASH_ALGO missing from DBSCHEMA".to_string(),
            ));
        }
        Ok(Self {
            options,
            store,
            issuer_store,
            certhash_algo,
        })
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Configured refresh interval for the issuer index
    pub fn update_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.options.update_interval_secs)
    }

    /// The issuer index backing this store
    pub fn issuer_store(&self) -> &Arc<IssuerStore> {
        &self.issuer_store
    }

    /// True when the responder answers for the request issuer
    pub fn knows_issuer(&self, request: &RequestIssuer) -> bool {
        self.issuer_store.knows_issuer(request)
    }

    /// DER of the matching issuer certificate
    pub fn issuer_cert(&self, request: &RequestIssuer) -> Option<Vec<u8>> {
        self.issuer_store
            .snapshot()
            .issuer_for_request(request)
            .map(|e| e.cert_der.clone())
    }

    /// Resolve the status of `(issuer, serial)` at `time`
    ///
    /// Returns `None` when the issuer is unknown: the caller treats that
    /// as "not my responsibility". The store query runs in the variant
    /// matching `include_cert_hash` and `include_invalidity` (with or
    /// without the respective columns).
    pub async fn get_cert_status(
        &self,
        time: DateTime<Utc>,
        request_issuer: &RequestIssuer,
        serial: &Serial,
        include_cert_hash: bool,
        include_invalidity: bool,
        inherit_ca_revocation: bool,
    ) -> Result<Option<CertStatusInfo>, OcspStoreError> {
        let snapshot = self.issuer_store.snapshot();

        // 1. Non-positive serials can never have been issued.
        if serial.is_zero() {
            return Ok(Some(CertStatusInfo::new(CertStatus::Unknown, time, None)));
        }

        // 2. Issuer lookup.
        let issuer = match snapshot.issuer_for_request(request_issuer) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        // 3. CRL freshness.
        let crl_info = snapshot.crl_infos.get(&issuer.id);
        if self.options.ignore_expired_crls {
            if let Some(next_update) = crl_info.and_then(|ci| ci.next_update) {
                if next_update < time + Duration::seconds(CRL_EXPIRY_MARGIN_SECS) {
                    debug!(store = %self.options.name, issuer = issuer.id, "CRL expired");
                    return Ok(Some(CertStatusInfo::new(CertStatus::CrlExpired, time, None)));
                }
            }
        }
        let this_update = crl_info.map(|ci| ci.this_update).unwrap_or(time);
        let next_update = crl_info.and_then(|ci| ci.next_update);

        // 4./5. Store lookup; absent means unknown.
        let record = self
            .store
            .get_cert(issuer.id, serial)
            .await
            .map_err(OcspStoreError::from)?;

        let mut status_info = match record {
            None => CertStatusInfo::new(CertStatus::Unknown, this_update, next_update),
            Some(record) => {
                // 6. Store policy filters.
                if self.options.ignore_not_yet_valid_certs && time < record.not_before {
                    CertStatusInfo::new(CertStatus::Ignore, this_update, next_update)
                } else if self.options.ignore_expired_certs && time > record.not_after {
                    CertStatusInfo::new(CertStatus::Ignore, this_update, next_update)
                } else if let Some(revocation) = &record.revocation {
                    // 7. Revoked.
                    let mut revocation = revocation.clone();
                    if !include_invalidity {
                        revocation.invalidity_time = None;
                    }
                    let mut info = CertStatusInfo::new(
                        CertStatus::Revoked(revocation),
                        this_update,
                        next_update,
                    );
                    info.cert_hash = self.cert_hash_of(include_cert_hash, &record);
                    info
                } else {
                    // 8. Good.
                    let mut info =
                        CertStatusInfo::new(CertStatus::Good, this_update, next_update);
                    info.cert_hash = self.cert_hash_of(include_cert_hash, &record);
                    info
                }
            }
        };

        // 10. Archive cutoff.
        if let Some(retention_days) = self.options.retention_interval_days {
            status_info.archive_cutoff = Some(if retention_days < 0 {
                issuer.not_before
            } else {
                issuer
                    .not_before
                    .min(time - Duration::days(retention_days as i64))
            });
        }

        // 11. CA-revocation inheritance.
        if inherit_ca_revocation {
            if let Some(ca_revocation) = &issuer.revocation_info {
                if self.should_inherit(&status_info.status, ca_revocation) {
                    let inherited = if ca_revocation.reason == CrlReason::CaCompromise {
                        ca_revocation.clone()
                    } else {
                        RevocationInfo {
                            reason: CrlReason::CaCompromise,
                            revocation_time: ca_revocation.revocation_time,
                            invalidity_time: ca_revocation.invalidity_time,
                        }
                    };
                    status_info.status = CertStatus::Revoked(inherited);
                }
            }
        }

        Ok(Some(status_info))
    }

    fn cert_hash_of(&self, include: bool, record: &crate::store::CertRecord) -> Option<CertHash> {
        if !include {
            return None;
        }
        match (self.certhash_algo, &record.cert_hash) {
            (Some(algo), Some(value)) => Some(CertHash {
                algo,
                value: value.clone(),
            }),
            _ => None,
        }
    }

    /// The inheritance table: which underlying statuses a CA revocation
    /// replaces
    fn should_inherit(&self, status: &CertStatus, ca_revocation: &RevocationInfo) -> bool {
        match status {
            CertStatus::Good => true,
            CertStatus::Unknown | CertStatus::Ignore => {
                self.options.unknown_cert_behaviour == UnknownCertBehaviour::Good
            }
            CertStatus::Revoked(revocation) => {
                revocation.revocation_time > ca_revocation.revocation_time
            }
            CertStatus::CrlExpired => false,
        }
    }
}
