// Copyright (c) 2025 - Cowboy AI, LLC.

//! Authoritative certificate store
//!
//! The [`CertStore`] trait contracts the logical tables (`issuer`,
//! `cert`, `crl_info`, `system_event`, `publish_queue`, `dbschema`,
//! entity registries) without committing to a dialect; one operation is
//! one transaction. [`MemoryCertStore`] is the reference implementation
//! used by tests and the OCSP refresh path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::types::{CrlInfo, CrlReason, NameId, RevocationInfo, Serial, SystemEvent};
use crate::{CaError, Result};

/// Reserved DBSCHEMA keys that are immutable after initialization
pub const RESERVED_DBSCHEMA_KEYS: &[&str] = &["VERSION", "VENDOR", "X500NAME_MAXLEN"];

/// DBSCHEMA key naming the certificate hash algorithm
pub const DBSCHEMA_CERTHASH_ALGO: &str = "CERTHASH_ALGO";

/// One certificate row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRecord {
    /// Row id (unique-id-generator value)
    pub id: i64,
    /// Issuing CA id
    pub issuer_id: u32,
    /// Serial number, unique per issuer
    pub serial: Serial,
    /// Subject as an RFC 4514 string, for listing
    pub subject: String,
    /// notBefore of the certificate
    pub not_before: DateTime<Utc>,
    /// notAfter of the certificate
    pub not_after: DateTime<Utc>,
    /// Revocation state
    pub revocation: Option<RevocationInfo>,
    /// Profile the certificate was issued under
    pub profile_id: u32,
    /// Requestor that asked for the certificate
    pub requestor_id: Option<u32>,
    /// Certificate hash under the store's CERTHASH_ALGO
    pub cert_hash: Option<Vec<u8>>,
    /// DER of the certificate
    pub cert_der: Vec<u8>,
    /// CRL the revocation was published in
    pub crl_id: Option<i64>,
}

/// One issuer row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerRecord {
    /// Issuer id (CA id)
    pub id: u32,
    /// DER of the CA certificate
    pub cert_der: Vec<u8>,
    /// SHA-1 fingerprint of the CA certificate
    pub sha1_fp: Vec<u8>,
    /// CA-level revocation
    pub revocation: Option<RevocationInfo>,
    /// Latest CRL id of this issuer
    pub crl_id: Option<i64>,
}

/// Filter for certificate listing
#[derive(Debug, Clone, Default)]
pub struct CertListFilter {
    /// Restrict to one issuer
    pub issuer_id: Option<u32>,
    /// Restrict by revocation state
    pub revoked: Option<bool>,
    /// Only certificates valid at this time
    pub valid_at: Option<DateTime<Utc>>,
    /// Only certificates with `id > min_id` (bulk-republish paging)
    pub min_id: Option<i64>,
}

/// Sort order for certificate listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertListOrder {
    /// By row id
    #[default]
    Id,
    /// By serial number
    Serial,
    /// By `(revocationTime, serial)` (CRL building)
    RevocationTimeSerial,
}

/// Revocation state change of one certificate
#[derive(Debug, Clone)]
pub enum RevocationOp {
    /// Revoke or suspend
    Revoke(RevocationInfo),
    /// Release from `certificateHold`
    Unsuspend,
}

/// Kinds of registered entities whose name/id pairs the store persists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Certification authorities
    Ca,
    /// Certificate profiles
    Profile,
    /// Publishers
    Publisher,
    /// Requestors
    Requestor,
}

/// A queued publisher delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishQueueEntry {
    /// Publisher name
    pub publisher: String,
    /// Issuing CA id
    pub issuer_id: u32,
    /// Certificate row id
    pub cert_id: i64,
}

/// The authoritative store contract
#[async_trait]
pub trait CertStore: Send + Sync {
    /// Insert a certificate row; `(issuer_id, serial)` is unique
    async fn add_cert(&self, record: CertRecord) -> Result<()>;

    /// Certificate by `(issuer_id, serial)`
    async fn get_cert(&self, issuer_id: u32, serial: &Serial) -> Result<Option<CertRecord>>;

    /// Certificate by row id
    async fn get_cert_by_id(&self, id: i64) -> Result<Option<CertRecord>>;

    /// Change the revocation state, enforcing the transition rules
    async fn change_revocation(
        &self,
        issuer_id: u32,
        serial: &Serial,
        op: RevocationOp,
    ) -> Result<CertRecord>;

    /// Physically remove a certificate row
    async fn remove_cert(&self, issuer_id: u32, serial: &Serial) -> Result<CertRecord>;

    /// List certificates
    async fn list_certs(
        &self,
        filter: &CertListFilter,
        order: CertListOrder,
        limit: usize,
    ) -> Result<Vec<CertRecord>>;

    /// Reserve and commit the next CRL number of a CA
    async fn next_crl_number(&self, ca_id: u32) -> Result<u64>;

    /// Store a published CRL
    async fn add_crl(&self, ca_id: u32, info: CrlInfo, crl_der: Vec<u8>) -> Result<()>;

    /// Latest CRL metadata of a CA
    async fn get_crl_info(&self, ca_id: u32) -> Result<Option<CrlInfo>>;

    /// Latest CRL DER of a CA
    async fn get_current_crl(&self, ca_id: u32) -> Result<Option<Vec<u8>>>;

    /// Insert or replace an issuer row
    async fn add_issuer(&self, record: IssuerRecord) -> Result<()>;

    /// All issuer rows
    async fn list_issuers(&self) -> Result<Vec<IssuerRecord>>;

    /// Update the CA-level revocation of an issuer
    async fn update_issuer_revocation(
        &self,
        issuer_id: u32,
        revocation: Option<RevocationInfo>,
    ) -> Result<()>;

    /// Read a system event
    async fn get_system_event(&self, name: &str) -> Result<Option<SystemEvent>>;

    /// Replace a system event
    async fn change_system_event(&self, event: SystemEvent) -> Result<()>;

    /// Delete a system event
    async fn delete_system_event(&self, name: &str) -> Result<()>;

    /// Read a DBSCHEMA value
    async fn get_dbschema(&self, key: &str) -> Result<Option<String>>;

    /// Set a DBSCHEMA value; reserved keys are immutable
    async fn set_dbschema(&self, key: &str, value: &str) -> Result<()>;

    /// Register an entity name/id pair
    async fn add_entity(&self, kind: EntityKind, entity: NameId) -> Result<()>;

    /// Remove an entity registration
    async fn remove_entity(&self, kind: EntityKind, id: u32) -> Result<()>;

    /// All registered entities of a kind
    async fn entities(&self, kind: EntityKind) -> Result<Vec<NameId>>;

    /// Queue a failed publisher delivery for republish
    async fn queue_publish(&self, entry: PublishQueueEntry) -> Result<()>;

    /// Drain up to `limit` queued deliveries
    async fn drain_publish_queue(&self, limit: usize) -> Result<Vec<PublishQueueEntry>>;
}

#[derive(Default)]
struct StoreTables {
    certs: HashMap<(u32, Serial), CertRecord>,
    cert_ids: HashMap<i64, (u32, Serial)>,
    issuers: HashMap<u32, IssuerRecord>,
    crls: HashMap<u32, Vec<(CrlInfo, Vec<u8>)>>,
    crl_numbers: HashMap<u32, u64>,
    next_crl_id: i64,
    system_events: HashMap<String, SystemEvent>,
    dbschema: HashMap<String, String>,
    entities: HashMap<EntityKind, Vec<NameId>>,
    publish_queue: Vec<PublishQueueEntry>,
}

/// In-memory reference implementation of [`CertStore`]
pub struct MemoryCertStore {
    tables: RwLock<StoreTables>,
}

impl MemoryCertStore {
    /// Create a store seeded with the reserved DBSCHEMA rows
    pub fn new() -> Self {
        let mut dbschema = HashMap::new();
        dbschema.insert("VERSION".to_string(), "9".to_string());
        dbschema.insert("VENDOR".to_string(), "CIM".to_string());
        dbschema.insert("X500NAME_MAXLEN".to_string(), "350".to_string());
        Self {
            tables: RwLock::new(StoreTables {
                dbschema,
                next_crl_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Seed the CERTHASH_ALGO schema row
    pub fn with_certhash_algo(self, algo: &str) -> Self {
        self.tables
            .write()
            .unwrap()
            .dbschema
            .insert(DBSCHEMA_CERTHASH_ALGO.to_string(), algo.to_string());
        self
    }
}

impl Default for MemoryCertStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertStore for MemoryCertStore {
    async fn add_cert(&self, record: CertRecord) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let key = (record.issuer_id, record.serial.clone());
        if tables.certs.contains_key(&key) {
            return Err(CaError::AlreadyExists(format!(
                "certificate {} of issuer {}",
                record.serial, record.issuer_id
            )));
        }
        tables.cert_ids.insert(record.id, key.clone());
        debug!(issuer = record.issuer_id, serial = %record.serial, "stored certificate");
        tables.certs.insert(key, record);
        Ok(())
    }

    async fn get_cert(&self, issuer_id: u32, serial: &Serial) -> Result<Option<CertRecord>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.certs.get(&(issuer_id, serial.clone())).cloned())
    }

    async fn get_cert_by_id(&self, id: i64) -> Result<Option<CertRecord>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .cert_ids
            .get(&id)
            .and_then(|key| tables.certs.get(key))
            .cloned())
    }

    async fn change_revocation(
        &self,
        issuer_id: u32,
        serial: &Serial,
        op: RevocationOp,
    ) -> Result<CertRecord> {
        let mut tables = self.tables.write().unwrap();
        let record = tables
            .certs
            .get_mut(&(issuer_id, serial.clone()))
            .ok_or_else(|| {
                CaError::NotFound(format!("certificate {} of issuer {}", serial, issuer_id))
            })?;

        match op {
            RevocationOp::Revoke(info) => {
                let on_hold = record
                    .revocation
                    .as_ref()
                    .map(|r| r.reason == CrlReason::CertificateHold)
                    .unwrap_or(false);
                if info.reason == CrlReason::RemoveFromCrl {
                    if !on_hold {
                        return Err(CaError::NotPermitted(
                            "removeFromCRL is only valid for certificates on hold".to_string(),
                        ));
                    }
                    record.revocation = None;
                } else if record.revocation.is_some() && !on_hold {
                    return Err(CaError::NotPermitted(format!(
                        "certificate {} is already revoked",
                        serial
                    )));
                } else {
                    record.revocation = Some(info);
                }
            }
            RevocationOp::Unsuspend => {
                let on_hold = record
                    .revocation
                    .as_ref()
                    .map(|r| r.reason == CrlReason::CertificateHold)
                    .unwrap_or(false);
                if !on_hold {
                    return Err(CaError::NotPermitted(format!(
                        "certificate {} is not on hold",
                        serial
                    )));
                }
                record.revocation = None;
            }
        }
        Ok(record.clone())
    }

    async fn remove_cert(&self, issuer_id: u32, serial: &Serial) -> Result<CertRecord> {
        let mut tables = self.tables.write().unwrap();
        let record = tables
            .certs
            .remove(&(issuer_id, serial.clone()))
            .ok_or_else(|| {
                CaError::NotFound(format!("certificate {} of issuer {}", serial, issuer_id))
            })?;
        tables.cert_ids.remove(&record.id);
        info!(issuer = issuer_id, serial = %serial, "removed certificate");
        Ok(record)
    }

    async fn list_certs(
        &self,
        filter: &CertListFilter,
        order: CertListOrder,
        limit: usize,
    ) -> Result<Vec<CertRecord>> {
        let tables = self.tables.read().unwrap();
        let mut records: Vec<CertRecord> = tables
            .certs
            .values()
            .filter(|r| {
                filter.issuer_id.map(|id| r.issuer_id == id).unwrap_or(true)
                    && filter
                        .revoked
                        .map(|want| r.revocation.is_some() == want)
                        .unwrap_or(true)
                    && filter
                        .valid_at
                        .map(|t| r.not_before <= t && t <= r.not_after)
                        .unwrap_or(true)
                    && filter.min_id.map(|min| r.id > min).unwrap_or(true)
            })
            .cloned()
            .collect();
        match order {
            CertListOrder::Id => records.sort_by_key(|r| r.id),
            CertListOrder::Serial => records.sort_by(|a, b| a.serial.cmp(&b.serial)),
            CertListOrder::RevocationTimeSerial => records.sort_by(|a, b| {
                let ta = a.revocation.as_ref().map(|r| r.revocation_time);
                let tb = b.revocation.as_ref().map(|r| r.revocation_time);
                ta.cmp(&tb).then_with(|| a.serial.cmp(&b.serial))
            }),
        }
        records.truncate(limit);
        Ok(records)
    }

    async fn next_crl_number(&self, ca_id: u32) -> Result<u64> {
        let mut tables = self.tables.write().unwrap();
        let next = tables.crl_numbers.entry(ca_id).or_insert(1);
        let reserved = *next;
        *next += 1;
        Ok(reserved)
    }

    async fn add_crl(&self, ca_id: u32, info: CrlInfo, crl_der: Vec<u8>) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let crl_id = info.crl_id;
        tables.crls.entry(ca_id).or_default().push((info, crl_der));
        tables.next_crl_id = tables.next_crl_id.max(crl_id + 1);
        if let Some(issuer) = tables.issuers.get_mut(&ca_id) {
            issuer.crl_id = Some(crl_id);
        }
        Ok(())
    }

    async fn get_crl_info(&self, ca_id: u32) -> Result<Option<CrlInfo>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .crls
            .get(&ca_id)
            .and_then(|crls| crls.last())
            .map(|(info, _)| info.clone()))
    }

    async fn get_current_crl(&self, ca_id: u32) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .crls
            .get(&ca_id)
            .and_then(|crls| crls.last())
            .map(|(_, der)| der.clone()))
    }

    async fn add_issuer(&self, record: IssuerRecord) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        tables.issuers.insert(record.id, record);
        Ok(())
    }

    async fn list_issuers(&self) -> Result<Vec<IssuerRecord>> {
        let tables = self.tables.read().unwrap();
        let mut issuers: Vec<IssuerRecord> = tables.issuers.values().cloned().collect();
        issuers.sort_by_key(|r| r.id);
        Ok(issuers)
    }

    async fn update_issuer_revocation(
        &self,
        issuer_id: u32,
        revocation: Option<RevocationInfo>,
    ) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let issuer = tables
            .issuers
            .get_mut(&issuer_id)
            .ok_or_else(|| CaError::NotFound(format!("issuer {}", issuer_id)))?;
        issuer.revocation = revocation;
        Ok(())
    }

    async fn get_system_event(&self, name: &str) -> Result<Option<SystemEvent>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.system_events.get(name).cloned())
    }

    async fn change_system_event(&self, event: SystemEvent) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        tables.system_events.insert(event.name.clone(), event);
        Ok(())
    }

    async fn delete_system_event(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        tables.system_events.remove(name);
        Ok(())
    }

    async fn get_dbschema(&self, key: &str) -> Result<Option<String>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.dbschema.get(key).cloned())
    }

    async fn set_dbschema(&self, key: &str, value: &str) -> Result<()> {
        if RESERVED_DBSCHEMA_KEYS.contains(&key) {
            return Err(CaError::NotPermitted(format!(
                "DBSCHEMA key {} is immutable",
                key
            )));
        }
        let mut tables = self.tables.write().unwrap();
        tables.dbschema.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn add_entity(&self, kind: EntityKind, entity: NameId) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let entities = tables.entities.entry(kind).or_default();
        if entities.iter().any(|e| e.id == entity.id || e.name == entity.name) {
            return Err(CaError::AlreadyExists(format!("{:?} {}", kind, entity)));
        }
        entities.push(entity);
        Ok(())
    }

    async fn remove_entity(&self, kind: EntityKind, id: u32) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        if let Some(entities) = tables.entities.get_mut(&kind) {
            entities.retain(|e| e.id != id);
        }
        Ok(())
    }

    async fn entities(&self, kind: EntityKind) -> Result<Vec<NameId>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.entities.get(&kind).cloned().unwrap_or_default())
    }

    async fn queue_publish(&self, entry: PublishQueueEntry) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        tables.publish_queue.push(entry);
        Ok(())
    }

    async fn drain_publish_queue(&self, limit: usize) -> Result<Vec<PublishQueueEntry>> {
        let mut tables = self.tables.write().unwrap();
        let n = limit.min(tables.publish_queue.len());
        Ok(tables.publish_queue.drain(..n).collect())
    }
}
