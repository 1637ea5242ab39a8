// Copyright (c) 2025 - Cowboy AI, LLC.

//! In-memory issuer index
//!
//! Holds an immutable snapshot of `{issuers, ids, crlInfos}` behind one
//! swap point: readers always observe a consistent generation, never a
//! partial mix. Per-request-algorithm issuer hashes are computed lazily
//! and cached per entry.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::OcspStoreError;
use crate::store::IssuerRecord;
use crate::types::{CrlInfo, HashAlgo, RevocationInfo};

/// The issuer half of an OCSP request: hashes of the issuer name and key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIssuer {
    /// Hash algorithm of both hashes
    pub hash_algo: HashAlgo,
    /// Hash of the DER-encoded issuer DN
    pub name_hash: Vec<u8>,
    /// Hash of the issuer's subjectPublicKey BIT STRING contents
    pub key_hash: Vec<u8>,
}

impl RequestIssuer {
    /// Compute the request hashes from an issuer certificate
    pub fn from_cert_der(hash_algo: HashAlgo, issuer_cert_der: &[u8]) -> Result<Self, OcspStoreError> {
        let (subject_der, spk_bits) = parse_name_and_key(issuer_cert_der)?;
        Ok(Self {
            hash_algo,
            name_hash: hash_algo.digest(&subject_der),
            key_hash: hash_algo.digest(&spk_bits),
        })
    }
}

fn parse_name_and_key(cert_der: &[u8]) -> Result<(Vec<u8>, Vec<u8>), OcspStoreError> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| OcspStoreError::IssuerDecode(format!("invalid certificate: {}", e)))?;
    let tbs = &cert.tbs_certificate;
    Ok((
        tbs.subject.as_raw().to_vec(),
        tbs.subject_pki.subject_public_key.data.to_vec(),
    ))
}

/// One issuer known to the OCSP responder
pub struct IssuerEntry {
    /// Issuer id
    pub id: u32,
    /// DER of the issuer certificate
    pub cert_der: Vec<u8>,
    /// DER of the issuer subject DN
    pub subject_der: Vec<u8>,
    /// subjectPublicKey BIT STRING contents
    pub spk_bits: Vec<u8>,
    /// SHA-1 fingerprint of the certificate
    pub sha1_fp: Vec<u8>,
    /// Subject key identifier
    pub subject_key_identifier: Vec<u8>,
    /// notBefore of the issuer certificate
    pub not_before: DateTime<Utc>,
    /// CA-level revocation
    pub revocation_info: Option<RevocationInfo>,
    /// Latest CRL id of this issuer
    pub crl_id: Option<i64>,
    /// Lazily computed `(nameHash, keyHash)` per algorithm
    hashes: RwLock<HashMap<HashAlgo, (Vec<u8>, Vec<u8>)>>,
}

impl IssuerEntry {
    /// Decode an issuer row into an index entry
    pub fn from_record(record: &IssuerRecord) -> Result<Self, OcspStoreError> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(&record.cert_der)
            .map_err(|e| OcspStoreError::IssuerDecode(format!("invalid certificate: {}", e)))?;
        let tbs = &cert.tbs_certificate;
        let subject_der = tbs.subject.as_raw().to_vec();
        let spk_bits = tbs.subject_pki.subject_public_key.data.to_vec();
        let not_before = DateTime::<Utc>::from_timestamp(tbs.validity.not_before.timestamp(), 0)
            .ok_or_else(|| OcspStoreError::IssuerDecode("invalid notBefore".to_string()))?;

        let mut ski: Option<Vec<u8>> = None;
        for extension in cert.extensions() {
            if let ParsedExtension::SubjectKeyIdentifier(ki) = extension.parsed_extension() {
                ski = Some(ki.0.to_vec());
            }
        }
        let subject_key_identifier =
            ski.unwrap_or_else(|| HashAlgo::Sha1.digest(&spk_bits));

        Ok(Self {
            id: record.id,
            cert_der: record.cert_der.clone(),
            subject_der,
            spk_bits,
            sha1_fp: record.sha1_fp.clone(),
            subject_key_identifier,
            not_before,
            revocation_info: record.revocation.clone(),
            crl_id: record.crl_id,
            hashes: RwLock::new(HashMap::new()),
        })
    }

    /// `(nameHash, keyHash)` under `algo`, computed on first use
    pub fn hashes_for(&self, algo: HashAlgo) -> (Vec<u8>, Vec<u8>) {
        if let Some(pair) = self.hashes.read().unwrap().get(&algo) {
            return pair.clone();
        }
        let pair = (
            algo.digest(&self.subject_der),
            algo.digest(&self.spk_bits),
        );
        self.hashes
            .write()
            .unwrap()
            .insert(algo, pair.clone());
        pair
    }

    /// True when this entry matches the request's `(nameHash, keyHash)`
    pub fn matches(&self, request: &RequestIssuer) -> bool {
        let (name_hash, key_hash) = self.hashes_for(request.hash_algo);
        name_hash == request.name_hash && key_hash == request.key_hash
    }
}

impl std::fmt::Debug for IssuerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerEntry")
            .field("id", &self.id)
            .field("sha1_fp", &hex::encode(&self.sha1_fp))
            .field("revoked", &self.revocation_info.is_some())
            .finish()
    }
}

/// One immutable generation of the issuer index
#[derive(Debug)]
pub struct IssuerSnapshot {
    /// All known issuers
    pub issuers: Vec<Arc<IssuerEntry>>,
    /// Ids of all known issuers
    pub ids: BTreeSet<u32>,
    /// CRL metadata by issuer id
    pub crl_infos: HashMap<u32, CrlInfo>,
    /// Generation counter, bumped on every swap
    pub generation: u64,
}

impl IssuerSnapshot {
    fn empty() -> Self {
        Self {
            issuers: Vec::new(),
            ids: BTreeSet::new(),
            crl_infos: HashMap::new(),
            generation: 0,
        }
    }

    /// Linear scan for the entry matching a request issuer
    pub fn issuer_for_request(&self, request: &RequestIssuer) -> Option<Arc<IssuerEntry>> {
        self.issuers.iter().find(|e| e.matches(request)).cloned()
    }
}

/// The swap point of the issuer index
///
/// `issuers`, `ids` and `crl_infos` are replaced together inside one
/// critical section; readers take the current `Arc` and keep a
/// consistent view for as long as they hold it.
pub struct IssuerStore {
    current: RwLock<Arc<IssuerSnapshot>>,
}

impl IssuerStore {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(IssuerSnapshot::empty())),
        }
    }

    /// The current snapshot
    pub fn snapshot(&self) -> Arc<IssuerSnapshot> {
        self.current.read().unwrap().clone()
    }

    /// Replace the index atomically
    pub fn set_issuers(
        &self,
        issuers: Vec<Arc<IssuerEntry>>,
        crl_infos: HashMap<u32, CrlInfo>,
    ) {
        let ids = issuers.iter().map(|e| e.id).collect();
        let mut current = self.current.write().unwrap();
        let next = IssuerSnapshot {
            issuers,
            ids,
            crl_infos,
            generation: current.generation + 1,
        };
        *current = Arc::new(next);
    }

    /// True when an issuer matching the request is known
    pub fn knows_issuer(&self, request: &RequestIssuer) -> bool {
        self.snapshot().issuer_for_request(request).is_some()
    }
}

impl Default for IssuerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_swap_replaces_ids_and_issuers_together() {
        let store = IssuerStore::new();
        let before = store.snapshot();
        assert_eq!(before.generation, 0);
        assert!(before.ids.is_empty());

        store.set_issuers(Vec::new(), HashMap::new());
        let after = store.snapshot();
        assert_eq!(after.generation, 1);

        // The old snapshot is untouched.
        assert_eq!(before.generation, 0);
    }
}
