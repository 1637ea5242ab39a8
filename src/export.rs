// Copyright (c) 2025 - Cowboy AI, LLC.

//! Configuration import/export
//!
//! The full manager configuration is exported as one gzip-compressed
//! JSON bundle: profiles, publishers, keypair generators, requestors,
//! signers, CA entries, aliases and cross-links.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};

use crate::manager::{CaEntry, KeypairGenEntry, ProfileEntry, PublisherEntry, RequestorEntry,
    SignerEntry};
use crate::{CaError, Result};

/// The exported configuration bundle
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfBundle {
    /// CA definitions
    #[serde(default)]
    pub ca_entries: Vec<CaEntry>,
    /// Profile definitions
    #[serde(default)]
    pub profile_entries: Vec<ProfileEntry>,
    /// Publisher definitions
    #[serde(default)]
    pub publisher_entries: Vec<PublisherEntry>,
    /// Requestor definitions
    #[serde(default)]
    pub requestor_entries: Vec<RequestorEntry>,
    /// Signer definitions
    #[serde(default)]
    pub signer_entries: Vec<SignerEntry>,
    /// Keypair generator definitions
    #[serde(default)]
    pub keypair_gen_entries: Vec<KeypairGenEntry>,
    /// CA aliases
    #[serde(default)]
    pub ca_aliases: HashMap<String, String>,
    /// CA ↔ profile bindings
    #[serde(default)]
    pub ca_has_profiles: HashMap<String, BTreeSet<String>>,
    /// CA ↔ publisher bindings
    #[serde(default)]
    pub ca_has_publishers: HashMap<String, BTreeSet<String>>,
    /// CA ↔ requestor bindings
    #[serde(default)]
    pub ca_has_requestors: HashMap<String, BTreeSet<String>>,
}

/// Serialize and compress a bundle
pub fn to_archive(bundle: &ConfBundle) -> Result<Vec<u8>> {
    let json = serde_json::to_vec_pretty(bundle)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decompress and parse a bundle
pub fn from_archive(archive: &[u8]) -> Result<ConfBundle> {
    let mut decoder = GzDecoder::new(archive);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| CaError::InvalidConf(format!("invalid configuration archive: {}", e)))?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_round_trips() {
        let bundle = ConfBundle {
            ca_aliases: HashMap::from([("default".to_string(), "my-ca".to_string())]),
            ..Default::default()
        };
        let archive = to_archive(&bundle).unwrap();
        // gzip magic
        assert_eq!(&archive[..2], &[0x1F, 0x8B]);

        let restored = from_archive(&archive).unwrap();
        assert_eq!(restored.ca_aliases.get("default").unwrap(), "my-ca");
    }

    #[test]
    fn garbage_archive_rejected() {
        assert!(from_archive(&[0x00, 0x01, 0x02]).is_err());
    }
}
