// Copyright (c) 2025 - Cowboy AI, LLC.

//! Periodic issuer-index refresh
//!
//! A [`StoreRefresher`] re-reads the issuer and CRL tables from the
//! certificate store and swaps the [`IssuerStore`] snapshot atomically.
//! A single in-process flag serialises refreshes; a forced refresh waits
//! for the running one and then runs itself. The scheduled loop adds a
//! random jitter of up to 60 seconds per tick.

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::OcspStoreError;
use crate::ocsp::issuer::{IssuerEntry, IssuerStore};
use crate::store::CertStore;
use crate::types::CrlInfo;

/// Maximum random jitter added to each scheduled tick
const MAX_JITTER_SECS: u64 = 60;

/// Background refresher of one issuer index
pub struct StoreRefresher {
    store: Arc<dyn CertStore>,
    issuer_store: Arc<IssuerStore>,
    update_interval: Duration,
    in_process: AtomicBool,
    finished: Notify,
}

impl StoreRefresher {
    /// Create a refresher
    pub fn new(
        store: Arc<dyn CertStore>,
        issuer_store: Arc<IssuerStore>,
        update_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            issuer_store,
            update_interval,
            in_process: AtomicBool::new(false),
            finished: Notify::new(),
        })
    }

    /// Run one refresh
    ///
    /// With `force = false` a refresh already in process makes this a
    /// no-op returning `false`. With `force = true` the call waits for
    /// the running refresh and then performs its own.
    pub async fn refresh_once(&self, force: bool) -> Result<bool, OcspStoreError> {
        loop {
            if self
                .in_process
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            if !force {
                debug!("issuer refresh already in process, skipping");
                return Ok(false);
            }
            self.finished.notified().await;
        }

        let result = self.do_refresh().await;
        self.in_process.store(false, Ordering::Release);
        self.finished.notify_waiters();
        result.map(|_| true)
    }

    async fn do_refresh(&self) -> Result<(), OcspStoreError> {
        let records = self.store.list_issuers().await.map_err(OcspStoreError::from)?;

        // CRL metadata is refreshed wholesale on every pass.
        let mut crl_infos: HashMap<u32, CrlInfo> = HashMap::new();
        for record in &records {
            if let Some(info) = self
                .store
                .get_crl_info(record.id)
                .await
                .map_err(OcspStoreError::from)?
            {
                crl_infos.insert(record.id, info);
            }
        }

        let snapshot = self.issuer_store.snapshot();

        // Fast path: the issuer set and each entry's revocation and
        // fingerprint are unchanged; only the CRL table is swapped.
        let unchanged = !snapshot.issuers.is_empty()
            && records.len() == snapshot.issuers.len()
            && records.iter().all(|record| {
                snapshot.issuers.iter().any(|entry| {
                    entry.id == record.id
                        && entry.sha1_fp == record.sha1_fp
                        && entry.revocation_info == record.revocation
                })
            });
        if unchanged {
            let issuers = snapshot.issuers.clone();
            self.issuer_store.set_issuers(issuers, crl_infos);
            debug!("issuer index unchanged, refreshed CRL metadata only");
            return Ok(());
        }

        // Slow path: decode every issuer certificate and verify that no
        // two issuers share (name, key); a duplicate fails the update and
        // keeps the previous snapshot.
        let mut entries: Vec<Arc<IssuerEntry>> = Vec::with_capacity(records.len());
        for record in &records {
            entries.push(Arc::new(IssuerEntry::from_record(record)?));
        }
        for (i, a) in entries.iter().enumerate() {
            for b in entries.iter().skip(i + 1) {
                if a.subject_der == b.subject_der && a.spk_bits == b.spk_bits {
                    error!(
                        first = a.id,
                        second = b.id,
                        "two issuers share subject and key, keeping previous snapshot"
                    );
                    return Err(OcspStoreError::IssuerDecode(format!(
                        "issuers {} and {} share subject and key",
                        a.id, b.id
                    )));
                }
            }
        }

        let count = entries.len();
        self.issuer_store.set_issuers(entries, crl_infos);
        info!(issuers = count, "issuer index refreshed");
        Ok(())
    }

    /// Start the scheduled refresh loop
    ///
    /// The returned handle owns the task: dropping it detaches, awaiting
    /// [`RefresherHandle::stop`] signals and joins.
    pub fn start(self: &Arc<Self>) -> RefresherHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let refresher = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_SECS);
                let sleep = refresher.update_interval + Duration::from_secs(jitter);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                }
                if let Err(e) = refresher.refresh_once(false).await {
                    // Logged and retried on the next tick.
                    error!("issuer refresh failed: {}", e);
                }
            }
        });
        RefresherHandle { stop_tx, handle }
    }
}

/// Owned handle of a running refresh loop
pub struct RefresherHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefresherHandle {
    /// Signal the loop to stop and await its completion
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IssuerRecord, MemoryCertStore};

    #[tokio::test]
    async fn refresh_of_empty_store_yields_empty_snapshot() {
        let store = Arc::new(MemoryCertStore::new());
        let issuer_store = Arc::new(IssuerStore::new());
        let refresher = StoreRefresher::new(store, issuer_store.clone(), Duration::from_secs(300));

        assert!(refresher.refresh_once(false).await.unwrap());
        let snapshot = issuer_store.snapshot();
        assert_eq!(snapshot.generation, 1);
        assert!(snapshot.issuers.is_empty());
    }

    #[tokio::test]
    async fn undecodable_issuer_keeps_previous_snapshot() {
        let store = Arc::new(MemoryCertStore::new());
        let issuer_store = Arc::new(IssuerStore::new());
        let refresher =
            StoreRefresher::new(store.clone(), issuer_store.clone(), Duration::from_secs(300));
        refresher.refresh_once(false).await.unwrap();
        let generation = issuer_store.snapshot().generation;

        store
            .add_issuer(IssuerRecord {
                id: 1,
                cert_der: vec![0xDE, 0xAD],
                sha1_fp: vec![1; 20],
                revocation: None,
                crl_id: None,
            })
            .await
            .unwrap();

        assert!(refresher.refresh_once(false).await.is_err());
        assert_eq!(issuer_store.snapshot().generation, generation);
    }
}
