// Copyright (c) 2025 - Cowboy AI, LLC.

//! CA manager: top-level registry and lifecycle orchestration
//!
//! The manager is the single owner of all mutable registries (CA
//! entries, profiles, publishers, requestors, signers, keypair
//! generators, aliases, cross-links); live CA instances and other
//! sub-components receive short-lived borrowed handles, never
//! back-references.
//!
//! Cluster arbitration uses the `LOCK` system-event row: a master writes
//! `{owner = instanceId, time = now}` on start and refuses to start when
//! another owner's row exists; `unlock` wipes the row. Configuration
//! changes bump the `CA_CHANGE` event, which slaves poll to restart
//! themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ca::{CaCert, CaInfo, CrlControl, IssuedCertificate, X509Ca};
use crate::idgen::UniqueIdGenerator;
use crate::issuance::{CertTemplateData, SoftwareKeypairGenerator};
use crate::namemap::NameIdRegistry;
use crate::profile::{create_profile_engine, ProfileConf, ProfileEngine};
use crate::signer::{SignerConf, SignerPool, SoftwareSigner};
use crate::store::{CertStore, EntityKind, IssuerRecord};
use crate::traits::{CertPublishEvent, CertPublisher, KeypairGenerator, Signer};
use crate::types::{CaStatus, CrlReason, HashAlgo, NameId, RevocationInfo, Serial, SystemEvent,
    ValidityMode, EVENT_CA_CHANGE, EVENT_LOCK};
use crate::{CaError, Result};

/// Interval at which slaves poll the `CA_CHANGE` event
const SLAVE_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Interval at which the master checks scheduled CRL generation
const CRL_SCHEDULE_INTERVAL: Duration = Duration::from_secs(3600);

/// Overall status of the CA system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaSystemStatus {
    /// Not yet initialized
    Uninitialised,
    /// Initialization in progress
    Initialising,
    /// Running as the cluster master
    StartedAsMaster,
    /// Running as a slave
    StartedAsSlave,
    /// Another instance holds the master lock
    LockFailed,
    /// Initialization failed
    Error,
}

/// Static manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaManagerConf {
    /// Run as the cluster master
    #[serde(default = "default_true")]
    pub master: bool,
    /// Shard id of the unique-id generator
    #[serde(default)]
    pub shard_id: u8,
    /// Directory holding the lock-id token file
    pub lock_file_dir: PathBuf,
}

fn default_true() -> bool {
    true
}

/// Persisted definition of one CA
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaEntry {
    /// CA name
    pub name: String,
    /// CA certificate, PEM
    pub cert_pem: String,
    /// Chain up to the root, PEM
    #[serde(default)]
    pub cert_chain_pem: Vec<String>,
    /// Operational status
    #[serde(default)]
    pub status: CaStatus,
    /// Validity mode
    #[serde(default)]
    pub validity_mode: ValidityMode,
    /// Upper bound on granted validity, in days
    #[serde(default)]
    pub max_validity_days: Option<u32>,
    /// No new certificates after this time; defaults to the CA notAfter
    #[serde(default)]
    pub no_new_certificate_after: Option<DateTime<Utc>>,
    /// CA-level revocation
    #[serde(default)]
    pub revocation: Option<RevocationInfo>,
    /// Issuer-policy extra-control bag
    #[serde(default)]
    pub extra_control: Option<String>,
    /// CRL generation control
    #[serde(default)]
    pub crl_control: Option<CrlControl>,
    /// OCSP responder URIs
    #[serde(default)]
    pub ocsp_uris: Vec<String>,
    /// CA certificate download URIs
    #[serde(default)]
    pub ca_issuer_uris: Vec<String>,
    /// CRL distribution URIs
    #[serde(default)]
    pub crl_uris: Vec<String>,
    /// Delta-CRL distribution URIs
    #[serde(default)]
    pub delta_crl_uris: Vec<String>,
    /// Names of the signers backing this CA
    #[serde(default)]
    pub signer_names: Vec<String>,
    /// Names of the keypair generators offered to this CA
    #[serde(default)]
    pub keypair_gen_names: Vec<String>,
    /// Bound on concurrent sign operations
    #[serde(default)]
    pub sign_parallelism: Option<usize>,
}

/// Persisted definition of one profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEntry {
    /// Profile name
    pub name: String,
    /// Profile definition
    pub conf: ProfileConf,
}

/// Persisted definition of one requestor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestorEntry {
    /// Requestor name
    pub name: String,
    /// Authentication certificate, PEM
    #[serde(default)]
    pub cert_pem: Option<String>,
}

/// Persisted definition of one publisher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherEntry {
    /// Publisher name
    pub name: String,
    /// Publisher type; `log` is built in
    #[serde(default = "default_publisher_type")]
    pub r#type: String,
}

fn default_publisher_type() -> String {
    "log".to_string()
}

/// Persisted definition of one keypair generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeypairGenEntry {
    /// Generator name
    pub name: String,
    /// Generator type; `software` is built in
    #[serde(default = "default_keypair_gen_type")]
    pub r#type: String,
}

fn default_keypair_gen_type() -> String {
    "software".to_string()
}

/// Persisted definition of one signer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerEntry {
    /// Signer name
    pub name: String,
    /// Signer definition
    pub conf: SignerConf,
}

/// Built-in publisher that only logs deliveries
struct LogPublisher {
    name: String,
}

#[async_trait::async_trait]
impl CertPublisher for LogPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, event: &CertPublishEvent) -> Result<()> {
        debug!(publisher = %self.name, ca = %event.ca.name, serial = %event.serial,
            kind = ?event.kind, "certificate event");
        Ok(())
    }

    async fn publish_crl(&self, ca: &NameId, crl_der: &[u8]) -> Result<()> {
        debug!(publisher = %self.name, ca = %ca.name, bytes = crl_der.len(), "CRL event");
        Ok(())
    }
}

struct TaskHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Persisted registries of the manager (what import/export captures)
#[derive(Default)]
struct ConfRegistries {
    ca_entries: HashMap<String, CaEntry>,
    profile_entries: HashMap<String, ProfileEntry>,
    publisher_entries: HashMap<String, PublisherEntry>,
    requestor_entries: HashMap<String, RequestorEntry>,
    signer_entries: HashMap<String, SignerEntry>,
    keypair_gen_entries: HashMap<String, KeypairGenEntry>,
    ca_aliases: HashMap<String, String>,
    ca_has_profiles: HashMap<String, BTreeSet<String>>,
    ca_has_publishers: HashMap<String, BTreeSet<String>>,
    ca_has_requestors: HashMap<String, BTreeSet<String>>,
}

/// The top-level CA manager
pub struct CaManager {
    conf: CaManagerConf,
    store: Arc<dyn CertStore>,
    status: RwLock<CaSystemStatus>,
    instance_id: RwLock<Option<String>>,
    last_start_time: RwLock<DateTime<Utc>>,
    id_generator: Arc<UniqueIdGenerator>,

    registries: RwLock<ConfRegistries>,
    ids: RwLock<HashMap<EntityKind, NameIdRegistry>>,

    cas: RwLock<HashMap<String, Arc<X509Ca>>>,
    profiles: RwLock<HashMap<String, Arc<dyn ProfileEngine>>>,
    publishers: RwLock<HashMap<String, Arc<dyn CertPublisher>>>,
    signers: RwLock<HashMap<String, Arc<dyn Signer>>>,
    keypair_gens: RwLock<HashMap<String, Arc<dyn KeypairGenerator>>>,
    failed_ca_names: RwLock<Vec<String>>,

    restart_lock: Mutex<()>,
    background: Mutex<Vec<TaskHandle>>,
}

impl CaManager {
    /// Create an uninitialised manager over a store
    pub fn new(conf: CaManagerConf, store: Arc<dyn CertStore>) -> Arc<Self> {
        let shard_id = conf.shard_id;
        Arc::new(Self {
            conf,
            store,
            status: RwLock::new(CaSystemStatus::Uninitialised),
            instance_id: RwLock::new(None),
            last_start_time: RwLock::new(Utc::now()),
            id_generator: Arc::new(UniqueIdGenerator::new(shard_id)),
            registries: RwLock::new(ConfRegistries::default()),
            ids: RwLock::new(HashMap::new()),
            cas: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            publishers: RwLock::new(HashMap::new()),
            signers: RwLock::new(HashMap::new()),
            keypair_gens: RwLock::new(HashMap::new()),
            failed_ca_names: RwLock::new(Vec::new()),
            restart_lock: Mutex::new(()),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Current system status
    pub fn status(&self) -> CaSystemStatus {
        *self.status.read().unwrap()
    }

    /// Names of CAs that failed to start in the last restart
    pub fn failed_ca_names(&self) -> Vec<String> {
        self.failed_ca_names.read().unwrap().clone()
    }

    /// Names of live CAs
    pub fn ca_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cas.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of registered but inactive CAs
    pub fn inactive_ca_names(&self) -> Vec<String> {
        let registries = self.registries.read().unwrap();
        let mut names: Vec<String> = registries
            .ca_entries
            .values()
            .filter(|e| e.status == CaStatus::Inactive)
            .map(|e| e.name.trim().to_lowercase())
            .collect();
        names.sort();
        names
    }

    // -- lock handling -----------------------------------------------------

    async fn load_instance_id(&self) -> Result<String> {
        if let Some(id) = self.instance_id.read().unwrap().clone() {
            return Ok(id);
        }
        let path = self.conf.lock_file_dir.join("ca-lock.id");
        let id = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content.trim().to_string(),
            Err(_) => {
                let fresh = Uuid::new_v4().to_string();
                tokio::fs::create_dir_all(&self.conf.lock_file_dir).await?;
                tokio::fs::write(&path, &fresh).await?;
                info!(path = %path.display(), "wrote lock-id token file");
                fresh
            }
        };
        *self.instance_id.write().unwrap() = Some(id.clone());
        Ok(id)
    }

    async fn acquire_master_lock(&self) -> Result<()> {
        let instance_id = self.load_instance_id().await?;
        if let Some(lock) = self.store.get_system_event(EVENT_LOCK).await? {
            if lock.owner != instance_id {
                return Err(CaError::LockFailed(format!(
                    "master lock held by {} since {}",
                    lock.owner, lock.event_time
                )));
            }
            debug!("re-acquiring our own master lock");
        }
        self.store
            .change_system_event(SystemEvent::now(EVENT_LOCK, &instance_id))
            .await?;
        Ok(())
    }

    /// Wipe the master lock row; destructive, operator-only
    pub async fn unlock(&self) -> Result<()> {
        self.store.delete_system_event(EVENT_LOCK).await?;
        warn!("master lock wiped");
        Ok(())
    }

    /// Bump the `CA_CHANGE` event so slaves restart
    pub async fn notify_ca_change(&self) -> Result<()> {
        let instance_id = self.load_instance_id().await?;
        self.store
            .change_system_event(SystemEvent::now(EVENT_CA_CHANGE, &instance_id))
            .await
    }

    // -- lifecycle ---------------------------------------------------------

    /// Initialize the CA system
    ///
    /// `Uninitialised → Initialising → {StartedAsMaster | StartedAsSlave
    /// | LockFailed | Error}`. A failed CA start leaves the rest of the
    /// system running.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        *self.status.write().unwrap() = CaSystemStatus::Initialising;
        self.stop_background_tasks().await;

        if let Err(e) = self.load_entity_ids().await {
            *self.status.write().unwrap() = CaSystemStatus::Error;
            return Err(e);
        }

        if self.conf.master {
            if let Err(e) = self.acquire_master_lock().await {
                *self.status.write().unwrap() = if matches!(e, CaError::LockFailed(_)) {
                    CaSystemStatus::LockFailed
                } else {
                    CaSystemStatus::Error
                };
                return Err(e);
            }
        }

        if let Err(e) = self.restart_ca_system().await {
            *self.status.write().unwrap() = CaSystemStatus::Error;
            return Err(e);
        }

        let status = if self.conf.master {
            self.start_crl_scheduler().await;
            CaSystemStatus::StartedAsMaster
        } else {
            self.start_slave_watcher().await;
            CaSystemStatus::StartedAsSlave
        };
        *self.status.write().unwrap() = status;
        info!(?status, "CA system started");
        Ok(())
    }

    async fn load_entity_ids(&self) -> Result<()> {
        let mut ids = HashMap::new();
        for kind in [
            EntityKind::Ca,
            EntityKind::Profile,
            EntityKind::Publisher,
            EntityKind::Requestor,
        ] {
            let mut registry = NameIdRegistry::new();
            for entity in self.store.entities(kind).await? {
                registry.add(entity.id, &entity.name)?;
            }
            ids.insert(kind, registry);
        }
        *self.ids.write().unwrap() = ids;
        Ok(())
    }

    async fn ensure_entity(&self, kind: EntityKind, name: &str) -> Result<NameId> {
        {
            let ids = self.ids.read().unwrap();
            if let Some(registry) = ids.get(&kind) {
                if let Some(entity) = registry.get_by_name(name) {
                    return Ok(entity.clone());
                }
            }
        }
        let entity = {
            let mut ids = self.ids.write().unwrap();
            let registry = ids.entry(kind).or_default();
            let next_id = registry.entries().map(|e| e.id).max().unwrap_or(0) + 1;
            registry.add(next_id, name)?
        };
        self.store.add_entity(kind, entity.clone()).await?;
        Ok(entity)
    }

    /// Tear down all CA instances and rebuild them from the persisted
    /// configuration; re-enterable from any terminal state
    pub async fn restart_ca_system(self: &Arc<Self>) -> Result<()> {
        let _guard = self.restart_lock.lock().await;
        info!("restarting CA system");

        // Background tasks survive a restart; they are owned by
        // init/shutdown. The slave watcher in particular triggers
        // restarts itself and must not be joined from here.
        self.cas.write().unwrap().clear();
        self.profiles.write().unwrap().clear();
        self.signers.write().unwrap().clear();
        self.publishers.write().unwrap().clear();
        self.keypair_gens.write().unwrap().clear();
        self.failed_ca_names.write().unwrap().clear();

        let registries_snapshot = {
            let registries = self.registries.read().unwrap();
            (
                registries.signer_entries.clone(),
                registries.publisher_entries.clone(),
                registries.keypair_gen_entries.clone(),
                registries.profile_entries.clone(),
                registries.ca_entries.clone(),
            )
        };
        let (signer_entries, publisher_entries, keypair_gen_entries, profile_entries, ca_entries) =
            registries_snapshot;

        for (name, entry) in &signer_entries {
            match SoftwareSigner::from_conf(&entry.conf) {
                Ok(signer) => {
                    self.signers
                        .write()
                        .unwrap()
                        .insert(name.clone(), Arc::new(signer));
                }
                Err(e) => error!(signer = %name, "signer failed to load: {}", e),
            }
        }
        for (name, entry) in &publisher_entries {
            if entry.r#type == "log" {
                self.publishers.write().unwrap().insert(
                    name.clone(),
                    Arc::new(LogPublisher { name: name.clone() }),
                );
            } else {
                error!(publisher = %name, "unknown publisher type {}", entry.r#type);
            }
        }
        for (name, entry) in &keypair_gen_entries {
            if entry.r#type == "software" {
                self.keypair_gens
                    .write()
                    .unwrap()
                    .insert(name.clone(), Arc::new(SoftwareKeypairGenerator::new(name)));
            } else {
                error!(generator = %name, "unknown keypair generator type {}", entry.r#type);
            }
        }
        for (name, entry) in &profile_entries {
            match create_profile_engine(&entry.conf) {
                Ok(engine) => {
                    self.profiles.write().unwrap().insert(name.clone(), engine);
                }
                Err(e) => error!(profile = %name, "profile failed to load: {}", e),
            }
        }

        for (name, entry) in &ca_entries {
            if entry.status == CaStatus::Inactive {
                debug!(ca = %name, "skipping inactive CA");
                continue;
            }
            match self.create_ca(entry).await {
                Ok(ca) => {
                    self.cas.write().unwrap().insert(name.clone(), ca);
                }
                Err(e) => {
                    error!(ca = %name, "CA failed to start: {}", e);
                    self.failed_ca_names.write().unwrap().push(name.clone());
                }
            }
        }

        *self.last_start_time.write().unwrap() = Utc::now();
        if self.conf.master && self.status() != CaSystemStatus::Initialising {
            self.notify_ca_change().await?;
        }
        Ok(())
    }

    async fn create_ca(&self, entry: &CaEntry) -> Result<Arc<X509Ca>> {
        let ident = self.ensure_entity(EntityKind::Ca, &entry.name).await?;

        let cert_pem = pem::parse(&entry.cert_pem)
            .map_err(|e| CaError::InvalidConf(format!("invalid CA certificate PEM: {}", e)))?;
        let cert = CaCert::parse(cert_pem.contents())?;
        let mut cert_chain = Vec::new();
        for chain_pem in &entry.cert_chain_pem {
            let parsed = pem::parse(chain_pem)
                .map_err(|e| CaError::InvalidConf(format!("invalid chain PEM: {}", e)))?;
            cert_chain.push(parsed.contents().to_vec());
        }

        let signers: Vec<Arc<dyn Signer>> = {
            let registry = self.signers.read().unwrap();
            entry
                .signer_names
                .iter()
                .filter_map(|n| registry.get(n).cloned())
                .collect()
        };
        if signers.is_empty() {
            return Err(CaError::InvalidConf(format!(
                "CA {} has no usable signer",
                entry.name
            )));
        }
        let signer_pool = Arc::new(SignerPool::new(signers, entry.sign_parallelism.unwrap_or(8)));

        let publishers: Vec<Arc<dyn CertPublisher>> = {
            let registries = self.registries.read().unwrap();
            let bound = registries
                .ca_has_publishers
                .get(&ident.name)
                .cloned()
                .unwrap_or_default();
            let instances = self.publishers.read().unwrap();
            bound
                .iter()
                .filter_map(|n| instances.get(n).cloned())
                .collect()
        };
        let keypair_generators: Vec<Arc<dyn KeypairGenerator>> = {
            let instances = self.keypair_gens.read().unwrap();
            entry
                .keypair_gen_names
                .iter()
                .filter_map(|n| instances.get(n).cloned())
                .collect()
        };

        let certhash_algo = self
            .store
            .get_dbschema(crate::store::DBSCHEMA_CERTHASH_ALGO)
            .await?
            .and_then(|name| HashAlgo::from_name(&name));

        let info = CaInfo {
            ident: ident.clone(),
            cert: cert.clone(),
            cert_chain,
            status: entry.status,
            validity_mode: entry.validity_mode,
            max_validity_days: entry.max_validity_days,
            no_new_certificate_after: entry
                .no_new_certificate_after
                .unwrap_or(cert.not_after),
            revocation_info: entry.revocation.clone(),
            extra_control: entry.extra_control.clone(),
            crl_control: entry.crl_control.clone(),
            ocsp_uris: entry.ocsp_uris.clone(),
            ca_issuer_uris: entry.ca_issuer_uris.clone(),
            crl_uris: entry.crl_uris.clone(),
            delta_crl_uris: entry.delta_crl_uris.clone(),
        };

        // The issuer row backs the OCSP refresh pipeline; a previously
        // recorded CRL link survives the re-registration.
        let existing_crl_id = self
            .store
            .list_issuers()
            .await?
            .into_iter()
            .find(|r| r.id == ident.id)
            .and_then(|r| r.crl_id);
        self.store
            .add_issuer(IssuerRecord {
                id: ident.id,
                cert_der: cert.der.clone(),
                sha1_fp: HashAlgo::Sha1.digest(&cert.der),
                revocation: entry.revocation.clone(),
                crl_id: existing_crl_id,
            })
            .await?;

        Ok(Arc::new(X509Ca::new(
            info,
            self.store.clone(),
            signer_pool,
            publishers,
            keypair_generators,
            self.id_generator.clone(),
            certhash_algo,
        )))
    }

    async fn stop_background_tasks(&self) {
        let mut background = self.background.lock().await;
        for task in background.drain(..) {
            task.stop().await;
        }
    }

    async fn start_slave_watcher(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SLAVE_POLL_INTERVAL) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                }
                let last_start = *manager.last_start_time.read().unwrap();
                match manager.store.get_system_event(EVENT_CA_CHANGE).await {
                    Ok(Some(event)) if event.event_time > last_start.timestamp() => {
                        info!("CA_CHANGE observed, restarting slave");
                        if let Err(e) = manager.restart_ca_system().await {
                            error!("slave restart failed: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("CA_CHANGE poll failed: {}", e),
                }
            }
        });
        self.background.lock().await.push(TaskHandle { stop_tx, handle });
    }

    async fn start_crl_scheduler(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CRL_SCHEDULE_INTERVAL) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                }
                let cas: Vec<Arc<X509Ca>> =
                    manager.cas.read().unwrap().values().cloned().collect();
                for ca in cas {
                    let info = ca.info();
                    let Some(control) = info.crl_control.clone() else {
                        continue;
                    };
                    let due = match manager.store.get_crl_info(info.ident.id).await {
                        Ok(Some(current)) => {
                            current.this_update
                                + chrono::Duration::hours(control.interval_hours as i64)
                                <= Utc::now()
                        }
                        Ok(None) => true,
                        Err(e) => {
                            warn!(ca = %info.ident.name, "CRL schedule check failed: {}", e);
                            false
                        }
                    };
                    if due {
                        if let Err(e) = ca.generate_crl(false).await {
                            error!(ca = %info.ident.name, "scheduled CRL generation failed: {}", e);
                        }
                    }
                }
            }
        });
        self.background.lock().await.push(TaskHandle { stop_tx, handle });
    }

    /// Stop background tasks and tear down live CAs
    pub async fn shutdown(&self) {
        self.stop_background_tasks().await;
        self.cas.write().unwrap().clear();
        *self.status.write().unwrap() = CaSystemStatus::Uninitialised;
    }

    // -- registry management ----------------------------------------------

    /// Add a CA definition
    pub async fn add_ca(self: &Arc<Self>, entry: CaEntry) -> Result<()> {
        let name = NameId::new(0, &entry.name)?.name;
        {
            let registries = self.registries.read().unwrap();
            if registries.ca_entries.contains_key(&name) {
                return Err(CaError::AlreadyExists(format!("CA {}", name)));
            }
        }
        let ca = self.create_ca(&entry).await?;
        {
            let mut registries = self.registries.write().unwrap();
            registries.ca_entries.insert(name.clone(), entry);
        }
        if ca.info().status == CaStatus::Active {
            self.cas.write().unwrap().insert(name, ca);
        }
        self.notify_ca_change().await
    }

    /// Remove a CA definition and its live instance
    pub async fn remove_ca(&self, name: &str) -> Result<()> {
        let name = name.trim().to_lowercase();
        let removed = self.registries.write().unwrap().ca_entries.remove(&name);
        if removed.is_none() {
            return Err(CaError::NotFound(format!("CA {}", name)));
        }
        self.cas.write().unwrap().remove(&name);
        {
            let mut registries = self.registries.write().unwrap();
            registries.ca_aliases.retain(|_, ca| ca != &name);
            registries.ca_has_profiles.remove(&name);
            registries.ca_has_publishers.remove(&name);
            registries.ca_has_requestors.remove(&name);
        }
        self.notify_ca_change().await
    }

    /// Add a profile definition; the engine is created eagerly so a bad
    /// conf fails here
    pub async fn add_profile(&self, entry: ProfileEntry) -> Result<()> {
        let name = NameId::new(0, &entry.name)?.name;
        {
            let registries = self.registries.read().unwrap();
            if registries.profile_entries.contains_key(&name) {
                return Err(CaError::AlreadyExists(format!("profile {}", name)));
            }
        }
        let engine = create_profile_engine(&entry.conf)?;
        self.ensure_entity(EntityKind::Profile, &name).await?;
        self.registries
            .write()
            .unwrap()
            .profile_entries
            .insert(name.clone(), entry);
        self.profiles.write().unwrap().insert(name, engine);
        self.notify_ca_change().await
    }

    /// Remove a profile definition
    pub async fn remove_profile(&self, name: &str) -> Result<()> {
        let name = name.trim().to_lowercase();
        if self
            .registries
            .write()
            .unwrap()
            .profile_entries
            .remove(&name)
            .is_none()
        {
            return Err(CaError::NotFound(format!("profile {}", name)));
        }
        self.profiles.write().unwrap().remove(&name);
        let mut registries = self.registries.write().unwrap();
        for profiles in registries.ca_has_profiles.values_mut() {
            profiles.remove(&name);
        }
        drop(registries);
        self.notify_ca_change().await
    }

    /// Add a signer definition
    pub async fn add_signer(&self, entry: SignerEntry) -> Result<()> {
        let name = NameId::new(0, &entry.name)?.name;
        {
            let registries = self.registries.read().unwrap();
            if registries.signer_entries.contains_key(&name) {
                return Err(CaError::AlreadyExists(format!("signer {}", name)));
            }
        }
        let signer = SoftwareSigner::from_conf(&entry.conf)?;
        self.registries
            .write()
            .unwrap()
            .signer_entries
            .insert(name.clone(), entry);
        self.signers.write().unwrap().insert(name, Arc::new(signer));
        Ok(())
    }

    /// Add a publisher definition
    pub async fn add_publisher(&self, entry: PublisherEntry) -> Result<()> {
        let name = NameId::new(0, &entry.name)?.name;
        if entry.r#type != "log" {
            return Err(CaError::InvalidConf(format!(
                "unknown publisher type {}",
                entry.r#type
            )));
        }
        {
            let registries = self.registries.read().unwrap();
            if registries.publisher_entries.contains_key(&name) {
                return Err(CaError::AlreadyExists(format!("publisher {}", name)));
            }
        }
        self.ensure_entity(EntityKind::Publisher, &name).await?;
        self.registries
            .write()
            .unwrap()
            .publisher_entries
            .insert(name.clone(), entry);
        self.publishers
            .write()
            .unwrap()
            .insert(name.clone(), Arc::new(LogPublisher { name }));
        Ok(())
    }

    /// Add a requestor definition
    pub async fn add_requestor(&self, entry: RequestorEntry) -> Result<()> {
        let name = NameId::new(0, &entry.name)?.name;
        {
            let registries = self.registries.read().unwrap();
            if registries.requestor_entries.contains_key(&name) {
                return Err(CaError::AlreadyExists(format!("requestor {}", name)));
            }
        }
        self.ensure_entity(EntityKind::Requestor, &name).await?;
        self.registries
            .write()
            .unwrap()
            .requestor_entries
            .insert(name, entry);
        Ok(())
    }

    /// Add a keypair generator definition
    pub async fn add_keypair_gen(&self, entry: KeypairGenEntry) -> Result<()> {
        let name = NameId::new(0, &entry.name)?.name;
        if entry.r#type != "software" {
            return Err(CaError::InvalidConf(format!(
                "unknown keypair generator type {}",
                entry.r#type
            )));
        }
        self.registries
            .write()
            .unwrap()
            .keypair_gen_entries
            .insert(name.clone(), entry);
        self.keypair_gens
            .write()
            .unwrap()
            .insert(name.clone(), Arc::new(SoftwareKeypairGenerator::new(&name)));
        Ok(())
    }

    /// Remove a signer definition; CAs using it pick the change up on
    /// the next restart
    pub fn remove_signer(&self, name: &str) -> Result<()> {
        let name = name.trim().to_lowercase();
        if self
            .registries
            .write()
            .unwrap()
            .signer_entries
            .remove(&name)
            .is_none()
        {
            return Err(CaError::NotFound(format!("signer {}", name)));
        }
        self.signers.write().unwrap().remove(&name);
        Ok(())
    }

    /// Remove a publisher definition
    pub fn remove_publisher(&self, name: &str) -> Result<()> {
        let name = name.trim().to_lowercase();
        if self
            .registries
            .write()
            .unwrap()
            .publisher_entries
            .remove(&name)
            .is_none()
        {
            return Err(CaError::NotFound(format!("publisher {}", name)));
        }
        self.publishers.write().unwrap().remove(&name);
        let mut registries = self.registries.write().unwrap();
        for publishers in registries.ca_has_publishers.values_mut() {
            publishers.remove(&name);
        }
        Ok(())
    }

    /// Remove a requestor definition
    pub fn remove_requestor(&self, name: &str) -> Result<()> {
        let name = name.trim().to_lowercase();
        if self
            .registries
            .write()
            .unwrap()
            .requestor_entries
            .remove(&name)
            .is_none()
        {
            return Err(CaError::NotFound(format!("requestor {}", name)));
        }
        let mut registries = self.registries.write().unwrap();
        for requestors in registries.ca_has_requestors.values_mut() {
            requestors.remove(&name);
        }
        Ok(())
    }

    /// Remove a keypair generator definition
    pub fn remove_keypair_gen(&self, name: &str) -> Result<()> {
        let name = name.trim().to_lowercase();
        if self
            .registries
            .write()
            .unwrap()
            .keypair_gen_entries
            .remove(&name)
            .is_none()
        {
            return Err(CaError::NotFound(format!("keypair generator {}", name)));
        }
        self.keypair_gens.write().unwrap().remove(&name);
        Ok(())
    }

    /// Remove a CA alias
    pub fn remove_ca_alias(&self, alias: &str) -> Result<()> {
        let alias = alias.trim().to_lowercase();
        if self
            .registries
            .write()
            .unwrap()
            .ca_aliases
            .remove(&alias)
            .is_none()
        {
            return Err(CaError::NotFound(format!("alias {}", alias)));
        }
        Ok(())
    }

    /// Bind a profile to a CA
    pub fn add_ca_profile(&self, ca: &str, profile: &str) -> Result<()> {
        let ca = ca.trim().to_lowercase();
        let profile = profile.trim().to_lowercase();
        let mut registries = self.registries.write().unwrap();
        if !registries.ca_entries.contains_key(&ca) {
            return Err(CaError::NotFound(format!("CA {}", ca)));
        }
        if !registries.profile_entries.contains_key(&profile) {
            return Err(CaError::NotFound(format!("profile {}", profile)));
        }
        registries
            .ca_has_profiles
            .entry(ca)
            .or_default()
            .insert(profile);
        Ok(())
    }

    /// Bind a publisher to a CA
    pub fn add_ca_publisher(&self, ca: &str, publisher: &str) -> Result<()> {
        let ca = ca.trim().to_lowercase();
        let publisher = publisher.trim().to_lowercase();
        let mut registries = self.registries.write().unwrap();
        if !registries.ca_entries.contains_key(&ca) {
            return Err(CaError::NotFound(format!("CA {}", ca)));
        }
        if !registries.publisher_entries.contains_key(&publisher) {
            return Err(CaError::NotFound(format!("publisher {}", publisher)));
        }
        registries
            .ca_has_publishers
            .entry(ca)
            .or_default()
            .insert(publisher);
        Ok(())
    }

    /// Bind a requestor to a CA
    pub fn add_ca_requestor(&self, ca: &str, requestor: &str) -> Result<()> {
        let ca = ca.trim().to_lowercase();
        let requestor = requestor.trim().to_lowercase();
        let mut registries = self.registries.write().unwrap();
        if !registries.ca_entries.contains_key(&ca) {
            return Err(CaError::NotFound(format!("CA {}", ca)));
        }
        if !registries.requestor_entries.contains_key(&requestor) {
            return Err(CaError::NotFound(format!("requestor {}", requestor)));
        }
        registries
            .ca_has_requestors
            .entry(ca)
            .or_default()
            .insert(requestor);
        Ok(())
    }

    /// Register an alias for a CA
    pub fn add_ca_alias(&self, alias: &str, ca: &str) -> Result<()> {
        let alias = NameId::new(0, alias)?.name;
        let ca = ca.trim().to_lowercase();
        let mut registries = self.registries.write().unwrap();
        if !registries.ca_entries.contains_key(&ca) {
            return Err(CaError::NotFound(format!("CA {}", ca)));
        }
        if registries.ca_aliases.contains_key(&alias) {
            return Err(CaError::AlreadyExists(format!("alias {}", alias)));
        }
        registries.ca_aliases.insert(alias, ca);
        Ok(())
    }

    /// Resolve a CA by name or alias
    pub fn resolve_ca(&self, name_or_alias: &str) -> Result<Arc<X509Ca>> {
        let key = name_or_alias.trim().to_lowercase();
        let resolved = {
            let registries = self.registries.read().unwrap();
            registries.ca_aliases.get(&key).cloned().unwrap_or(key)
        };
        self.cas
            .read()
            .unwrap()
            .get(&resolved)
            .cloned()
            .ok_or_else(|| CaError::NotFound(format!("CA {}", resolved)))
    }

    /// Resolve a profile engine, checking the CA↔profile binding
    pub fn resolve_profile(&self, ca: &NameId, profile_name: &str) -> Result<Arc<dyn ProfileEngine>> {
        let profile_name = profile_name.trim().to_lowercase();
        {
            let registries = self.registries.read().unwrap();
            let bound = registries
                .ca_has_profiles
                .get(&ca.name)
                .map(|set| set.contains(&profile_name))
                .unwrap_or(false);
            if !bound {
                return Err(CaError::UnknownCertProfile(format!(
                    "profile {} is not bound to CA {}",
                    profile_name, ca.name
                )));
            }
        }
        self.profiles
            .read()
            .unwrap()
            .get(&profile_name)
            .cloned()
            .ok_or_else(|| CaError::UnknownCertProfile(profile_name))
    }

    // -- issuance façade ---------------------------------------------------

    /// Issue a certificate through a named CA and profile
    pub async fn generate_certificate(
        &self,
        ca_name: &str,
        profile_name: &str,
        request: CertTemplateData,
    ) -> Result<IssuedCertificate> {
        let ca = self.resolve_ca(ca_name)?;
        let ident = ca.ident();
        let engine = self.resolve_profile(&ident, profile_name)?;
        let profile_ident = self
            .ensure_entity(EntityKind::Profile, profile_name)
            .await?;
        ca.generate(&profile_ident, engine.profile(), &request, None)
            .await
    }

    /// Revoke a certificate
    pub async fn revoke_certificate(
        &self,
        ca_name: &str,
        serial: &Serial,
        reason: CrlReason,
        invalidity_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let ca = self.resolve_ca(ca_name)?;
        ca.revoke(serial, reason, invalidity_time).await?;
        Ok(())
    }

    /// Release a certificate from hold
    pub async fn unsuspend_certificate(&self, ca_name: &str, serial: &Serial) -> Result<()> {
        let ca = self.resolve_ca(ca_name)?;
        ca.unsuspend(serial).await?;
        Ok(())
    }

    /// Physically remove a certificate
    pub async fn remove_certificate(&self, ca_name: &str, serial: &Serial) -> Result<()> {
        let ca = self.resolve_ca(ca_name)?;
        ca.remove(serial).await
    }

    /// Generate a CRL on demand
    pub async fn generate_crl(&self, ca_name: &str) -> Result<Vec<u8>> {
        let ca = self.resolve_ca(ca_name)?;
        ca.generate_crl(true).await
    }

    /// Current CRL of a CA
    pub async fn get_current_crl(&self, ca_name: &str) -> Result<Option<Vec<u8>>> {
        let ca = self.resolve_ca(ca_name)?;
        self.store.get_current_crl(ca.ident().id).await
    }

    /// Revoke a CA; issued certificates inherit the revocation at OCSP
    /// time
    pub async fn revoke_ca(&self, ca_name: &str, revocation: RevocationInfo) -> Result<()> {
        let ca = self.resolve_ca(ca_name)?;
        ca.revoke_ca(revocation.clone()).await?;
        let mut registries = self.registries.write().unwrap();
        if let Some(entry) = registries.ca_entries.get_mut(&ca.ident().name) {
            entry.revocation = Some(revocation);
        }
        Ok(())
    }

    /// Lift a CA-level revocation
    pub async fn unrevoke_ca(&self, ca_name: &str) -> Result<()> {
        let ca = self.resolve_ca(ca_name)?;
        ca.unrevoke_ca().await?;
        let mut registries = self.registries.write().unwrap();
        if let Some(entry) = registries.ca_entries.get_mut(&ca.ident().name) {
            entry.revocation = None;
        }
        Ok(())
    }

    // -- import/export -----------------------------------------------------

    /// Export the full configuration as a gzip archive
    pub fn export_conf(&self) -> Result<Vec<u8>> {
        let registries = self.registries.read().unwrap();
        let bundle = crate::export::ConfBundle {
            ca_entries: registries.ca_entries.values().cloned().collect(),
            profile_entries: registries.profile_entries.values().cloned().collect(),
            publisher_entries: registries.publisher_entries.values().cloned().collect(),
            requestor_entries: registries.requestor_entries.values().cloned().collect(),
            signer_entries: registries.signer_entries.values().cloned().collect(),
            keypair_gen_entries: registries.keypair_gen_entries.values().cloned().collect(),
            ca_aliases: registries.ca_aliases.clone(),
            ca_has_profiles: registries.ca_has_profiles.clone(),
            ca_has_publishers: registries.ca_has_publishers.clone(),
            ca_has_requestors: registries.ca_has_requestors.clone(),
        };
        crate::export::to_archive(&bundle)
    }

    /// Import a configuration archive
    ///
    /// With `replace = true` the archive replaces the registries, else it
    /// merges (archive wins on name clashes). On any failure the current
    /// live state is preserved.
    pub async fn import_conf(self: &Arc<Self>, archive: &[u8], replace: bool) -> Result<()> {
        let bundle = crate::export::from_archive(archive)?;

        // Validate everything the import can validate before touching
        // live state.
        for profile in &bundle.profile_entries {
            create_profile_engine(&profile.conf).map_err(|e| {
                CaError::InvalidConf(format!("profile {} in archive: {}", profile.name, e))
            })?;
        }
        for signer in &bundle.signer_entries {
            SoftwareSigner::from_conf(&signer.conf).map_err(|e| {
                CaError::InvalidConf(format!("signer {} in archive: {}", signer.name, e))
            })?;
        }
        for ca in &bundle.ca_entries {
            let parsed = pem::parse(&ca.cert_pem).map_err(|e| {
                CaError::InvalidConf(format!("CA {} in archive: {}", ca.name, e))
            })?;
            CaCert::parse(parsed.contents()).map_err(|e| {
                CaError::InvalidConf(format!("CA {} in archive: {}", ca.name, e))
            })?;
        }

        {
            let mut registries = self.registries.write().unwrap();
            if replace {
                *registries = ConfRegistries::default();
            }
            for entry in bundle.ca_entries {
                registries.ca_entries.insert(entry.name.clone(), entry);
            }
            for entry in bundle.profile_entries {
                registries.profile_entries.insert(entry.name.clone(), entry);
            }
            for entry in bundle.publisher_entries {
                registries
                    .publisher_entries
                    .insert(entry.name.clone(), entry);
            }
            for entry in bundle.requestor_entries {
                registries
                    .requestor_entries
                    .insert(entry.name.clone(), entry);
            }
            for entry in bundle.signer_entries {
                registries.signer_entries.insert(entry.name.clone(), entry);
            }
            for entry in bundle.keypair_gen_entries {
                registries
                    .keypair_gen_entries
                    .insert(entry.name.clone(), entry);
            }
            registries.ca_aliases.extend(bundle.ca_aliases);
            for (ca, set) in bundle.ca_has_profiles {
                registries.ca_has_profiles.entry(ca).or_default().extend(set);
            }
            for (ca, set) in bundle.ca_has_publishers {
                registries
                    .ca_has_publishers
                    .entry(ca)
                    .or_default()
                    .extend(set);
            }
            for (ca, set) in bundle.ca_has_requestors {
                registries
                    .ca_has_requestors
                    .entry(ca)
                    .or_default()
                    .extend(set);
            }
        }

        self.restart_ca_system().await
    }
}
