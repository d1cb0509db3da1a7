//! The herd: every node, the scan loop that drives them, and the operator
//! actions that reach them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use herd_core::{HerdConfig, Image, MdbEntry, SubConfiguration};
use herd_node::{
    AuthInfo, ComputedFile, FastUpdateMessage, FastUpdateRequest, ImageSource, Node, NodeEnv,
    ObjectGetter, SubConnector, SubSnapshot, SubStatus,
};
use herd_state::{StateStore, UpdatesDisabled};
use herd_throttle::{CpuStats, Limits, PoolStats};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{HerdError, HerdResult};
use crate::images::StoreImages;

/// Longest [`Herd::hold_lock`] keeps the node table locked.
pub const MAX_LOCK_HOLD: Duration = Duration::from_secs(60);

/// Node counts by classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub alive: usize,
    pub deviant: usize,
    pub compliant: usize,
    pub busy: usize,
    pub needs_operator: usize,
    pub by_status: BTreeMap<String, usize>,
}

/// What an MDB sync did to the node table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MdbSyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

pub struct Herd {
    env: Arc<NodeEnv>,
    store: StateStore,
    images: Arc<StoreImages>,
    /// Guards insert/delete/iterate only; nodes publish their own state.
    nodes: RwLock<BTreeMap<String, Arc<Node>>>,
    scan_interval: Duration,
}

impl Herd {
    pub fn new(
        config: &HerdConfig,
        store: StateStore,
        connector: Arc<dyn SubConnector>,
        object_getter: Option<Arc<dyn ObjectGetter>>,
    ) -> HerdResult<Self> {
        let images = Arc::new(StoreImages::new(store.clone()));
        let mut env = NodeEnv::new(
            Limits::new(&config.limits),
            connector,
            Arc::clone(&images) as Arc<dyn ImageSource>,
        );
        env.object_getter = object_getter;
        env.object_server = config.herd.object_server.clone();
        env.sub_port = config.herd.sub_port;
        env.use_ip = config.herd.use_ip;
        env.rpc_timeout = Duration::from_secs(config.herd.rpc_timeout_secs);

        let settings = store.get_settings()?;
        let default_image = settings
            .default_image
            .or_else(|| config.herd.default_image.clone());
        env.update_globals(|globals| {
            globals.default_image = default_image;
            globals.updates_disabled_reason = settings.updates_disabled.map(|d| d.reason);
            globals.sub_configuration = config.sub_configuration.clone();
        });

        Ok(Self {
            env: Arc::new(env),
            store,
            images,
            nodes: RwLock::new(BTreeMap::new()),
            scan_interval: Duration::from_secs(config.herd.scan_interval_secs.max(1)),
        })
    }

    // ── Machine database ───────────────────────────────────────────

    /// Persist `entries` as the MDB and bring the node table in line.
    pub async fn sync_mdb(&self, entries: Vec<MdbEntry>) -> HerdResult<MdbSyncReport> {
        self.store.replace_mdb(&entries)?;
        Ok(self.apply_mdb(entries).await)
    }

    /// Rebuild the node table from the persisted MDB.
    pub async fn restore_mdb(&self) -> HerdResult<MdbSyncReport> {
        let entries = self.store.list_mdb()?;
        Ok(self.apply_mdb(entries).await)
    }

    async fn apply_mdb(&self, entries: Vec<MdbEntry>) -> MdbSyncReport {
        let mut report = MdbSyncReport::default();
        let wanted: BTreeSet<&str> = entries.iter().map(|e| e.hostname.as_str()).collect();
        let mut nodes = self.nodes.write().await;
        nodes.retain(|hostname, node| {
            if wanted.contains(hostname.as_str()) {
                return true;
            }
            node.mark_deleting();
            report.removed.push(hostname.clone());
            false
        });
        for entry in entries {
            match nodes.get(&entry.hostname) {
                Some(node) => {
                    let hostname = entry.hostname.clone();
                    if node.update_mdb(entry) {
                        report.changed.push(hostname);
                    }
                }
                None => {
                    report.added.push(entry.hostname.clone());
                    let node = Node::new(entry, Arc::clone(&self.env));
                    nodes.insert(node.hostname().to_string(), Arc::new(node));
                }
            }
        }
        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            changed = report.changed.len(),
            total = nodes.len(),
            "mdb applied"
        );
        report
    }

    // ── Scanning ───────────────────────────────────────────────────

    /// Start a cycle on every node that is not already busy.
    pub async fn start_cycles(&self) -> Vec<JoinHandle<bool>> {
        let nodes: Vec<Arc<Node>> = self.nodes.read().await.values().cloned().collect();
        nodes
            .into_iter()
            .filter(|node| !node.is_busy())
            .map(|node| tokio::spawn(async move { node.try_cycle().await }))
            .collect()
    }

    /// Run the scan loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.scan_interval.as_secs(),
            "herd scan loop started"
        );
        let mut interval = tokio::time::interval(self.scan_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = self.start_cycles().await.len();
                    debug!(started, "scan");
                }
                _ = shutdown.changed() => {
                    info!("herd scan loop shutting down");
                    break;
                }
            }
        }
    }

    // ── Observation ────────────────────────────────────────────────

    async fn node(&self, hostname: &str) -> HerdResult<Arc<Node>> {
        self.nodes
            .read()
            .await
            .get(hostname)
            .cloned()
            .ok_or_else(|| HerdError::UnknownSub(hostname.to_string()))
    }

    pub async fn snapshot(&self, hostname: &str) -> HerdResult<SubSnapshot> {
        Ok(self.node(hostname).await?.snapshot())
    }

    pub async fn snapshots(&self) -> Vec<SubSnapshot> {
        self.nodes
            .read()
            .await
            .values()
            .map(|node| node.snapshot())
            .collect()
    }

    /// Hostnames of subs in any of `statuses`, or of every sub if empty.
    pub async fn list_subs(&self, statuses: &[SubStatus]) -> Vec<String> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|node| statuses.is_empty() || statuses.contains(&node.status()))
            .map(|node| node.hostname().to_string())
            .collect()
    }

    pub async fn status_summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for snapshot in self.snapshots().await {
            let status = snapshot.status;
            summary.total += 1;
            summary.alive += usize::from(status.is_alive());
            summary.deviant += usize::from(status.is_deviant());
            summary.compliant += usize::from(status.is_compliant());
            summary.needs_operator += usize::from(status.needs_operator());
            summary.busy += usize::from(snapshot.busy);
            *summary
                .by_status
                .entry(status.as_str().to_string())
                .or_default() += 1;
        }
        summary
    }

    pub fn pool_stats(&self) -> [PoolStats; 3] {
        self.env.limits.pool_stats()
    }

    pub fn cpu_stats(&self) -> CpuStats {
        self.env.limits.cpu.stats()
    }

    // ── Operator actions on one sub ────────────────────────────────

    pub async fn clear_safety_shutoff(&self, hostname: &str, auth: &AuthInfo) -> HerdResult<()> {
        Ok(self.node(hostname).await?.clear_safety_shutoff(auth)?)
    }

    pub async fn force_disruptive_update(
        &self,
        hostname: &str,
        auth: &AuthInfo,
    ) -> HerdResult<()> {
        Ok(self.node(hostname).await?.force_disruptive_update(auth)?)
    }

    pub async fn fast_update(
        &self,
        hostname: &str,
        request: FastUpdateRequest,
        auth: &AuthInfo,
    ) -> HerdResult<mpsc::Receiver<FastUpdateMessage>> {
        Ok(self.node(hostname).await?.fast_update(request, auth)?)
    }

    pub async fn receive_computed_files(
        &self,
        hostname: &str,
        files: Vec<ComputedFile>,
    ) -> HerdResult<()> {
        self.node(hostname).await?.receive_computed_files(files);
        Ok(())
    }

    // ── Herd-wide settings ─────────────────────────────────────────

    pub fn disable_updates(&self, reason: &str, auth: &AuthInfo) -> HerdResult<()> {
        require_method_access(auth)?;
        if reason.is_empty() {
            return Err(HerdError::NoReason);
        }
        let mut settings = self.store.get_settings()?;
        settings.updates_disabled = Some(UpdatesDisabled {
            reason: reason.to_string(),
            by: auth.username.clone(),
            since: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        });
        self.store.put_settings(&settings)?;
        self.env
            .update_globals(|g| g.updates_disabled_reason = Some(reason.to_string()));
        warn!(user = %auth.username, %reason, "updates disabled");
        Ok(())
    }

    pub fn enable_updates(&self, auth: &AuthInfo) -> HerdResult<()> {
        require_method_access(auth)?;
        let mut settings = self.store.get_settings()?;
        settings.updates_disabled = None;
        self.store.put_settings(&settings)?;
        self.env.update_globals(|g| g.updates_disabled_reason = None);
        info!(user = %auth.username, "updates enabled");
        Ok(())
    }

    pub fn updates_disabled(&self) -> HerdResult<Option<UpdatesDisabled>> {
        Ok(self.store.get_settings()?.updates_disabled)
    }

    pub fn default_image(&self) -> Option<String> {
        self.env.globals().default_image
    }

    /// Set or clear the image used by subs without a required image.
    pub async fn set_default_image(&self, name: Option<&str>, auth: &AuthInfo) -> HerdResult<()> {
        require_method_access(auth)?;
        let name = name.filter(|n| !n.is_empty());
        if let Some(name) = name {
            if self.images.get(name).is_none() {
                return Err(HerdError::ImageNotFound(name.to_string()));
            }
        }
        let mut settings = self.store.get_settings()?;
        settings.default_image = name.map(str::to_string);
        self.store.put_settings(&settings)?;
        self.env
            .update_globals(|g| g.default_image = settings.default_image.clone());
        for node in self.nodes.read().await.values() {
            node.cancel();
        }
        info!(user = %auth.username, image = ?name, "default image set");
        Ok(())
    }

    pub fn sub_configuration(&self) -> SubConfiguration {
        self.env.globals().sub_configuration
    }

    /// Replace the configuration pushed to every sub.
    pub fn set_sub_configuration(
        &self,
        config: SubConfiguration,
        auth: &AuthInfo,
    ) -> HerdResult<()> {
        require_method_access(auth)?;
        info!(user = %auth.username, ?config, "sub configuration set");
        self.env.update_globals(|g| g.sub_configuration = config);
        Ok(())
    }

    // ── Images ─────────────────────────────────────────────────────

    pub fn add_image(&self, name: &str, image: Image) -> HerdResult<()> {
        self.images.add(name, image)
    }

    pub fn image_names(&self) -> HerdResult<Vec<String>> {
        self.images.names()
    }

    // ── Diagnostics ────────────────────────────────────────────────

    /// Hold the node-table lock for `duration`, capped at [`MAX_LOCK_HOLD`].
    /// Returns how long the lock was held.
    pub async fn hold_lock(&self, duration: Duration, write: bool) -> Duration {
        let duration = duration.min(MAX_LOCK_HOLD);
        if write {
            let _nodes = self.nodes.write().await;
            tokio::time::sleep(duration).await;
        } else {
            let _nodes = self.nodes.read().await;
            tokio::time::sleep(duration).await;
        }
        duration
    }
}

fn require_method_access(auth: &AuthInfo) -> HerdResult<()> {
    if auth.have_method_access {
        Ok(())
    } else {
        Err(HerdError::NoAccess)
    }
}
