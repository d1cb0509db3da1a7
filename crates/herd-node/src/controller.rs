//! The per-node reconciliation cycle.
//!
//! A [`NodeController`] owns everything the herd knows about one sub. One
//! call to [`NodeController::connect_and_poll`] is one cycle: connect,
//! poll, fetch/push missing objects, send an update when needed, clean
//! up, and publish a snapshot. Every path through a cycle ends with a
//! status; nothing here is fatal.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use herd_applier::matched_in_update;
use herd_core::{
    AddObjectsRequest, CleanupRequest, DisruptionState, FetchRequest, FileSystem, Hash, Image,
    Inode, MdbEntry, PollRequest, PollResponse, RegularInode, SubConfiguration, Triggers,
};
use herd_diff::{
    SubView, build_missing_lists, build_update_request, cleanup_candidates, has_enough_space,
    is_unsafe_update, space_needed,
};
use herd_throttle::Limits;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{RpcError, RpcResult};
use crate::snapshot::{ComputedFile, FastUpdateMessage, SubSnapshot, unix_secs};
use crate::status::SubStatus;
use crate::transport::{ImageSource, ObjectGetter, SubClient, SubConnector};

/// Where fast-update progress goes.
pub type Progress = mpsc::Sender<FastUpdateMessage>;

/// After this long connecting, the Connecting status is published.
const CONNECT_PUBLISH_DELAY: Duration = Duration::from_secs(1);

// ── Shared environment ─────────────────────────────────────────────

/// Herd-wide settings a node reads at the start of each cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Globals {
    pub default_image: Option<String>,
    pub updates_disabled_reason: Option<String>,
    pub sub_configuration: SubConfiguration,
}

/// Collaborators and settings shared by every node of a herd.
pub struct NodeEnv {
    pub limits: Limits,
    pub connector: Arc<dyn SubConnector>,
    pub images: Arc<dyn ImageSource>,
    pub object_getter: Option<Arc<dyn ObjectGetter>>,
    /// Object server address handed to subs in Fetch requests.
    pub object_server: String,
    pub sub_port: u16,
    pub use_ip: bool,
    pub rpc_timeout: Duration,
    globals: RwLock<Globals>,
}

impl NodeEnv {
    pub fn new(
        limits: Limits,
        connector: Arc<dyn SubConnector>,
        images: Arc<dyn ImageSource>,
    ) -> Self {
        Self {
            limits,
            connector,
            images,
            object_getter: None,
            object_server: String::new(),
            sub_port: 6969,
            use_ip: false,
            rpc_timeout: Duration::from_secs(300),
            globals: RwLock::new(Globals::default()),
        }
    }

    pub fn globals(&self) -> Globals {
        self.globals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_globals(&self, f: impl FnOnce(&mut Globals)) {
        let mut globals = self.globals.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut globals);
    }
}

/// State of a node visible outside its controller.
pub(crate) struct NodeShared {
    pub(crate) hostname: String,
    pub(crate) snapshot: watch::Sender<SubSnapshot>,
    pub(crate) mdb: watch::Sender<MdbEntry>,
    /// Set to abort a pending poll-slot wait or skip the rest of a cycle.
    pub(crate) cancel: watch::Sender<bool>,
    pub(crate) pending_safety_clear: AtomicBool,
    pub(crate) pending_force_disruption: AtomicBool,
    pub(crate) deleting: AtomicBool,
    pub(crate) busy: AtomicBool,
    pub(crate) file_updates: Mutex<Vec<Vec<ComputedFile>>>,
}

impl NodeShared {
    pub(crate) fn new(mdb: MdbEntry) -> Self {
        let (snapshot, _) = watch::channel(SubSnapshot::new(&mdb));
        let (cancel, _) = watch::channel(false);
        Self {
            hostname: mdb.hostname.clone(),
            snapshot,
            mdb: watch::channel(mdb).0,
            cancel,
            pending_safety_clear: AtomicBool::new(false),
            pending_force_disruption: AtomicBool::new(false),
            deleting: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            file_updates: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn take_file_updates(&self) -> Vec<Vec<ComputedFile>> {
        std::mem::take(&mut *self.file_updates.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

fn same_image(a: &Option<Arc<Image>>, b: &Option<Arc<Image>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

// ── Controller ─────────────────────────────────────────────────────

pub struct NodeController {
    shared: Arc<NodeShared>,
    env: Arc<NodeEnv>,
    cancel_rx: watch::Receiver<bool>,
    mdb: MdbEntry,
    pub(crate) status: SubStatus,
    pub(crate) required_image_name: String,
    pub(crate) planned_image_name: String,
    pub(crate) required_image: Option<Arc<Image>>,
    pub(crate) planned_image: Option<Arc<Image>>,
    have_planned_image: bool,
    computed_inodes: BTreeMap<String, RegularInode>,
    computed_files_change_time: Option<SystemTime>,
    client: Option<Arc<dyn SubClient>>,
    generation: u64,
    file_system: Option<FileSystem>,
    object_cache: Option<Vec<Hash>>,
    scan_count: u64,
    scan_count_at_last_update_end: u64,
    start_time: u64,
    poll_time: u64,
    free_space: Option<u64>,
    free_space_threshold: Option<u64>,
    last_successful_image: String,
    last_note: String,
    last_error: String,
    last_disruption_state: DisruptionState,
    pub(crate) config_to_restore: Option<SubConfiguration>,
    last_address: String,
    insecure: bool,
    last_poll_was_full: bool,
    last_reachable_time: Option<SystemTime>,
    last_poll_succeeded_time: Option<SystemTime>,
    last_update_time: Option<SystemTime>,
    last_sync_time: Option<SystemTime>,
    last_connect_duration: Option<Duration>,
    last_short_poll_duration: Option<Duration>,
    last_full_poll_duration: Option<Duration>,
}

impl NodeController {
    pub(crate) fn new(shared: Arc<NodeShared>, env: Arc<NodeEnv>) -> Self {
        let cancel_rx = shared.cancel.subscribe();
        let mdb = shared.mdb.borrow().clone();
        Self {
            shared,
            env,
            cancel_rx,
            mdb,
            status: SubStatus::Unknown,
            required_image_name: String::new(),
            planned_image_name: String::new(),
            required_image: None,
            planned_image: None,
            have_planned_image: false,
            computed_inodes: BTreeMap::new(),
            computed_files_change_time: None,
            client: None,
            generation: 0,
            file_system: None,
            object_cache: None,
            scan_count: 0,
            scan_count_at_last_update_end: 0,
            start_time: 0,
            poll_time: 0,
            free_space: None,
            free_space_threshold: None,
            last_successful_image: String::new(),
            last_note: String::new(),
            last_error: String::new(),
            last_disruption_state: DisruptionState::Anytime,
            config_to_restore: None,
            last_address: String::new(),
            insecure: false,
            last_poll_was_full: false,
            last_reachable_time: None,
            last_poll_succeeded_time: None,
            last_update_time: None,
            last_sync_time: None,
            last_connect_duration: None,
            last_short_poll_duration: None,
            last_full_poll_duration: None,
        }
    }

    pub fn status(&self) -> SubStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: SubStatus) {
        self.status = status;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn hostname(&self) -> &str {
        &self.shared.hostname
    }

    /// The address to dial: the MDB IP when preferred and known, keeping
    /// any `*instance` suffix of the hostname.
    pub(crate) fn address(&self) -> String {
        let port = self.env.sub_port;
        match &self.mdb.ip_address {
            Some(ip) if self.env.use_ip && !ip.is_empty() => {
                match self.mdb.hostname.split_once('*') {
                    Some((_, instance)) => format!("{ip}*{instance}:{port}"),
                    None => format!("{ip}:{port}"),
                }
            }
            _ => format!("{}:{port}", self.mdb.hostname),
        }
    }

    /// Bound `call` by the herd-wide RPC deadline.
    async fn rpc<T>(&self, call: impl Future<Output = RpcResult<T>>) -> RpcResult<T> {
        tokio::time::timeout(self.env.rpc_timeout, call)
            .await
            .unwrap_or(Err(RpcError::Timeout))
    }

    /// Drop the pooled connection after a failed call.
    fn close(&mut self) {
        self.client = None;
    }

    fn check_cancel(&self) -> bool {
        self.shared.cancel.send_replace(false)
    }

    pub(crate) async fn send_progress(&self, progress: Option<&Progress>, message: &str) {
        if let Some(tx) = progress {
            let _ = tx
                .send(FastUpdateMessage {
                    message: message.to_string(),
                    synced: self.status == SubStatus::Synced,
                    is_final: false,
                })
                .await;
        }
    }

    // ── Configuration ──────────────────────────────────────────────

    /// Reload the MDB entry and images. Returns true if either image changed.
    fn load_configuration(&mut self, swap_images: bool) -> bool {
        self.mdb = self.shared.mdb.borrow().clone();
        let (mut required, planned) = if swap_images {
            (self.mdb.planned_image.clone(), self.mdb.required_image.clone())
        } else {
            (self.mdb.required_image.clone(), self.mdb.planned_image.clone())
        };
        if required.as_deref().is_none_or(str::is_empty) {
            required = self.env.globals().default_image;
        }
        let required = required.unwrap_or_default();
        let planned = planned.unwrap_or_default();
        let required_image = (!required.is_empty())
            .then(|| self.env.images.get(&required))
            .flatten();
        let planned_image = (!planned.is_empty())
            .then(|| self.env.images.get(&planned))
            .flatten();
        let changed = !same_image(&self.required_image, &required_image)
            || !same_image(&self.planned_image, &planned_image);
        self.required_image_name = required;
        self.planned_image_name = planned;
        self.required_image = required_image;
        self.planned_image = planned_image;
        changed
    }

    /// Fold in computed-file content received since the last cycle.
    /// Returns true if anything changed.
    fn process_file_updates(&mut self) -> bool {
        let mut have_updates = false;
        for batch in self.shared.take_file_updates() {
            let Some(image) = &self.required_image else {
                for file in &batch {
                    debug!(sub = %self.hostname(), path = %file.path, hash = %file.hash,
                        "no image, discarding computed file");
                }
                continue;
            };
            for file in batch {
                if file.hash.is_zero() {
                    continue;
                }
                let Some(Inode::Computed(computed)) = image.filesystem.get(&file.path) else {
                    continue;
                };
                let inode = RegularInode {
                    mode: computed.mode,
                    uid: computed.uid,
                    gid: computed.gid,
                    mtime_seconds: -1,
                    mtime_nanos: 0,
                    size: file.length,
                    hash: file.hash,
                };
                if self.computed_inodes.get(&file.path) != Some(&inode) {
                    self.computed_inodes.insert(file.path, inode);
                    have_updates = true;
                }
            }
        }
        if have_updates {
            self.computed_files_change_time = Some(SystemTime::now());
        }
        have_updates
    }

    // ── Cycle ──────────────────────────────────────────────────────

    /// Run one cycle. Returns true if the cycle failed or was cancelled in a
    /// way that makes an immediate retry reasonable.
    ///
    /// With `swap_images` the planned image is treated as required. With
    /// `progress` the sub's limits are boosted and progress is reported.
    pub async fn connect_and_poll(
        &mut self,
        swap_images: bool,
        fail_on_reboot: bool,
        progress: Option<&Progress>,
    ) -> bool {
        if self.load_configuration(swap_images) {
            self.generation = 0;
        }
        if self.process_file_updates() {
            self.generation = 0;
        }
        if self.shared.deleting.load(Ordering::SeqCst) {
            return false;
        }
        let previous = self.status;
        self.status = SubStatus::Connecting;
        let retry = self.cycle(previous, fail_on_reboot, progress).await;
        self.publish();
        retry
    }

    async fn cycle(
        &mut self,
        previous: SubStatus,
        fail_on_reboot: bool,
        progress: Option<&Progress>,
    ) -> bool {
        let Some(client) = self.connect().await else {
            return false;
        };

        let mut cancel = self.cancel_rx.clone();
        let slot = match self.env.limits.polls.acquire_or_cancel(&mut cancel).await {
            Ok(slot) => slot,
            Err(e) => {
                // Configuration changed while waiting: start over with it.
                debug!(sub = %self.hostname(), error = %e, "poll slot wait abandoned");
                self.check_cancel();
                self.status = previous;
                return true;
            }
        };
        if progress.is_some() {
            if let Err(e) = self.rpc(client.boost_cpu_limit()).await {
                self.send_progress(progress, &e.to_string()).await;
            }
            self.boost_scan_speed(&client, progress).await;
        }
        self.status = SubStatus::Polling;
        let retry = self
            .poll(&client, previous, progress.is_some(), fail_on_reboot, progress)
            .await;
        drop(slot);
        retry
    }

    /// Reuse the pooled connection or dial a new one, classifying failures.
    async fn connect(&mut self) -> Option<Arc<dyn SubClient>> {
        if let Some(client) = &self.client {
            return Some(Arc::clone(client));
        }
        let address = self.address();
        let started = Instant::now();
        let result = {
            let connect = self.env.connector.connect(&address);
            tokio::pin!(connect);
            match tokio::time::timeout(CONNECT_PUBLISH_DELAY, &mut connect).await {
                Ok(result) => result,
                Err(_) => {
                    self.publish();
                    connect.await
                }
            }
        };
        let returned = SystemTime::now();
        match result {
            Ok(client) => {
                self.insecure = !client.is_encrypted();
                self.last_address = address;
                self.last_reachable_time = Some(returned);
                self.last_connect_duration = Some(started.elapsed());
                self.client = Some(Arc::clone(&client));
                Some(client)
            }
            Err(e) => {
                self.insecure = false;
                self.poll_time = 0;
                self.status = match &e {
                    RpcError::Dns(_) => SubStatus::DnsError,
                    RpcError::Timeout => SubStatus::ConnectTimeout,
                    RpcError::ConnectionRefused => SubStatus::ConnectionRefused,
                    RpcError::NoRouteToHost => SubStatus::NoRouteToHost,
                    RpcError::MissingCertificate => {
                        self.last_reachable_time = Some(returned);
                        SubStatus::MissingCertificate
                    }
                    RpcError::BadCertificate => {
                        self.last_reachable_time = Some(returned);
                        SubStatus::BadCertificate
                    }
                    _ => SubStatus::FailedToConnect,
                };
                debug!(sub = %self.hostname(), %address, error = %e, status = %self.status,
                    "connect failed");
                self.last_error = e.to_string();
                None
            }
        }
    }

    async fn boost_scan_speed(&mut self, client: &Arc<dyn SubClient>, progress: Option<&Progress>) {
        if progress.is_none() || self.config_to_restore.is_some() {
            return;
        }
        match self.rpc(client.boost_scan_limit()).await {
            Ok(()) => return,
            Err(e) => self.send_progress(progress, &e.to_string()).await,
        }
        let old = match self.rpc(client.get_configuration()).await {
            Ok(config) => config,
            Err(e) => {
                self.send_progress(progress, &e.to_string()).await;
                return;
            }
        };
        let boosted = SubConfiguration {
            network_speed_percent: 100,
            scan_speed_percent: 100,
            ..old.clone()
        };
        if let Err(e) = self.rpc(client.set_configuration(boosted)).await {
            self.send_progress(progress, &e.to_string()).await;
            return;
        }
        self.config_to_restore = Some(old);
        self.send_progress(progress, "increased scan speed percent").await;
    }

    /// Put back the configuration saved by a scan-speed boost.
    pub(crate) async fn restore_scan_speed(&mut self, progress: Option<&Progress>) {
        if progress.is_none() {
            return;
        }
        let Some(config) = self.config_to_restore.clone() else {
            return;
        };
        let Some(client) = self.connect().await else {
            self.send_progress(progress, &self.last_error.clone()).await;
            return;
        };
        let percent = config.scan_speed_percent;
        if let Err(e) = self.rpc(client.set_configuration(config)).await {
            self.close();
            self.send_progress(progress, &e.to_string()).await;
            return;
        }
        self.send_progress(
            progress,
            &format!("restored scan speed percent to {percent}%"),
        )
        .await;
        self.config_to_restore = None;
    }

    fn force_full_poll_if_needed(&mut self, previous: SubStatus) {
        if previous == SubStatus::Synced && !self.have_planned_image && self.planned_image.is_some()
        {
            self.have_planned_image = true;
            self.generation = 0;
        }
        if previous == SubStatus::Synced
            && self
                .computed_files_change_time
                .is_some_and(|changed| self.last_sync_time.is_none_or(|synced| changed > synced))
        {
            self.generation = 0;
        }
        if previous == SubStatus::UpdatesDisabled
            && self.env.globals().updates_disabled_reason.is_none()
            && !self.mdb.disable_updates
        {
            self.generation = 0;
        }
        if previous == SubStatus::UnsafeUpdate
            && self.shared.pending_safety_clear.load(Ordering::SeqCst)
        {
            self.generation = 0;
        }
        if previous.is_waiting_for_disruption()
            && self.shared.pending_force_disruption.load(Ordering::SeqCst)
        {
            self.generation = 0;
        }
    }

    async fn poll(
        &mut self,
        client: &Arc<dyn SubClient>,
        mut previous: SubStatus,
        fast: bool,
        fail_on_reboot: bool,
        progress: Option<&Progress>,
    ) -> bool {
        self.force_full_poll_if_needed(previous);
        let have_image = self.required_image.is_some() || self.planned_image.is_some();
        let request = PollRequest {
            have_generation: self.generation,
            short_poll_only: !have_image,
        };
        if !have_image {
            // Make sure a full poll happens once an image shows up.
            self.generation = 0;
        }
        let poll_started = Instant::now();
        let reply = match self.rpc(client.poll(request)).await {
            Ok(reply) => reply,
            Err(e) => {
                self.close();
                if e == RpcError::Eof {
                    return true;
                }
                self.poll_time = 0;
                self.last_error = e.to_string();
                warn!(sub = %self.hostname(), error = %e,
                    elapsed_ms = poll_started.elapsed().as_millis() as u64, "poll failed");
                if e == RpcError::AccessDenied {
                    self.status = SubStatus::PollDenied;
                    return false;
                }
                self.status = SubStatus::FailedToPoll;
                return true;
            }
        };
        self.last_poll_succeeded_time = Some(SystemTime::now());
        self.last_disruption_state = reply.disruption_state;
        self.last_successful_image = reply.last_successful_image_name.clone();
        self.last_note = reply.last_note.clone();
        self.scan_count = reply.scan_count;
        self.free_space = reply.free_space;
        if reply.generation_count == 0 {
            self.reclaim();
            self.generation = 0;
        }
        if !self.absorb_poll_reply(&reply, poll_started) {
            return false;
        }
        self.update_configuration(client, &reply).await;

        if reply.fetch_in_progress {
            self.status = SubStatus::Fetching;
            return false;
        }
        if reply.update_in_progress {
            self.status = SubStatus::Updating;
            return false;
        }
        if !reply.last_write_error.is_empty() {
            self.last_error = reply.last_write_error.clone();
            self.status = SubStatus::Unwritable;
            self.reclaim();
            return false;
        }
        if reply.generation_count < 1 {
            self.status = SubStatus::SubNotReady;
            return false;
        }
        if reply.locked_by_another_client {
            self.status = SubStatus::Locked;
            self.reclaim();
            return false;
        }
        if previous == SubStatus::Locked && self.file_system.is_none() {
            self.generation = 0;
            return false;
        }
        if previous == SubStatus::Fetching && !reply.last_fetch_error.is_empty() {
            warn!(sub = %self.hostname(), error = %reply.last_fetch_error, "fetch failed");
            self.last_error = reply.last_fetch_error.clone();
            self.status = SubStatus::FailedToFetch;
            if self.file_system.is_none() {
                self.generation = 0;
                return false;
            }
        }
        if previous == SubStatus::Updating {
            self.status = match reply.last_update_error.as_str() {
                "" => SubStatus::WaitingForNextFullPoll,
                herd_core::ERROR_DISRUPTION_PENDING => SubStatus::DisruptionRequested,
                herd_core::ERROR_DISRUPTION_DENIED => SubStatus::DisruptionDenied,
                error => {
                    warn!(sub = %self.hostname(), %error, "update failed");
                    self.last_error = error.to_string();
                    SubStatus::FailedToUpdate
                }
            };
            self.scan_count_at_last_update_end = reply.scan_count;
            self.reclaim();
            return false;
        }
        if self.check_cancel() {
            // Keep the file-system: it speeds up the next poll.
            self.status = previous;
            return true;
        }
        if !have_image {
            self.status = if self.required_image_name.is_empty() {
                SubStatus::ImageUndefined
            } else {
                SubStatus::ImageNotReady
            };
            return false;
        }
        if matches!(
            previous,
            SubStatus::FailedToUpdate | SubStatus::WaitingForNextFullPoll
        ) {
            if self.scan_count_at_last_update_end == reply.scan_count {
                // The sub has not rescanned since the update ended.
                self.reclaim();
                self.status = previous;
                return false;
            }
            if self.file_system.is_none() {
                self.generation = 0;
                self.status = previous;
                return false;
            }
        }
        if previous.is_waiting_for_disruption() {
            match reply.disruption_state {
                DisruptionState::Anytime | DisruptionState::Permitted => self.generation = 0,
                DisruptionState::Requested => previous = SubStatus::DisruptionRequested,
                DisruptionState::Denied => previous = SubStatus::DisruptionDenied,
            }
        }
        if self.file_system.is_none() {
            self.status = previous;
            return false;
        }

        if let Some(required) = self.required_image.clone() {
            let (idle, status) = self
                .fetch_missing_objects(client, &required, reply.free_space, true, fast, progress)
                .await;
            if !idle {
                self.status = status;
                self.reclaim();
                return false;
            }
            self.status = SubStatus::ComputingUpdate;
            let (idle, status) = self.send_update(client, &required, fail_on_reboot).await;
            if !idle {
                self.status = status;
                self.reclaim();
                return false;
            }
        } else {
            self.status = SubStatus::ImageNotReady;
        }
        if !same_image(&self.planned_image, &self.required_image) {
            let (idle, status) = match self.planned_image.clone() {
                Some(planned) => {
                    self.fetch_missing_objects(
                        client,
                        &planned,
                        reply.free_space,
                        false,
                        fast,
                        progress,
                    )
                    .await
                }
                None => (false, SubStatus::ImageNotReady),
            };
            if !idle
                && status != SubStatus::ImageNotReady
                && status != SubStatus::NotEnoughFreeSpace
            {
                self.status = status;
                self.reclaim();
                return false;
            }
        }
        if previous == SubStatus::WaitingForNextFullPoll && self.last_update_time.is_some() {
            self.last_sync_time = Some(SystemTime::now());
        }
        self.status = SubStatus::Synced;
        self.last_error.clear();
        self.cleanup(client).await;
        self.reclaim();
        false
    }

    /// Take the file-system payload, if any, and the sub's timing fields.
    /// Returns false if the payload is unusable.
    fn absorb_poll_reply(&mut self, reply: &PollResponse, poll_started: Instant) -> bool {
        match &reply.filesystem {
            None => {
                self.last_poll_was_full = false;
                self.last_short_poll_duration = Some(poll_started.elapsed());
                if self.start_time != reply.start_time {
                    // The sub restarted.
                    self.generation = 0;
                }
                if let (Some(threshold), Some(free)) = (self.free_space_threshold, reply.free_space)
                {
                    if free > threshold {
                        self.generation = 0;
                    }
                }
            }
            Some(fs) => {
                self.last_poll_was_full = true;
                self.free_space_threshold = None;
                if let Err(e) = fs.check_consistency() {
                    warn!(sub = %self.hostname(), error = %e, "bad file-system in poll reply");
                    self.last_error = e.to_string();
                    self.status = SubStatus::FailedToPoll;
                    return false;
                }
                self.file_system = Some(fs.clone());
                self.object_cache = Some(reply.object_cache.clone().unwrap_or_default());
                self.generation = reply.generation_count;
                self.last_full_poll_duration = Some(poll_started.elapsed());
            }
        }
        self.start_time = reply.start_time;
        self.poll_time = reply.poll_time;
        true
    }

    /// Push the herd-wide sub configuration if the sub reports a different one.
    async fn update_configuration(&mut self, client: &Arc<dyn SubClient>, reply: &PollResponse) {
        if reply.scan_count < 1 {
            return;
        }
        let desired = self.env.globals().sub_configuration;
        let wanted = reply.current_configuration.overlay(&desired);
        if wanted == reply.current_configuration {
            return;
        }
        if let Err(e) = self.rpc(client.set_configuration(wanted)).await {
            self.close();
            warn!(sub = %self.hostname(), error = %e, "failed to set sub configuration");
        }
    }

    fn reclaim(&mut self) {
        self.file_system = None;
        self.object_cache = None;
    }

    /// Make sure the sub has every object `image` needs. Returns true when
    /// nothing is missing.
    async fn fetch_missing_objects(
        &mut self,
        client: &Arc<dyn SubClient>,
        image: &Image,
        free_space: Option<u64>,
        is_required: bool,
        fast: bool,
        progress: Option<&Progress>,
    ) -> (bool, SubStatus) {
        let image_type = if is_required { "required" } else { "planned" };
        let Ok(ticket) = self.env.limits.cpu.grab().await else {
            return (false, SubStatus::FailedToFetch);
        };
        let lists = {
            let Some(fs) = self.file_system.as_ref() else {
                return (false, SubStatus::ImageNotReady);
            };
            let view = SubView {
                hostname: &self.shared.hostname,
                filesystem: fs,
                computed_inodes: &self.computed_inodes,
                object_cache: self.object_cache.as_deref().unwrap_or(&[]),
            };
            if is_required {
                build_missing_lists(&view, Some(image), None, true, false)
            } else {
                build_missing_lists(&view, None, Some(image), false, false)
            }
        };
        drop(ticket);
        let lists = match lists {
            Ok(lists) => lists,
            Err(e) => {
                self.last_error = e.to_string();
                return (false, SubStatus::MissingComputedFile);
            }
        };

        let mut available = true;
        let mut status = SubStatus::Synced;
        if !lists.fetch.is_empty() {
            if !self.check_for_enough_space(free_space, &lists.fetch) {
                return (false, SubStatus::NotEnoughFreeSpace);
            }
            info!(sub = %self.hostname(), image = image_type, objects = lists.fetch.len(),
                "calling Fetch");
            let request = FetchRequest {
                server_address: self.env.object_server.clone(),
                hashes: lists.fetch.keys().copied().collect(),
                wait: false,
                speed_percent: fast.then_some(100),
            };
            if let Err(e) = self.rpc(client.fetch(request)).await {
                self.close();
                warn!(sub = %self.hostname(), error = %e, "Fetch failed");
                self.last_error = e.to_string();
                return if e == RpcError::AccessDenied {
                    (false, SubStatus::FetchDenied)
                } else {
                    (false, SubStatus::FailedToFetch)
                };
            }
            available = false;
            status = SubStatus::Fetching;
        }
        if !lists.push.is_empty() {
            info!(sub = %self.hostname(), objects = lists.push.len(), "calling AddObjects");
            let Ok(_slot) = self.env.limits.pushes.acquire().await else {
                return (false, SubStatus::FailedToPush);
            };
            self.status = SubStatus::Pushing;
            self.send_progress(progress, self.status.as_str()).await;
            let Some(getter) = self.env.object_getter.clone() else {
                self.last_error = "no object getter".into();
                return (false, SubStatus::FailedToGetObject);
            };
            let mut objects = Vec::with_capacity(lists.push.len());
            for hash in &lists.push {
                match getter.get_object(*hash).await {
                    Ok(data) => objects.push((*hash, data)),
                    Err(e) => {
                        warn!(sub = %self.hostname(), %hash, error = %e, "failed to get object");
                        self.last_error = e;
                        return (false, SubStatus::FailedToGetObject);
                    }
                }
            }
            if let Err(e) = self.rpc(client.add_objects(AddObjectsRequest { objects })).await {
                self.close();
                warn!(sub = %self.hostname(), error = %e, "AddObjects failed");
                self.last_error = e.to_string();
                return if e == RpcError::AccessDenied {
                    (false, SubStatus::PushDenied)
                } else {
                    (false, SubStatus::FailedToPush)
                };
            }
            if available {
                // No poll happens before the update is computed.
                if let Some(cache) = self.object_cache.as_mut() {
                    cache.extend(lists.push.iter().copied());
                }
            }
        }
        (available, status)
    }

    fn check_for_enough_space(&mut self, free_space: Option<u64>, objects: &BTreeMap<Hash, u64>) -> bool {
        let needed = space_needed(objects);
        if has_enough_space(free_space, needed) {
            self.free_space_threshold = None;
            true
        } else {
            self.free_space_threshold = Some(needed);
            false
        }
    }

    /// Build and send the update. Returns true when nothing needs doing.
    async fn send_update(
        &mut self,
        client: &Arc<dyn SubClient>,
        image: &Image,
        fail_on_reboot: bool,
    ) -> (bool, SubStatus) {
        let Ok(ticket) = self.env.limits.cpu.grab().await else {
            return (false, SubStatus::FailedToUpdate);
        };
        let Some(fs) = self.file_system.as_ref() else {
            return (false, SubStatus::ImageNotReady);
        };
        let view = SubView {
            hostname: &self.shared.hostname,
            filesystem: fs,
            computed_inodes: &self.computed_inodes,
            object_cache: self.object_cache.as_deref().unwrap_or(&[]),
        };
        let built = build_update_request(&view, image, &self.required_image_name);
        let mut request = match built {
            Ok(request) => request,
            Err(e) => {
                self.last_error = e.to_string();
                return (false, SubStatus::MissingComputedFile);
            }
        };
        if request.has_no_mutations() && self.last_successful_image == self.required_image_name {
            return (true, SubStatus::Synced);
        }
        if self.mdb.disable_updates || self.env.globals().updates_disabled_reason.is_some() {
            return (false, SubStatus::UpdatesDisabled);
        }
        if !self.shared.pending_safety_clear.load(Ordering::SeqCst)
            && is_unsafe_update(image, fs, &request, self.mdb.safety_check_disabled())
        {
            return (false, SubStatus::UnsafeUpdate);
        }
        if fail_on_reboot {
            let matched = Triggers::new(matched_in_update(&request).into_iter().cloned().collect());
            let (_, reboot) = matched.check_impact();
            if reboot {
                return (false, SubStatus::RebootBlocked);
            }
        }
        drop(ticket);
        if self.mdb.force_disruptive_update()
            || self.shared.pending_force_disruption.load(Ordering::SeqCst)
        {
            request.force_disruption = true;
        }

        self.status = SubStatus::SendingUpdate;
        self.last_update_time = Some(SystemTime::now());
        info!(sub = %self.hostname(), image = %self.required_image_name,
            force_disruption = request.force_disruption, "calling Update");
        if let Err(e) = self.rpc(client.update(request)).await {
            self.close();
            warn!(sub = %self.hostname(), error = %e, "Update failed");
            self.last_error = e.to_string();
            return if e == RpcError::AccessDenied {
                (false, SubStatus::UpdateDenied)
            } else {
                (false, SubStatus::FailedToUpdate)
            };
        }
        self.shared.pending_safety_clear.store(false, Ordering::SeqCst);
        self.shared.pending_force_disruption.store(false, Ordering::SeqCst);
        (false, SubStatus::Updating)
    }

    /// Release unused objects and tell the sub that any disruptive update
    /// is over.
    async fn cleanup(&mut self, client: &Arc<dyn SubClient>) {
        let Some(fs) = self.file_system.as_ref() else {
            return;
        };
        let hashes = cleanup_candidates(
            fs,
            self.object_cache.as_deref().unwrap_or(&[]),
            self.planned_image.as_deref(),
        );
        if hashes.is_empty() && self.last_disruption_state == DisruptionState::Anytime {
            return;
        }
        debug!(sub = %self.hostname(), objects = hashes.len(), "calling Cleanup");
        if let Err(e) = self.rpc(client.cleanup(CleanupRequest { hashes })).await {
            self.close();
            warn!(sub = %self.hostname(), error = %e, "Cleanup failed");
        }
    }

    // ── Publication ────────────────────────────────────────────────

    pub(crate) fn publish(&self) {
        self.shared.snapshot.send_replace(self.make_snapshot());
    }

    fn make_snapshot(&self) -> SubSnapshot {
        SubSnapshot {
            hostname: self.mdb.hostname.clone(),
            ip_address: self.mdb.ip_address.clone(),
            location: self.mdb.location.clone(),
            status: self.status,
            required_image: self.required_image_name.clone(),
            planned_image: self.planned_image_name.clone(),
            last_successful_image: self.last_successful_image.clone(),
            last_note: self.last_note.clone(),
            last_error: self.last_error.clone(),
            last_address: self.last_address.clone(),
            insecure: self.insecure,
            generation: self.generation,
            scan_count: self.scan_count,
            free_space: self.free_space,
            disruption_state: self.last_disruption_state,
            busy: false,
            pending_safety_clear: false,
            pending_force_disruption: false,
            last_poll_was_full: self.last_poll_was_full,
            start_time: self.start_time,
            poll_time: self.poll_time,
            last_reachable_time: self.last_reachable_time.map(unix_secs),
            last_poll_succeeded_time: self.last_poll_succeeded_time.map(unix_secs),
            last_update_time: self.last_update_time.map(unix_secs),
            last_sync_time: self.last_sync_time.map(unix_secs),
            last_connect_millis: self.last_connect_duration.map(|d| d.as_millis() as u64),
            last_short_poll_millis: self.last_short_poll_duration.map(|d| d.as_millis() as u64),
            last_full_poll_millis: self.last_full_poll_duration.map(|d| d.as_millis() as u64),
        }
    }
}
