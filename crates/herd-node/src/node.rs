//! The handle the herd keeps for each sub.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use herd_core::MdbEntry;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::controller::{NodeController, NodeEnv, NodeShared, Progress};
use crate::error::{NodeError, NodeResult};
use crate::snapshot::{AuthInfo, ComputedFile, FastUpdateMessage, FastUpdateRequest, SubSnapshot};
use crate::status::SubStatus;

/// Depth of the fast-update progress channel.
const PROGRESS_BUFFER: usize = 64;

/// One sub. Cycles are serialised by the controller lock; everything
/// readable without that lock lives in the shared half.
pub struct Node {
    shared: Arc<NodeShared>,
    env: Arc<NodeEnv>,
    controller: Mutex<NodeController>,
}

impl Node {
    pub fn new(mdb: MdbEntry, env: Arc<NodeEnv>) -> Self {
        let shared = Arc::new(NodeShared::new(mdb));
        let controller = NodeController::new(Arc::clone(&shared), Arc::clone(&env));
        Self {
            shared,
            env,
            controller: Mutex::new(controller),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.shared.hostname
    }

    /// The last published snapshot with the live busy and pending flags.
    pub fn snapshot(&self) -> SubSnapshot {
        let mut snapshot = self.shared.snapshot.borrow().clone();
        snapshot.busy = self.shared.busy.load(Ordering::SeqCst);
        snapshot.pending_safety_clear = self.shared.pending_safety_clear.load(Ordering::SeqCst);
        snapshot.pending_force_disruption =
            self.shared.pending_force_disruption.load(Ordering::SeqCst);
        snapshot
    }

    pub fn status(&self) -> SubStatus {
        self.shared.snapshot.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<SubSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn mdb(&self) -> MdbEntry {
        self.shared.mdb.borrow().clone()
    }

    /// Replace the MDB entry. A change cancels any pending wait so the
    /// next cycle picks it up. Returns whether anything changed.
    pub fn update_mdb(&self, mdb: MdbEntry) -> bool {
        let changed = self.shared.mdb.send_if_modified(|current| {
            if *current == mdb {
                return false;
            }
            *current = mdb;
            true
        });
        if changed {
            self.cancel();
        }
        changed
    }

    pub fn cancel(&self) {
        self.shared.cancel.send_replace(true);
    }

    /// The node is being removed: no further cycles start.
    pub fn mark_deleting(&self) {
        self.shared.deleting.store(true, Ordering::SeqCst);
        self.cancel();
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Run a cycle unless one is already running. Returns false if the node
    /// was busy.
    pub async fn try_cycle(&self) -> bool {
        let Ok(mut controller) = self.controller.try_lock() else {
            return false;
        };
        let _busy = BusyGuard::new(&self.shared.busy);
        if controller.connect_and_poll(false, false, None).await {
            controller.connect_and_poll(false, false, None).await;
        }
        true
    }

    /// Run a cycle, waiting for any running one to finish first.
    pub async fn cycle(&self) {
        let mut controller = self.controller.lock().await;
        let _busy = BusyGuard::new(&self.shared.busy);
        if controller.connect_and_poll(false, false, None).await {
            controller.connect_and_poll(false, false, None).await;
        }
    }

    // ── Operator actions ───────────────────────────────────────────

    /// Method access, an owner group or an owner user grants access.
    pub fn check_admin_access(&self, auth: &AuthInfo) -> NodeResult<()> {
        if auth.have_method_access {
            return Ok(());
        }
        let mdb = self.shared.mdb.borrow();
        let owns = mdb.owner_groups.iter().any(|g| auth.groups.contains(g))
            || (!auth.username.is_empty() && mdb.owner_users.iter().any(|u| *u == auth.username));
        if owns { Ok(()) } else { Err(NodeError::NoAccess) }
    }

    /// Let the next update through the safety check once.
    pub fn clear_safety_shutoff(&self, auth: &AuthInfo) -> NodeResult<()> {
        self.check_admin_access(auth)?;
        if self.status() != SubStatus::UnsafeUpdate {
            return Err(NodeError::NoPendingUnsafeUpdate);
        }
        info!(sub = %self.hostname(), user = %auth.username, "safety shutoff cleared");
        self.shared.pending_safety_clear.store(true, Ordering::SeqCst);
        self.cancel();
        Ok(())
    }

    /// Mark the next update as permitted to disrupt the sub.
    pub fn force_disruptive_update(&self, auth: &AuthInfo) -> NodeResult<()> {
        self.check_admin_access(auth)?;
        if !self.status().is_waiting_for_disruption() {
            return Err(NodeError::NotWaitingForDisruption);
        }
        info!(sub = %self.hostname(), user = %auth.username, "disruptive update forced");
        self.shared.pending_force_disruption.store(true, Ordering::SeqCst);
        self.cancel();
        Ok(())
    }

    /// Queue computed-file content for the next cycle.
    pub fn receive_computed_files(&self, files: Vec<ComputedFile>) {
        if files.is_empty() {
            return;
        }
        self.shared
            .file_updates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(files);
        self.cancel();
    }

    // ── Fast update ────────────────────────────────────────────────

    /// Start driving the sub to its image as fast as limits allow. Progress
    /// arrives on the returned channel, which ends with exactly one final
    /// message.
    pub fn fast_update(
        self: &Arc<Self>,
        request: FastUpdateRequest,
        auth: &AuthInfo,
    ) -> NodeResult<mpsc::Receiver<FastUpdateMessage>> {
        self.check_admin_access(auth)?;
        if self.shared.deleting.load(Ordering::SeqCst) {
            return Err(NodeError::Deleting);
        }
        let mdb = self.mdb();
        let image_name = if request.use_planned_image {
            mdb.planned_image
                .filter(|name| !name.is_empty())
                .ok_or(NodeError::NoImageSpecified("planned image"))?
        } else {
            mdb.required_image
                .filter(|name| !name.is_empty())
                .or_else(|| self.env.globals().default_image)
                .ok_or(NodeError::NoImageSpecified("required image"))?
        };
        if self.env.images.get(&image_name).is_none() {
            return Err(NodeError::ImageNotReady(image_name));
        }
        info!(sub = %self.hostname(), image = %image_name, user = %auth.username,
            "fast update");
        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let synced = node.run_fast_update(&request, &tx).await;
            let _ = tx
                .send(FastUpdateMessage {
                    message: String::new(),
                    synced,
                    is_final: true,
                })
                .await;
        });
        Ok(rx)
    }

    async fn run_fast_update(&self, request: &FastUpdateRequest, tx: &Progress) -> bool {
        let deadline = Instant::now() + request.timeout;
        let pool = &self.env.limits.fast_updates;
        let _slot = match pool.try_acquire() {
            Ok(slot) => {
                send(tx, "got fast update slot").await;
                slot
            }
            Err(_) => {
                send(tx, "waiting for fast update slot").await;
                match tokio::time::timeout_at(deadline, pool.acquire()).await {
                    Ok(Ok(slot)) => {
                        send(tx, "finished waiting for fast update slot").await;
                        slot
                    }
                    _ => {
                        send(tx, "timed out").await;
                        return false;
                    }
                }
            }
        };
        let mut controller = match self.controller.try_lock() {
            Ok(controller) => controller,
            Err(_) => {
                send(tx, "waiting for sub to not be busy").await;
                match tokio::time::timeout_at(deadline, self.controller.lock()).await {
                    Ok(controller) => controller,
                    Err(_) => {
                        send(tx, "timed out").await;
                        return false;
                    }
                }
            }
        };
        send(tx, "made sub busy").await;
        let _busy = BusyGuard::new(&self.shared.busy);

        let synced = self
            .fast_update_loop(&mut controller, request, tx, deadline)
            .await;
        controller.restore_scan_speed(Some(tx)).await;
        self.shared.pending_safety_clear.store(false, Ordering::SeqCst);
        self.shared.pending_force_disruption.store(false, Ordering::SeqCst);
        controller.publish();
        debug!(sub = %self.hostname(), synced, "fast update finished");
        synced
    }

    async fn fast_update_loop(
        &self,
        controller: &mut NodeController,
        request: &FastUpdateRequest,
        tx: &Progress,
        deadline: Instant,
    ) -> bool {
        if controller.status() == SubStatus::Synced {
            controller.set_status(SubStatus::WaitingToPoll);
        }
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        let mut last_status = None;
        let mut polled = false;
        while Instant::now() < deadline {
            if self.shared.deleting.load(Ordering::SeqCst) {
                send(tx, "deleting").await;
                return false;
            }
            let status = controller.status();
            if last_status != Some(status) {
                send(tx, status.as_str()).await;
                last_status = Some(status);
                backoff.reset();
            }
            if polled {
                match status {
                    SubStatus::Synced => return true,
                    SubStatus::UpdatesDisabled
                    | SubStatus::UnsafeUpdate
                    | SubStatus::RebootBlocked => return false,
                    _ => {}
                }
            }
            if request.disable_safety_check {
                self.shared.pending_safety_clear.store(true, Ordering::SeqCst);
            }
            if request.force_disruptive_update {
                self.shared.pending_force_disruption.store(true, Ordering::SeqCst);
            }
            controller
                .connect_and_poll(request.use_planned_image, request.fail_on_reboot, Some(tx))
                .await;
            polled = true;
            let wake = (Instant::now() + backoff.next()).min(deadline);
            tokio::time::sleep_until(wake).await;
        }
        send(tx, "timed out").await;
        false
    }
}

async fn send(tx: &Progress, message: &str) {
    let _ = tx
        .send(FastUpdateMessage {
            message: message.to_string(),
            synced: false,
            is_final: false,
        })
        .await;
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Doubling delay, capped.
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeNetwork, FakeObjects, FakeSub, MemoryImages, fs_with, image_with};
    use herd_core::{ComputedInode, Hash, Inode};

    fn admin() -> AuthInfo {
        AuthInfo::admin()
    }

    #[tokio::test]
    async fn converges_a_sub_onto_its_image() {
        let h = Harness::new();
        h.images.put("base/2", image_with(&[("/bin/app", b"v2")]));
        let sub = h.add_sub("sub-1", fs_with(&[("/bin/app", b"v1")]));
        let node = h.node("sub-1", Some("base/2"));

        run_until(&node, SubStatus::Synced, 10).await;

        let state = sub.state();
        assert_eq!(state.fetched, vec![vec![Hash::of(b"v2")]]);
        assert_eq!(state.updates.len(), 1);
        assert_eq!(state.last_successful_image, "base/2");
        assert_eq!(
            state.filesystem.get("/bin/app").and_then(Inode::materialised_hash),
            Some(Hash::of(b"v2"))
        );
        drop(state);
        let snapshot = node.snapshot();
        assert_eq!(snapshot.last_successful_image, "base/2");
        assert!(snapshot.last_sync_time.is_some());
        assert!(!snapshot.busy);
    }

    #[tokio::test]
    async fn synced_sub_stays_synced_without_updates() {
        let h = Harness::new();
        let image = image_with(&[("/a", b"a")]);
        let sub = h.add_sub("sub-1", image.filesystem.clone());
        sub.state().last_successful_image = "base/1".into();
        h.images.put("base/1", image);
        let node = h.node("sub-1", Some("base/1"));

        node.cycle().await;
        assert_eq!(node.status(), SubStatus::Synced);
        node.cycle().await;
        assert_eq!(node.status(), SubStatus::Synced);
        assert!(sub.state().updates.is_empty());
        assert!(sub.state().fetched.is_empty());
    }

    #[tokio::test]
    async fn unsafe_update_waits_for_operator() {
        let h = Harness::new();
        h.images.put("tiny", image_with(&[("/a", b"a")]));
        let files: Vec<(String, Vec<u8>)> = (0..10)
            .map(|i| (format!("/f{i}"), vec![i as u8; 4]))
            .collect();
        let mut refs: Vec<(&str, &[u8])> =
            files.iter().map(|(p, d)| (p.as_str(), d.as_slice())).collect();
        refs.push(("/a", b"a"));
        let sub = h.add_sub("sub-1", fs_with(&refs));
        let node = h.node("sub-1", Some("tiny"));

        node.cycle().await;
        assert_eq!(node.status(), SubStatus::UnsafeUpdate);
        node.cycle().await;
        assert_eq!(node.status(), SubStatus::UnsafeUpdate);
        assert!(sub.state().updates.is_empty());

        let stranger = AuthInfo::user("mallory", &["nobody"]);
        assert_eq!(node.clear_safety_shutoff(&stranger), Err(NodeError::NoAccess));
        node.clear_safety_shutoff(&admin()).unwrap();
        assert!(node.snapshot().pending_safety_clear);

        node.cycle().await;
        assert_eq!(node.status(), SubStatus::Updating);
        assert!(!node.snapshot().pending_safety_clear);
        let state = sub.state();
        assert_eq!(state.updates.len(), 1);
        assert_eq!(state.updates[0].paths_to_delete.len(), 10);
    }

    #[tokio::test]
    async fn operator_flags_require_matching_status() {
        let h = Harness::new();
        let image = image_with(&[("/a", b"a")]);
        let sub = h.add_sub("sub-1", image.filesystem.clone());
        sub.state().last_successful_image = "base/1".into();
        h.images.put("base/1", image);
        let node = h.node("sub-1", Some("base/1"));
        node.cycle().await;

        assert_eq!(
            node.clear_safety_shutoff(&admin()),
            Err(NodeError::NoPendingUnsafeUpdate)
        );
        assert_eq!(
            node.force_disruptive_update(&admin()),
            Err(NodeError::NotWaitingForDisruption)
        );
        assert!(!node.snapshot().pending_safety_clear);
    }

    #[tokio::test]
    async fn owners_may_act_on_their_subs() {
        let h = Harness::new();
        let mut mdb = MdbEntry::new("sub-1");
        mdb.owner_users = vec!["alice".into()];
        mdb.owner_groups = vec!["ops".into()];
        let node = Node::new(mdb, Arc::clone(&h.env));

        assert!(node.check_admin_access(&AuthInfo::user("alice", &[])).is_ok());
        assert!(node.check_admin_access(&AuthInfo::user("bob", &["ops"])).is_ok());
        assert_eq!(
            node.check_admin_access(&AuthInfo::user("bob", &["dev"])),
            Err(NodeError::NoAccess)
        );
    }

    #[tokio::test]
    async fn disabled_updates_hold_until_enabled() {
        let h = Harness::new();
        h.images.put("base/1", image_with(&[("/a", b"new")]));
        let sub = h.add_sub("sub-1", fs_with(&[("/a", b"new"), ("/b", b"b")]));
        let mut mdb = MdbEntry::new("sub-1");
        mdb.required_image = Some("base/1".into());
        mdb.disable_updates = true;
        let node = Node::new(mdb.clone(), Arc::clone(&h.env));

        node.cycle().await;
        assert_eq!(node.status(), SubStatus::UpdatesDisabled);
        node.cycle().await;
        assert_eq!(node.status(), SubStatus::UpdatesDisabled);
        assert!(sub.state().updates.is_empty());

        mdb.disable_updates = false;
        assert!(node.update_mdb(mdb.clone()));
        assert!(!node.update_mdb(mdb));
        node.cycle().await;
        assert_eq!(node.status(), SubStatus::Updating);
        assert_eq!(sub.state().updates.len(), 1);
    }

    #[tokio::test]
    async fn herd_wide_disable_blocks_updates() {
        let h = Harness::new();
        h.images.put("base/1", image_with(&[("/a", b"a")]));
        let sub = h.add_sub("sub-1", fs_with(&[("/a", b"a"), ("/b", b"b")]));
        let node = h.node("sub-1", Some("base/1"));
        h.env
            .update_globals(|g| g.updates_disabled_reason = Some("maintenance".into()));

        node.cycle().await;
        assert_eq!(node.status(), SubStatus::UpdatesDisabled);
        assert!(sub.state().updates.is_empty());
    }

    #[tokio::test]
    async fn denied_rpcs_map_to_denied_statuses() {
        let h = Harness::new();
        h.images.put("base/1", image_with(&[("/a", b"a")]));
        let sub = h.add_sub("sub-1", fs_with(&[("/a", b"old")]));
        let node = h.node("sub-1", Some("base/1"));

        sub.state().denied.insert("Poll".into());
        node.cycle().await;
        assert_eq!(node.status(), SubStatus::PollDenied);
        assert!(!node.snapshot().last_error.is_empty());

        sub.state().denied.clear();
        sub.state().denied.insert("Fetch".into());
        node.cycle().await;
        assert_eq!(node.status(), SubStatus::FetchDenied);
    }

    #[tokio::test]
    async fn unreachable_sub_reports_connection_refused() {
        let h = Harness::new();
        h.images.put("base/1", image_with(&[("/a", b"a")]));
        let node = h.node("sub-1", Some("base/1"));

        assert!(node.try_cycle().await);
        assert_eq!(node.status(), SubStatus::ConnectionRefused);
        assert_eq!(h.network.connects(), 1);
        assert!(!node.snapshot().insecure);
    }

    #[tokio::test]
    async fn connection_is_reused_between_cycles() {
        let h = Harness::new();
        let image = image_with(&[("/a", b"a")]);
        h.add_sub("sub-1", image.filesystem.clone());
        h.images.put("base/1", image);
        let node = h.node("sub-1", Some("base/1"));

        node.cycle().await;
        node.cycle().await;
        node.cycle().await;
        assert_eq!(h.network.connects(), 1);
        assert_eq!(node.snapshot().last_address, "sub-1:6969");
    }

    #[tokio::test]
    async fn no_image_means_image_undefined() {
        let h = Harness::new();
        let sub = h.add_sub("sub-1", fs_with(&[("/a", b"a")]));
        let node = h.node("sub-1", None);

        node.cycle().await;
        assert_eq!(node.status(), SubStatus::ImageUndefined);

        let node = h.node("sub-1", Some("not-yet"));
        node.cycle().await;
        assert_eq!(node.status(), SubStatus::ImageNotReady);
        assert!(sub.state().updates.is_empty());
    }

    #[tokio::test]
    async fn default_image_applies_without_mdb_image() {
        let h = Harness::new();
        h.images.put("default", image_with(&[("/a", b"a")]));
        let sub = h.add_sub("sub-1", fs_with(&[("/a", b"a")]));
        h.env
            .update_globals(|g| g.default_image = Some("default".into()));
        let node = h.node("sub-1", None);

        node.cycle().await;
        assert_eq!(node.status(), SubStatus::Updating);
        assert_eq!(sub.state().updates[0].image_name, "default");
    }

    #[tokio::test]
    async fn not_enough_free_space_skips_fetch() {
        let h = Harness::new();
        h.images.put("big", image_with(&[("/big", &[7u8; 100])]));
        let sub = h.add_sub("sub-1", fs_with(&[("/a", b"a")]));
        sub.state().free_space = Some(10);
        let node = h.node("sub-1", Some("big"));

        node.cycle().await;
        assert_eq!(node.status(), SubStatus::NotEnoughFreeSpace);
        assert!(sub.state().fetched.is_empty());

        // More room shows up in a short poll and forces a full one.
        sub.state().free_space = Some(1 << 20);
        node.cycle().await;
        node.cycle().await;
        assert_eq!(sub.state().fetched.len(), 1);
    }

    #[tokio::test]
    async fn computed_files_are_pushed_once_known() {
        let h = Harness::new();
        let mut image = image_with(&[("/etc/motd", b"hi")]);
        image.filesystem.insert(
            "/etc/hostname",
            Inode::Computed(ComputedInode {
                mode: 0o100644,
                uid: 0,
                gid: 0,
                source: "mdb".into(),
            }),
        );
        h.images.put("base/1", image);
        let sub = h.add_sub("sub-1", fs_with(&[("/etc/motd", b"hi")]));
        let node = h.node("sub-1", Some("base/1"));

        node.cycle().await;
        assert_eq!(node.status(), SubStatus::MissingComputedFile);

        let hash = h.objects.insert(b"sub-1\n");
        node.receive_computed_files(vec![ComputedFile {
            path: "/etc/hostname".into(),
            hash,
            length: 6,
        }]);
        node.cycle().await;
        assert_eq!(node.status(), SubStatus::Updating);
        let state = sub.state();
        assert_eq!(state.pushed, vec![hash]);
        assert_eq!(
            state
                .filesystem
                .get("/etc/hostname")
                .and_then(Inode::materialised_hash),
            Some(hash)
        );
    }

    #[tokio::test]
    async fn deleting_node_stops_cycling() {
        let h = Harness::new();
        h.images.put("base/1", image_with(&[("/a", b"a")]));
        let sub = h.add_sub("sub-1", fs_with(&[("/a", b"a")]));
        let node = Arc::new(h.node("sub-1", Some("base/1")));

        node.mark_deleting();
        node.cycle().await;
        assert!(sub.state().calls.is_empty());
        assert_eq!(
            node.fast_update(FastUpdateRequest::default(), &admin()).err(),
            Some(NodeError::Deleting)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_fetch_or_update_in_flight() {
        let h = Harness::new();
        h.images.put("base/2", image_with(&[("/bin/app", b"v2")]));
        let sub = Arc::new(
            FakeSub::new(fs_with(&[("/bin/app", b"v1")])).with_busy_delay(Duration::from_millis(50)),
        );
        h.network.add("sub-1:6969", Arc::clone(&sub));
        let node = Arc::new(h.node("sub-1", Some("base/2")));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let node = Arc::clone(&node);
            tasks.push(tokio::spawn(async move {
                for _ in 0..4 {
                    node.cycle().await;
                    node.try_cycle().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(node.status(), SubStatus::Synced);
        assert_eq!(sub.max_in_flight(), 1);
        assert_eq!(sub.state().updates.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_update_ends_with_one_final_message() {
        let h = Harness::new();
        h.images.put("base/2", image_with(&[("/bin/app", b"v2")]));
        let sub = h.add_sub("sub-1", fs_with(&[("/bin/app", b"v1")]));
        let node = Arc::new(h.node("sub-1", Some("base/2")));

        let mut rx = node
            .fast_update(FastUpdateRequest::default(), &admin())
            .unwrap();
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        let finals: Vec<_> = messages.iter().filter(|m| m.is_final).collect();
        assert_eq!(finals.len(), 1);
        let last = messages.last().unwrap();
        assert!(last.is_final);
        assert!(last.synced);
        let texts: Vec<&str> = messages.iter().map(|m| m.message.as_str()).collect();
        assert!(texts.contains(&"got fast update slot"));
        assert!(texts.contains(&"made sub busy"));
        assert!(texts.contains(&"synced"));
        assert!(sub.state().calls.contains(&"BoostCpuLimit".to_string()));
        assert_eq!(sub.state().fetched.len(), 1);
        assert!(!node.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn fast_update_stops_on_unsafe_update() {
        let h = Harness::new();
        h.images.put("tiny", image_with(&[("/a", b"a")]));
        let files: Vec<(String, Vec<u8>)> = (0..6)
            .map(|i| (format!("/f{i}"), vec![i as u8; 4]))
            .collect();
        let refs: Vec<(&str, &[u8])> =
            files.iter().map(|(p, d)| (p.as_str(), d.as_slice())).collect();
        h.add_sub("sub-1", fs_with(&refs));
        let node = Arc::new(h.node("sub-1", Some("tiny")));

        let mut rx = node
            .fast_update(FastUpdateRequest::default(), &admin())
            .unwrap();
        let mut last = None;
        let mut saw_unsafe = false;
        while let Some(message) = rx.recv().await {
            saw_unsafe |= message.message == "unsafe update";
            last = Some(message);
        }
        assert!(saw_unsafe);
        let last = last.unwrap();
        assert!(last.is_final);
        assert!(!last.synced);
    }

    #[tokio::test]
    async fn fast_update_validates_image() {
        let h = Harness::new();
        let node = Arc::new(h.node("sub-1", None));
        assert_eq!(
            node.fast_update(FastUpdateRequest::default(), &admin()).err(),
            Some(NodeError::NoImageSpecified("required image"))
        );
        let request = FastUpdateRequest {
            use_planned_image: true,
            ..Default::default()
        };
        assert_eq!(
            node.fast_update(request, &admin()).err(),
            Some(NodeError::NoImageSpecified("planned image"))
        );

        let node = Arc::new(h.node("sub-1", Some("missing")));
        assert_eq!(
            node.fast_update(FastUpdateRequest::default(), &admin()).err(),
            Some(NodeError::ImageNotReady("missing".into()))
        );
        assert_eq!(
            node.fast_update(FastUpdateRequest::default(), &AuthInfo::user("x", &[]))
                .err(),
            Some(NodeError::NoAccess)
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(backoff.next(), Duration::from_millis(10));
        assert_eq!(backoff.next(), Duration::from_millis(20));
        assert_eq!(backoff.next(), Duration::from_millis(35));
        assert_eq!(backoff.next(), Duration::from_millis(35));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(10));
    }

    // ── Harness ────────────────────────────────────────────────────

    struct Harness {
        env: Arc<NodeEnv>,
        network: Arc<FakeNetwork>,
        images: Arc<MemoryImages>,
        objects: Arc<FakeObjects>,
    }

    impl Harness {
        fn new() -> Self {
            let network = Arc::new(FakeNetwork::default());
            let images = Arc::new(MemoryImages::default());
            let objects = Arc::new(FakeObjects::default());
            let mut env = NodeEnv::new(
                herd_throttle::Limits::default(),
                Arc::clone(&network) as _,
                Arc::clone(&images) as _,
            );
            env.object_getter = Some(Arc::clone(&objects) as _);
            env.object_server = "objects:6970".into();
            Self {
                env: Arc::new(env),
                network,
                images,
                objects,
            }
        }

        fn add_sub(&self, hostname: &str, fs: herd_core::FileSystem) -> Arc<FakeSub> {
            let sub = Arc::new(FakeSub::new(fs));
            self.network.add(&format!("{hostname}:6969"), Arc::clone(&sub));
            sub
        }

        fn node(&self, hostname: &str, image: Option<&str>) -> Node {
            let mut mdb = MdbEntry::new(hostname);
            mdb.required_image = image.map(str::to_string);
            Node::new(mdb, Arc::clone(&self.env))
        }
    }

    async fn run_until(node: &Node, status: SubStatus, max_cycles: usize) {
        for _ in 0..max_cycles {
            node.cycle().await;
            if node.status() == status {
                return;
            }
        }
        panic!("{} never reached {status}: {:?}", node.hostname(), node.snapshot());
    }
}
