//! [`LocalSub`]: a sub serving the herd protocol against a real root.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use herd_applier::{PATCHED_IMAGE_FILE, ServiceRunner, UpdateOptions, Updater};
use herd_core::{
    AddObjectsRequest, CleanupRequest, FetchRequest, FileSystem, Filter, Hash, PollRequest,
    PollResponse, SubConfiguration, UpdateRequest,
};
use herd_disruption::DisruptionHandle;
use herd_node::{BoxFuture, ObjectGetter, RpcError, RpcResult, SubClient};
use tracing::{debug, info, warn};

use crate::error::{SubError, SubResult};
use crate::objects::ObjectCache;
use crate::scan::{ScanCache, scan_root};

const BUSY: &str = "another Fetch or Update is in progress";

#[derive(Debug, Clone)]
pub struct SubOptions {
    pub root: PathBuf,
    /// Holds the object cache and the triggers of the last update.
    pub state_dir: PathBuf,
    pub set_ownership: bool,
    pub reboot_timeout: Duration,
}

impl SubOptions {
    /// Options for `root`, keeping state in its private `.subd` directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state_dir: root.join(".subd"),
            root,
            set_ownership: true,
            reboot_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct SubState {
    generation: u64,
    scan_count: u64,
    filesystem: FileSystem,
    object_cache: Vec<Hash>,
    configuration: SubConfiguration,
    exclusions: Filter,
    last_fetch_error: String,
    last_update_error: String,
    last_update_had_trigger_failures: bool,
    last_successful_image_name: String,
}

/// Clears its flag when dropped.
struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct LocalSub {
    root: PathBuf,
    objects: ObjectCache,
    source: Arc<dyn ObjectGetter>,
    updater: Updater,
    disruption: DisruptionHandle,
    state: Mutex<SubState>,
    scan_cache: Arc<Mutex<ScanCache>>,
    /// Held for the whole of a Fetch, Update or Cleanup.
    work: tokio::sync::Mutex<()>,
    fetching: AtomicBool,
    updating: AtomicBool,
    start_time: u64,
}

impl LocalSub {
    /// A sub for `options.root` that fetches objects from `source` and
    /// asks `disruption` before high-impact updates.
    pub fn new(
        options: SubOptions,
        source: Arc<dyn ObjectGetter>,
        runner: Arc<dyn ServiceRunner>,
        disruption: DisruptionHandle,
    ) -> SubResult<Self> {
        let objects = ObjectCache::open(options.state_dir.join("objects"))?;
        let mut update_options = UpdateOptions::new(&options.root, objects.dir());
        update_options.old_triggers_file = Some(options.state_dir.join("triggers.previous"));
        update_options.set_ownership = options.set_ownership;
        update_options.reboot_timeout = options.reboot_timeout;
        let updater =
            Updater::new(update_options, runner).with_disruption(Arc::new(disruption.clone()));
        let state = SubState {
            last_successful_image_name: patched_image_name(&options.root),
            ..Default::default()
        };
        info!(root = %options.root.display(), image = %state.last_successful_image_name, "sub ready");
        Ok(Self {
            root: options.root,
            objects,
            source,
            updater,
            disruption,
            state: Mutex::new(state),
            scan_cache: Arc::default(),
            work: tokio::sync::Mutex::new(()),
            fetching: AtomicBool::new(false),
            updating: AtomicBool::new(false),
            start_time: epoch_seconds(),
        })
    }

    fn state(&self) -> MutexGuard<'_, SubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_work(&self) -> RpcResult<tokio::sync::MutexGuard<'_, ()>> {
        self.work
            .try_lock()
            .map_err(|_| RpcError::Remote(BUSY.to_string()))
    }

    /// Rescan the root and object cache, bumping the generation on change.
    async fn rescan(&self) -> SubResult<()> {
        let root = self.root.clone();
        let objects = self.objects.clone();
        let exclusions = self.state().exclusions.clone();
        let cache = Arc::clone(&self.scan_cache);
        let (filesystem, object_cache) = tokio::task::spawn_blocking(move || {
            let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
            let filesystem = scan_root(&root, &exclusions, &mut cache)?;
            Ok::<_, SubError>((filesystem, objects.list()?))
        })
        .await
        .map_err(|e| SubError::Task(e.to_string()))??;

        let mut state = self.state();
        state.scan_count += 1;
        if state.generation == 0
            || state.filesystem != filesystem
            || state.object_cache != object_cache
        {
            state.generation += 1;
            state.filesystem = filesystem;
            state.object_cache = object_cache;
            debug!(generation = state.generation, "sub changed");
        }
        Ok(())
    }
}

impl SubClient for LocalSub {
    fn poll(&self, request: PollRequest) -> BoxFuture<'_, RpcResult<PollResponse>> {
        Box::pin(async move {
            // A running Fetch or Update is reported, not rescanned under.
            if let Ok(_idle) = self.work.try_lock() {
                self.rescan()
                    .await
                    .map_err(|e| RpcError::Remote(e.to_string()))?;
            }
            let state = self.state();
            let full = request.have_generation != state.generation && !request.short_poll_only;
            Ok(PollResponse {
                generation_count: state.generation,
                scan_count: state.scan_count,
                free_space: free_space(&self.root),
                current_configuration: state.configuration.clone(),
                fetch_in_progress: self.fetching.load(Ordering::SeqCst),
                update_in_progress: self.updating.load(Ordering::SeqCst),
                last_fetch_error: state.last_fetch_error.clone(),
                last_update_error: state.last_update_error.clone(),
                last_update_had_trigger_failures: state.last_update_had_trigger_failures,
                last_successful_image_name: state.last_successful_image_name.clone(),
                disruption_state: self.disruption.state(),
                start_time: self.start_time,
                poll_time: epoch_seconds(),
                filesystem: full.then(|| state.filesystem.clone()),
                object_cache: full.then(|| state.object_cache.clone()),
                ..Default::default()
            })
        })
    }

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            let _work = self.begin_work()?;
            let _fetching = InProgress::raise(&self.fetching);
            info!(
                objects = request.hashes.len(),
                server = %request.server_address,
                "fetch started"
            );
            let mut last_error = String::new();
            for hash in request.hashes {
                if self.objects.contains(&hash).await {
                    continue;
                }
                let stored = match self.source.get_object(hash).await {
                    Ok(data) => self.objects.add(hash, &data).await.map_err(|e| e.to_string()),
                    Err(e) => Err(e),
                };
                if let Err(e) = stored {
                    warn!(%hash, error = %e, "fetch failed");
                    last_error = e;
                }
            }
            self.state().last_fetch_error = last_error;
            Ok(())
        })
    }

    fn update(&self, request: UpdateRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            let _work = self.begin_work()?;
            let _updating = InProgress::raise(&self.updating);
            let image = request.image_name.clone();
            let result = self.updater.update(request).await;
            let mut state = self.state();
            match result {
                Ok(outcome) => {
                    state.last_update_had_trigger_failures = outcome.had_trigger_failures;
                    match outcome.last_error {
                        Some(e) => state.last_update_error = e,
                        None => {
                            state.last_update_error.clear();
                            if !image.is_empty() {
                                state.last_successful_image_name = image;
                            }
                        }
                    }
                }
                Err(e) => {
                    info!(%image, error = %e, "update not applied");
                    state.last_update_had_trigger_failures = false;
                    state.last_update_error = e.to_string();
                }
            }
            Ok(())
        })
    }

    fn cleanup(&self, request: CleanupRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            let _work = self.begin_work()?;
            let mut removed = 0;
            for hash in &request.hashes {
                match self.objects.remove(hash).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(%hash, error = %e, "cleanup failed"),
                }
            }
            self.disruption.cancel();
            debug!(removed, requested = request.hashes.len(), "cleanup done");
            Ok(())
        })
    }

    fn get_configuration(&self) -> BoxFuture<'_, RpcResult<SubConfiguration>> {
        Box::pin(async move { Ok(self.state().configuration.clone()) })
    }

    fn set_configuration(&self, config: SubConfiguration) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            let exclusions = Filter::new(&config.scan_exclusions)
                .map_err(|e| RpcError::Remote(e.to_string()))?;
            let mut state = self.state();
            state.configuration = config;
            state.exclusions = exclusions;
            Ok(())
        })
    }

    fn boost_cpu_limit(&self) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            debug!("cpu limit boost requested");
            Ok(())
        })
    }

    fn boost_scan_limit(&self) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            debug!("scan limit boost requested");
            Ok(())
        })
    }

    fn add_objects(&self, request: AddObjectsRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            for (hash, data) in request.objects {
                self.objects
                    .add(hash, &data)
                    .await
                    .map_err(|e| RpcError::Remote(e.to_string()))?;
            }
            Ok(())
        })
    }
}

fn patched_image_name(root: &Path) -> String {
    let path = root.join(PATCHED_IMAGE_FILE.trim_start_matches('/'));
    std::fs::read_to_string(path)
        .map(|name| name.trim().to_string())
        .unwrap_or_default()
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Bytes available to unprivileged users on the file-system holding `path`.
fn free_space(path: &Path) -> Option<u64> {
    let path = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: `path` is NUL-terminated and `stat` is a valid out-pointer.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
    (rc == 0).then(|| stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_applier::RebootMethod;
    use herd_core::{DirectoryInode, Inode, InodeChange, RegularInode, Trigger, Triggers};
    use herd_node::fake::FakeObjects;
    use std::os::unix::fs::MetadataExt;

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    impl Calls {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl ServiceRunner for Calls {
        fn service(
            &self,
            service: &str,
            action: &str,
        ) -> herd_applier::runner::BoxFuture<'_, Result<(), String>> {
            self.0.lock().unwrap().push(format!("{action} {service}"));
            Box::pin(async { Ok(()) })
        }

        fn reboot(
            &self,
            method: RebootMethod,
        ) -> herd_applier::runner::BoxFuture<'_, Result<(), String>> {
            self.0.lock().unwrap().push(format!("reboot {method:?}"));
            Box::pin(async { Err("not permitted".to_string()) })
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        objects: Arc<FakeObjects>,
        calls: Arc<Calls>,
        sub: LocalSub,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("etc")).unwrap();
            std::fs::write(dir.path().join("etc/app.conf"), b"v1").unwrap();
            let objects = Arc::new(FakeObjects::default());
            let calls = Arc::new(Calls::default());
            let mut options = SubOptions::new(dir.path());
            options.set_ownership = false;
            let sub = LocalSub::new(
                options,
                Arc::clone(&objects) as Arc<dyn ObjectGetter>,
                Arc::clone(&calls) as Arc<dyn ServiceRunner>,
                DisruptionHandle::always_permitted(),
            )
            .unwrap();
            Self {
                dir,
                objects,
                calls,
                sub,
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        async fn full_poll(&self) -> PollResponse {
            self.sub.poll(PollRequest::default()).await.unwrap()
        }

        /// Replace /etc/app.conf with `data` and restart `app`.
        fn replace_conf(&self, data: &[u8]) -> UpdateRequest {
            let meta = std::fs::metadata(self.path("etc")).unwrap();
            UpdateRequest {
                image_name: "app/2".into(),
                inodes_to_make: vec![InodeChange {
                    name: "/etc/app.conf".into(),
                    inode: Inode::Regular(RegularInode {
                        mode: 0o100644,
                        uid: meta.uid(),
                        gid: meta.gid(),
                        mtime_seconds: 1_700_000_000,
                        mtime_nanos: 0,
                        size: data.len() as u64,
                        hash: Hash::of(data),
                    }),
                }],
                directories_to_make: vec![InodeChange {
                    name: "/srv".into(),
                    inode: Inode::Directory(DirectoryInode {
                        mode: 0o040755,
                        uid: meta.uid(),
                        gid: meta.gid(),
                    }),
                }],
                triggers: Triggers::new(vec![Trigger::new("app", &["/etc/app.conf"]).unwrap()]),
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn polls_report_the_scanned_root() {
        let fx = Fixture::new();
        let first = fx.full_poll().await;
        assert_eq!(first.generation_count, 1);
        assert_eq!(first.scan_count, 1);
        assert!(first.free_space.is_some());
        let fs = first.filesystem.unwrap();
        assert_eq!(
            fs.get("/etc/app.conf").and_then(Inode::materialised_hash),
            Some(Hash::of(b"v1"))
        );
        assert!(fs.get("/.subd").is_none());

        let short = fx
            .sub
            .poll(PollRequest {
                have_generation: 1,
                short_poll_only: false,
            })
            .await
            .unwrap();
        assert_eq!(short.generation_count, 1);
        assert_eq!(short.scan_count, 2);
        assert!(short.filesystem.is_none());

        std::fs::write(fx.path("etc/new"), b"x").unwrap();
        let changed = fx
            .sub
            .poll(PollRequest {
                have_generation: 1,
                short_poll_only: true,
            })
            .await
            .unwrap();
        assert_eq!(changed.generation_count, 2);
        assert!(changed.filesystem.is_none());
    }

    #[tokio::test]
    async fn fetch_update_and_cleanup_change_the_root() {
        let fx = Fixture::new();
        let hash = fx.objects.insert(b"v2");
        fx.sub
            .fetch(FetchRequest {
                hashes: vec![hash],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(fx.full_poll().await.object_cache, Some(vec![hash]));

        fx.sub.update(fx.replace_conf(b"v2")).await.unwrap();
        assert_eq!(std::fs::read(fx.path("etc/app.conf")).unwrap(), b"v2");
        assert!(fx.path("srv").is_dir());
        assert_eq!(fx.calls.take(), vec!["stop app", "start app"]);

        let reply = fx.full_poll().await;
        assert_eq!(reply.last_update_error, "");
        assert_eq!(reply.last_successful_image_name, "app/2");
        assert!(reply.object_cache.unwrap().is_empty());
        assert_eq!(
            std::fs::read_to_string(fx.path("var/lib/patched-image")).unwrap(),
            "app/2\n"
        );

        fx.sub
            .add_objects(AddObjectsRequest {
                objects: vec![(Hash::of(b"extra"), b"extra".to_vec())],
            })
            .await
            .unwrap();
        fx.sub
            .cleanup(CleanupRequest {
                hashes: vec![Hash::of(b"extra")],
            })
            .await
            .unwrap();
        assert!(fx.full_poll().await.object_cache.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_objects_are_reported_as_fetch_errors() {
        let fx = Fixture::new();
        fx.sub
            .fetch(FetchRequest {
                hashes: vec![Hash::of(b"nowhere")],
                ..Default::default()
            })
            .await
            .unwrap();
        let reply = fx.full_poll().await;
        assert!(reply.last_fetch_error.contains("not found"));
        assert!(!reply.fetch_in_progress);
    }

    #[tokio::test]
    async fn update_without_objects_reports_the_error() {
        let fx = Fixture::new();
        fx.sub.update(fx.replace_conf(b"v3")).await.unwrap();
        let reply = fx.full_poll().await;
        assert!(!reply.last_update_error.is_empty());
        assert_eq!(reply.last_successful_image_name, "");
        assert_eq!(std::fs::read(fx.path("etc/app.conf")).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn scan_exclusions_follow_the_configuration() {
        let fx = Fixture::new();
        fx.sub
            .set_configuration(SubConfiguration {
                scan_exclusions: vec!["/etc(/.*)?".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        let fs = fx.full_poll().await.filesystem.unwrap();
        assert!(fs.get("/etc").is_none());
        assert_eq!(
            fx.sub.get_configuration().await.unwrap().scan_exclusions,
            vec!["/etc(/.*)?"]
        );

        let bad = SubConfiguration {
            scan_exclusions: vec!["(".into()],
            ..Default::default()
        };
        assert!(fx.sub.set_configuration(bad).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_work_is_rejected() {
        let fx = Fixture::new();
        let _held = fx.sub.work.try_lock().unwrap();
        let err = fx
            .sub
            .fetch(FetchRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Remote(BUSY.to_string()));
        // Polls during work answer from the last scan.
        let reply = fx.full_poll().await;
        assert_eq!(reply.scan_count, 0);
    }

    #[test]
    fn patched_image_survives_restarts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("var/lib")).unwrap();
        std::fs::write(dir.path().join("var/lib/patched-image"), "base/7\n").unwrap();
        assert_eq!(patched_image_name(dir.path()), "base/7");
        assert_eq!(patched_image_name(&dir.path().join("missing")), "");
    }
}
