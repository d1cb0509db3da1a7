//! A herd converging a real directory tree through a sub served over TCP.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use herd::{DirObjects, Herd};
use herd_applier::runner::BoxFuture as RunnerFuture;
use herd_applier::{RebootMethod, ServiceRunner};
use herd_core::{
    DirectoryInode, DisruptionState, FileSystem, Filter, Hash, HerdConfig, Image, Inode,
    MdbEntry, RegularInode, Trigger, Triggers,
};
use herd_disruption::{
    DisruptionCommand, DisruptionHandle, DisruptionManager, DisruptionPolicy, DisruptionResult,
    DisruptionTiming, start_coordinator,
};
use herd_node::{JsonConnector, ObjectGetter, SubClient, SubConnector, SubStatus, tcp};
use herd_state::StateStore;
use herd_sub::{LocalSub, SubOptions};
use tokio::net::TcpListener;
use tokio::sync::watch;

const HOST: &str = "127.0.0.1";
const IMAGE: &str = "app/2";
const MTIME: i64 = 1_700_000_000;

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl Recorder {
    fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl ServiceRunner for Recorder {
    fn service(&self, service: &str, action: &str) -> RunnerFuture<'_, Result<(), String>> {
        self.0.lock().unwrap().push(format!("{action} {service}"));
        Box::pin(async { Ok(()) })
    }

    fn reboot(&self, method: RebootMethod) -> RunnerFuture<'_, Result<(), String>> {
        self.0.lock().unwrap().push(format!("reboot {method:?}"));
        Box::pin(async { Err("not permitted".to_string()) })
    }
}

/// A disruption manager whose answer the test flips.
struct Switch {
    state: Mutex<DisruptionState>,
    commands: Mutex<Vec<DisruptionCommand>>,
}

impl Switch {
    fn new(state: DisruptionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            commands: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, state: DisruptionState) {
        *self.state.lock().unwrap() = state;
    }

    fn saw(&self, command: DisruptionCommand) -> bool {
        self.commands.lock().unwrap().contains(&command)
    }
}

impl DisruptionManager for Switch {
    fn run(
        &self,
        command: DisruptionCommand,
    ) -> herd_disruption::policy::BoxFuture<'_, DisruptionResult<DisruptionState>> {
        self.commands.lock().unwrap().push(command);
        let state = *self.state.lock().unwrap();
        Box::pin(async move { Ok(state) })
    }
}

fn quick_timing() -> DisruptionTiming {
    let short = Duration::from_millis(20);
    DisruptionTiming {
        check_change_to_disrupt: short,
        check_change_to_non_disrupt: short,
        check_disrupt: short,
        check_non_disrupt: short,
        check_startup: short,
        cancel_when_permitted: Duration::from_secs(600),
        cancel_when_requested: Duration::from_secs(600),
        request_when_denied: short,
        request_when_requested: short,
        resend_minimum: Duration::from_millis(1),
        resend_same_mutation: short,
        retry_failed_mutation: short,
    }
}

struct Site {
    _dir: tempfile::TempDir,
    root: PathBuf,
    herd: Herd,
    runner: Arc<Recorder>,
    _shutdown: watch::Sender<bool>,
}

impl Site {
    /// A root holding `/etc/app.conf` = "v1" and `/stale`, a sub serving it
    /// on a local port, and a herd that wants `/etc/app.conf` = "v2".
    async fn start(
        high_impact: bool,
        disruption: DisruptionHandle,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("etc")).unwrap();
        for path in [root.clone(), root.join("etc")] {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        std::fs::write(root.join("etc/app.conf"), b"v1").unwrap();
        std::fs::write(root.join("stale"), b"left over").unwrap();

        let objects = DirObjects::new(dir.path().join("objects"));
        let hash = objects.put(b"v2").await.unwrap();

        let runner = Arc::new(Recorder::default());
        let mut options = SubOptions::new(&root);
        options.set_ownership = false;
        let sub = LocalSub::new(
            options,
            Arc::new(objects) as Arc<dyn ObjectGetter>,
            Arc::clone(&runner) as Arc<dyn ServiceRunner>,
            disruption,
        )
        .unwrap();
        let listener = TcpListener::bind((HOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(tcp::serve(
            listener,
            Arc::new(sub) as Arc<dyn SubClient>,
            shutdown.subscribe(),
        ));

        let mut config = HerdConfig::default();
        config.herd.sub_port = port;
        config.herd.rpc_timeout_secs = 10;
        let herd = Herd::new(
            &config,
            StateStore::open_in_memory().unwrap(),
            Arc::new(JsonConnector::default()) as Arc<dyn SubConnector>,
            None,
        )
        .unwrap();
        herd.add_image(IMAGE, image(&root, hash, high_impact))
            .unwrap();
        let mut entry = MdbEntry::new(HOST);
        entry.required_image = Some(IMAGE.to_string());
        herd.sync_mdb(vec![entry]).await.unwrap();

        Self {
            _dir: dir,
            root,
            herd,
            runner,
            _shutdown: shutdown,
        }
    }

    fn conf(&self) -> Vec<u8> {
        std::fs::read(self.root.join("etc/app.conf")).unwrap()
    }

    async fn status(&self) -> SubStatus {
        self.herd.snapshot(HOST).await.unwrap().status
    }

    async fn scan_until(&self, status: SubStatus) {
        for _ in 0..20 {
            for handle in self.herd.start_cycles().await {
                handle.await.unwrap();
            }
            if self.status().await == status {
                return;
            }
        }
        panic!(
            "sub never reached {status}: {:?}",
            self.herd.snapshot(HOST).await.unwrap()
        );
    }
}

/// The wanted tree, owned like the test's own files. `/var` holds the
/// patched-image record, which the image leaves alone.
fn image(root: &Path, conf: Hash, high_impact: bool) -> Image {
    let meta = std::fs::metadata(root).unwrap();
    let (uid, gid) = (meta.uid(), meta.gid());
    let dir = || {
        Inode::Directory(DirectoryInode {
            mode: 0o040755,
            uid,
            gid,
        })
    };
    let mut fs = FileSystem::default();
    fs.insert("/", dir());
    fs.insert("/etc", dir());
    fs.insert(
        "/etc/app.conf",
        Inode::Regular(RegularInode {
            mode: 0o100644,
            uid,
            gid,
            mtime_seconds: MTIME,
            mtime_nanos: 0,
            size: 2,
            hash: conf,
        }),
    );
    let mut trigger = Trigger::new("app", &["/etc/app.conf"]).unwrap();
    trigger.high_impact = high_impact;
    Image {
        filesystem: fs,
        filter: Some(Filter::new(["/var(/.*)?"]).unwrap()),
        triggers: Triggers::new(vec![trigger]),
    }
}

async fn wait_for(handle: &DisruptionHandle, state: DisruptionState) {
    for _ in 0..500 {
        if handle.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("disruption state never became {state}: {}", handle.state());
}

#[tokio::test]
async fn herd_cycle_converges_a_real_tree() {
    let (shutdown, _) = watch::channel(false);
    let site = Site::start(false, DisruptionHandle::always_permitted(), shutdown).await;

    site.scan_until(SubStatus::Synced).await;

    assert_eq!(site.conf(), b"v2");
    let meta = std::fs::metadata(site.root.join("etc/app.conf")).unwrap();
    assert_eq!(meta.mode(), 0o100644);
    assert_eq!(meta.mtime(), MTIME);
    assert!(!site.root.join("stale").exists());
    assert_eq!(site.runner.calls(), vec!["stop app", "start app"]);
    assert_eq!(
        std::fs::read_to_string(site.root.join("var/lib/patched-image")).unwrap(),
        "app/2\n"
    );
    assert_eq!(
        site.herd.snapshot(HOST).await.unwrap().last_successful_image,
        IMAGE
    );
}

#[tokio::test]
async fn high_impact_update_waits_for_disruption_permission() {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let switch = Switch::new(DisruptionState::Requested);
    let handle = start_coordinator(
        DisruptionPolicy::External(Arc::clone(&switch) as Arc<dyn DisruptionManager>),
        quick_timing(),
        shutdown_rx,
    );
    wait_for(&handle, DisruptionState::Requested).await;
    let site = Site::start(true, handle.clone(), shutdown).await;

    site.scan_until(SubStatus::DisruptionRequested).await;
    assert_eq!(site.conf(), b"v1");
    assert!(site.root.join("stale").exists());
    assert!(site.runner.calls().is_empty());

    switch.set(DisruptionState::Permitted);
    wait_for(&handle, DisruptionState::Permitted).await;
    site.scan_until(SubStatus::Synced).await;

    assert_eq!(site.conf(), b"v2");
    assert!(!site.root.join("stale").exists());
    assert_eq!(site.runner.calls(), vec!["stop app", "start app"]);
    assert!(switch.saw(DisruptionCommand::Request));
}
