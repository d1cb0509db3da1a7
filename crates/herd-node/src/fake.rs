//! An in-memory sub for tests.
//!
//! [`FakeSub`] keeps a file-system, an object cache and a generation count
//! and applies update requests to them in batch order. Calls can be slowed
//! down or denied per method, and the number of overlapping Fetch/Update
//! calls is tracked.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use herd_core::{
    AddObjectsRequest, CleanupRequest, DirectoryInode, DisruptionState, FetchRequest, FileSystem,
    Hash, Image, Inode, PollRequest, PollResponse, RegularInode, SubConfiguration, UpdateRequest,
};

use crate::error::{RpcError, RpcResult};
use crate::transport::{BoxFuture, ImageSource, ObjectGetter, SubClient, SubConnector};

#[derive(Debug, Clone)]
pub struct FakeState {
    pub filesystem: FileSystem,
    pub object_cache: BTreeSet<Hash>,
    pub generation: u64,
    pub scan_count: u64,
    pub free_space: Option<u64>,
    pub configuration: SubConfiguration,
    pub last_successful_image: String,
    pub last_update_error: String,
    pub disruption_state: DisruptionState,
    pub start_time: u64,
    /// Methods answered with access denied.
    pub denied: BTreeSet<String>,
    /// Every call in arrival order, by method name.
    pub calls: Vec<String>,
    pub fetched: Vec<Vec<Hash>>,
    pub updates: Vec<UpdateRequest>,
    pub cleanups: Vec<Vec<Hash>>,
    pub pushed: Vec<Hash>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            filesystem: FileSystem::new(),
            object_cache: BTreeSet::new(),
            generation: 1,
            scan_count: 1,
            free_space: None,
            configuration: SubConfiguration::default(),
            last_successful_image: String::new(),
            last_update_error: String::new(),
            disruption_state: DisruptionState::Anytime,
            start_time: 1_700_000_000,
            denied: BTreeSet::new(),
            calls: Vec::new(),
            fetched: Vec::new(),
            updates: Vec::new(),
            cleanups: Vec::new(),
            pushed: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeSub {
    state: Mutex<FakeState>,
    /// How long Fetch and Update take.
    pub busy_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeSub {
    pub fn new(filesystem: FileSystem) -> Self {
        Self {
            state: Mutex::new(FakeState {
                filesystem,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn with_busy_delay(mut self, delay: Duration) -> Self {
        self.busy_delay = delay;
        self
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most Fetch/Update calls that were ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, method: &str) -> RpcResult<()> {
        let mut state = self.state();
        state.calls.push(method.to_string());
        if state.denied.contains(method) {
            return Err(RpcError::AccessDenied);
        }
        Ok(())
    }

    async fn busy<T>(&self, f: impl FnOnce(&mut FakeState) -> RpcResult<T>) -> RpcResult<T> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.busy_delay.is_zero() {
            tokio::time::sleep(self.busy_delay).await;
        }
        let result = f(&mut self.state());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Apply `request` to `state` in batch order.
fn apply_update(state: &mut FakeState, request: &UpdateRequest) -> Result<(), String> {
    for copy in &request.files_to_copy_to_cache {
        state.object_cache.insert(copy.hash);
    }
    let fs = &mut state.filesystem;
    for change in &request.directories_to_make {
        fs.insert(&change.name, change.inode.clone());
    }
    for change in &request.inodes_to_make {
        if let Some(hash) = change.inode.materialised_hash() {
            if !state.object_cache.contains(&hash) {
                return Err(format!("{}: object {hash} not in cache", change.name));
            }
            if !request.multiply_used_objects.contains_key(&hash) {
                state.object_cache.remove(&hash);
            }
        }
        fs.insert(&change.name, change.inode.clone());
    }
    for link in &request.hardlinks_to_make {
        fs.link(&link.new_link, &link.target)
            .map_err(|e| e.to_string())?;
    }
    for path in &request.paths_to_delete {
        let prefix = format!("{path}/");
        fs.paths
            .retain(|name, _| name != path && !name.starts_with(&prefix));
    }
    for change in &request.inodes_to_change {
        let number = fs
            .inode_number(&change.name)
            .ok_or_else(|| format!("{}: no such path", change.name))?;
        let merged = match (fs.inodes.get(&number), &change.inode) {
            (Some(Inode::Regular(have)), Inode::Regular(want)) => {
                let mut inode = want.clone();
                inode.hash = have.hash;
                inode.size = have.size;
                Inode::Regular(inode)
            }
            _ => change.inode.clone(),
        };
        fs.inodes.insert(number, merged);
    }
    let live: BTreeSet<_> = fs.paths.values().copied().collect();
    fs.inodes.retain(|number, _| live.contains(number));
    Ok(())
}

impl SubClient for FakeSub {
    fn poll(&self, request: PollRequest) -> BoxFuture<'_, RpcResult<PollResponse>> {
        Box::pin(async move {
            self.record("Poll")?;
            let mut state = self.state();
            // A real sub rescans continuously.
            state.scan_count += 1;
            let full = request.have_generation != state.generation && !request.short_poll_only;
            Ok(PollResponse {
                generation_count: state.generation,
                scan_count: state.scan_count,
                free_space: state.free_space,
                current_configuration: state.configuration.clone(),
                last_update_error: state.last_update_error.clone(),
                last_successful_image_name: state.last_successful_image.clone(),
                disruption_state: state.disruption_state,
                start_time: state.start_time,
                poll_time: state.start_time + state.scan_count,
                filesystem: full.then(|| state.filesystem.clone()),
                object_cache: full.then(|| state.object_cache.iter().copied().collect()),
                ..Default::default()
            })
        })
    }

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            self.record("Fetch")?;
            self.busy(|state| {
                state.object_cache.extend(request.hashes.iter().copied());
                state.fetched.push(request.hashes);
                state.generation += 1;
                state.scan_count += 1;
                Ok(())
            })
            .await
        })
    }

    fn update(&self, request: UpdateRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            self.record("Update")?;
            self.busy(|state| {
                match apply_update(state, &request) {
                    Ok(()) => {
                        state.last_successful_image = request.image_name.clone();
                        state.last_update_error.clear();
                    }
                    Err(e) => state.last_update_error = e,
                }
                state.updates.push(request);
                state.generation += 1;
                state.scan_count += 1;
                Ok(())
            })
            .await
        })
    }

    fn cleanup(&self, request: CleanupRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            self.record("Cleanup")?;
            let mut state = self.state();
            for hash in &request.hashes {
                state.object_cache.remove(hash);
            }
            state.cleanups.push(request.hashes);
            Ok(())
        })
    }

    fn get_configuration(&self) -> BoxFuture<'_, RpcResult<SubConfiguration>> {
        Box::pin(async move {
            self.record("GetConfiguration")?;
            Ok(self.state().configuration.clone())
        })
    }

    fn set_configuration(&self, config: SubConfiguration) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            self.record("SetConfiguration")?;
            self.state().configuration = config;
            Ok(())
        })
    }

    fn boost_cpu_limit(&self) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move { self.record("BoostCpuLimit") })
    }

    fn boost_scan_limit(&self) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move { self.record("BoostScanLimit") })
    }

    fn add_objects(&self, request: AddObjectsRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move {
            self.record("AddObjects")?;
            let mut state = self.state();
            for (hash, _) in request.objects {
                state.object_cache.insert(hash);
                state.pushed.push(hash);
            }
            Ok(())
        })
    }
}

/// Hands out fake subs by address.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    subs: Mutex<BTreeMap<String, Arc<FakeSub>>>,
    connects: AtomicUsize,
}

impl FakeNetwork {
    pub fn add(&self, address: &str, sub: Arc<FakeSub>) {
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string(), sub);
    }

    pub fn remove(&self, address: &str) {
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl SubConnector for FakeNetwork {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, RpcResult<Arc<dyn SubClient>>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let sub = self
                .subs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(address)
                .cloned();
            match sub {
                Some(sub) => Ok(sub as Arc<dyn SubClient>),
                None => Err(RpcError::ConnectionRefused),
            }
        })
    }
}

/// Serves object content from memory.
#[derive(Debug, Default)]
pub struct FakeObjects {
    pub objects: Mutex<BTreeMap<Hash, Vec<u8>>>,
}

impl FakeObjects {
    pub fn insert(&self, data: &[u8]) -> Hash {
        let hash = Hash::of(data);
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash, data.to_vec());
        hash
    }
}

impl ObjectGetter for FakeObjects {
    fn get_object(&self, hash: Hash) -> BoxFuture<'_, Result<Vec<u8>, String>> {
        Box::pin(async move {
            self.objects
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&hash)
                .cloned()
                .ok_or_else(|| format!("object {hash} not found"))
        })
    }
}

/// Images held in memory, addable at any time.
#[derive(Debug, Default)]
pub struct MemoryImages {
    images: Mutex<BTreeMap<String, Arc<Image>>>,
}

impl MemoryImages {
    pub fn put(&self, name: &str, image: Image) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(image));
    }

    pub fn remove(&self, name: &str) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

impl ImageSource for MemoryImages {
    fn get(&self, name: &str) -> Option<Arc<Image>> {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

// ── Builders ───────────────────────────────────────────────────────

pub fn regular(data: &[u8]) -> RegularInode {
    RegularInode {
        mode: 0o100644,
        uid: 0,
        gid: 0,
        mtime_seconds: 0,
        mtime_nanos: 0,
        size: data.len() as u64,
        hash: if data.is_empty() {
            Hash::ZERO
        } else {
            Hash::of(data)
        },
    }
}

/// A file-system holding regular files with the given content, plus the
/// parent directories they need.
pub fn fs_with(files: &[(&str, &[u8])]) -> FileSystem {
    let mut fs = FileSystem::new();
    for (path, data) in files {
        let mut prefix = String::new();
        let parts: Vec<_> = path.trim_start_matches('/').split('/').collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            prefix.push('/');
            prefix.push_str(part);
            if fs.get(&prefix).is_none() {
                fs.insert(
                    &prefix,
                    Inode::Directory(DirectoryInode {
                        mode: 0o040755,
                        uid: 0,
                        gid: 0,
                    }),
                );
            }
        }
        fs.insert(path, Inode::Regular(regular(data)));
    }
    fs
}

pub fn image_with(files: &[(&str, &[u8])]) -> Image {
    Image::new(fs_with(files))
}
