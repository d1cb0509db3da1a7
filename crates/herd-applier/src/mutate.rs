//! Ordered file-system mutation on the sub.
//!
//! Every batch keeps going after a failure; the last error seen is kept in
//! the [`MutationReport`] and surfaces as the update's error.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use herd_core::{
    DirectoryInode, FileToCopyToCache, Filter, Hardlink, Hash, Inode, InodeChange, RegularInode,
    MODE_TYPE_MASK, SpecialInode, SymlinkInode, UpdateRequest,
};
use tracing::{debug, info, warn};

use crate::error::{ApplyError, ApplyResult};

/// Sub-private directory, never touched by updates.
pub const SUBD_DIRECTORY: &str = "/.subd";
/// Records which image the root was last patched to.
pub const PATCHED_IMAGE_FILE: &str = "/var/lib/patched-image";

const TEMPORARY_HARDLINK: &str = "temporaryHardlink";

/// Outcome of a mutation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MutationReport {
    pub last_error: Option<String>,
    pub errors: usize,
}

impl MutationReport {
    fn record(&mut self, err: ApplyError) {
        warn!(error = %err, "mutation failed");
        self.errors += 1;
        self.last_error = Some(err.to_string());
    }

    fn check(&mut self, result: ApplyResult<()>) {
        if let Err(e) = result {
            self.record(e);
        }
    }
}

/// Applies update batches beneath `root`.
#[derive(Debug, Clone)]
pub struct Mutator {
    pub root: PathBuf,
    pub objects_dir: PathBuf,
    pub skip_filter: Filter,
    /// Apply uid/gid. Needs privileges.
    pub set_ownership: bool,
}

impl Mutator {
    pub fn new(root: impl Into<PathBuf>, objects_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            objects_dir: objects_dir.into(),
            skip_filter: Filter::default(),
            set_ownership: true,
        }
    }

    fn full_path(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }

    fn object_path(&self, hash: &Hash) -> PathBuf {
        self.objects_dir.join(hash.object_filename())
    }

    fn skip_path(&self, name: &str) -> bool {
        name == SUBD_DIRECTORY
            || name.starts_with("/.subd/")
            || self.skip_filter.is_match(name)
    }

    // ── Trigger matching ───────────────────────────────────────────

    /// Paths that the request will touch. Directories under the skip filter
    /// are left out, and a metadata change only counts when something other
    /// than the mtime differs from what is on disk now.
    pub fn touched_paths<'r>(&self, request: &'r UpdateRequest) -> Vec<&'r str> {
        let mut out = Vec::new();
        out.extend(
            request
                .directories_to_make
                .iter()
                .filter(|c| !self.skip_path(&c.name))
                .map(|c| c.name.as_str()),
        );
        out.extend(request.inodes_to_make.iter().map(|c| c.name.as_str()));
        out.extend(request.hardlinks_to_make.iter().map(|h| h.new_link.as_str()));
        out.extend(request.paths_to_delete.iter().map(String::as_str));
        out.extend(
            request
                .inodes_to_change
                .iter()
                .filter(|c| non_mtime_change(&self.full_path(&c.name), &c.inode))
                .map(|c| c.name.as_str()),
        );
        out
    }

    // ── Cache preparation ──────────────────────────────────────────

    /// Put existing files' content into the cache and replicate objects that
    /// several new inodes will consume.
    pub fn prepare_cache(&self, request: &UpdateRequest, report: &mut MutationReport) {
        for file in &request.files_to_copy_to_cache {
            report.check(self.copy_to_cache(file));
        }
        for (hash, count) in &request.multiply_used_objects {
            let source = self.object_path(hash);
            for copy in (1..*count).rev() {
                let dest = copy_name(&source, copy);
                report.check(copy_file(&source, &dest, false));
                debug!(%hash, copy, "copied object");
            }
        }
    }

    fn copy_to_cache(&self, file: &FileToCopyToCache) -> ApplyResult<()> {
        let source = self.full_path(&file.name);
        let dest = self.object_path(&file.hash);
        copy_file(&source, &dest, file.do_hardlink)?;
        info!(
            path = %source.display(),
            hardlink = file.do_hardlink,
            "copied to cache"
        );
        Ok(())
    }

    // ── Mutation ───────────────────────────────────────────────────

    /// Apply the mutation batches in order, then record the image name.
    pub fn apply(&self, request: &UpdateRequest, report: &mut MutationReport) {
        for dir in &request.directories_to_make {
            if self.skip_path(&dir.name) {
                continue;
            }
            report.check(self.make_directory(dir));
        }
        let mut copies_left = request.multiply_used_objects.clone();
        for change in &request.inodes_to_make {
            report.check(self.make_inode(change, &mut copies_left));
        }
        for link in &request.hardlinks_to_make {
            report.check(self.make_hardlink(link));
        }
        for path in &request.paths_to_delete {
            report.check(self.delete(path));
        }
        for change in &request.inodes_to_change {
            report.check(self.change_inode(change));
        }
        if let Err(e) = self.write_patched_image_name(&request.image_name) {
            warn!(error = %e, "failed to record patched image name");
        }
    }

    fn make_directory(&self, change: &InodeChange) -> ApplyResult<()> {
        let Inode::Directory(dir) = &change.inode else {
            return Err(ApplyError::NotADirectory(change.name.clone()));
        };
        let path = self.full_path(&change.name);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => fs::remove_file(&path).map_err(|e| ApplyError::io(&path, e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(ApplyError::io(&path, e)),
        }
        if let Err(e) = fs::create_dir(&path) {
            if e.kind() != ErrorKind::AlreadyExists {
                return Err(ApplyError::io(&path, e));
            }
        }
        self.write_directory_metadata(&path, dir)?;
        info!(path = %path.display(), mode = %format!("{:o}", dir.mode), "made directory");
        Ok(())
    }

    fn make_inode(
        &self,
        change: &InodeChange,
        copies_left: &mut BTreeMap<Hash, u64>,
    ) -> ApplyResult<()> {
        let path = self.full_path(&change.name);
        match &change.inode {
            Inode::Regular(inode) => self.make_regular(&path, inode, copies_left),
            Inode::Symlink(inode) => {
                force_remove(&path)?;
                std::os::unix::fs::symlink(&inode.target, &path)
                    .map_err(|e| ApplyError::io(&path, e))?;
                self.write_symlink_metadata(&path, inode)?;
                info!(path = %path.display(), target = %inode.target, "made symlink");
                Ok(())
            }
            Inode::Special(inode) => {
                force_remove(&path)?;
                mknod(&path, inode.mode, inode.rdev)?;
                self.write_special_metadata(&path, inode)?;
                info!(path = %path.display(), "made special inode");
                Ok(())
            }
            Inode::Directory(_) => self.make_directory(change),
            Inode::Computed(_) => Err(ApplyError::UnsupportedInode(
                change.name.clone(),
                change.inode.kind(),
            )),
        }
    }

    fn make_regular(
        &self,
        path: &Path,
        inode: &RegularInode,
        copies_left: &mut BTreeMap<Hash, u64>,
    ) -> ApplyResult<()> {
        let source = if inode.is_materialised() {
            let base = self.object_path(&inode.hash);
            match copies_left.get(&inode.hash).copied() {
                Some(count) if count > 1 => {
                    let copy = count - 1;
                    if copy < 2 {
                        copies_left.remove(&inode.hash);
                    } else {
                        copies_left.insert(inode.hash, copy);
                    }
                    copy_name(&base, copy)
                }
                _ => base,
            }
        } else {
            let mut name = path.as_os_str().to_owned();
            name.push(format!(".empty.{}", std::process::id()));
            let empty = PathBuf::from(name);
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&empty)
                .map_err(|e| ApplyError::io(&empty, e))?;
            empty
        };
        force_rename(&source, path)?;
        self.write_regular_metadata(path, inode)?;
        if inode.is_materialised() {
            info!(path = %path.display(), hash = %inode.hash, "made inode");
        } else {
            info!(path = %path.display(), "made empty inode");
        }
        Ok(())
    }

    fn make_hardlink(&self, link: &Hardlink) -> ApplyResult<()> {
        let target = self.full_path(&link.target);
        let new_link = self.full_path(&link.new_link);
        let tmp = self.objects_dir.join(TEMPORARY_HARDLINK);
        force_remove(&tmp)?;
        fs::hard_link(&target, &tmp).map_err(|e| ApplyError::io(&target, e))?;
        if let Err(e) = force_rename(&tmp, &new_link) {
            force_remove(&tmp)?;
            return Err(e);
        }
        info!(link = %new_link.display(), target = %target.display(), "linked");
        Ok(())
    }

    fn delete(&self, name: &str) -> ApplyResult<()> {
        let path = self.full_path(name);
        let result = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!(path = %path.display(), "deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ApplyError::io(&path, e)),
        }
    }

    fn change_inode(&self, change: &InodeChange) -> ApplyResult<()> {
        let path = self.full_path(&change.name);
        match &change.inode {
            Inode::Regular(inode) => self.write_regular_metadata(&path, inode)?,
            Inode::Directory(inode) => self.write_directory_metadata(&path, inode)?,
            Inode::Symlink(inode) => self.write_symlink_metadata(&path, inode)?,
            Inode::Special(inode) => self.write_special_metadata(&path, inode)?,
            Inode::Computed(_) => {
                return Err(ApplyError::UnsupportedInode(
                    change.name.clone(),
                    change.inode.kind(),
                ));
            }
        }
        info!(path = %path.display(), "changed inode");
        Ok(())
    }

    /// Write `name` followed by a newline to the patched-image file, or
    /// remove the file when `name` is empty.
    pub fn write_patched_image_name(&self, name: &str) -> ApplyResult<()> {
        let path = self.full_path(PATCHED_IMAGE_FILE);
        if name.is_empty() {
            return match fs::remove_file(&path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(ApplyError::io(&path, e)),
                _ => Ok(()),
            };
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ApplyError::io(parent, e))?;
        }
        fs::write(&path, format!("{name}\n")).map_err(|e| ApplyError::io(&path, e))?;
        fs::set_permissions(&path, Permissions::from_mode(0o644))
            .map_err(|e| ApplyError::io(&path, e))
    }

    // ── Metadata ───────────────────────────────────────────────────

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> ApplyResult<()> {
        if self.set_ownership {
            std::os::unix::fs::chown(path, Some(uid), Some(gid))
                .map_err(|e| ApplyError::io(path, e))?;
        }
        Ok(())
    }

    fn write_regular_metadata(&self, path: &Path, inode: &RegularInode) -> ApplyResult<()> {
        self.chown(path, inode.uid, inode.gid)?;
        chmod(path, inode.mode)?;
        set_mtime(path, inode.mtime_seconds, inode.mtime_nanos)
    }

    fn write_special_metadata(&self, path: &Path, inode: &SpecialInode) -> ApplyResult<()> {
        self.chown(path, inode.uid, inode.gid)?;
        chmod(path, inode.mode)?;
        set_mtime(path, inode.mtime_seconds, inode.mtime_nanos)
    }

    fn write_directory_metadata(&self, path: &Path, inode: &DirectoryInode) -> ApplyResult<()> {
        self.chown(path, inode.uid, inode.gid)?;
        chmod(path, inode.mode)
    }

    fn write_symlink_metadata(&self, path: &Path, inode: &SymlinkInode) -> ApplyResult<()> {
        if self.set_ownership {
            std::os::unix::fs::lchown(path, Some(inode.uid), Some(inode.gid))
                .map_err(|e| ApplyError::io(path, e))?;
        }
        Ok(())
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn copy_name(object: &Path, copy: u64) -> PathBuf {
    let mut name = object.as_os_str().to_owned();
    name.push(format!("~{copy}~"));
    PathBuf::from(name)
}

fn copy_file(source: &Path, dest: &Path, hardlink: bool) -> ApplyResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| ApplyError::io(parent, e))?;
    }
    if hardlink {
        force_remove(dest)?;
        fs::hard_link(source, dest).map_err(|e| ApplyError::io(source, e))?;
    } else {
        fs::copy(source, dest).map_err(|e| ApplyError::io(source, e))?;
    }
    Ok(())
}

/// Remove whatever is at `path`, if anything.
fn force_remove(path: &Path) -> ApplyResult<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(ApplyError::io(path, e)),
        _ => Ok(()),
    }
}

/// Rename, clearing a directory that is in the way.
fn force_rename(from: &Path, to: &Path) -> ApplyResult<()> {
    if let Ok(meta) = fs::symlink_metadata(to) {
        if meta.is_dir() {
            fs::remove_dir_all(to).map_err(|e| ApplyError::io(to, e))?;
        }
    }
    fs::rename(from, to).map_err(|e| ApplyError::io(from, e))
}

fn chmod(path: &Path, mode: u32) -> ApplyResult<()> {
    fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))
        .map_err(|e| ApplyError::io(path, e))
}

fn c_path(path: &Path) -> ApplyResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        ApplyError::io(
            path,
            io::Error::new(ErrorKind::InvalidInput, "path contains NUL byte"),
        )
    })
}

fn set_mtime(path: &Path, seconds: i64, nanos: u32) -> ApplyResult<()> {
    let c = c_path(path)?;
    // SAFETY: timespec is plain data; zeroing fills any padding fields.
    let mut time: libc::timespec = unsafe { std::mem::zeroed() };
    time.tv_sec = seconds as libc::time_t;
    time.tv_nsec = nanos as _;
    let times = [time, time];
    // SAFETY: `c` is a valid NUL-terminated path and `times` holds two entries.
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), 0) };
    if rc != 0 {
        return Err(ApplyError::io(path, io::Error::last_os_error()));
    }
    Ok(())
}

fn mknod(path: &Path, mode: u32, rdev: u64) -> ApplyResult<()> {
    let c = c_path(path)?;
    // SAFETY: `c` is a valid NUL-terminated path.
    let rc = unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
    if rc != 0 {
        return Err(ApplyError::io(path, io::Error::last_os_error()));
    }
    Ok(())
}

/// Whether applying `inode`'s metadata to `path` changes more than its
/// mtime. Anything unreadable or of another type counts as a change.
fn non_mtime_change(path: &Path, inode: &Inode) -> bool {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return true;
    };
    let on_disk_type = meta.mode() & MODE_TYPE_MASK;
    match inode {
        Inode::Regular(r) => {
            !(meta.file_type().is_file()
                && meta.mode() == r.mode
                && meta.uid() == r.uid
                && meta.gid() == r.gid
                && meta.size() == r.size)
        }
        Inode::Special(s) => {
            !(on_disk_type == s.mode & MODE_TYPE_MASK
                && meta.mode() == s.mode
                && meta.uid() == s.uid
                && meta.gid() == s.gid
                && meta.rdev() == s.rdev)
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_core::Triggers;
    use std::os::unix::fs::MetadataExt;

    struct Sandbox {
        _dir: tempfile::TempDir,
        mutator: Mutator,
    }

    fn sandbox() -> Sandbox {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let objects = dir.path().join("objects");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&objects).unwrap();
        let mut mutator = Mutator::new(root, objects);
        mutator.set_ownership = false;
        Sandbox { _dir: dir, mutator }
    }

    fn add_object(m: &Mutator, data: &[u8]) -> Hash {
        let hash = Hash::of(data);
        let path = m.object_path(&hash);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
        hash
    }

    fn regular(hash: Hash, size: u64, mode: u32) -> Inode {
        Inode::Regular(RegularInode {
            mode,
            uid: 0,
            gid: 0,
            mtime_seconds: 1_000_000,
            mtime_nanos: 0,
            size,
            hash,
        })
    }

    fn dir(mode: u32) -> Inode {
        Inode::Directory(DirectoryInode { mode, uid: 0, gid: 0 })
    }

    fn change(name: &str, inode: Inode) -> InodeChange {
        InodeChange {
            name: name.into(),
            inode,
        }
    }

    #[test]
    fn batches_apply_in_order() {
        let sb = sandbox();
        let m = &sb.mutator;
        let hash = add_object(m, b"hello");
        fs::write(m.full_path("/stale"), b"old").unwrap();
        let request = UpdateRequest {
            image_name: "base.0".into(),
            directories_to_make: vec![change("/etc", dir(0o040750))],
            inodes_to_make: vec![
                change("/etc/motd", regular(hash, 5, 0o100640)),
                change("/etc/empty", regular(Hash::ZERO, 0, 0o100600)),
                change(
                    "/etc/link",
                    Inode::Symlink(SymlinkInode {
                        uid: 0,
                        gid: 0,
                        target: "motd".into(),
                    }),
                ),
            ],
            hardlinks_to_make: vec![Hardlink {
                new_link: "/etc/motd2".into(),
                target: "/etc/motd".into(),
            }],
            paths_to_delete: vec!["/stale".into(), "/never-existed".into()],
            ..Default::default()
        };
        let mut report = MutationReport::default();
        m.prepare_cache(&request, &mut report);
        m.apply(&request, &mut report);
        assert_eq!(report, MutationReport::default());

        let etc = fs::metadata(m.full_path("/etc")).unwrap();
        assert_eq!(etc.mode() & 0o7777, 0o750);
        let motd = m.full_path("/etc/motd");
        assert_eq!(fs::read(&motd).unwrap(), b"hello");
        let meta = fs::metadata(&motd).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o640);
        assert_eq!(meta.mtime(), 1_000_000);
        assert_eq!(meta.nlink(), 2);
        assert_eq!(fs::read(m.full_path("/etc/empty")).unwrap(), b"");
        assert_eq!(
            fs::read_link(m.full_path("/etc/link")).unwrap(),
            PathBuf::from("motd")
        );
        assert!(!m.full_path("/stale").exists());
        assert_eq!(
            fs::read_to_string(m.full_path(PATCHED_IMAGE_FILE)).unwrap(),
            "base.0\n"
        );
        // The object was consumed by the rename.
        assert!(!m.object_path(&hash).exists());
    }

    #[test]
    fn multiply_used_objects_are_replicated() {
        let sb = sandbox();
        let m = &sb.mutator;
        let hash = add_object(m, b"shared");
        let request = UpdateRequest {
            inodes_to_make: vec![
                change("/a", regular(hash, 6, 0o100644)),
                change("/b", regular(hash, 6, 0o100644)),
                change("/c", regular(hash, 6, 0o100644)),
            ],
            multiply_used_objects: [(hash, 3)].into_iter().collect(),
            ..Default::default()
        };
        let mut report = MutationReport::default();
        m.prepare_cache(&request, &mut report);
        assert!(copy_name(&m.object_path(&hash), 2).exists());
        assert!(copy_name(&m.object_path(&hash), 1).exists());
        m.apply(&request, &mut report);
        assert_eq!(report.errors, 0);
        for name in ["/a", "/b", "/c"] {
            assert_eq!(fs::read(m.full_path(name)).unwrap(), b"shared");
        }
        assert_eq!(fs::metadata(m.full_path("/a")).unwrap().nlink(), 1);
    }

    #[test]
    fn copy_to_cache_saves_replaced_content() {
        let sb = sandbox();
        let m = &sb.mutator;
        fs::write(m.full_path("/old"), b"keep me").unwrap();
        let hash = Hash::of(b"keep me");
        let request = UpdateRequest {
            files_to_copy_to_cache: vec![FileToCopyToCache {
                name: "/old".into(),
                hash,
                do_hardlink: true,
            }],
            inodes_to_make: vec![change("/new", regular(hash, 7, 0o100644))],
            paths_to_delete: vec!["/old".into()],
            ..Default::default()
        };
        let mut report = MutationReport::default();
        m.prepare_cache(&request, &mut report);
        m.apply(&request, &mut report);
        assert_eq!(report.errors, 0);
        assert_eq!(fs::read(m.full_path("/new")).unwrap(), b"keep me");
        assert!(!m.full_path("/old").exists());
    }

    #[test]
    fn failures_are_recorded_and_later_batches_still_run() {
        let sb = sandbox();
        let m = &sb.mutator;
        fs::write(m.full_path("/doomed"), b"x").unwrap();
        let missing = Hash::of(b"not in cache");
        let request = UpdateRequest {
            inodes_to_make: vec![change("/file", regular(missing, 12, 0o100644))],
            paths_to_delete: vec!["/doomed".into()],
            ..Default::default()
        };
        let mut report = MutationReport::default();
        m.apply(&request, &mut report);
        assert_eq!(report.errors, 1);
        assert!(report.last_error.is_some());
        assert!(!m.full_path("/doomed").exists());
    }

    #[test]
    fn private_and_filtered_directories_are_skipped() {
        let sb = sandbox();
        let mut m = sb.mutator.clone();
        m.skip_filter = Filter::new(["/tmp/.*"]).unwrap();
        let request = UpdateRequest {
            directories_to_make: vec![
                change("/.subd", dir(0o040700)),
                change("/.subd/x", dir(0o040700)),
                change("/tmp/cache", dir(0o040755)),
                change("/opt", dir(0o040755)),
            ],
            ..Default::default()
        };
        assert_eq!(m.touched_paths(&request), vec!["/opt"]);
        let mut report = MutationReport::default();
        m.apply(&request, &mut report);
        assert!(!m.full_path("/.subd").exists());
        assert!(!m.full_path("/tmp/cache").exists());
        assert!(m.full_path("/opt").is_dir());
    }

    #[test]
    fn mtime_only_change_is_not_a_touch() {
        let sb = sandbox();
        let m = &sb.mutator;
        let path = m.full_path("/conf");
        fs::write(&path, b"abc").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();
        let meta = fs::metadata(&path).unwrap();
        let same = Inode::Regular(RegularInode {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime_seconds: 42,
            mtime_nanos: 0,
            size: 3,
            hash: Hash::of(b"abc"),
        });
        let mut chmod = same.clone();
        if let Inode::Regular(r) = &mut chmod {
            r.mode = (r.mode & !0o7777) | 0o600;
        }
        let request = UpdateRequest {
            inodes_to_change: vec![change("/conf", same), change("/conf", chmod)],
            triggers: Triggers::default(),
            ..Default::default()
        };
        assert_eq!(m.touched_paths(&request), vec!["/conf"]);
        let mut report = MutationReport::default();
        m.apply(&request, &mut report);
        assert_eq!(report.errors, 0);
        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o7777, 0o600);
    }

    #[test]
    fn empty_image_name_removes_patched_file() {
        let sb = sandbox();
        let m = &sb.mutator;
        m.write_patched_image_name("img").unwrap();
        assert!(m.full_path(PATCHED_IMAGE_FILE).exists());
        m.write_patched_image_name("").unwrap();
        assert!(!m.full_path(PATCHED_IMAGE_FILE).exists());
        m.write_patched_image_name("").unwrap();
    }

    #[test]
    fn directory_in_the_way_of_a_file_is_replaced() {
        let sb = sandbox();
        let m = &sb.mutator;
        fs::create_dir_all(m.full_path("/thing/sub")).unwrap();
        let request = UpdateRequest {
            inodes_to_make: vec![change("/thing", regular(Hash::ZERO, 0, 0o100644))],
            ..Default::default()
        };
        let mut report = MutationReport::default();
        m.apply(&request, &mut report);
        assert_eq!(report.errors, 0);
        assert!(m.full_path("/thing").is_file());
    }
}
