//! FUSE passthrough filesystem routed through the lock broker.
//!
//! Every VFS operation maps to a lock acquisition against the backing path
//! before the underlying I/O runs:
//!
//! - metadata reads (`lookup`, `getattr`, `readdir`, `readlink`) take a
//!   `read` lock for the duration of the call
//! - mutations (`setattr`, `mknod`, `mkdir`, `unlink`, `rmdir`, `symlink`,
//!   `rename`, `link`) take `write` locks on every affected path and its
//!   parent, acquired in lexicographic order and released in reverse
//! - `open`/`create` take a lock matching the open mode and keep it until
//!   the handle is released (or flushed, under the legacy policy)
//!
//! `access` and `statfs` are pure probes of the backing tree and skip the
//! broker entirely.

use std::ffi::{CString, OsStr};
use std::fs::{Metadata, OpenOptions};
use std::io;
use std::os::raw::c_int;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use gate_core::client::{
    AcquireOutcome, AcquireRequest, BrokerClient, ClientError, HeartbeatOutcome,
};
use gate_core::protocol::{LockMode, OwnerToken};
use tracing::{debug, warn};

use crate::handle::{HandleState, HandleTable, OpenHandle};
use crate::inode::InodeTable;

/// Attribute cache TTL. Zero: with concurrent editors behind the broker,
/// stale kernel caches would defeat the serialization the mount exists for.
const ATTR_TTL: Duration = Duration::from_secs(0);

/// Proxy-side lock policy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Lease window requested for every acquire.
    pub lease_ms: u64,
    /// Client-side acquire timeout.
    pub acquire_timeout_ms: u64,
    /// Absolute-cap override forwarded to the broker, if any.
    pub max_hold_ms: Option<u64>,
    /// Legacy policy: release the handle's lock at flush instead of close.
    pub release_on_flush: bool,
}

type FsResult<T> = Result<T, c_int>;

/// The passthrough filesystem.
pub struct GateFs {
    root: PathBuf,
    client: BrokerClient,
    inodes: Mutex<InodeTable>,
    handles: Arc<Mutex<HandleTable>>,
    cfg: ProxyConfig,
}

impl GateFs {
    /// Build a filesystem over a canonicalized backing root.
    ///
    /// # Errors
    ///
    /// Fails when the backing root does not exist or cannot be resolved.
    pub fn new(root: &Path, client: BrokerClient, cfg: ProxyConfig) -> io::Result<Self> {
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            client,
            inodes: Mutex::new(InodeTable::new()),
            handles: Arc::new(Mutex::new(HandleTable::default())),
            cfg,
        })
    }

    /// Shared handle table, for the heartbeat task.
    #[must_use]
    pub fn handles(&self) -> Arc<Mutex<HandleTable>> {
        Arc::clone(&self.handles)
    }

    fn full_path(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    fn lock_key(&self, rel: &Path) -> String {
        self.full_path(rel).to_string_lossy().into_owned()
    }

    fn rel_of(&self, ino: u64) -> FsResult<PathBuf> {
        self.inodes
            .lock()
            .expect("inode table lock")
            .path_of(ino)
            .cloned()
            .ok_or(libc::ENOENT)
    }

    fn child_rel(&self, parent: u64, name: &OsStr) -> FsResult<PathBuf> {
        self.inodes
            .lock()
            .expect("inode table lock")
            .child_path(parent, name)
            .ok_or(libc::ENOENT)
    }

    fn acquire(&self, key: &str, mode: LockMode, owner: &OwnerToken) -> FsResult<()> {
        let mut req = AcquireRequest::new(key, mode, owner)
            .timeout_ms(self.cfg.acquire_timeout_ms)
            .lease_ms(self.cfg.lease_ms);
        if let Some(max_hold_ms) = self.cfg.max_hold_ms {
            req = req.max_hold_ms(max_hold_ms);
        }
        match self.client.acquire(&req) {
            Ok(AcquireOutcome::Granted) => Ok(()),
            Ok(AcquireOutcome::Timeout) => {
                debug!(key, %mode, "lock wait timed out");
                Err(libc::ETIMEDOUT)
            }
            Err(e) => Err(client_errno(&e)),
        }
    }

    fn release_lock(&self, key: &str, owner: &OwnerToken) {
        if let Err(e) = self.client.release(key, owner) {
            warn!(key, "lock release failed: {e}");
        }
    }

    /// Run `f` under one lock on `rel`. Reuses an open handle's owner when
    /// its held mode covers `mode`; otherwise mints a per-operation token.
    /// The lock is released even when `f` fails.
    fn with_lock<T>(
        &self,
        rel: &Path,
        mode: LockMode,
        f: impl FnOnce(&Path) -> io::Result<T>,
    ) -> FsResult<T> {
        let key = self.lock_key(rel);
        let owner = self
            .handles
            .lock()
            .expect("handle table lock")
            .reusable_owner(&key, mode)
            .unwrap_or_else(OwnerToken::mint);

        self.acquire(&key, mode, &owner)?;
        let result = f(&self.full_path(rel));
        self.release_lock(&key, &owner);
        result.map_err(io_errno)
    }

    /// Run `f` under write locks on every path in `rels`, acquired in
    /// lexicographic key order and released in reverse. One fresh owner
    /// token spans the whole operation.
    fn with_multi_write_lock<T>(
        &self,
        rels: &[PathBuf],
        f: impl FnOnce() -> io::Result<T>,
    ) -> FsResult<T> {
        let keys = write_lock_keys(&self.root, rels);

        let owner = OwnerToken::mint();
        let mut held: Vec<&str> = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Err(errno) = self.acquire(key, LockMode::Write, &owner) {
                for key in held.into_iter().rev() {
                    self.release_lock(key, &owner);
                }
                return Err(errno);
            }
            held.push(key);
        }

        let result = f();
        for key in held.into_iter().rev() {
            self.release_lock(key, &owner);
        }
        result.map_err(io_errno)
    }

    /// Stat a child under a fresh read lock and map it into the inode table.
    fn locked_entry(&self, rel: &Path) -> FsResult<FileAttr> {
        let md = self.with_lock(rel, LockMode::Read, |full| {
            std::fs::symlink_metadata(full)
        })?;
        let ino = self
            .inodes
            .lock()
            .expect("inode table lock")
            .ino_or_insert(rel.to_path_buf());
        Ok(attr_from_metadata(ino, &md))
    }

    fn heartbeat_handle(&self, fh: u64) -> FsResult<()> {
        let target = {
            let handles = self.handles.lock().expect("handle table lock");
            handles
                .get(fh)
                .filter(|h| h.state == HandleState::Open)
                .map(|h| (h.lock_key.clone(), h.owner.clone()))
        };
        let Some((key, owner)) = target else {
            // Flushed (legacy policy) or lost; nothing to refresh.
            return Ok(());
        };
        match self.client.heartbeat(&key, &owner) {
            Ok(HeartbeatOutcome::Ok) => Ok(()),
            Ok(HeartbeatOutcome::NotHeld | HeartbeatOutcome::Expired) => {
                warn!(key, fh, "lock lost; failing handle");
                self.handles
                    .lock()
                    .expect("handle table lock")
                    .mark_lost(fh);
                Err(libc::EIO)
            }
            Err(e) => Err(client_errno(&e)),
        }
    }
}

fn io_errno(e: io::Error) -> c_int {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn client_errno(e: &ClientError) -> c_int {
    warn!("broker call failed: {e}");
    libc::EIO
}

fn ts(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = u32::try_from(nsecs).unwrap_or(0);
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs.unsigned_abs(), nsecs)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0)
    }
}

fn kind_of(md: &Metadata) -> FileType {
    use std::os::unix::fs::FileTypeExt;
    let ft = md.file_type();
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else {
        FileType::RegularFile
    }
}

/// Translate backing-tree metadata into a kernel attribute record.
#[must_use]
pub fn attr_from_metadata(ino: u64, md: &Metadata) -> FileAttr {
    FileAttr {
        ino,
        size: md.size(),
        blocks: md.blocks(),
        atime: ts(md.atime(), md.atime_nsec()),
        mtime: ts(md.mtime(), md.mtime_nsec()),
        ctime: ts(md.ctime(), md.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: kind_of(md),
        perm: (md.mode() & 0o7777) as u16,
        nlink: md.nlink() as u32,
        uid: md.uid(),
        gid: md.gid(),
        rdev: md.rdev() as u32,
        blksize: md.blksize() as u32,
        flags: 0,
    }
}

/// Relative paths a create/remove style operation (`mknod`, `mkdir`,
/// `symlink`, `unlink`, `rmdir`) must write-lock: the parent directory and
/// the node itself.
#[must_use]
pub fn parent_child_lock_paths(parent: &Path, child: &Path) -> Vec<PathBuf> {
    vec![parent.to_path_buf(), child.to_path_buf()]
}

/// Relative paths a rename must write-lock: both parents and both endpoints.
#[must_use]
pub fn rename_lock_paths(
    src_parent: &Path,
    src: &Path,
    dst_parent: &Path,
    dst: &Path,
) -> Vec<PathBuf> {
    vec![
        src_parent.to_path_buf(),
        dst_parent.to_path_buf(),
        src.to_path_buf(),
        dst.to_path_buf(),
    ]
}

/// Relative paths a hard link must write-lock, like a rename: the source
/// and its parent, the new name and its parent.
#[must_use]
pub fn link_lock_paths(src: &Path, dst_parent: &Path, dst: &Path) -> Vec<PathBuf> {
    let src_parent = src.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
    vec![
        src_parent,
        src.to_path_buf(),
        dst_parent.to_path_buf(),
        dst.to_path_buf(),
    ]
}

/// Broker lock keys for `rels` under `root`: absolute backing paths,
/// lexicographically ordered and deduplicated. The total acquisition order
/// across the process eliminates AB/BA deadlock between concurrent
/// multi-path operations touching overlapping paths.
#[must_use]
pub fn write_lock_keys(root: &Path, rels: &[PathBuf]) -> Vec<String> {
    let mut keys: Vec<String> = rels
        .iter()
        .map(|rel| root.join(rel).to_string_lossy().into_owned())
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Whether open flags imply mutation and therefore an exclusive lock.
#[must_use]
pub fn open_wants_write(flags: i32) -> bool {
    let write_bits = libc::O_WRONLY | libc::O_RDWR | libc::O_TRUNC | libc::O_APPEND;
    (flags & write_bits) != 0
}

fn open_options(flags: i32) -> OpenOptions {
    let access = flags & libc::O_ACCMODE;
    let mut opts = OpenOptions::new();
    opts.read(access == libc::O_RDONLY || access == libc::O_RDWR)
        .write(access == libc::O_WRONLY || access == libc::O_RDWR)
        .append((flags & libc::O_APPEND) != 0);
    if (flags & libc::O_TRUNC) != 0 && access != libc::O_RDONLY {
        opts.truncate(true);
    }
    opts
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn timespec_of(t: Option<TimeOrNow>) -> libc::timespec {
    match t {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(at)) => {
            let d = at.duration_since(UNIX_EPOCH).unwrap_or_default();
            libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            }
        }
    }
}

impl Filesystem for GateFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let rel = match self.child_rel(parent, name) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        match self.locked_entry(&rel) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let rel = match self.rel_of(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        let result = self.with_lock(&rel, LockMode::Read, |full| {
            std::fs::symlink_metadata(full)
        });
        match result {
            Ok(md) => reply.attr(&ATTR_TTL, &attr_from_metadata(ino, &md)),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let rel = match self.rel_of(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        let result = self.with_lock(&rel, LockMode::Write, |full| {
            if let Some(size) = size {
                OpenOptions::new().write(true).open(full)?.set_len(size)?;
            }
            if let Some(mode) = mode {
                std::fs::set_permissions(full, PermissionsExt::from_mode(mode))?;
            }
            if uid.is_some() || gid.is_some() {
                std::os::unix::fs::chown(full, uid, gid)?;
            }
            if atime.is_some() || mtime.is_some() {
                let times = [timespec_of(atime), timespec_of(mtime)];
                let c = cpath(full)?;
                // SAFETY: both pointers are valid for the duration of the call.
                let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), 0) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            std::fs::symlink_metadata(full)
        });
        match result {
            Ok(md) => reply.attr(&ATTR_TTL, &attr_from_metadata(ino, &md)),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let rel = match self.rel_of(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        let root = self.root.clone();
        let result = self.with_lock(&rel, LockMode::Read, |full| {
            let target = std::fs::read_link(full)?;
            // Absolute targets under the backing root are rebased onto the
            // mount so they resolve through the gate.
            let rebased = match target.strip_prefix(&root) {
                Ok(stripped) => Path::new("/").join(stripped),
                Err(_) => target,
            };
            Ok(rebased.into_os_string().into_vec())
        });
        match result {
            Ok(bytes) => reply.data(&bytes),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let (parent_rel, rel) = match (self.rel_of(parent), self.child_rel(parent, name)) {
            (Ok(p), Ok(r)) => (p, r),
            _ => return reply.error(libc::ENOENT),
        };
        let full = self.full_path(&rel);
        let result = self.with_multi_write_lock(&parent_child_lock_paths(&parent_rel, &rel), || {
            let c = cpath(&full)?;
            // SAFETY: the path pointer is valid for the duration of the call.
            let rc = unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, libc::dev_t::from(rdev)) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            std::fs::symlink_metadata(&full)
        });
        match result {
            Ok(md) => {
                let ino = self
                    .inodes
                    .lock()
                    .expect("inode table lock")
                    .ino_or_insert(rel);
                reply.entry(&ATTR_TTL, &attr_from_metadata(ino, &md), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let (parent_rel, rel) = match (self.rel_of(parent), self.child_rel(parent, name)) {
            (Ok(p), Ok(r)) => (p, r),
            _ => return reply.error(libc::ENOENT),
        };
        let full = self.full_path(&rel);
        let result = self.with_multi_write_lock(&parent_child_lock_paths(&parent_rel, &rel), || {
            std::fs::DirBuilder::new()
                .mode(mode & !umask)
                .create(&full)?;
            std::fs::symlink_metadata(&full)
        });
        match result {
            Ok(md) => {
                let ino = self
                    .inodes
                    .lock()
                    .expect("inode table lock")
                    .ino_or_insert(rel);
                reply.entry(&ATTR_TTL, &attr_from_metadata(ino, &md), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (parent_rel, rel) = match (self.rel_of(parent), self.child_rel(parent, name)) {
            (Ok(p), Ok(r)) => (p, r),
            _ => return reply.error(libc::ENOENT),
        };
        let full = self.full_path(&rel);
        let result = self.with_multi_write_lock(&parent_child_lock_paths(&parent_rel, &rel), || {
            std::fs::remove_file(&full)
        });
        match result {
            Ok(()) => {
                self.inodes
                    .lock()
                    .expect("inode table lock")
                    .forget_path(&rel);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (parent_rel, rel) = match (self.rel_of(parent), self.child_rel(parent, name)) {
            (Ok(p), Ok(r)) => (p, r),
            _ => return reply.error(libc::ENOENT),
        };
        let full = self.full_path(&rel);
        let result = self.with_multi_write_lock(&parent_child_lock_paths(&parent_rel, &rel), || {
            std::fs::remove_dir(&full)
        });
        match result {
            Ok(()) => {
                self.inodes
                    .lock()
                    .expect("inode table lock")
                    .forget_path(&rel);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (parent_rel, rel) = match (self.rel_of(parent), self.child_rel(parent, link_name)) {
            (Ok(p), Ok(r)) => (p, r),
            _ => return reply.error(libc::ENOENT),
        };
        let full = self.full_path(&rel);
        let result = self.with_multi_write_lock(&parent_child_lock_paths(&parent_rel, &rel), || {
            std::os::unix::fs::symlink(target, &full)?;
            std::fs::symlink_metadata(&full)
        });
        match result {
            Ok(md) => {
                let ino = self
                    .inodes
                    .lock()
                    .expect("inode table lock")
                    .ino_or_insert(rel);
                reply.entry(&ATTR_TTL, &attr_from_metadata(ino, &md), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (src_parent, src) = match (self.rel_of(parent), self.child_rel(parent, name)) {
            (Ok(p), Ok(r)) => (p, r),
            _ => return reply.error(libc::ENOENT),
        };
        let (dst_parent, dst) = match (self.rel_of(newparent), self.child_rel(newparent, newname)) {
            (Ok(p), Ok(r)) => (p, r),
            _ => return reply.error(libc::ENOENT),
        };

        let src_full = self.full_path(&src);
        let dst_full = self.full_path(&dst);
        let result = self.with_multi_write_lock(
            &rename_lock_paths(&src_parent, &src, &dst_parent, &dst),
            || std::fs::rename(&src_full, &dst_full),
        );
        match result {
            Ok(()) => {
                let mut inodes = self.inodes.lock().expect("inode table lock");
                inodes.replace_target(&dst);
                inodes.rename_subtree(&src, &dst);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let src = match self.rel_of(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        let (dst_parent, dst) = match (self.rel_of(newparent), self.child_rel(newparent, newname)) {
            (Ok(p), Ok(r)) => (p, r),
            _ => return reply.error(libc::ENOENT),
        };
        let src_full = self.full_path(&src);
        let dst_full = self.full_path(&dst);
        let result = self.with_multi_write_lock(&link_lock_paths(&src, &dst_parent, &dst), || {
            std::fs::hard_link(&src_full, &dst_full)?;
            std::fs::symlink_metadata(&dst_full)
        });
        match result {
            Ok(md) => {
                let new_ino = self
                    .inodes
                    .lock()
                    .expect("inode table lock")
                    .ino_or_insert(dst);
                reply.entry(&ATTR_TTL, &attr_from_metadata(new_ino, &md), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let rel = match self.rel_of(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        let mode = if open_wants_write(flags) {
            LockMode::Write
        } else {
            LockMode::Read
        };
        let key = self.lock_key(&rel);
        let owner = OwnerToken::mint();

        if let Err(errno) = self.acquire(&key, mode, &owner) {
            return reply.error(errno);
        }
        let file = match open_options(flags).open(self.full_path(&rel)) {
            Ok(file) => file,
            Err(e) => {
                self.release_lock(&key, &owner);
                return reply.error(io_errno(e));
            }
        };

        let fh = self.handles.lock().expect("handle table lock").insert(OpenHandle {
            rel_path: rel,
            lock_key: key,
            owner,
            mode,
            state: HandleState::Open,
            file,
        });
        debug!(fh, ino, %mode, "handle opened");
        reply.opened(fh, 0);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let (parent_rel, rel) = match (self.rel_of(parent), self.child_rel(parent, name)) {
            (Ok(p), Ok(r)) => (p, r),
            _ => return reply.error(libc::ENOENT),
        };
        let parent_key = self.lock_key(&parent_rel);
        let key = self.lock_key(&rel);
        let parent_owner = OwnerToken::mint();
        let owner = OwnerToken::mint();

        // Parent first (it is the lexicographic prefix of the child); the
        // child lock stays with the handle, the parent lock does not.
        if let Err(errno) = self.acquire(&parent_key, LockMode::Write, &parent_owner) {
            return reply.error(errno);
        }
        if let Err(errno) = self.acquire(&key, LockMode::Write, &owner) {
            self.release_lock(&parent_key, &parent_owner);
            return reply.error(errno);
        }

        let full = self.full_path(&rel);
        let access = flags & libc::O_ACCMODE;
        let created = OpenOptions::new()
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode & !umask)
            .open(&full)
            .and_then(|file| std::fs::symlink_metadata(&full).map(|md| (file, md)));

        self.release_lock(&parent_key, &parent_owner);

        match created {
            Ok((file, md)) => {
                let ino = self
                    .inodes
                    .lock()
                    .expect("inode table lock")
                    .ino_or_insert(rel.clone());
                let fh = self.handles.lock().expect("handle table lock").insert(OpenHandle {
                    rel_path: rel,
                    lock_key: key,
                    owner,
                    mode: LockMode::Write,
                    state: HandleState::Open,
                    file,
                });
                debug!(fh, ino, "handle created");
                reply.created(&ATTR_TTL, &attr_from_metadata(ino, &md), 0, fh, 0);
            }
            Err(e) => {
                self.release_lock(&key, &owner);
                reply.error(io_errno(e));
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        let handles = self.handles.lock().expect("handle table lock");
        let Some(handle) = handles.get(fh) else {
            return reply.error(libc::EBADF);
        };
        if handle.state == HandleState::Lost {
            return reply.error(libc::EIO);
        }
        let mut buf = vec![0u8; size as usize];
        match handle.file.read_at(&mut buf, offset) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(io_errno(e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        let handles = self.handles.lock().expect("handle table lock");
        let Some(handle) = handles.get(fh) else {
            return reply.error(libc::EBADF);
        };
        if handle.state == HandleState::Lost {
            return reply.error(libc::EIO);
        }
        match handle.file.write_at(data, offset) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(io_errno(e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if self.cfg.release_on_flush {
            // Legacy policy: the lock goes at flush; the handle lingers
            // until the kernel's release but no longer holds anything.
            let released = {
                let mut handles = self.handles.lock().expect("handle table lock");
                handles.get_mut(fh).and_then(|h| {
                    if h.state == HandleState::Open {
                        h.state = HandleState::Flushed;
                        Some((h.lock_key.clone(), h.owner.clone()))
                    } else {
                        None
                    }
                })
            };
            if let Some((key, owner)) = released {
                self.release_lock(&key, &owner);
            }
            return reply.ok();
        }

        match self.heartbeat_handle(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let handle = self.handles.lock().expect("handle table lock").remove(fh);
        if let Some(handle) = handle {
            // The file closes on drop; the lock is released best-effort (the
            // lease reclaims it if the broker is briefly away).
            if handle.state == HandleState::Open {
                self.release_lock(&handle.lock_key, &handle.owner);
            }
            debug!(fh, "handle released");
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let result = {
            let handles = self.handles.lock().expect("handle table lock");
            let Some(handle) = handles.get(fh) else {
                return reply.error(libc::EBADF);
            };
            if handle.state == HandleState::Lost {
                return reply.error(libc::EIO);
            }
            if datasync {
                handle.file.sync_data()
            } else {
                handle.file.sync_all()
            }
        };
        if let Err(e) = result {
            return reply.error(io_errno(e));
        }
        // A long-lived handle that fsyncs is actively writing; refresh its
        // lease eagerly rather than waiting for the background task.
        match self.heartbeat_handle(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.rel_of(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let rel = match self.rel_of(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };

        let listing = self.with_lock(&rel, LockMode::Read, |full| {
            let mut names: Vec<(std::ffi::OsString, FileType)> = Vec::new();
            for entry in std::fs::read_dir(full)? {
                let entry = entry?;
                let kind = entry.file_type().map(|ft| {
                    if ft.is_dir() {
                        FileType::Directory
                    } else if ft.is_symlink() {
                        FileType::Symlink
                    } else {
                        FileType::RegularFile
                    }
                })?;
                names.push((entry.file_name(), kind));
            }
            Ok(names)
        });

        let names = match listing {
            Ok(names) => names,
            Err(errno) => return reply.error(errno),
        };

        let mut inodes = self.inodes.lock().expect("inode table lock");
        let parent_ino = rel
            .parent()
            .and_then(|p| inodes.ino_of(p))
            .unwrap_or(crate::inode::ROOT_INO);

        let mut entries: Vec<(u64, FileType, std::ffi::OsString)> = Vec::with_capacity(names.len() + 2);
        entries.push((ino, FileType::Directory, ".".into()));
        entries.push((parent_ino, FileType::Directory, "..".into()));
        for (name, kind) in names {
            let child_ino = inodes.ino_or_insert(rel.join(&name));
            entries.push((child_ino, kind, name));
        }
        drop(inodes);

        let Ok(skip) = usize::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(skip) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let rel = match self.rel_of(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        let full = self.full_path(&rel);
        let c = match cpath(&full) {
            Ok(c) => c,
            Err(e) => return reply.error(io_errno(e)),
        };
        let mut sv: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: the path pointer and out-pointer are valid for the call.
        let rc = unsafe { libc::statvfs(c.as_ptr(), &mut sv) };
        if rc != 0 {
            return reply.error(io_errno(io::Error::last_os_error()));
        }
        reply.statfs(
            sv.f_blocks,
            sv.f_bfree,
            sv.f_bavail,
            sv.f_files,
            sv.f_ffree,
            sv.f_bsize as u32,
            sv.f_namemax as u32,
            sv.f_frsize as u32,
        );
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let rel = match self.rel_of(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        let full = self.full_path(&rel);
        let c = match cpath(&full) {
            Ok(c) => c,
            Err(e) => return reply.error(io_errno(e)),
        };
        // SAFETY: the path pointer is valid for the call.
        let rc = unsafe { libc::access(c.as_ptr(), mask) };
        if rc == 0 {
            reply.ok();
        } else {
            reply.error(io_errno(io::Error::last_os_error()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_flag_detection() {
        assert!(!open_wants_write(libc::O_RDONLY));
        assert!(open_wants_write(libc::O_WRONLY));
        assert!(open_wants_write(libc::O_RDWR));
        assert!(open_wants_write(libc::O_RDONLY | libc::O_APPEND));
        assert!(open_wants_write(libc::O_RDONLY | libc::O_TRUNC));
    }

    #[test]
    fn attr_mirrors_backing_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello").unwrap();

        let md = std::fs::symlink_metadata(&path).unwrap();
        let attr = attr_from_metadata(42, &md);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(u32::from(attr.perm), md.mode() & 0o7777);
    }

    #[test]
    fn directory_kind_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let md = std::fs::symlink_metadata(dir.path()).unwrap();
        assert_eq!(attr_from_metadata(7, &md).kind, FileType::Directory);
    }

    #[test]
    fn timespec_mapping() {
        assert_eq!(timespec_of(None).tv_nsec, libc::UTIME_OMIT);
        assert_eq!(timespec_of(Some(TimeOrNow::Now)).tv_nsec, libc::UTIME_NOW);
        let at = UNIX_EPOCH + Duration::new(12, 34);
        let spec = timespec_of(Some(TimeOrNow::SpecificTime(at)));
        assert_eq!(spec.tv_sec, 12);
        assert_eq!(spec.tv_nsec, 34);
    }

    #[test]
    fn lock_plans_order_and_dedup() {
        let root = Path::new("/r");

        // Parent sorts before child.
        let keys = write_lock_keys(
            root,
            &parent_child_lock_paths(Path::new("sub"), Path::new("sub/f")),
        );
        assert_eq!(keys, vec!["/r/sub".to_string(), "/r/sub/f".to_string()]);

        // A rename within one directory collapses the duplicate parent.
        let keys = write_lock_keys(
            root,
            &rename_lock_paths(
                Path::new("d"),
                Path::new("d/a"),
                Path::new("d"),
                Path::new("d/b"),
            ),
        );
        assert_eq!(
            keys,
            vec![
                "/r/d".to_string(),
                "/r/d/a".to_string(),
                "/r/d/b".to_string()
            ]
        );
    }

    #[test]
    fn link_plan_locks_the_source_parent_too() {
        let plan = link_lock_paths(
            Path::new("dir/orig"),
            Path::new("other"),
            Path::new("other/l"),
        );
        assert_eq!(plan.len(), 4);
        assert!(plan.contains(&PathBuf::from("dir")));
        assert!(plan.contains(&PathBuf::from("dir/orig")));
        assert!(plan.contains(&PathBuf::from("other")));
        assert!(plan.contains(&PathBuf::from("other/l")));

        // A root-level source locks the root itself.
        let plan = link_lock_paths(Path::new("orig"), Path::new("d"), Path::new("d/l"));
        assert!(plan.contains(&PathBuf::from("")));
    }

    // The broker-backed tests below drive the private locking helpers the
    // Filesystem methods are built from against a real in-process broker,
    // the same harness shape as gate-broker's server tests.

    struct BrokerFixture {
        client: BrokerClient,
        dir: tempfile::TempDir,
        _runtime: tokio::runtime::Runtime,
    }

    fn start_broker() -> BrokerFixture {
        use gate_broker::broker::LockBroker;
        use gate_broker::server::{self, Listener, Shutdown};
        use gate_broker::store::Store;
        use gate_core::config::BrokerConfig;

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("broker.sock");
        let runtime = tokio::runtime::Runtime::new().unwrap();

        let store = Store::open_in_memory().unwrap();
        let config = BrokerConfig {
            lease_ms: 60_000,
            max_hold_ms: 600_000,
            acquire_timeout_ms: 5_000,
            ..BrokerConfig::default()
        };
        let broker = Arc::new(LockBroker::from_store(store, &config).unwrap());
        let listener = {
            let _guard = runtime.enter();
            Listener::bind_unix(&socket).unwrap()
        };
        let shutdown = Shutdown::new();
        runtime.spawn(async move {
            let _ = server::run(listener, broker, shutdown).await;
        });

        BrokerFixture {
            client: BrokerClient::new(gate_core::BrokerEndpoint::Unix(socket)),
            dir,
            _runtime: runtime,
        }
    }

    fn test_fs(fixture: &BrokerFixture, acquire_timeout_ms: u64) -> GateFs {
        let root = fixture.dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        GateFs::new(
            &root,
            fixture.client.clone(),
            ProxyConfig {
                lease_ms: 60_000,
                acquire_timeout_ms,
                max_hold_ms: None,
                release_on_flush: false,
            },
        )
        .unwrap()
    }

    fn canonical_root(fixture: &BrokerFixture) -> PathBuf {
        fixture.dir.path().join("root").canonicalize().unwrap()
    }

    #[test]
    fn rename_holds_exactly_the_planned_lock_set() {
        use gate_core::protocol::EntryState;

        let fixture = start_broker();
        let fs = test_fs(&fixture, 2_000);
        let root = canonical_root(&fixture);

        let plan = rename_lock_paths(
            Path::new(""),
            Path::new("a.txt"),
            Path::new("sub"),
            Path::new("sub/b.txt"),
        );
        let expected = write_lock_keys(&root, &plan);
        assert_eq!(expected.len(), 4);

        let client = fixture.client.clone();
        let snapshot = fs
            .with_multi_write_lock(&plan, || Ok(client.status(None).unwrap()))
            .unwrap();

        let held: Vec<String> = snapshot.paths.keys().cloned().collect();
        assert_eq!(held, expected);

        let mut owners = std::collections::HashSet::new();
        for entries in snapshot.paths.values() {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].mode, LockMode::Write);
            assert_eq!(entries[0].state, EntryState::Granted);
            owners.insert(entries[0].owner.clone());
        }
        // One op-scoped owner spans the whole set.
        assert_eq!(owners.len(), 1);

        // Everything is released once the operation returns.
        assert!(fixture.client.status(None).unwrap().paths.is_empty());
    }

    #[test]
    fn link_holds_the_source_parent_lock() {
        let fixture = start_broker();
        let fs = test_fs(&fixture, 2_000);
        let root = canonical_root(&fixture);

        let plan = link_lock_paths(
            Path::new("dir/orig.txt"),
            Path::new("other"),
            Path::new("other/l.txt"),
        );
        let expected = write_lock_keys(&root, &plan);
        let source_parent_key = root.join("dir").to_string_lossy().into_owned();
        assert!(expected.contains(&source_parent_key));

        let client = fixture.client.clone();
        let snapshot = fs
            .with_multi_write_lock(&plan, || Ok(client.status(None).unwrap()))
            .unwrap();
        let held: Vec<String> = snapshot.paths.keys().cloned().collect();
        assert_eq!(held, expected);

        assert!(fixture.client.status(None).unwrap().paths.is_empty());
    }

    #[test]
    fn contended_lock_surfaces_etimedout() {
        let fixture = start_broker();
        let fs = test_fs(&fixture, 300);
        let root = canonical_root(&fixture);
        let key = root.join("f.txt").to_string_lossy().into_owned();

        let holder = OwnerToken::mint();
        let outcome = fixture
            .client
            .acquire(&AcquireRequest::new(key.clone(), LockMode::Write, &holder))
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::Granted);

        let errno = fs
            .with_lock(Path::new("f.txt"), LockMode::Write, |_| Ok(()))
            .unwrap_err();
        assert_eq!(errno, libc::ETIMEDOUT);

        fixture.client.release(&key, &holder).unwrap();
    }

    #[test]
    fn unreachable_broker_surfaces_eio() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let client = BrokerClient::new(gate_core::BrokerEndpoint::Unix(
            dir.path().join("absent.sock"),
        ));
        let fs = GateFs::new(
            &root,
            client,
            ProxyConfig {
                lease_ms: 60_000,
                acquire_timeout_ms: 300,
                max_hold_ms: None,
                release_on_flush: false,
            },
        )
        .unwrap();

        let errno = fs
            .with_lock(Path::new("f"), LockMode::Read, |_| Ok(()))
            .unwrap_err();
        assert_eq!(errno, libc::EIO);
    }

    #[test]
    fn metadata_op_reenters_an_open_write_handle() {
        let fixture = start_broker();
        let fs = test_fs(&fixture, 300);
        let root = canonical_root(&fixture);
        let key = root.join("f.txt").to_string_lossy().into_owned();

        // Simulate an open write handle whose owner already holds the lock.
        let owner = OwnerToken::mint();
        fixture
            .client
            .acquire(&AcquireRequest::new(key.clone(), LockMode::Write, &owner))
            .unwrap();
        fs.handles.lock().unwrap().insert(OpenHandle {
            rel_path: PathBuf::from("f.txt"),
            lock_key: key.clone(),
            owner: owner.clone(),
            mode: LockMode::Write,
            state: HandleState::Open,
            file: tempfile::tempfile().unwrap(),
        });

        // A chmod-style op on the same path re-enters the handle's lock
        // instead of timing out behind it.
        fs.with_lock(Path::new("f.txt"), LockMode::Write, |_| Ok(()))
            .unwrap();

        // The handle's own hold survives the operation.
        let snapshot = fixture.client.status(Some(&key)).unwrap();
        let entries = &snapshot.paths[key.as_str()];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owner, owner);
        assert_eq!(entries[0].hold_count, 1);
    }
}
