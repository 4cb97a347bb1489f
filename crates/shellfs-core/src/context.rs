//! The VFS context: backend registry, superblock store, garbage
//! collection stamps and the POSIX-shaped operation surface.
//!
//! This is the only entry point the host application uses; it never
//! talks to a backend directly. One context owns all state — there are
//! no process-wide globals — and everything on it is single-threaded
//! and cooperative: the sweeper runs when the host says it is idle.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::backend::{Mount, VfsBackend, VfsClass};
use crate::error::{OpContext, VfsError, VfsResult};
use crate::fish::FishBackend;
use crate::gc::StampList;
use crate::host::Host;
use crate::localfs::LocalFsBackend;
use crate::path::{MountSpec, canonicalize, parse_network_url, split_dir_name, split_scheme};
use crate::settings::VfsSettings;
use crate::stat::FileStat;
use crate::superblock::{SbId, Superblock, SuperblockStore};
use crate::tree::{InodeId, LocalCopy, Lookup};

const TRANSFER_CHUNK: usize = 8192;

/// Handle to an open file, as given out by [`VfsContext::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u64);

/// One directory listing row from [`VfsContext::read_dir`].
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub stat: FileStat,
}

/// Open disposition flags, the caller-facing shape of the usual
/// `O_*` set.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
    /// Streaming sequential read without materializing a local copy.
    pub linear: bool,
}

impl OpenFlags {
    #[must_use]
    pub fn read_only() -> Self {
        Self { read: true, ..Self::default() }
    }

    #[must_use]
    pub fn write_only() -> Self {
        Self { write: true, create: true, truncate: true, ..Self::default() }
    }

    #[must_use]
    pub fn append() -> Self {
        Self { write: true, create: true, append: true, ..Self::default() }
    }

    /// "View without copying": read the stream straight off the
    /// backend.
    #[must_use]
    pub fn linear() -> Self {
        Self { read: true, linear: true, ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinearMode {
    NotLinear,
    Preopen,
    Open,
}

struct FileHandle {
    sb: SbId,
    /// In-mount path, kept on the handle so commit-back and fstat
    /// survive a cache invalidation.
    path: String,
    stat: FileStat,
    local: Option<LocalCopy>,
    file: Option<std::fs::File>,
    pos: u64,
    changed: bool,
    append: bool,
    linear: LinearMode,
}

/// The process-wide VFS state and operation surface.
pub struct VfsContext {
    backends: Vec<Box<dyn VfsBackend>>,
    supers: SuperblockStore,
    stamps: StampList,
    settings: VfsSettings,
    host: Rc<dyn Host>,
    handles: HashMap<u64, FileHandle>,
    next_handle: u64,
}

impl VfsContext {
    /// A context with the stock backends: the local filesystem as
    /// fallback plus the FISH remote backend.
    #[must_use]
    pub fn new(host: Rc<dyn Host>, settings: VfsSettings) -> Self {
        let fish = FishBackend::new(Rc::clone(&host));
        Self::with_backends(host, settings, vec![Box::new(fish)])
    }

    /// A context with the local fallback plus the given backends.
    /// Backend order is registration order; the scheme router scans it.
    #[must_use]
    pub fn with_backends(
        host: Rc<dyn Host>,
        settings: VfsSettings,
        extra: Vec<Box<dyn VfsBackend>>,
    ) -> Self {
        let mut backends: Vec<Box<dyn VfsBackend>> = vec![Box::new(LocalFsBackend::new())];
        backends.extend(extra);
        Self {
            backends,
            supers: SuperblockStore::new(),
            stamps: StampList::new(),
            settings,
            host,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Tear everything down: every connection is disconnected, open
    /// handles are dropped, local copies deleted. Stamped superblocks
    /// unwind in reverse order so a mount layered on another comes down
    /// first; whatever the sweep left (busy or displayed mounts) is
    /// released afterwards.
    pub fn shutdown(mut self) {
        self.handles.clear();
        self.expire(true);
        for id in self.supers.ids().into_iter().rev() {
            if let Some(mut sb) = self.supers.take(id) {
                debug!(mount = %sb.name, "shutdown: releasing");
                sb.mount.disconnect();
            }
        }
    }

    /// Idle hook for the host event loop: expire superblocks that have
    /// been idle past the timeout.
    pub fn on_idle(&mut self) {
        self.expire(false);
    }

    /// Resolve a path to its backend class and the in-class remainder.
    /// Unknown scheme tokens are the not-found-class error; plain paths
    /// resolve to the local class.
    pub fn resolve(&self, path: &str) -> VfsResult<(&VfsClass, String)> {
        match split_scheme(path) {
            Some((token, rest)) => {
                for backend in self.backends.iter().skip(1) {
                    if backend.which(token) {
                        return Ok((backend.class(), rest.to_string()));
                    }
                }
                Err(VfsError::NoSuchScheme(token.to_string()))
            }
            None => Ok((self.backends[0].class(), path.to_string())),
        }
    }

    /// Names of the live mounts, for the host's connection list UI.
    #[must_use]
    pub fn fill_names(&self) -> Vec<String> {
        self.supers.iter().map(|(_, sb)| sb.name.clone()).collect()
    }

    /// Number of live superblocks. One remote identity maps to at most
    /// one of them.
    #[must_use]
    pub fn active_mounts(&self) -> usize {
        self.supers.len()
    }

    // ---- path routing and superblock lookup ----

    fn route(&self, path: &str) -> VfsResult<(usize, MountSpec, String)> {
        match split_scheme(path) {
            Some((token, rest)) => {
                for (idx, backend) in self.backends.iter().enumerate().skip(1) {
                    if backend.which(token) {
                        if backend.class().flags.remote {
                            let (spec, inpath) = parse_network_url(rest)?;
                            return Ok((idx, MountSpec::Network(spec), inpath));
                        }
                        return Err(VfsError::Invalid(format!(
                            "class '{}' cannot be addressed by scheme",
                            backend.class().name
                        )));
                    }
                }
                // no class claimed the token: the string is a local
                // filename after all
                debug!(token, "no backend matched scheme token, using local");
                Ok((0, MountSpec::Local, canonicalize(path)))
            }
            None => Ok((0, MountSpec::Local, canonicalize(path))),
        }
    }

    fn get_superblock(&mut self, backend_idx: usize, spec: &MountSpec) -> VfsResult<SbId> {
        let mut found = None;
        for (id, sb) in self.supers.iter() {
            if sb.backend_idx == backend_idx
                && !sb.broken
                && self.backends[backend_idx].archive_same(spec, sb.mount.as_ref())
            {
                found = Some(id);
                break;
            }
        }
        if let Some(id) = found {
            self.touch_stamp(id);
            return Ok(id);
        }

        let mount = self.backends[backend_idx].open_archive(spec)?;
        let flags = self.backends[backend_idx].class().flags;
        let sb = Superblock::new(backend_idx, flags, mount);
        debug!(mount = %sb.name, "opened superblock");
        let id = self.supers.insert(sb);
        self.stamp_create(id);
        Ok(id)
    }

    /// Refresh (or create) the idle stamp for a superblock on path use.
    fn touch_stamp(&mut self, id: SbId) {
        let Some(sb) = self.supers.get(id) else { return };
        if sb.flags.local {
            return;
        }
        self.stamps.add(id);
    }

    /// Conditionally record "became idle": only when nothing is open on
    /// the superblock and the host is not displaying it.
    fn stamp_create(&mut self, id: SbId) {
        let Some(sb) = self.supers.get(id) else { return };
        if sb.flags.local || sb.fd_usage > 0 {
            return;
        }
        if self.host.in_use(&sb.name) {
            return;
        }
        self.stamps.add(id);
    }

    fn expire(&mut self, all: bool) {
        if !self.stamps.begin_sweep() {
            return;
        }
        let victims = self.stamps.expired(self.settings.gc_timeout(), all);
        for id in victims {
            let busy = self.supers.get(id).is_some_and(|sb| sb.fd_usage > 0);
            if busy {
                // still in use: push the stamp forward instead
                self.stamps.refresh(id);
                continue;
            }
            self.stamps.remove(id);
            if let Some(mut sb) = self.supers.take(id) {
                debug!(mount = %sb.name, "expiring idle superblock");
                sb.mount.disconnect();
            }
        }
        self.stamps.end_sweep();
    }

    /// Mark a superblock unusable after a connection-fatal error.
    fn note_failure(&mut self, id: SbId, err: &VfsError) {
        if err.is_fatal_to_connection()
            && let Some(sb) = self.supers.get_mut(id)
        {
            warn!(mount = %sb.name, "connection failed, marking superblock dead");
            sb.broken = true;
        }
    }

    fn resolve_inode(&mut self, path: &str, lookup: Lookup) -> VfsResult<(SbId, InodeId, String)> {
        let (idx, spec, inpath) = self.route(path)?;
        let id = self.get_superblock(idx, &spec)?;
        let timeout = self.settings.dir_cache_timeout();
        let sb = self.supers.get_mut(id).expect("live superblock");
        match sb.find_inode(&inpath, lookup, timeout) {
            Ok(ino) => Ok((id, ino, inpath)),
            Err(err) => {
                self.note_failure(id, &err);
                Err(err)
            }
        }
    }

    // ---- stat family ----

    pub fn stat(&mut self, path: &str) -> VfsResult<FileStat> {
        let (id, ino, _) = self.resolve_inode(path, Lookup::follow())?;
        let sb = self.supers.get(id).expect("live superblock");
        Ok(sb.tree.inode(ino).stat.clone())
    }

    pub fn lstat(&mut self, path: &str) -> VfsResult<FileStat> {
        let (id, ino, _) = self.resolve_inode(path, Lookup::no_follow())?;
        let sb = self.supers.get(id).expect("live superblock");
        Ok(sb.tree.inode(ino).stat.clone())
    }

    pub fn fstat(&self, file: FileId) -> VfsResult<FileStat> {
        let handle = self.handles.get(&file.0).ok_or(VfsError::StaleHandle)?;
        let mut stat = handle.stat.clone();
        if let Some(local) = &handle.file
            && let Ok(metadata) = local.metadata()
        {
            stat.size = metadata.len();
        }
        Ok(stat)
    }

    pub fn readlink(&mut self, path: &str) -> VfsResult<String> {
        let (id, ino, _) = self.resolve_inode(path, Lookup::no_follow())?;
        let sb = self.supers.get(id).expect("live superblock");
        let inode = sb.tree.inode(ino);
        if !inode.stat.is_symlink() {
            return Err(VfsError::Invalid(format!("'{path}' is not a symlink")));
        }
        inode
            .link_target
            .clone()
            .ok_or_else(|| VfsError::Invalid(format!("dangling link '{path}'")))
    }

    // ---- directories ----

    pub fn read_dir(&mut self, path: &str) -> VfsResult<Vec<DirEntryInfo>> {
        let (id, ino, _) = self.resolve_inode(path, Lookup::dir())?;
        let sb = self.supers.get(id).expect("live superblock");
        Ok(sb
            .tree
            .children(ino)
            .iter()
            .map(|entry| DirEntryInfo {
                name: entry.name.clone(),
                stat: sb.tree.inode(entry.node).stat.clone(),
            })
            .collect())
    }

    // ---- open / io / close ----

    pub fn open(&mut self, path: &str, mut flags: OpenFlags) -> VfsResult<FileId> {
        let (idx, spec, inpath) = self.route(path)?;
        let id = self.get_superblock(idx, &spec)?;
        let class_flags = self.backends[idx].class().flags;
        if class_flags.no_exclusive_create {
            // the backend cannot perform an exclusive create remotely
            flags.exclusive = false;
        }

        let timeout = self.settings.dir_cache_timeout();
        let mut created = false;

        let sb = self.supers.get_mut(id).expect("live superblock");
        let ino = match sb.find_inode(&inpath, Lookup::follow(), timeout) {
            Ok(ino) => {
                if flags.create && flags.exclusive {
                    return Err(VfsError::AlreadyExists(path.to_string()));
                }
                ino
            }
            Err(VfsError::NotFound(_)) if flags.create && flags.write => {
                if class_flags.read_only {
                    return Err(VfsError::ReadOnly(path.to_string()));
                }
                let (dirname, basename) = split_dir_name(&inpath);
                let dir = sb.find_inode(dirname, Lookup::dir(), timeout)?;
                created = true;
                sb.tree.add_child(dir, basename, FileStat::regular())?
            }
            Err(err) => {
                self.note_failure(id, &err);
                return Err(err);
            }
        };

        let sb = self.supers.get_mut(id).expect("live superblock");
        if sb.tree.inode(ino).stat.is_dir() {
            return Err(VfsError::IsDirectory(path.to_string()));
        }
        let stat = sb.tree.inode(ino).stat.clone();

        let mut handle = FileHandle {
            sb: id,
            path: inpath.clone(),
            stat,
            local: None,
            file: None,
            pos: 0,
            changed: created,
            append: flags.append,
            linear: LinearMode::NotLinear,
        };

        if flags.linear && flags.read && !flags.write {
            handle.linear = LinearMode::Preopen;
        } else if class_flags.use_tmp {
            let write_only = flags.write && !flags.read;
            let local = if write_only && sb.tree.inode(ino).local.is_none() {
                // no need to fetch content that is about to be replaced
                let local = new_local_copy(self.backends[idx].class().name, &inpath)?;
                sb.tree.inode_mut(ino).local = Some(local.clone());
                local
            } else if let Some(local) = sb.tree.inode(ino).local.clone() {
                local
            } else {
                let local = match retrieve_file(sb, self.host.as_ref(), self.backends[idx].class().name, &inpath) {
                    Ok(local) => local,
                    Err(err) => {
                        self.note_failure(id, &err);
                        return Err(err);
                    }
                };
                let sb = self.supers.get_mut(id).expect("live superblock");
                sb.tree.inode_mut(ino).local = Some(local.clone());
                local
            };

            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(flags.write)
                .append(flags.append)
                .truncate(flags.truncate && !flags.append)
                .open(local.as_ref())
                .map_err(|err| {
                    VfsError::io(err, OpContext::new().with_op("open").with_path(path))
                })?;
            handle.local = Some(local);
            handle.file = Some(file);
        }

        let sb = self.supers.get_mut(id).expect("live superblock");
        sb.fd_usage += 1;
        self.stamps.remove(id);

        let fid = FileId(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(fid.0, handle);
        Ok(fid)
    }

    pub fn read(&mut self, file: FileId, buf: &mut [u8]) -> VfsResult<usize> {
        let handle = self.handles.get_mut(&file.0).ok_or(VfsError::StaleHandle)?;
        match handle.linear {
            LinearMode::Preopen => {
                let sb = self.supers.get_mut(handle.sb).ok_or(VfsError::StaleHandle)?;
                let started = sb.mount.linear_start(&handle.path, handle.pos);
                if let Err(err) = started {
                    if err.is_fatal_to_connection() {
                        sb.broken = true;
                    }
                    return Err(err);
                }
                handle.linear = LinearMode::Open;
                self.read(file, buf)
            }
            LinearMode::Open => {
                let sb = self.supers.get_mut(handle.sb).ok_or(VfsError::StaleHandle)?;
                match sb.mount.linear_read(buf) {
                    Ok(n) => {
                        handle.pos += n as u64;
                        Ok(n)
                    }
                    Err(err) => {
                        if err.is_fatal_to_connection() {
                            sb.broken = true;
                        }
                        Err(err)
                    }
                }
            }
            LinearMode::NotLinear => {
                let local = handle
                    .file
                    .as_mut()
                    .ok_or_else(|| VfsError::Invalid("file not open for reading".into()))?;
                let n = local.read(buf).map_err(|err| {
                    VfsError::io(err, OpContext::new().with_op("read").with_path(&handle.path))
                })?;
                handle.pos += n as u64;
                Ok(n)
            }
        }
    }

    pub fn write(&mut self, file: FileId, buf: &[u8]) -> VfsResult<usize> {
        let handle = self.handles.get_mut(&file.0).ok_or(VfsError::StaleHandle)?;
        if handle.linear != LinearMode::NotLinear {
            return Err(VfsError::Invalid("streaming handles are read-only".into()));
        }
        let local = handle
            .file
            .as_mut()
            .ok_or_else(|| VfsError::Invalid("file not open for writing".into()))?;
        let n = local.write(buf).map_err(|err| {
            VfsError::io(err, OpContext::new().with_op("write").with_path(&handle.path))
        })?;
        handle.changed = true;
        handle.pos += n as u64;
        Ok(n)
    }

    pub fn lseek(&mut self, file: FileId, pos: SeekFrom) -> VfsResult<u64> {
        let handle = self.handles.get_mut(&file.0).ok_or(VfsError::StaleHandle)?;
        if handle.linear == LinearMode::Open {
            return Err(VfsError::Invalid("cannot seek a streaming read".into()));
        }
        if let Some(local) = handle.file.as_mut() {
            let off = local.seek(pos).map_err(|err| {
                VfsError::io(err, OpContext::new().with_op("lseek").with_path(&handle.path))
            })?;
            handle.pos = off;
            return Ok(off);
        }
        // linear preopen: adjust the start offset against known size
        let size = handle.stat.size;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(handle.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(size) + i128::from(delta),
        };
        handle.pos = u64::try_from(target.clamp(0, i128::from(size))).unwrap_or(0);
        Ok(handle.pos)
    }

    /// Close a handle. A changed local copy is committed back to the
    /// backend first; if that commit fails the handle is still
    /// released and the error reported.
    pub fn close(&mut self, file: FileId) -> VfsResult<()> {
        let mut handle = self.handles.remove(&file.0).ok_or(VfsError::StaleHandle)?;
        let id = handle.sb;
        let mut result = Ok(());

        if handle.linear == LinearMode::Open
            && let Some(sb) = self.supers.get_mut(id)
            && let Err(err) = sb.mount.linear_close()
        {
            if err.is_fatal_to_connection() {
                sb.broken = true;
            }
            result = Err(err);
        }

        let commit = handle.changed && handle.local.is_some();
        // close the local file first so buffered bytes land on disk
        handle.file = None;

        if commit && let Some(sb) = self.supers.get_mut(id) {
            if sb.flags.read_only {
                result = Err(VfsError::ReadOnly(handle.path.clone()));
            } else {
                let local = handle.local.as_ref().expect("checked above");
                match sb.mount.file_store(&handle.path, local.as_ref(), handle.append) {
                    Ok(()) => sb.invalidate(),
                    Err(err) => {
                        if err.is_fatal_to_connection() {
                            sb.broken = true;
                        }
                        result = Err(err);
                    }
                }
            }
        }

        if let Some(sb) = self.supers.get_mut(id) {
            sb.fd_usage = sb.fd_usage.saturating_sub(1);
            if sb.fd_usage == 0 {
                self.stamp_create(id);
            }
        }
        result
    }

    /// Local copy of a file, fetching it if needed. The copy lives in
    /// the cache and disappears with it.
    pub fn getlocalcopy(&mut self, path: &str) -> VfsResult<PathBuf> {
        let file = self.open(path, OpenFlags::read_only())?;
        let local = self
            .handles
            .get(&file.0)
            .and_then(|handle| handle.local.clone());
        let closed = self.close(file);
        let local = local.ok_or_else(|| {
            VfsError::Invalid(format!("'{path}' has no local representation"))
        })?;
        closed?;
        Ok(local.as_ref().to_path_buf())
    }

    // ---- mutations ----

    pub fn chmod(&mut self, path: &str, perm: u32) -> VfsResult<()> {
        self.mutate(path, |mount, inpath| mount.chmod(inpath, perm))
    }

    pub fn chown(&mut self, path: &str, owner: &str, group: &str) -> VfsResult<()> {
        self.mutate(path, |mount, inpath| mount.chown(inpath, owner, group))
    }

    pub fn utime(
        &mut self,
        path: &str,
        atime: std::time::SystemTime,
        mtime: std::time::SystemTime,
    ) -> VfsResult<()> {
        self.mutate(path, |mount, inpath| mount.utime(inpath, atime, mtime))
    }

    pub fn unlink(&mut self, path: &str) -> VfsResult<()> {
        self.mutate(path, |mount, inpath| mount.unlink(inpath))
    }

    pub fn rmdir(&mut self, path: &str) -> VfsResult<()> {
        self.mutate(path, |mount, inpath| mount.rmdir(inpath))
    }

    /// Create a directory, then verify it actually appeared: some
    /// remote shells report success for creations that silently failed.
    pub fn mkdir(&mut self, path: &str) -> VfsResult<()> {
        self.mutate(path, |mount, inpath| mount.mkdir(inpath))?;
        let (idx, spec, inpath) = self.route(path)?;
        let id = self.get_superblock(idx, &spec)?;
        let sb = self.supers.get_mut(id).expect("live superblock");
        match sb.mount.exists(&inpath) {
            Ok(true) => Ok(()),
            Ok(false) => Err(VfsError::AccessDenied(path.to_string())),
            Err(err) => {
                self.note_failure(id, &err);
                Err(err)
            }
        }
    }

    /// Create a symlink at `link_path` pointing at `target`. The
    /// target is an uninterpreted string for the backend.
    pub fn symlink(&mut self, target: &str, link_path: &str) -> VfsResult<()> {
        let target = target.to_string();
        self.mutate(link_path, move |mount, inpath| mount.symlink(&target, inpath))
    }

    pub fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
        self.two_path_op(from, to, |mount, p1, p2| mount.rename(p1, p2))
    }

    pub fn link(&mut self, from: &str, to: &str) -> VfsResult<()> {
        self.two_path_op(from, to, |mount, p1, p2| mount.hardlink(p1, p2))
    }

    /// Drop every cached listing of the superblock `path` resolves to.
    pub fn invalidate(&mut self, path: &str) -> VfsResult<()> {
        let (idx, spec, _) = self.route(path)?;
        let id = self.get_superblock(idx, &spec)?;
        let sb = self.supers.get_mut(id).expect("live superblock");
        sb.invalidate();
        Ok(())
    }

    fn mutate(
        &mut self,
        path: &str,
        op: impl FnOnce(&mut dyn Mount, &str) -> VfsResult<()>,
    ) -> VfsResult<()> {
        let (idx, spec, inpath) = self.route(path)?;
        let id = self.get_superblock(idx, &spec)?;
        let sb = self.supers.get_mut(id).expect("live superblock");
        if sb.flags.read_only {
            return Err(VfsError::ReadOnly(path.to_string()));
        }
        let result = op(sb.mount.as_mut(), &inpath);
        match result {
            Ok(()) => {
                sb.invalidate();
                self.stamp_create(id);
                Ok(())
            }
            Err(err) => {
                self.note_failure(id, &err);
                self.stamp_create(id);
                Err(err)
            }
        }
    }

    fn two_path_op(
        &mut self,
        from: &str,
        to: &str,
        op: impl FnOnce(&mut dyn Mount, &str, &str) -> VfsResult<()>,
    ) -> VfsResult<()> {
        let (idx1, spec1, inpath1) = self.route(from)?;
        let (idx2, spec2, inpath2) = self.route(to)?;
        let id = self.get_superblock(idx2, &spec2)?;
        {
            let sb = self.supers.get(id).expect("live superblock");
            if idx1 != idx2 || !self.backends[idx1].archive_same(&spec1, sb.mount.as_ref()) {
                return Err(VfsError::CrossDevice(format!("{from} -> {to}")));
            }
        }
        let sb = self.supers.get_mut(id).expect("live superblock");
        if sb.flags.read_only {
            return Err(VfsError::ReadOnly(to.to_string()));
        }
        let result = op(sb.mount.as_mut(), &inpath1, &inpath2);
        match result {
            Ok(()) => {
                sb.invalidate();
                self.stamp_create(id);
                Ok(())
            }
            Err(err) => {
                self.note_failure(id, &err);
                self.stamp_create(id);
                Err(err)
            }
        }
    }
}

/// Fresh empty local cache file named after the class and basename.
fn new_local_copy(class_name: &str, inpath: &str) -> VfsResult<LocalCopy> {
    let (_, basename) = split_dir_name(inpath);
    let suffix: String = basename.chars().take(32).collect();
    let temp = tempfile::Builder::new()
        .prefix(&format!("{class_name}-"))
        .suffix(&format!("-{suffix}"))
        .tempfile()
        .map_err(|err| VfsError::io(err, OpContext::new().with_op("mktemp").with_path(inpath)))?;
    Ok(Rc::new(temp.into_temp_path()))
}

/// Download a whole file into a fresh local copy through the streaming
/// read interface.
fn retrieve_file(
    sb: &mut Superblock,
    host: &dyn Host,
    class_name: &str,
    inpath: &str,
) -> VfsResult<LocalCopy> {
    let local = new_local_copy(class_name, inpath)?;
    let mut out = std::fs::File::create(local.as_ref())
        .map_err(|err| VfsError::io(err, OpContext::new().with_op("retrieve").with_path(inpath)))?;

    let total = sb.mount.linear_start(inpath, 0)?;
    let mut buf = [0u8; TRANSFER_CHUNK];
    let mut got: u64 = 0;
    loop {
        let n = match sb.mount.linear_read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                let _ = sb.mount.linear_close();
                return Err(err);
            }
        };
        if let Err(err) = out.write_all(&buf[..n]) {
            let _ = sb.mount.linear_close();
            return Err(VfsError::io(
                err,
                OpContext::new().with_op("retrieve").with_path(inpath),
            ));
        }
        got += n as u64;
        host.message(&format!(
            "{class_name}: Getting file {inpath}: {got}/{total} bytes transferred"
        ));
    }
    sb.mount.linear_close()?;
    Ok(local)
}
