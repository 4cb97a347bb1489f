//! Superblocks: one live backend instance per connection or archive,
//! plus the process-wide store they live in.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::backend::{ClassFlags, Mount};
use crate::error::{VfsError, VfsResult};
use crate::path::split_dir_name;
use crate::stat::FileStat;
use crate::tree::{DirTree, InodeId, Lookup};

/// Slot index of a superblock in the store. Stable for the lifetime of
/// the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SbId(pub(crate) usize);

/// One open connection or mounted archive.
pub struct Superblock {
    pub(crate) backend_idx: usize,
    /// Display name, e.g. `sh://alice@box/`.
    pub name: String,
    pub flags: ClassFlags,
    pub tree: DirTree,
    /// Number of open file handles. A superblock with open handles is
    /// never evicted.
    pub fd_usage: u32,
    pub mount: Box<dyn Mount>,
    /// Set when the connection died mid-exchange; new operations are
    /// refused, and the next resolution of this identity opens a fresh
    /// superblock.
    pub broken: bool,
}

impl Superblock {
    pub(crate) fn new(backend_idx: usize, flags: ClassFlags, mount: Box<dyn Mount>) -> Self {
        Self {
            backend_idx,
            name: mount.name(),
            flags,
            tree: DirTree::new(),
            fd_usage: 0,
            mount,
            broken: false,
        }
    }

    /// Resolve an in-mount path to an inode, loading directory listings
    /// from the backend as needed.
    ///
    /// Remote-style classes keep a flat layout at the root: each loaded
    /// directory is a root entry named with its full in-mount path, and
    /// the tree walk only runs inside it. Local-style tree classes walk
    /// from the root directly.
    pub fn find_inode(
        &mut self,
        path: &str,
        lookup: Lookup,
        dir_timeout: Duration,
    ) -> VfsResult<InodeId> {
        if self.broken {
            return Err(VfsError::ConnectionReset(
                crate::error::OpContext::new().with_mount(self.name.clone()),
            ));
        }
        if self.flags.remote || self.flags.use_tmp {
            self.find_inode_linear(path, lookup, dir_timeout)
        } else {
            let root = self.tree.root();
            self.tree.find(root, path, lookup)
        }
    }

    fn find_inode_linear(
        &mut self,
        path: &str,
        lookup: Lookup,
        dir_timeout: Duration,
    ) -> VfsResult<InodeId> {
        if path.is_empty() && lookup.want_dir {
            // the mount root always exists, even before any listing
            return Ok(self.tree.root());
        }

        let (dirname, basename) = if lookup.want_dir {
            (path, None)
        } else {
            let (dir, name) = split_dir_name(path);
            (dir, Some(name))
        };

        let dir = self.load_dir(dirname, dir_timeout)?;
        match basename {
            None => Ok(dir),
            Some(name) => self.tree.find(dir, name, lookup),
        }
    }

    /// Look up (or fetch) the cached listing of `dirname`, honoring the
    /// expiry deadline.
    fn load_dir(&mut self, dirname: &str, dir_timeout: Duration) -> VfsResult<InodeId> {
        let root = self.tree.root();
        let now = Instant::now();

        if let Some(existing) = self.tree.lookup_child(root, dirname) {
            if !self.tree.dir_expired(existing, now) {
                return Ok(existing);
            }
            debug!(dir = dirname, mount = %self.name, "directory cache expired");
            self.tree.remove_entry(root, dirname);
        }

        let dir = self.tree.add_inode(FileStat::directory());
        self.mount.dir_load(&mut self.tree, dir, dirname)?;
        self.tree.inode_mut(dir).cache_deadline = Some(now + dir_timeout);
        self.tree.insert_entry(root, dirname, dir)?;
        Ok(dir)
    }

    /// Throw away every cached listing and local copy. Open handles are
    /// unaffected: they hold their own references to local copies.
    pub fn invalidate(&mut self) {
        self.tree = DirTree::new();
    }
}

/// Process-wide list of live superblocks.
///
/// Slots are index-stable: freeing a superblock leaves a hole rather
/// than shifting its neighbors, so a GC sweep can free entries while
/// iterating over a snapshot of ids.
#[derive(Default)]
pub struct SuperblockStore {
    slots: Vec<Option<Superblock>>,
}

impl SuperblockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, superblock: Superblock) -> SbId {
        match self.slots.iter().position(Option::is_none) {
            Some(hole) => {
                self.slots[hole] = Some(superblock);
                SbId(hole)
            }
            None => {
                self.slots.push(Some(superblock));
                SbId(self.slots.len() - 1)
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: SbId) -> Option<&Superblock> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: SbId) -> Option<&mut Superblock> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Remove and return a superblock, leaving a reusable hole.
    pub fn take(&mut self, id: SbId) -> Option<Superblock> {
        self.slots.get_mut(id.0).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SbId, &Superblock)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|sb| (SbId(idx), sb)))
    }

    /// Snapshot of live ids, safe to hold across frees.
    #[must_use]
    pub fn ids(&self) -> Vec<SbId> {
        self.iter().map(|(id, _)| id).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
