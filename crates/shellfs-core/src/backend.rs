//! The backend adapter contract.
//!
//! A new backend (archive format, protocol) plugs in by implementing
//! [`VfsBackend`] and [`Mount`] and registering with the context; the
//! cache, router and garbage collector never change. [`VfsBackend`] is
//! the per-class descriptor and connection factory; [`Mount`] is the
//! state of one live connection or opened archive, owned by its
//! superblock.

use std::path::Path;
use std::time::SystemTime;

use crate::error::{VfsError, VfsResult};
use crate::path::{MountSpec, token_matches};
use crate::tree::{DirTree, InodeId};

/// Capabilities of a backend class. Immutable after registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassFlags {
    /// Backed by the local filesystem; exempt from idle-eviction.
    pub local: bool,
    /// Talks to another machine; lookups go through the flat
    /// full-path-per-entry root layout.
    pub remote: bool,
    /// The backend cannot create hard links.
    pub no_links: bool,
    /// Content is materialized in local temp copies; writes are
    /// committed back on close.
    pub use_tmp: bool,
    /// Mutating operations are rejected outright.
    pub read_only: bool,
    /// `O_EXCL` is quietly dropped on open; the backend cannot perform
    /// an exclusive create remotely.
    pub no_exclusive_create: bool,
}

/// Immutable descriptor of one backend class.
#[derive(Debug, Clone)]
pub struct VfsClass {
    /// Human-readable backend name, e.g. `"fish"`.
    pub name: &'static str,
    /// Scheme token this class claims, e.g. `"sh"`.
    pub prefix: &'static str,
    pub flags: ClassFlags,
}

impl VfsClass {
    /// Default scheme predicate: exact token or token plus the `+`
    /// variant marker.
    #[must_use]
    pub fn matches_token(&self, token: &str) -> bool {
        token_matches(self.prefix, token)
    }
}

/// A registered backend: class descriptor plus the factory and identity
/// predicate for its superblocks.
pub trait VfsBackend {
    fn class(&self) -> &VfsClass;

    /// Scheme-token predicate. The default defers to the class prefix.
    fn which(&self, token: &str) -> bool {
        self.class().matches_token(token)
    }

    /// Establish a new connection / open a new archive for `spec`.
    /// On failure nothing is registered and the error propagates to the
    /// caller of the original operation.
    fn open_archive(&self, spec: &MountSpec) -> VfsResult<Box<dyn Mount>>;

    /// Whether an existing mount serves the same identity as `spec`.
    fn archive_same(&self, spec: &MountSpec, mount: &dyn Mount) -> bool;
}

/// One live connection or opened archive.
///
/// All paths are in-mount paths: separator-normalized, no leading slash
/// (the root of the mount is the empty string). Implementations never
/// see raw user input — interpolation into remote commands goes through
/// the escaping layer.
pub trait Mount {
    /// Display name, e.g. `sh://alice@box/`. Used in messages and for
    /// connection enumeration.
    fn name(&self) -> String;

    /// The identity this mount was opened with.
    fn spec(&self) -> &MountSpec;

    /// Fill `dir`'s child entries from a fresh listing of
    /// `remote_path`.
    fn dir_load(&mut self, tree: &mut DirTree, dir: InodeId, remote_path: &str) -> VfsResult<()>;

    /// Commit a locally modified or created file back to the backend.
    fn file_store(&mut self, remote_path: &str, local: &Path, append: bool) -> VfsResult<()>;

    /// Begin a streaming sequential read. Returns the total byte count
    /// the backend is about to send.
    fn linear_start(&mut self, remote_path: &str, offset: u64) -> VfsResult<u64>;

    /// Read the next chunk of a streaming transfer. Returns 0 at end of
    /// stream, after which the transfer is finished.
    fn linear_read(&mut self, buf: &mut [u8]) -> VfsResult<usize>;

    /// Finish a streaming transfer. If the declared byte count was not
    /// consumed, the remainder is drained so the session stays usable.
    fn linear_close(&mut self) -> VfsResult<()>;

    fn chmod(&mut self, path: &str, perm: u32) -> VfsResult<()>;

    fn chown(&mut self, path: &str, owner: &str, group: &str) -> VfsResult<()>;

    fn utime(&mut self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()>;

    /// Create a symlink at `link_path` pointing to `target`.
    fn symlink(&mut self, target: &str, link_path: &str) -> VfsResult<()>;

    fn hardlink(&mut self, from: &str, to: &str) -> VfsResult<()> {
        let _ = (from, to);
        Err(VfsError::NotSupported("hard links"))
    }

    fn rename(&mut self, from: &str, to: &str) -> VfsResult<()>;

    fn unlink(&mut self, path: &str) -> VfsResult<()>;

    fn mkdir(&mut self, path: &str) -> VfsResult<()>;

    fn rmdir(&mut self, path: &str) -> VfsResult<()>;

    /// Probe whether `path` exists on the backend right now.
    fn exists(&mut self, path: &str) -> VfsResult<bool>;

    /// Release transport resources: close pipes, reap the child, delete
    /// whatever the backend still holds. Best effort; called exactly
    /// once before the superblock is dropped.
    fn disconnect(&mut self);
}
