#![forbid(unsafe_code)]

//! Stackable virtual filesystem layer for file-manager front ends.
//!
//! One uniform path/operation interface over local files and remote
//! shell-accessible hosts. The concrete remote backend speaks FISH
//! ("files transferred over shell"): a line-oriented command/reply
//! protocol driving a remote `/bin/sh` through an `ssh`/`rsh` pipe.

pub mod backend;
pub mod context;
pub mod error;
pub mod escape;
pub mod fish;
pub mod gc;
pub mod host;
pub mod localfs;
pub mod path;
pub mod settings;
pub mod stat;
pub mod superblock;
pub mod tree;

pub use backend::{ClassFlags, Mount, VfsBackend, VfsClass};
pub use context::{DirEntryInfo, FileId, OpenFlags, VfsContext};
pub use error::{OpContext, VfsError, VfsResult};
pub use escape::{Quoted, shell_escape, shell_unescape};
pub use host::{Host, InterruptFlag, NullHost};
pub use path::{ConnectSpec, HostFlavor, MountSpec};
pub use settings::VfsSettings;
pub use stat::{FileKind, FileStat};
