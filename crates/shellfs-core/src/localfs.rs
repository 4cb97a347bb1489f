//! Local filesystem backend.
//!
//! The fallback every path without a scheme resolves to. It speaks the
//! same [`Mount`] contract as the remote backends, so the cache, the
//! open/commit machinery and the tests exercise one code path for
//! both.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::backend::{ClassFlags, Mount, VfsBackend, VfsClass};
use crate::error::{OpContext, VfsError, VfsResult};
use crate::stat::{FileKind, FileStat};
use crate::tree::{DirTree, InodeId};

pub struct LocalFsBackend {
    class: VfsClass,
}

impl Default for LocalFsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalFsBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            class: VfsClass {
                name: "localfs",
                prefix: "local",
                flags: ClassFlags {
                    local: true,
                    use_tmp: true,
                    ..ClassFlags::default()
                },
            },
        }
    }
}

impl VfsBackend for LocalFsBackend {
    fn class(&self) -> &VfsClass {
        &self.class
    }

    /// The local class is the fallback, never claimed through a scheme
    /// token.
    fn which(&self, _token: &str) -> bool {
        false
    }

    fn open_archive(&self, spec: &crate::path::MountSpec) -> VfsResult<Box<dyn Mount>> {
        if !matches!(spec, crate::path::MountSpec::Local) {
            return Err(VfsError::Invalid("localfs only mounts the local spec".into()));
        }
        Ok(Box::new(LocalFsMount { reader: None }))
    }

    fn archive_same(&self, spec: &crate::path::MountSpec, _mount: &dyn Mount) -> bool {
        matches!(spec, crate::path::MountSpec::Local)
    }
}

struct LocalReader {
    file: fs::File,
    remaining: u64,
}

pub struct LocalFsMount {
    reader: Option<LocalReader>,
}

static LOCAL_SPEC: crate::path::MountSpec = crate::path::MountSpec::Local;

fn full_path(path: &str) -> PathBuf {
    let mut full = PathBuf::from("/");
    full.push(path);
    full
}

fn map_io(err: std::io::Error, op: &'static str, path: &str) -> VfsError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => VfsError::NotFound(path.to_string()),
        ErrorKind::PermissionDenied => VfsError::AccessDenied(path.to_string()),
        ErrorKind::AlreadyExists => VfsError::AlreadyExists(path.to_string()),
        ErrorKind::NotADirectory => VfsError::NotDirectory(path.to_string()),
        ErrorKind::IsADirectory => VfsError::IsDirectory(path.to_string()),
        _ => VfsError::io(err, OpContext::new().with_op(op).with_path(path)),
    }
}

fn stat_from_metadata(metadata: &fs::Metadata) -> FileStat {
    let kind = if metadata.file_type().is_dir() {
        FileKind::Directory
    } else if metadata.file_type().is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::Regular
    };

    #[cfg(unix)]
    let perm = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let perm = if metadata.permissions().readonly() { 0o444 } else { 0o644 };

    let mut stat = FileStat::new(kind, perm);
    stat.size = metadata.len();
    if let Ok(modified) = metadata.modified() {
        stat.mtime = modified;
    }
    stat
}

impl Mount for LocalFsMount {
    fn name(&self) -> String {
        "/".to_string()
    }

    fn spec(&self) -> &crate::path::MountSpec {
        &LOCAL_SPEC
    }

    fn dir_load(&mut self, tree: &mut DirTree, dir: InodeId, remote_path: &str) -> VfsResult<()> {
        let full = full_path(remote_path);
        debug!(path = %full.display(), "loading local directory");

        let entries = fs::read_dir(&full).map_err(|err| map_io(err, "dir_load", remote_path))?;
        for entry in entries {
            let entry = entry.map_err(|err| map_io(err, "dir_load", remote_path))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = match entry.path().symlink_metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue, // raced away; skip it
            };
            let node = tree.add_child(dir, &name, stat_from_metadata(&metadata))?;
            if metadata.file_type().is_symlink()
                && let Ok(target) = fs::read_link(entry.path())
            {
                tree.inode_mut(node).link_target =
                    Some(target.to_string_lossy().into_owned());
            }
        }
        Ok(())
    }

    fn file_store(&mut self, remote_path: &str, local: &Path, append: bool) -> VfsResult<()> {
        let full = full_path(remote_path);
        if append {
            use std::io::Write;
            let mut src =
                fs::File::open(local).map_err(|err| map_io(err, "store", remote_path))?;
            let mut dst = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&full)
                .map_err(|err| map_io(err, "store", remote_path))?;
            std::io::copy(&mut src, &mut dst)
                .map_err(|err| map_io(err, "store", remote_path))?;
            dst.flush().map_err(|err| map_io(err, "store", remote_path))?;
        } else {
            fs::copy(local, &full).map_err(|err| map_io(err, "store", remote_path))?;
        }
        Ok(())
    }

    fn linear_start(&mut self, remote_path: &str, offset: u64) -> VfsResult<u64> {
        if self.reader.is_some() {
            return Err(VfsError::Invalid("transfer already in progress".into()));
        }
        let full = full_path(remote_path);
        let mut file = fs::File::open(&full).map_err(|err| map_io(err, "retrieve", remote_path))?;
        let len = file
            .metadata()
            .map_err(|err| map_io(err, "retrieve", remote_path))?
            .len();
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|err| map_io(err, "retrieve", remote_path))?;
        }
        let remaining = len.saturating_sub(offset);
        self.reader = Some(LocalReader { file, remaining });
        Ok(remaining)
    }

    fn linear_read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(VfsError::Invalid("no transfer in progress".into()));
        };
        let want = usize::try_from(reader.remaining.min(buf.len() as u64)).unwrap_or(buf.len());
        if want == 0 {
            return Ok(0);
        }
        let n = reader.file.read(&mut buf[..want])?;
        reader.remaining -= n as u64;
        Ok(n)
    }

    fn linear_close(&mut self) -> VfsResult<()> {
        self.reader = None;
        Ok(())
    }

    fn chmod(&mut self, path: &str, perm: u32) -> VfsResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let full = full_path(path);
            fs::set_permissions(&full, fs::Permissions::from_mode(perm & 0o7777))
                .map_err(|err| map_io(err, "chmod", path))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, perm);
            Err(VfsError::NotSupported("chmod"))
        }
    }

    fn chown(&mut self, _path: &str, _owner: &str, _group: &str) -> VfsResult<()> {
        Err(VfsError::NotSupported("chown on the local filesystem"))
    }

    fn utime(&mut self, _path: &str, _atime: SystemTime, _mtime: SystemTime) -> VfsResult<()> {
        Err(VfsError::NotSupported("utime on the local filesystem"))
    }

    fn symlink(&mut self, target: &str, link_path: &str) -> VfsResult<()> {
        #[cfg(unix)]
        {
            let full = full_path(link_path);
            std::os::unix::fs::symlink(target, &full)
                .map_err(|err| map_io(err, "symlink", link_path))
        }
        #[cfg(not(unix))]
        {
            let _ = (target, link_path);
            Err(VfsError::NotSupported("symlink"))
        }
    }

    fn hardlink(&mut self, from: &str, to: &str) -> VfsResult<()> {
        fs::hard_link(full_path(from), full_path(to)).map_err(|err| map_io(err, "hardlink", to))
    }

    fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
        fs::rename(full_path(from), full_path(to)).map_err(|err| map_io(err, "rename", to))
    }

    fn unlink(&mut self, path: &str) -> VfsResult<()> {
        fs::remove_file(full_path(path)).map_err(|err| map_io(err, "unlink", path))
    }

    fn mkdir(&mut self, path: &str) -> VfsResult<()> {
        fs::create_dir(full_path(path)).map_err(|err| map_io(err, "mkdir", path))
    }

    fn rmdir(&mut self, path: &str) -> VfsResult<()> {
        fs::remove_dir(full_path(path)).map_err(|err| map_io(err, "rmdir", path))
    }

    fn exists(&mut self, path: &str) -> VfsResult<bool> {
        Ok(full_path(path).symlink_metadata().is_ok())
    }

    fn disconnect(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;
    use assert_fs::prelude::*;

    fn in_mount(dir: &TempDir, rest: &str) -> String {
        let base = dir.path().to_string_lossy().trim_start_matches('/').to_string();
        if rest.is_empty() { base } else { format!("{base}/{rest}") }
    }

    #[test]
    fn test_dir_load_lists_entries() {
        let temp = TempDir::new().unwrap();
        temp.child("a.txt").write_str("hello").unwrap();
        temp.child("sub").create_dir_all().unwrap();

        let mut mount = LocalFsMount { reader: None };
        let mut tree = DirTree::new();
        let dir = tree.root();
        mount.dir_load(&mut tree, dir, &in_mount(&temp, "")).unwrap();

        let file = tree.lookup_child(dir, "a.txt").unwrap();
        assert_eq!(tree.inode(file).stat.size, 5);
        assert_eq!(tree.inode(file).stat.kind, FileKind::Regular);
        let sub = tree.lookup_child(dir, "sub").unwrap();
        assert!(tree.inode(sub).stat.is_dir());
    }

    #[test]
    fn test_dir_load_missing_dir() {
        let temp = TempDir::new().unwrap();
        let mut mount = LocalFsMount { reader: None };
        let mut tree = DirTree::new();
        let dir = tree.root();
        let err = mount
            .dir_load(&mut tree, dir, &in_mount(&temp, "absent"))
            .unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
    }

    #[test]
    fn test_linear_read_with_offset() {
        let temp = TempDir::new().unwrap();
        temp.child("data").write_str("0123456789").unwrap();

        let mut mount = LocalFsMount { reader: None };
        let total = mount.linear_start(&in_mount(&temp, "data"), 4).unwrap();
        assert_eq!(total, 6);

        let mut buf = [0u8; 16];
        let n = mount.linear_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"456789");
        assert_eq!(mount.linear_read(&mut buf).unwrap(), 0);
        mount.linear_close().unwrap();
    }

    #[test]
    fn test_store_and_append() {
        let temp = TempDir::new().unwrap();
        let local = temp.child("src");
        local.write_str("one").unwrap();

        let mut mount = LocalFsMount { reader: None };
        let dest = in_mount(&temp, "dest");
        mount.file_store(&dest, local.path(), false).unwrap();
        assert_eq!(std::fs::read_to_string(temp.child("dest").path()).unwrap(), "one");

        mount.file_store(&dest, local.path(), true).unwrap();
        assert_eq!(std::fs::read_to_string(temp.child("dest").path()).unwrap(), "oneone");
    }

    #[test]
    fn test_mkdir_rmdir_unlink() {
        let temp = TempDir::new().unwrap();
        let mut mount = LocalFsMount { reader: None };

        mount.mkdir(&in_mount(&temp, "d")).unwrap();
        assert!(mount.exists(&in_mount(&temp, "d")).unwrap());
        mount.rmdir(&in_mount(&temp, "d")).unwrap();
        assert!(!mount.exists(&in_mount(&temp, "d")).unwrap());

        temp.child("f").write_str("x").unwrap();
        mount.unlink(&in_mount(&temp, "f")).unwrap();
        assert!(!mount.exists(&in_mount(&temp, "f")).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_listed_with_target() {
        let temp = TempDir::new().unwrap();
        temp.child("real").write_str("content").unwrap();
        let mut mount = LocalFsMount { reader: None };
        mount.symlink("real", &in_mount(&temp, "alias")).unwrap();

        let mut tree = DirTree::new();
        let dir = tree.root();
        mount.dir_load(&mut tree, dir, &in_mount(&temp, "")).unwrap();
        let link = tree.lookup_child(dir, "alias").unwrap();
        assert_eq!(tree.inode(link).stat.kind, FileKind::Symlink);
        assert_eq!(tree.inode(link).link_target.as_deref(), Some("real"));
    }
}
