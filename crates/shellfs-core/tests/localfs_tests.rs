//! The POSIX-shaped surface exercised against the local backend: same
//! cache, same commit-back machinery as the remote path, real files
//! underneath.

use std::io::SeekFrom;
use std::rc::Rc;

use assert_fs::TempDir;
use assert_fs::prelude::*;

use shellfs_core::host::RecordingHost;
use shellfs_core::{FileKind, OpenFlags, VfsContext, VfsError, VfsSettings};

fn context() -> VfsContext {
    VfsContext::new(Rc::new(RecordingHost::new()), VfsSettings::default())
}

/// Settings with the directory cache disabled, so every call observes
/// the filesystem as it is now.
fn uncached() -> VfsSettings {
    VfsSettings { dir_cache_timeout_secs: 0, ..VfsSettings::default() }
}

fn uncached_context() -> VfsContext {
    VfsContext::new(Rc::new(RecordingHost::new()), uncached())
}

fn path_of(temp: &TempDir, rest: &str) -> String {
    format!("{}/{rest}", temp.path().display())
}

#[test]
fn test_stat_and_read_dir() {
    let temp = TempDir::new().unwrap();
    temp.child("notes.txt").write_str("four").unwrap();
    temp.child("docs").create_dir_all().unwrap();

    let mut vfs = context();
    let stat = vfs.stat(&path_of(&temp, "notes.txt")).unwrap();
    assert_eq!(stat.kind, FileKind::Regular);
    assert_eq!(stat.size, 4);

    let mut names: Vec<String> = vfs
        .read_dir(&path_of(&temp, ""))
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["docs", "notes.txt"]);
}

#[test]
fn test_missing_path_is_not_found() {
    let temp = TempDir::new().unwrap();
    let mut vfs = context();
    let err = vfs.stat(&path_of(&temp, "nothing")).unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)), "{err}");
}

#[test]
fn test_write_commits_on_close() {
    let temp = TempDir::new().unwrap();
    let mut vfs = uncached_context();
    let target = path_of(&temp, "out.txt");

    let file = vfs.open(&target, OpenFlags::write_only()).unwrap();
    vfs.write(file, b"committed").unwrap();
    vfs.close(file).unwrap();

    // the write went through a local working copy; the close committed
    // it to the real destination
    assert_eq!(std::fs::read_to_string(temp.child("out.txt").path()).unwrap(), "committed");
}

#[test]
fn test_read_back_through_the_cache() {
    let temp = TempDir::new().unwrap();
    temp.child("data.bin").write_str("abcdefgh").unwrap();
    let mut vfs = context();

    let file = vfs.open(&path_of(&temp, "data.bin"), OpenFlags::read_only()).unwrap();
    let mut buf = [0u8; 3];
    assert_eq!(vfs.read(file, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"abc");

    assert_eq!(vfs.lseek(file, SeekFrom::Start(6)).unwrap(), 6);
    assert_eq!(vfs.read(file, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"gh");
    vfs.close(file).unwrap();
}

#[test]
fn test_append_flag() {
    let temp = TempDir::new().unwrap();
    temp.child("log").write_str("one,").unwrap();
    let mut vfs = uncached_context();

    let file = vfs.open(&path_of(&temp, "log"), OpenFlags::append()).unwrap();
    vfs.write(file, b"two").unwrap();
    vfs.close(file).unwrap();

    assert_eq!(std::fs::read_to_string(temp.child("log").path()).unwrap(), "one,two");
}

#[test]
fn test_mkdir_rename_rmdir() {
    let temp = TempDir::new().unwrap();
    let mut vfs = uncached_context();

    vfs.mkdir(&path_of(&temp, "fresh")).unwrap();
    assert!(temp.child("fresh").path().is_dir());

    vfs.rename(&path_of(&temp, "fresh"), &path_of(&temp, "renamed")).unwrap();
    assert!(!temp.child("fresh").path().exists());
    assert!(temp.child("renamed").path().is_dir());

    vfs.rmdir(&path_of(&temp, "renamed")).unwrap();
    assert!(!temp.child("renamed").path().exists());
}

#[test]
fn test_unlink() {
    let temp = TempDir::new().unwrap();
    temp.child("gone.txt").write_str("x").unwrap();
    let mut vfs = uncached_context();

    vfs.unlink(&path_of(&temp, "gone.txt")).unwrap();
    assert!(!temp.child("gone.txt").path().exists());
}

#[cfg(unix)]
#[test]
fn test_readlink_and_follow() {
    let temp = TempDir::new().unwrap();
    temp.child("real.txt").write_str("content").unwrap();
    std::os::unix::fs::symlink("real.txt", temp.path().join("alias")).unwrap();

    let mut vfs = context();
    assert_eq!(vfs.readlink(&path_of(&temp, "alias")).unwrap(), "real.txt");

    // stat follows, lstat does not
    assert_eq!(vfs.stat(&path_of(&temp, "alias")).unwrap().kind, FileKind::Regular);
    assert_eq!(vfs.lstat(&path_of(&temp, "alias")).unwrap().kind, FileKind::Symlink);

    let err = vfs.readlink(&path_of(&temp, "real.txt")).unwrap_err();
    assert!(matches!(err, VfsError::Invalid(_)));
}

#[cfg(unix)]
#[test]
fn test_symlink_cycle_is_eloop() {
    let temp = TempDir::new().unwrap();
    std::os::unix::fs::symlink("b", temp.path().join("a")).unwrap();
    std::os::unix::fs::symlink("a", temp.path().join("b")).unwrap();

    let mut vfs = context();
    for name in ["a", "b"] {
        let err = vfs.stat(&path_of(&temp, name)).unwrap_err();
        assert!(matches!(err, VfsError::SymlinkLoop(_)), "{name}: {err}");
    }
}

#[test]
fn test_getlocalcopy_materializes_content() {
    let temp = TempDir::new().unwrap();
    temp.child("orig.txt").write_str("payload").unwrap();
    let mut vfs = context();

    let copy = vfs.getlocalcopy(&path_of(&temp, "orig.txt")).unwrap();
    assert_ne!(copy, temp.child("orig.txt").path());
    assert_eq!(std::fs::read_to_string(&copy).unwrap(), "payload");
}

#[test]
fn test_open_exclusive_on_existing_file() {
    let temp = TempDir::new().unwrap();
    temp.child("taken").write_str("x").unwrap();
    let mut vfs = context();

    let flags = OpenFlags { exclusive: true, ..OpenFlags::write_only() };
    let err = vfs.open(&path_of(&temp, "taken"), flags).unwrap_err();
    assert!(matches!(err, VfsError::AlreadyExists(_)), "{err}");
}

#[test]
fn test_open_directory_fails() {
    let temp = TempDir::new().unwrap();
    temp.child("d").create_dir_all().unwrap();
    let mut vfs = context();

    let err = vfs.open(&path_of(&temp, "d"), OpenFlags::read_only()).unwrap_err();
    assert!(matches!(err, VfsError::IsDirectory(_)), "{err}");
}

#[test]
fn test_local_mount_is_shared_and_never_collected() {
    let temp = TempDir::new().unwrap();
    temp.child("x").write_str("1").unwrap();
    let settings = VfsSettings { gc_timeout_secs: 0, ..VfsSettings::default() };
    let mut vfs = VfsContext::new(Rc::new(RecordingHost::new()), settings);

    vfs.stat(&path_of(&temp, "x")).unwrap();
    assert_eq!(vfs.active_mounts(), 1);
    vfs.on_idle();
    assert_eq!(vfs.active_mounts(), 1, "the local mount is exempt from eviction");
}

#[test]
fn test_fstat_tracks_written_size() {
    let temp = TempDir::new().unwrap();
    let mut vfs = uncached_context();

    let file = vfs.open(&path_of(&temp, "grow.txt"), OpenFlags::write_only()).unwrap();
    vfs.write(file, b"12345").unwrap();
    let stat = vfs.fstat(file).unwrap();
    assert_eq!(stat.size, 5);
    vfs.close(file).unwrap();
}
