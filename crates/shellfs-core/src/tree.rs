//! Per-superblock directory cache: arena-allocated inodes, named
//! entries, symlink-safe path resolution.
//!
//! Inodes live in a `Vec` owned by their superblock and are addressed
//! by index, so entries can never dangle on partial teardown; slots of
//! detached subtrees are simply unreachable until the superblock goes
//! away. Remote listings are grafted in lazily: missing intermediate
//! directories can be synthesized during a load so a flat listing turns
//! into a tree without requiring parents to appear first.

use std::collections::HashSet;
use std::rc::Rc;
use std::time::Instant;

use tempfile::TempPath;

use crate::error::{VfsError, VfsResult};
use crate::path::canonicalize;
use crate::stat::FileStat;

/// Index of an inode within its superblock's arena. Only ever valid for
/// the tree that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(usize);

/// Named edge from a directory inode to a child inode.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub node: InodeId,
}

/// Shared handle on a local cache copy. The file is deleted when the
/// last holder (inode or open file handle) lets go.
pub type LocalCopy = Rc<TempPath>;

/// One filesystem object within a superblock.
#[derive(Debug)]
pub struct Inode {
    pub stat: FileStat,
    /// Symlink contents, for symlink inodes.
    pub link_target: Option<String>,
    /// Local cache copy, populated the first time content is read.
    pub local: Option<LocalCopy>,
    /// Child entries; `Some` exactly for directories.
    children: Option<Vec<Entry>>,
    /// Back-reference for path reconstruction. Root has none.
    parent: Option<InodeId>,
    name: Option<String>,
    /// When a cached listing stops being trusted.
    pub cache_deadline: Option<Instant>,
}

impl Inode {
    fn new(stat: FileStat) -> Self {
        let children = if stat.is_dir() { Some(Vec::new()) } else { None };
        Self {
            stat,
            link_target: None,
            local: None,
            children,
            parent: None,
            name: None,
            cache_deadline: None,
        }
    }
}

/// How a lookup should behave.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lookup {
    /// Dereference a symlink in the final component.
    pub follow: bool,
    /// Synthesize missing directories along the way (loading path).
    pub make_dirs: bool,
    /// Synthesize a missing regular file in the final component.
    pub make_file: bool,
    /// Require the result to be a directory.
    pub want_dir: bool,
}

impl Lookup {
    #[must_use]
    pub fn follow() -> Self {
        Self { follow: true, ..Self::default() }
    }

    #[must_use]
    pub fn no_follow() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn dir() -> Self {
        Self { follow: true, want_dir: true, ..Self::default() }
    }
}

/// The directory cache of one superblock.
#[derive(Debug)]
pub struct DirTree {
    inodes: Vec<Inode>,
    root: InodeId,
}

impl Default for DirTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DirTree {
    #[must_use]
    pub fn new() -> Self {
        let mut tree = Self { inodes: Vec::new(), root: InodeId(0) };
        tree.root = tree.add_inode(FileStat::directory());
        tree
    }

    #[must_use]
    pub fn root(&self) -> InodeId {
        self.root
    }

    #[must_use]
    pub fn inode(&self, id: InodeId) -> &Inode {
        &self.inodes[id.0]
    }

    pub fn inode_mut(&mut self, id: InodeId) -> &mut Inode {
        &mut self.inodes[id.0]
    }

    pub fn add_inode(&mut self, stat: FileStat) -> InodeId {
        self.inodes.push(Inode::new(stat));
        InodeId(self.inodes.len() - 1)
    }

    /// Attach `node` under `dir` as `name`. Names are unique within a
    /// parent: an existing entry of the same name is replaced and its
    /// subtree detached.
    pub fn insert_entry(&mut self, dir: InodeId, name: &str, node: InodeId) -> VfsResult<()> {
        if self.inodes[dir.0].children.is_none() {
            return Err(VfsError::NotDirectory(self.fullpath(dir)));
        }
        if let Some(old) = self.lookup_child(dir, name) {
            if old == node {
                return Ok(());
            }
            self.remove_entry(dir, name);
        }
        if self.inodes[node.0].parent.is_some() {
            // a second name for an inode already in the tree
            self.inodes[node.0].stat.nlink += 1;
        }
        self.inodes[node.0].parent = Some(dir);
        self.inodes[node.0].name = Some(name.to_string());
        self.inodes[dir.0]
            .children
            .as_mut()
            .expect("checked directory")
            .push(Entry { name: name.to_string(), node });
        Ok(())
    }

    /// Convenience: new inode plus entry in one go.
    pub fn add_child(&mut self, dir: InodeId, name: &str, stat: FileStat) -> VfsResult<InodeId> {
        let node = self.add_inode(stat);
        self.insert_entry(dir, name, node)?;
        Ok(node)
    }

    /// Detach the entry `name` from `dir`. The subtree keeps its arena
    /// slots but drops local cache copies as nothing references them.
    pub fn remove_entry(&mut self, dir: InodeId, name: &str) -> Option<InodeId> {
        let children = self.inodes[dir.0].children.as_mut()?;
        let pos = children.iter().position(|entry| entry.name == name)?;
        let node = children.remove(pos).node;
        self.inodes[node.0].parent = None;
        self.inodes[node.0].stat.nlink = self.inodes[node.0].stat.nlink.saturating_sub(1);
        self.drop_local_copies(node);
        Some(node)
    }

    fn drop_local_copies(&mut self, id: InodeId) {
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            self.inodes[cur.0].local = None;
            if let Some(children) = &self.inodes[cur.0].children {
                stack.extend(children.iter().map(|entry| entry.node));
            }
        }
    }

    #[must_use]
    pub fn lookup_child(&self, dir: InodeId, name: &str) -> Option<InodeId> {
        self.inodes[dir.0]
            .children
            .as_ref()?
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.node)
    }

    #[must_use]
    pub fn children(&self, dir: InodeId) -> &[Entry] {
        self.inodes[dir.0].children.as_deref().unwrap_or(&[])
    }

    /// Path of `id` relative to the root, without a leading separator.
    /// The root itself maps to the empty string.
    #[must_use]
    pub fn fullpath(&self, id: InodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = id;
        while let Some(name) = &self.inodes[cur.0].name {
            parts.push(name.clone());
            match self.inodes[cur.0].parent {
                Some(parent) => cur = parent,
                None => break,
            }
        }
        parts.reverse();
        parts.join("/")
    }

    /// Whether a directory's cached listing has passed its deadline.
    #[must_use]
    pub fn dir_expired(&self, id: InodeId, now: Instant) -> bool {
        match self.inodes[id.0].cache_deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Walk `path` starting at `from`, resolving `.`/`..` and symlinks.
    ///
    /// Symlink resolution carries a visited set for the active chain:
    /// re-entering a link that is still being resolved fails with the
    /// loop error instead of recursing forever.
    pub fn find(&mut self, from: InodeId, path: &str, lookup: Lookup) -> VfsResult<InodeId> {
        let mut visited = HashSet::new();
        self.find_inner(from, path, lookup, &mut visited)
    }

    fn find_inner(
        &mut self,
        from: InodeId,
        path: &str,
        lookup: Lookup,
        visited: &mut HashSet<InodeId>,
    ) -> VfsResult<InodeId> {
        let canon = canonicalize(path);
        let mut current = from;

        if canon.is_empty() {
            return self.finish_lookup(current, path, lookup, visited);
        }

        let parts: Vec<&str> = canon.split('/').collect();
        for (index, part) in parts.iter().enumerate() {
            let last = index + 1 == parts.len();

            current = self.deref_symlink(current, visited)?;
            if !self.inodes[current.0].stat.is_dir() {
                return Err(VfsError::NotDirectory(path.to_string()));
            }

            let next = if *part == ".." {
                self.inodes[current.0].parent.unwrap_or(self.root)
            } else {
                match self.lookup_child(current, part) {
                    Some(node) => node,
                    None => {
                        let make_dir = lookup.make_dirs;
                        let make_file = last && lookup.make_file;
                        if make_dir || make_file {
                            let stat = if make_file && !lookup.make_dirs {
                                FileStat::regular()
                            } else {
                                FileStat::directory()
                            };
                            self.add_child(current, part, stat)?
                        } else {
                            return Err(VfsError::NotFound(path.to_string()));
                        }
                    }
                }
            };

            if last {
                return self.finish_lookup(next, path, lookup, visited);
            }
            current = next;
        }
        unreachable!("non-empty component list always returns from the loop");
    }

    fn finish_lookup(
        &mut self,
        node: InodeId,
        path: &str,
        lookup: Lookup,
        visited: &mut HashSet<InodeId>,
    ) -> VfsResult<InodeId> {
        let node = if lookup.follow || lookup.want_dir {
            self.deref_symlink(node, visited)?
        } else {
            node
        };
        if lookup.want_dir && !self.inodes[node.0].stat.is_dir() {
            return Err(VfsError::NotDirectory(path.to_string()));
        }
        Ok(node)
    }

    /// Follow symlinks starting at `id` until a non-link inode.
    fn deref_symlink(
        &mut self,
        id: InodeId,
        visited: &mut HashSet<InodeId>,
    ) -> VfsResult<InodeId> {
        if !self.inodes[id.0].stat.is_symlink() {
            return Ok(id);
        }
        if !visited.insert(id) {
            return Err(VfsError::SymlinkLoop(self.fullpath(id)));
        }

        let result = (|| {
            let target = self.inodes[id.0]
                .link_target
                .clone()
                .ok_or_else(|| VfsError::Invalid(format!("dangling link at '{}'", self.fullpath(id))))?;
            let start = if target.starts_with('/') {
                self.root
            } else {
                self.inodes[id.0]
                    .parent
                    .ok_or_else(|| VfsError::NotFound(target.clone()))?
            };
            let next =
                self.find_inner(start, target.trim_start_matches('/'), Lookup::no_follow(), visited)?;
            self.deref_symlink(next, visited)
        })();

        // the set guards the active chain only
        visited.remove(&id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::FileKind;

    fn symlink(target: &str) -> (FileStat, Option<String>) {
        (FileStat::new(FileKind::Symlink, 0o777), Some(target.to_string()))
    }

    fn add_symlink(tree: &mut DirTree, dir: InodeId, name: &str, target: &str) -> InodeId {
        let (stat, link) = symlink(target);
        let node = tree.add_child(dir, name, stat).unwrap();
        tree.inode_mut(node).link_target = link;
        node
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut tree = DirTree::new();
        let root = tree.root();
        let dir = tree.add_child(root, "etc", FileStat::directory()).unwrap();
        let file = tree.add_child(dir, "hosts", FileStat::regular()).unwrap();

        assert_eq!(tree.lookup_child(root, "etc"), Some(dir));
        assert_eq!(tree.find(root, "etc/hosts", Lookup::follow()).unwrap(), file);
        assert_eq!(tree.fullpath(file), "etc/hosts");
        assert_eq!(tree.inode(file).stat.nlink, 1);
    }

    #[test]
    fn test_second_name_bumps_nlink() {
        let mut tree = DirTree::new();
        let root = tree.root();
        let file = tree.add_child(root, "a", FileStat::regular()).unwrap();
        tree.insert_entry(root, "b", file).unwrap();
        assert_eq!(tree.inode(file).stat.nlink, 2);

        tree.remove_entry(root, "b");
        assert_eq!(tree.inode(file).stat.nlink, 1);
    }

    #[test]
    fn test_names_unique_within_parent() {
        let mut tree = DirTree::new();
        let root = tree.root();
        tree.add_child(root, "x", FileStat::regular()).unwrap();
        let second = tree.add_child(root, "x", FileStat::directory()).unwrap();

        assert_eq!(tree.children(root).len(), 1);
        assert_eq!(tree.lookup_child(root, "x"), Some(second));
    }

    #[test]
    fn test_missing_component_is_not_found() {
        let mut tree = DirTree::new();
        let root = tree.root();
        let err = tree.find(root, "no/such/file", Lookup::follow()).unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
    }

    #[test]
    fn test_file_component_is_not_a_directory() {
        let mut tree = DirTree::new();
        let root = tree.root();
        tree.add_child(root, "f", FileStat::regular()).unwrap();
        let err = tree.find(root, "f/deeper", Lookup::follow()).unwrap_err();
        assert!(matches!(err, VfsError::NotDirectory(_)));
    }

    #[test]
    fn test_dot_and_dotdot() {
        let mut tree = DirTree::new();
        let root = tree.root();
        let a = tree.add_child(root, "a", FileStat::directory()).unwrap();
        let b = tree.add_child(a, "b", FileStat::directory()).unwrap();

        assert_eq!(tree.find(root, "a/./b", Lookup::dir()).unwrap(), b);
        assert_eq!(tree.find(root, "a/b/..", Lookup::dir()).unwrap(), a);
        // '..' at the root stays at the root
        assert_eq!(tree.find(root, "..", Lookup::dir()).unwrap(), root);
    }

    #[test]
    fn test_mkdir_synthesis_builds_intermediates() {
        let mut tree = DirTree::new();
        let root = tree.root();
        let lookup = Lookup { make_dirs: true, want_dir: true, follow: true, ..Lookup::default() };
        let deep = tree.find(root, "usr/src/linux", lookup).unwrap();

        assert!(tree.inode(deep).stat.is_dir());
        assert_eq!(tree.fullpath(deep), "usr/src/linux");
        // the intermediates exist now
        assert!(tree.find(root, "usr/src", Lookup::dir()).is_ok());
    }

    #[test]
    fn test_make_file_synthesizes_regular_final() {
        let mut tree = DirTree::new();
        let root = tree.root();
        tree.add_child(root, "d", FileStat::directory()).unwrap();
        let lookup = Lookup { make_file: true, ..Lookup::default() };
        let node = tree.find(root, "d/new.txt", lookup).unwrap();
        assert_eq!(tree.inode(node).stat.kind, FileKind::Regular);
    }

    #[test]
    fn test_symlink_resolution() {
        let mut tree = DirTree::new();
        let root = tree.root();
        let dir = tree.add_child(root, "real", FileStat::directory()).unwrap();
        let file = tree.add_child(dir, "data", FileStat::regular()).unwrap();
        add_symlink(&mut tree, root, "alias", "real");

        assert_eq!(tree.find(root, "alias/data", Lookup::follow()).unwrap(), file);
    }

    #[test]
    fn test_absolute_symlink_target() {
        let mut tree = DirTree::new();
        let root = tree.root();
        let dir = tree.add_child(root, "a", FileStat::directory()).unwrap();
        let sub = tree.add_child(dir, "b", FileStat::directory()).unwrap();
        let file = tree.add_child(sub, "f", FileStat::regular()).unwrap();
        add_symlink(&mut tree, sub, "top", "/a");

        assert_eq!(tree.find(root, "a/b/top/b/f", Lookup::follow()).unwrap(), file);
    }

    #[test]
    fn test_symlink_loop_two_links() {
        let mut tree = DirTree::new();
        let root = tree.root();
        add_symlink(&mut tree, root, "a", "b");
        add_symlink(&mut tree, root, "b", "a");

        for name in ["a", "b"] {
            let err = tree.find(root, name, Lookup::follow()).unwrap_err();
            assert!(matches!(err, VfsError::SymlinkLoop(_)), "{name}: {err}");
        }
    }

    #[test]
    fn test_symlink_to_self() {
        let mut tree = DirTree::new();
        let root = tree.root();
        add_symlink(&mut tree, root, "me", "me");
        let err = tree.find(root, "me", Lookup::follow()).unwrap_err();
        assert!(matches!(err, VfsError::SymlinkLoop(_)));
    }

    #[test]
    fn test_same_link_twice_in_one_walk_is_fine() {
        let mut tree = DirTree::new();
        let root = tree.root();
        let real = tree.add_child(root, "real", FileStat::directory()).unwrap();
        tree.add_child(real, "f", FileStat::regular()).unwrap();
        add_symlink(&mut tree, root, "l", "real");

        // resolving 'l' completes before it is needed again, so the
        // active-chain guard must not fire
        let got = tree.find(root, "l/../l/f", Lookup::follow());
        assert!(got.is_ok(), "{got:?}");
    }

    #[test]
    fn test_no_follow_returns_the_link_itself() {
        let mut tree = DirTree::new();
        let root = tree.root();
        tree.add_child(root, "real", FileStat::directory()).unwrap();
        let link = add_symlink(&mut tree, root, "l", "real");

        assert_eq!(tree.find(root, "l", Lookup::no_follow()).unwrap(), link);
    }

    #[test]
    fn test_remove_entry_detaches() {
        let mut tree = DirTree::new();
        let root = tree.root();
        tree.add_child(root, "x", FileStat::regular()).unwrap();
        assert!(tree.remove_entry(root, "x").is_some());
        assert!(tree.lookup_child(root, "x").is_none());
        assert!(tree.remove_entry(root, "x").is_none());
    }

    #[test]
    fn test_dir_expiry() {
        let mut tree = DirTree::new();
        let root = tree.root();
        let now = Instant::now();
        assert!(!tree.dir_expired(root, now));
        tree.inode_mut(root).cache_deadline = Some(now);
        assert!(tree.dir_expired(root, now));
    }
}
