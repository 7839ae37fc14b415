//! Resolved tree nodes

use crate::crypto::Digest;
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

/// Inode number
pub type Ino = u64;

/// Inode of the layer root
pub const ROOT_INO: Ino = 1;

/// Node kind after overlay resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Directory {
        /// Set by an opaque marker
        opaque: bool,
    },
    Regular {
        /// Index path the content is read from
        source: String,
        digest: Option<Digest>,
    },
    Symlink {
        target: String,
    },
    CharDevice {
        major: u32,
        minor: u32,
    },
    BlockDevice {
        major: u32,
        minor: u32,
    },
    Fifo,
    /// Hides the same name in lower layers
    Whiteout,
}

impl NodeKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Directory { .. })
    }
}

/// Metadata passed through from the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMeta {
    pub size: u64,
    /// Permission bits (including setuid/setgid/sticky), no type bits
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: SystemTime,
    pub nlink: u32,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

/// Children of a directory in listing order, with a name index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirChildren {
    entries: Vec<(String, Ino)>,
    index: HashMap<String, usize>,
}

impl DirChildren {
    /// Add a child; a repeated name replaces the earlier inode in place
    pub fn push(&mut self, name: String, ino: Ino) {
        if let Some(&i) = self.index.get(&name) {
            self.entries[i].1 = ino;
            return;
        }
        self.index.insert(name.clone(), self.entries.len());
        self.entries.push((name, ino));
    }

    /// Remove a child, keeping the order of the rest
    pub fn remove(&mut self, name: &str) -> Option<Ino> {
        let i = self.index.remove(name)?;
        let (_, ino) = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(ino)
    }

    pub fn get(&self, name: &str) -> Option<Ino> {
        self.index.get(name).map(|&i| self.entries[i].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Ino)> {
        self.entries.iter().map(|(n, i)| (n.as_str(), *i))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One node of the effective tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub ino: Ino,
    /// Parent inode; the root is its own parent
    pub parent: Ino,
    /// Basename ("" for the root)
    pub name: String,
    /// Cleaned path within the layer
    pub path: String,
    pub kind: NodeKind,
    pub meta: NodeMeta,
    pub children: DirChildren,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_children_order_and_replace() {
        let mut c = DirChildren::default();
        c.push("b".into(), 2);
        c.push("a".into(), 3);
        c.push("b".into(), 4);

        let listed: Vec<_> = c.iter().collect();
        assert_eq!(listed, vec![("b", 4), ("a", 3)]);
        assert_eq!(c.get("a"), Some(3));
        assert!(!c.contains("z"));
        assert_eq!(c.len(), 2);

        assert_eq!(c.remove("b"), Some(4));
        assert_eq!(c.get("a"), Some(3));
        assert_eq!(c.iter().collect::<Vec<_>>(), vec![("a", 3)]);
    }
}
