//! Second build phase: apply overlay markers to the raw index

use crate::crypto::Digest;
use crate::error::{Error, Result};
use crate::stargz::{clean_name, EntryType, StargzReader, TocEntry};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, warn};

use super::marker::{classify, is_marker, Marker};
use super::node::{DirChildren, Ino, NodeKind, NodeMeta, TreeNode, ROOT_INO};
use super::OPAQUE_XATTR_VALUE;

/// Knobs for resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Xattr set on opaque directories
    pub opaque_xattr: String,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            opaque_xattr: crate::config::OpaqueXattr::default().name().to_string(),
        }
    }
}

/// Placeholder inode for hardlinks awaiting their target
const UNRESOLVED: Ino = 0;

struct PendingLink {
    dir: Ino,
    name: String,
    target: String,
}

/// The layer as a container runtime sees it
///
/// Immutable once built. Nodes live in an arena indexed by inode; parents
/// are stored as inode numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveTree {
    nodes: Vec<TreeNode>,
}

impl EffectiveTree {
    /// Build the effective tree from a raw index
    pub fn resolve(reader: &StargzReader, options: &ResolveOptions) -> Result<Self> {
        let root_entry = reader
            .lookup("")
            .ok_or_else(|| Error::MalformedIndex("index has no root".to_string()))?;

        let mut tree = EffectiveTree {
            nodes: Vec::with_capacity(reader.len()),
        };
        tree.nodes.push(TreeNode {
            ino: ROOT_INO,
            parent: ROOT_INO,
            name: String::new(),
            path: String::new(),
            kind: NodeKind::Directory { opaque: false },
            meta: meta_of(root_entry),
            children: DirChildren::default(),
        });

        let mut pending = Vec::new();
        let mut queue = VecDeque::from([ROOT_INO]);
        while let Some(dir) = queue.pop_front() {
            tree.resolve_dir(reader, options, dir, &mut queue, &mut pending);
        }

        tree.link_hardlinks(pending);
        tree.count_dir_links();

        debug!("Resolved {} nodes", tree.nodes.len());
        Ok(tree)
    }

    fn resolve_dir(
        &mut self,
        reader: &StargzReader,
        options: &ResolveOptions,
        dir: Ino,
        queue: &mut VecDeque<Ino>,
        pending: &mut Vec<PendingLink>,
    ) {
        let dir_path = self.nodes[idx(dir)].path.clone();
        let names = reader.children(&dir_path).unwrap_or(&[]);

        let real: HashSet<&str> = names
            .iter()
            .map(|n| n.as_str())
            .filter(|n| !is_marker(n))
            .collect();

        let mut opaque = false;
        let mut whiteouts: Vec<(&str, &TocEntry)> = Vec::new();

        for name in names {
            let path = join(&dir_path, name);
            let Some(entry) = reader.lookup(&path) else {
                continue;
            };

            match classify(name) {
                Some(Marker::Opaque) => opaque = true,
                Some(Marker::Meta) => debug!("Dropping overlay metadata entry {}", path),
                Some(Marker::Malformed) => warn!("Dropping malformed whiteout {}", path),
                Some(Marker::Whiteout(target)) => whiteouts.push((target, entry)),
                None if entry.entry_type == EntryType::Hardlink => {
                    self.nodes[idx(dir)].children.push(name.clone(), UNRESOLVED);
                    pending.push(PendingLink {
                        dir,
                        name: name.clone(),
                        target: entry.link_name.clone(),
                    });
                }
                None => {
                    let Some(kind) = kind_of(entry, &path) else {
                        continue;
                    };
                    let is_dir = kind.is_dir();
                    let ino = self.push_node(dir, name, path, kind, meta_of(entry));
                    if is_dir {
                        queue.push_back(ino);
                    }
                }
            }
        }

        for (target, marker) in whiteouts {
            if real.contains(target) {
                debug!(
                    "Whiteout for {:?} in {:?} shadowed by a real entry",
                    target, dir_path
                );
                continue;
            }
            if self.nodes[idx(dir)].children.contains(target) {
                continue;
            }
            let meta = NodeMeta {
                size: 0,
                mode: 0,
                uid: marker.uid,
                gid: marker.gid,
                mtime: marker.mod_time(),
                nlink: 1,
                xattrs: BTreeMap::new(),
            };
            let path = join(&dir_path, target);
            self.push_node(dir, target, path, NodeKind::Whiteout, meta);
        }

        if opaque {
            let node = &mut self.nodes[idx(dir)];
            node.kind = NodeKind::Directory { opaque: true };
            node.meta
                .xattrs
                .insert(options.opaque_xattr.clone(), OPAQUE_XATTR_VALUE.to_vec());
        }
    }

    fn push_node(
        &mut self,
        dir: Ino,
        name: &str,
        path: String,
        kind: NodeKind,
        meta: NodeMeta,
    ) -> Ino {
        let ino = self.nodes.len() as Ino + 1;
        self.nodes.push(TreeNode {
            ino,
            parent: dir,
            name: name.to_string(),
            path,
            kind,
            meta,
            children: DirChildren::default(),
        });
        self.nodes[idx(dir)].children.push(name.to_string(), ino);
        ino
    }

    /// Point hardlinks at their targets; chains resolve over several passes
    fn link_hardlinks(&mut self, mut pending: Vec<PendingLink>) {
        loop {
            let before = pending.len();
            pending.retain(|link| match self.lookup_path(&link.target) {
                Some(target) if !target.kind.is_dir() => {
                    let ino = target.ino;
                    self.nodes[idx(link.dir)].children.push(link.name.clone(), ino);
                    false
                }
                _ => true,
            });
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }

        for link in pending {
            warn!(
                "Skipping hardlink {:?} in {:?}: target {:?} not found",
                link.name, self.nodes[idx(link.dir)].path, link.target
            );
            self.nodes[idx(link.dir)].children.remove(&link.name);
        }
    }

    fn count_dir_links(&mut self) {
        let counts: Vec<u32> = self
            .nodes
            .iter()
            .map(|n| {
                n.children
                    .iter()
                    .filter(|(_, ino)| {
                        self.get(*ino)
                            .map(|c| c.kind.is_dir() && c.parent == n.ino)
                            .unwrap_or(false)
                    })
                    .count() as u32
            })
            .collect();

        for (node, subdirs) in self.nodes.iter_mut().zip(counts) {
            if node.kind.is_dir() {
                node.meta.nlink = 2 + subdirs;
            }
        }
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn get(&self, ino: Ino) -> Option<&TreeNode> {
        if ino == UNRESOLVED {
            return None;
        }
        self.nodes.get(idx(ino))
    }

    /// Node by inode; `ino` must have come from this tree
    pub(crate) fn node(&self, ino: Ino) -> &TreeNode {
        &self.nodes[idx(ino)]
    }

    /// Look up a child by name; marker names never resolve
    pub fn lookup_child(&self, dir: Ino, name: &str) -> Option<&TreeNode> {
        if is_marker(name) {
            return None;
        }
        let ino = self.get(dir)?.children.get(name)?;
        self.get(ino)
    }

    /// Walk a path from the root
    pub fn lookup_path(&self, path: &str) -> Option<&TreeNode> {
        let path = clean_name(path);
        let mut node = self.root();
        if path.is_empty() {
            return Some(node);
        }
        for part in path.split('/') {
            node = self.lookup_child(node.ino, part)?;
        }
        Some(node)
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in inode order
    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.iter()
    }
}

fn idx(ino: Ino) -> usize {
    (ino - 1) as usize
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn meta_of(entry: &TocEntry) -> NodeMeta {
    let size = match entry.entry_type {
        EntryType::Reg => entry.size,
        EntryType::Symlink => entry.link_name.len() as u64,
        _ => 0,
    };
    NodeMeta {
        size,
        mode: entry.mode & 0o7777,
        uid: entry.uid,
        gid: entry.gid,
        mtime: entry.mod_time(),
        nlink: entry.num_link.max(1),
        xattrs: entry.xattrs.clone(),
    }
}

fn kind_of(entry: &TocEntry, path: &str) -> Option<NodeKind> {
    let kind = match entry.entry_type {
        EntryType::Dir => NodeKind::Directory { opaque: false },
        EntryType::Reg => {
            let digest = if entry.digest.is_empty() {
                None
            } else {
                match entry.digest.parse::<Digest>() {
                    Ok(d) => Some(d),
                    Err(e) => {
                        warn!("Ignoring bad digest on {}: {}", path, e);
                        None
                    }
                }
            };
            NodeKind::Regular {
                source: path.to_string(),
                digest,
            }
        }
        EntryType::Symlink => NodeKind::Symlink {
            target: entry.link_name.clone(),
        },
        EntryType::Char => NodeKind::CharDevice {
            major: entry.dev_major,
            minor: entry.dev_minor,
        },
        EntryType::Block => NodeKind::BlockDevice {
            major: entry.dev_major,
            minor: entry.dev_minor,
        },
        EntryType::Fifo => NodeKind::Fifo,
        EntryType::Hardlink | EntryType::Chunk => return None,
    };
    Some(kind)
}
