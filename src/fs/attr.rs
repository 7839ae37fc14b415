//! Node attributes as reported to the kernel

use crate::tree::{NodeKind, TreeNode};
use std::time::SystemTime;

/// Block size used for `blocks`
pub const BLOCK_SIZE: u64 = 512;

/// File type of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
}

impl From<&NodeKind> for FileKind {
    fn from(kind: &NodeKind) -> Self {
        match kind {
            NodeKind::Directory { .. } => FileKind::Directory,
            NodeKind::Regular { .. } => FileKind::RegularFile,
            NodeKind::Symlink { .. } => FileKind::Symlink,
            NodeKind::CharDevice { .. } | NodeKind::Whiteout => FileKind::CharDevice,
            NodeKind::BlockDevice { .. } => FileKind::BlockDevice,
            NodeKind::Fifo => FileKind::Fifo,
        }
    }
}

impl FileKind {
    pub fn to_fuser_type(&self) -> fuser::FileType {
        match self {
            FileKind::RegularFile => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::Symlink => fuser::FileType::Symlink,
            FileKind::BlockDevice => fuser::FileType::BlockDevice,
            FileKind::CharDevice => fuser::FileType::CharDevice,
            FileKind::Fifo => fuser::FileType::NamedPipe,
        }
    }

    /// `S_IF*` bits for this type
    pub fn type_bits(&self) -> u32 {
        let bits = match self {
            FileKind::RegularFile => libc::S_IFREG,
            FileKind::Directory => libc::S_IFDIR,
            FileKind::Symlink => libc::S_IFLNK,
            FileKind::BlockDevice => libc::S_IFBLK,
            FileKind::CharDevice => libc::S_IFCHR,
            FileKind::Fifo => libc::S_IFIFO,
        };
        bits as u32
    }
}

/// Attributes of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttr {
    pub ino: u64,
    pub size: u64,
    /// Size in 512-byte blocks
    pub blocks: u64,
    pub mtime: SystemTime,
    pub kind: FileKind,
    /// Permission bits including setuid/setgid/sticky
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
}

impl NodeAttr {
    pub(crate) fn from_tree(node: &TreeNode) -> Self {
        let rdev = match node.kind {
            NodeKind::CharDevice { major, minor } | NodeKind::BlockDevice { major, minor } => {
                nix::sys::stat::makedev(major as u64, minor as u64) as u32
            }
            _ => 0,
        };
        let meta = &node.meta;

        NodeAttr {
            ino: node.ino,
            size: meta.size,
            blocks: meta.size.div_ceil(BLOCK_SIZE),
            mtime: meta.mtime,
            kind: FileKind::from(&node.kind),
            perm: (meta.mode & 0o7777) as u16,
            nlink: meta.nlink,
            uid: meta.uid,
            gid: meta.gid,
            rdev,
        }
    }

    /// Full mode: type bits plus permissions
    pub fn mode(&self) -> u32 {
        self.kind.type_bits() | self.perm as u32
    }

    /// Convert to fuser FileAttr
    pub fn to_fuser_attr(&self) -> fuser::FileAttr {
        fuser::FileAttr {
            ino: self.ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.mtime,
            crtime: self.mtime,
            kind: self.kind.to_fuser_type(),
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: BLOCK_SIZE as u32,
            flags: 0,
        }
    }
}
