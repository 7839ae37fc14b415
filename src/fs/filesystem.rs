//! FUSE adapter for a stargz layer
//!
//! Translates kernel requests into [`Node`] operations. The layer is
//! read-only: every request that would modify it gets `EROFS`.

use fuser::{
    Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use libc::{EINVAL, ENOENT, ENOTDIR, ERANGE, EROFS};
use std::ffi::OsStr;
use std::time::Duration;
use tracing::{debug, error};

use super::attr::FileKind;
use super::handle::{is_write_access, FileHandle, HandleKind, HandleManager};
use super::node::{DirEntry, Layer, Node};
use crate::config::MountConfig;
use crate::error::Error;
use std::sync::Arc;

#[cfg(target_os = "linux")]
const ENOATTR: i32 = libc::ENODATA;
#[cfg(not(target_os = "linux"))]
const ENOATTR: i32 = libc::ENOATTR;

const NAME_MAX: u32 = 255;

/// Read-only FUSE filesystem over one layer
pub struct LayerFs {
    layer: Layer,
    handles: HandleManager,
    attr_ttl: Duration,
    entry_ttl: Duration,
}

impl LayerFs {
    pub fn new(layer: Layer, config: &MountConfig) -> Self {
        LayerFs {
            layer,
            handles: HandleManager::new(),
            attr_ttl: Duration::from_secs(config.attr_timeout_secs),
            entry_ttl: Duration::from_secs(config.entry_timeout_secs),
        }
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    fn node(&self, ino: u64) -> Result<Node, i32> {
        self.layer.node(ino).ok_or(ENOENT)
    }

    /// Directory listing with `.` and `..` in front
    fn listing(&self, node: &Node) -> Result<Vec<DirEntry>, i32> {
        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                ino: node.ino(),
                kind: FileKind::Directory,
            },
            DirEntry {
                name: "..".to_string(),
                ino: node.parent().ino(),
                kind: FileKind::Directory,
            },
        ];
        entries.extend(node.open_dir().map_err(|e| e.errno())?);
        Ok(entries)
    }
}

/// Answer an xattr request, honoring the size-probe protocol
fn reply_xattr(reply: ReplyXattr, size: u32, data: &[u8]) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() > size as usize {
        reply.error(ERANGE);
    } else {
        reply.data(data);
    }
}

fn log_failure(op: &str, ino: u64, e: &Error) {
    if e.is_verification_failure() {
        error!("{}(ino={}) failed verification: {}", op, ino, e);
    } else {
        error!("{}(ino={}) failed: {}", op, ino, e);
    }
}

impl Filesystem for LayerFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };

        let parent = match self.node(parent) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        if !parent.is_dir() {
            reply.error(ENOTDIR);
            return;
        }

        match parent.lookup(name) {
            Some(node) => reply.entry(&self.entry_ttl, &node.attr().to_fuser_attr(), 0),
            None => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.node(ino) {
            Ok(node) => reply.attr(&self.attr_ttl, &node.attr().to_fuser_attr()),
            Err(e) => reply.error(e),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);

        let entries = match self.node(ino).and_then(|n| self.listing(&n)) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let fh = self
            .handles
            .open(FileHandle::new(ino, flags, HandleKind::Dir(Arc::new(entries))));
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);

        // Fall back to a fresh listing for handles we did not hand out
        let entries = match self.handles.get(fh).and_then(|h| h.dir_entries().cloned()) {
            Some(entries) => entries,
            None => match self.node(ino).and_then(|n| self.listing(&n)) {
                Ok(entries) => Arc::new(entries),
                Err(e) => {
                    reply.error(e);
                    return;
                }
            },
        };

        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let buffer_full = reply.add(
                entry.ino,
                (i + 1) as i64,
                entry.kind.to_fuser_type(),
                &entry.name,
            );
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir(ino={}, fh={})", ino, fh);
        self.handles.close(fh);
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={})", ino, flags);

        if is_write_access(flags) {
            reply.error(EROFS);
            return;
        }

        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        if let Err(e) = node.open() {
            log_failure("open", ino, &e);
            reply.error(e.errno());
            return;
        }

        let fh = self
            .handles
            .open(FileHandle::new(ino, flags, HandleKind::File));
        // Content is immutable, so the page cache stays valid across opens
        reply.opened(fh, fuser::consts::FOPEN_KEEP_CACHE);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(EINVAL);
            return;
        }

        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match node.read(offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                log_failure("read", ino, &e);
                reply.error(e.errno());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.handles.close(fh);
        reply.ok();
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        match self.node(ino).map(|n| n.read_link()) {
            Ok(Ok(target)) => reply.data(target.as_bytes()),
            Ok(Err(e)) => reply.error(e.errno()),
            Err(e) => reply.error(e),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);

        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match name.to_str().and_then(|n| node.get_xattr(n)) {
            Some(value) => reply_xattr(reply, size, &value),
            None => reply.error(ENOATTR),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);

        let node = match self.node(ino) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        // NUL-terminated names, back to back
        let mut buf = Vec::new();
        for name in node.list_xattr() {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        reply_xattr(reply, size, &buf);
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        if self.layer.node(ino).is_none() {
            reply.error(ENOENT);
        } else if mask & libc::W_OK != 0 {
            reply.error(EROFS);
        } else {
            reply.ok();
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let tree = self.layer.tree();
        let bytes: u64 = tree
            .iter()
            .filter(|n| !n.kind.is_dir())
            .map(|n| n.meta.size)
            .sum();
        let bsize = super::attr::BLOCK_SIZE;

        reply.statfs(
            bytes.div_ceil(bsize), // blocks
            0,                     // bfree
            0,                     // bavail
            tree.len() as u64,     // files
            0,                     // ffree
            bsize as u32,          // bsize
            NAME_MAX,              // namelen
            bsize as u32,          // frsize
        );
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(EROFS);
    }

    fn unlink(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(EROFS);
    }

    fn rmdir(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(EROFS);
    }

    fn create(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(EROFS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::LayerConfig;
    use crate::testing::{dir, file, LayerBuilder};

    fn layer_fs() -> LayerFs {
        let blob = LayerBuilder::new()
            .entry(dir("d/"))
            .entry(file("d/f", "x"))
            .build();
        let layer = Layer::open(
            Arc::new(blob),
            Arc::new(MemoryCache::new(1024)),
            &LayerConfig::default(),
        )
        .unwrap();
        LayerFs::new(layer, &MountConfig::default())
    }

    #[test]
    fn test_listing_has_dot_entries() {
        let fs = layer_fs();
        let d = fs.layer().lookup_path("d").unwrap();

        let names: Vec<_> = fs.listing(&d).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, [".", "..", "f"]);

        let listing = fs.listing(&d).unwrap();
        assert_eq!(listing[0].ino, d.ino());
        assert_eq!(listing[1].ino, fs.layer().root().ino());
    }

    #[test]
    fn test_listing_rejects_files() {
        let fs = layer_fs();
        let f = fs.layer().lookup_path("d/f").unwrap();
        assert_eq!(fs.listing(&f).unwrap_err(), ENOTDIR);
        assert_eq!(fs.node(999).unwrap_err(), ENOENT);
    }
}
