//! Open file and directory handles

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::node::DirEntry;

/// What a handle refers to
#[derive(Debug, Clone)]
pub enum HandleKind {
    File,
    /// Listing captured at `opendir`, so offsets stay stable
    Dir(Arc<Vec<DirEntry>>),
}

/// Represents an open file or directory
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub ino: u64,
    /// Open flags
    pub flags: i32,
    pub kind: HandleKind,
}

impl FileHandle {
    pub fn new(ino: u64, flags: i32, kind: HandleKind) -> Self {
        FileHandle { ino, flags, kind }
    }

    pub fn dir_entries(&self) -> Option<&Arc<Vec<DirEntry>>> {
        match &self.kind {
            HandleKind::Dir(entries) => Some(entries),
            HandleKind::File => None,
        }
    }
}

/// Whether open flags request write access
pub fn is_write_access(flags: i32) -> bool {
    let mode = flags & libc::O_ACCMODE;
    mode == libc::O_WRONLY || mode == libc::O_RDWR
}

/// Manages open handles
pub struct HandleManager {
    next_id: AtomicU64,
    handles: RwLock<HashMap<u64, FileHandle>>,
}

impl HandleManager {
    pub fn new() -> Self {
        HandleManager {
            next_id: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handle and return its ID
    pub fn open(&self, handle: FileHandle) -> u64 {
        let fh = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, handle);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<FileHandle> {
        self.handles.read().get(&fh).cloned()
    }

    pub fn close(&self, fh: u64) -> Option<FileHandle> {
        self.handles.write().remove(&fh)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.handles.read().len()
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}
