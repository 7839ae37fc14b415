//! Filesystem nodes over a resolved layer
//!
//! A [`Layer`] owns everything built at mount time: the raw index, the
//! effective tree and the chunk fetcher. [`Node`] is a cheap handle into
//! it; the operations here are what the FUSE adapter calls.

use crate::cache::{BlobCache, ChunkFetcher, FetchStats};
use crate::config::LayerConfig;
use crate::crypto::Digest;
use crate::error::{Error, Result};
use crate::remote::BlobSource;
use crate::stargz::{ChunkRef, StargzReader};
use crate::tree::{EffectiveTree, Ino, NodeKind, ResolveOptions, TreeNode, ROOT_INO};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

use super::attr::{FileKind, NodeAttr};

/// One directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: Ino,
    pub kind: FileKind,
}

struct LayerInner {
    reader: StargzReader,
    tree: EffectiveTree,
    fetcher: ChunkFetcher,
}

/// A mounted stargz layer
#[derive(Clone)]
pub struct Layer {
    inner: Arc<LayerInner>,
}

impl Layer {
    /// Open a layer, caching verified content in `cache`
    pub fn open(
        source: Arc<dyn BlobSource>,
        cache: Arc<dyn BlobCache>,
        config: &LayerConfig,
    ) -> Result<Self> {
        Self::with_fetcher(source, ChunkFetcher::new(cache), config)
    }

    /// Open a layer with a preconfigured fetcher
    pub fn with_fetcher(
        source: Arc<dyn BlobSource>,
        fetcher: ChunkFetcher,
        config: &LayerConfig,
    ) -> Result<Self> {
        let reader = StargzReader::open(source)?;
        let options = ResolveOptions {
            opaque_xattr: config.opaque_xattr.name().to_string(),
        };
        let tree = EffectiveTree::resolve(&reader, &options)?;
        info!("Layer ready: {} nodes", tree.len());

        Ok(Layer {
            inner: Arc::new(LayerInner {
                reader,
                tree,
                fetcher,
            }),
        })
    }

    pub fn root(&self) -> Node {
        self.make_node(ROOT_INO)
    }

    /// Node by inode number
    pub fn node(&self, ino: Ino) -> Option<Node> {
        self.inner.tree.get(ino).map(|n| self.make_node(n.ino))
    }

    /// Node at `path`, relative to the layer root
    pub fn lookup_path(&self, path: &str) -> Option<Node> {
        self.inner.tree.lookup_path(path).map(|n| self.make_node(n.ino))
    }

    pub fn tree(&self) -> &EffectiveTree {
        &self.inner.tree
    }

    pub fn reader(&self) -> &StargzReader {
        &self.inner.reader
    }

    pub fn fetch_stats(&self) -> FetchStats {
        self.inner.fetcher.stats()
    }

    fn make_node(&self, ino: Ino) -> Node {
        Node {
            layer: self.inner.clone(),
            ino,
        }
    }
}

/// Handle to one node of a layer
#[derive(Clone)]
pub struct Node {
    layer: Arc<LayerInner>,
    ino: Ino,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("ino", &self.ino)
            .field("path", &self.tree_node().path)
            .finish()
    }
}

impl Node {
    fn tree_node(&self) -> &TreeNode {
        self.layer.tree.node(self.ino)
    }

    fn at(&self, ino: Ino) -> Node {
        Node {
            layer: self.layer.clone(),
            ino,
        }
    }

    pub fn ino(&self) -> Ino {
        self.ino
    }

    pub fn name(&self) -> &str {
        &self.tree_node().name
    }

    pub fn path(&self) -> &str {
        &self.tree_node().path
    }

    pub fn kind(&self) -> &NodeKind {
        &self.tree_node().kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind().is_dir()
    }

    pub fn is_whiteout(&self) -> bool {
        matches!(self.kind(), NodeKind::Whiteout)
    }

    /// Parent node; the root is its own parent
    pub fn parent(&self) -> Node {
        self.at(self.tree_node().parent)
    }

    pub fn attr(&self) -> NodeAttr {
        NodeAttr::from_tree(self.tree_node())
    }

    /// List a directory's effective children
    pub fn open_dir(&self) -> Result<Vec<DirEntry>> {
        let node = self.tree_node();
        if !node.kind.is_dir() {
            return Err(Error::NotADirectory(node.path.clone()));
        }

        Ok(node
            .children
            .iter()
            .filter_map(|(name, ino)| {
                let child = self.layer.tree.get(ino)?;
                Some(DirEntry {
                    name: name.to_string(),
                    ino,
                    kind: FileKind::from(&child.kind),
                })
            })
            .collect())
    }

    /// Look up a child by name
    pub fn lookup(&self, name: &str) -> Option<Node> {
        self.layer
            .tree
            .lookup_child(self.ino, name)
            .map(|child| self.at(child.ino))
    }

    pub fn list_xattr(&self) -> Vec<String> {
        self.tree_node().meta.xattrs.keys().cloned().collect()
    }

    pub fn get_xattr(&self, name: &str) -> Option<Vec<u8>> {
        self.tree_node().meta.xattrs.get(name).cloned()
    }

    /// Digest of a regular file's content
    pub fn digest(&self) -> Option<&Digest> {
        match self.kind() {
            NodeKind::Regular { digest, .. } => digest.as_ref(),
            _ => None,
        }
    }

    pub fn read_link(&self) -> Result<String> {
        match self.kind() {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(Error::NotASymlink(self.path().to_string())),
        }
    }

    /// Check that the file can be opened for (verified) reading
    pub fn open(&self) -> Result<()> {
        let node = self.tree_node();
        let NodeKind::Regular { source, digest } = &node.kind else {
            return Err(Error::NotAFile(node.path.clone()));
        };

        if node.meta.size > 0 && digest.is_none() && !self.chunk_digests_complete(source) {
            return Err(Error::MissingDigest(node.path.clone()));
        }
        Ok(())
    }

    fn chunk_digests_complete(&self, source: &str) -> bool {
        self.layer
            .reader
            .chunks(source)
            .iter()
            .all(|c| c.digest.is_some())
    }

    /// Read up to `len` bytes at `offset`, verifying everything fetched
    pub fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let node = self.tree_node();
        let NodeKind::Regular { source, digest } = &node.kind else {
            return Err(Error::NotAFile(node.path.clone()));
        };

        let size = node.meta.size;
        if offset >= size || len == 0 {
            return Ok(Bytes::new());
        }
        let end = size.min(offset.saturating_add(len as u64));
        debug!("read {} [{}, {})", node.path, offset, end);

        let chunks = self.layer.reader.chunks(source);
        if chunks.iter().all(|c| c.digest.is_some()) {
            return self.read_chunks(chunks, offset, end);
        }

        // Some chunk cannot be verified alone: the whole file is the unit
        let digest = digest
            .as_ref()
            .ok_or_else(|| Error::MissingDigest(node.path.clone()))?;
        let reader = &self.layer.reader;
        let whole = self.layer.fetcher.get_or_fetch(digest, || {
            let mut buf = Vec::with_capacity(size as usize);
            for chunk in chunks {
                buf.extend_from_slice(&reader.read_chunk(chunk)?);
            }
            Ok(Bytes::from(buf))
        })?;

        Ok(whole.slice(offset as usize..end as usize))
    }

    fn read_chunks(&self, chunks: &[ChunkRef], offset: u64, end: u64) -> Result<Bytes> {
        let first = chunks.partition_point(|c| c.end() <= offset);
        let mut parts = Vec::new();

        for chunk in &chunks[first..] {
            if chunk.chunk_offset >= end {
                break;
            }
            let Some(digest) = &chunk.digest else {
                return Err(Error::Internal("chunk digest vanished".to_string()));
            };
            let data = self
                .layer
                .fetcher
                .get_or_fetch(digest, || self.layer.reader.read_chunk(chunk))?;

            let from = (offset.max(chunk.chunk_offset) - chunk.chunk_offset) as usize;
            let to = (end.min(chunk.end()) - chunk.chunk_offset) as usize;
            parts.push(data.slice(from..to));
        }

        if parts.len() == 1 {
            return Ok(parts.remove(0));
        }
        Ok(Bytes::from(parts.concat()))
    }
}
