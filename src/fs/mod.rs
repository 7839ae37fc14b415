//! Filesystem layer
//!
//! [`Layer`] and [`Node`] carry the node operations; [`LayerFs`] adapts
//! them to the kernel through `fuser`.

mod attr;
mod filesystem;
mod handle;
mod node;

pub use attr::{FileKind, NodeAttr, BLOCK_SIZE};
pub use filesystem::LayerFs;
pub use handle::{FileHandle, HandleKind, HandleManager};
pub use node::{DirEntry, Layer, Node};
