//! Effective entry tree with overlay whiteouts applied
//!
//! The raw index lists markers as ordinary files. Resolution turns them
//! into what overlayfs expects of an upper layer: `.wh.X` becomes a 0/0
//! character device named `X`, and `.wh..wh..opq` marks its directory
//! opaque through an extended attribute.

mod marker;
mod node;
mod resolve;

pub use marker::{classify, is_marker, Marker};
pub use node::{DirChildren, Ino, NodeKind, NodeMeta, TreeNode, ROOT_INO};
pub use resolve::{EffectiveTree, ResolveOptions};

/// Prefix of whiteout marker names
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Name of the opaque directory marker
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Prefix of overlay bookkeeping entries that are never exposed
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// Value of the opaque xattr
pub const OPAQUE_XATTR_VALUE: &[u8] = b"y";
