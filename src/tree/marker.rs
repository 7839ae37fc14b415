//! Overlay marker names

use super::{OPAQUE_MARKER, WHITEOUT_META_PREFIX, WHITEOUT_PREFIX};

/// What a directory entry name means to overlay resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker<'a> {
    /// `.wh..wh..opq`: the directory hides everything below it
    Opaque,
    /// Other `.wh..wh.*` bookkeeping entries
    Meta,
    /// `.wh.<target>`: hides `target`
    Whiteout(&'a str),
    /// `.wh.` with nothing after it
    Malformed,
}

/// Classify a basename, or `None` for an ordinary entry
pub fn classify(name: &str) -> Option<Marker<'_>> {
    if name == OPAQUE_MARKER {
        return Some(Marker::Opaque);
    }
    if name.starts_with(WHITEOUT_META_PREFIX) {
        return Some(Marker::Meta);
    }
    match name.strip_prefix(WHITEOUT_PREFIX) {
        Some("") => Some(Marker::Malformed),
        Some(target) => Some(Marker::Whiteout(target)),
        None => None,
    }
}

/// Whether `name` is any kind of marker
pub fn is_marker(name: &str) -> bool {
    name.starts_with(WHITEOUT_PREFIX)
}
