//! Seekable tar.gz ("stargz") index reader
//!
//! A stargz blob is a gzipped tar where every file's data starts a new
//! gzip member, followed by a TOC member and a footer. The TOC lets any
//! file (or chunk of a large file) be fetched and decompressed alone.

mod footer;
mod reader;
mod toc;

pub use footer::{parse_footer, Footer, FOOTER_SIZE, SUBFIELD_FOOTER_SIZE};
pub use reader::{ChunkRef, StargzReader};
pub use toc::{clean_name, split_parent, EntryType, Toc, TocEntry, TOC_VERSION};

/// Name of the TOC file inside the TOC tar member
pub const TOC_TAR_NAME: &str = "stargz.index.json";
