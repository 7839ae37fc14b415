//! Random-access index over a stargz blob
//!
//! Opening a reader fetches the footer and the TOC only. The raw index it
//! builds is the first phase of tree construction: entries keyed by
//! cleaned path, children in encounter order, and the chunk layout of every
//! regular file. Whiteout interpretation happens later, in `tree`.

use crate::crypto::Digest;
use crate::error::{Error, Result};
use crate::remote::BlobSource;
use bytes::Bytes;
use flate2::read::{GzDecoder, MultiGzDecoder};
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};

use super::footer::{parse_footer, SUBFIELD_FOOTER_SIZE};
use super::toc::{clean_name, split_parent, EntryType, Toc, TocEntry, TOC_VERSION};
use super::TOC_TAR_NAME;

/// Location of one chunk of a regular file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    /// Offset of the chunk within the uncompressed file
    pub chunk_offset: u64,
    /// Uncompressed chunk length
    pub chunk_size: u64,
    /// Start of the chunk's gzip member in the blob
    pub blob_offset: u64,
    /// Start of the next data member (or the TOC)
    pub blob_end: u64,
    /// Digest of the uncompressed chunk, when the TOC records one
    pub digest: Option<Digest>,
}

impl ChunkRef {
    /// End of the chunk within the uncompressed file
    pub fn end(&self) -> u64 {
        self.chunk_offset + self.chunk_size
    }
}

/// Parsed stargz index plus access to the blob behind it
pub struct StargzReader {
    source: Arc<dyn BlobSource>,
    toc_offset: u64,
    entries: HashMap<String, TocEntry>,
    children: HashMap<String, Vec<String>>,
    chunks: HashMap<String, Vec<ChunkRef>>,
}

impl StargzReader {
    /// Read the footer and TOC of `source` and build the raw index
    pub fn open(source: Arc<dyn BlobSource>) -> Result<Self> {
        let size = source.size();
        let tail_len = size.min(SUBFIELD_FOOTER_SIZE as u64);
        let tail = source.read_at(size - tail_len, tail_len as usize)?;
        let footer = parse_footer(&tail)?;

        let toc_end = size - footer.size as u64;
        if footer.toc_offset >= toc_end {
            return Err(Error::InvalidFooter(format!(
                "TOC offset {} outside blob of {} bytes",
                footer.toc_offset, size
            )));
        }

        let toc_bytes = source.read_at(footer.toc_offset, (toc_end - footer.toc_offset) as usize)?;
        let toc = decode_toc(&toc_bytes)?;

        if toc.version != TOC_VERSION {
            return Err(Error::UnsupportedVersion(toc.version));
        }

        let mut reader = StargzReader {
            source,
            toc_offset: footer.toc_offset,
            entries: HashMap::new(),
            children: HashMap::new(),
            chunks: HashMap::new(),
        };
        reader.ingest(toc.entries)?;

        info!(
            "Opened stargz index: {} entries, TOC at {}",
            reader.entries.len(),
            reader.toc_offset
        );
        Ok(reader)
    }

    fn ingest(&mut self, raw: Vec<TocEntry>) -> Result<()> {
        self.entries.insert(String::new(), implicit_dir(""));
        self.children.insert(String::new(), Vec::new());

        let mut last_reg: Option<String> = None;
        let mut hardlinks: Vec<String> = Vec::new();

        for mut entry in raw {
            let name = clean_name(&entry.name);
            entry.name = name.clone();

            if entry.entry_type == EntryType::Chunk {
                if last_reg.as_deref() != Some(name.as_str()) {
                    return Err(Error::MalformedIndex(format!(
                        "chunk entry {:?} does not follow its file",
                        name
                    )));
                }
                let chunk = chunk_of(&entry, self.size_of(&name))?;
                self.chunks.entry(name).or_default().push(chunk);
                continue;
            }

            if name.is_empty() {
                // Explicit root entry: keep its metadata, root stays a directory
                if entry.entry_type != EntryType::Dir {
                    return Err(Error::MalformedIndex("root is not a directory".to_string()));
                }
                self.entries.insert(name, entry);
                continue;
            }

            last_reg = None;
            if entry.entry_type != EntryType::Reg {
                self.chunks.remove(&name);
            }
            match entry.entry_type {
                EntryType::Reg => {
                    if entry.size > 0 {
                        let chunk = chunk_of(&entry, entry.size)?;
                        self.chunks.insert(name.clone(), vec![chunk]);
                    } else {
                        self.chunks.remove(&name);
                    }
                    last_reg = Some(name.clone());
                }
                EntryType::Hardlink => {
                    entry.link_name = clean_name(&entry.link_name);
                    hardlinks.push(entry.link_name.clone());
                }
                EntryType::Dir => {
                    self.children.entry(name.clone()).or_default();
                }
                _ => {}
            }

            self.add_child(&name);
            self.entries.insert(name, entry);
        }

        for target in hardlinks {
            if let Some(e) = self.entries.get_mut(&target) {
                e.num_link = e.num_link.max(1) + 1;
            }
        }

        self.finish_chunks()
    }

    fn size_of(&self, name: &str) -> u64 {
        self.entries.get(name).map(|e| e.size).unwrap_or(0)
    }

    /// Register `path` under its parent, synthesizing missing directories
    fn add_child(&mut self, path: &str) {
        let (parent, base) = split_parent(path);
        if !self.entries.contains_key(parent) {
            debug!("Synthesizing implicit directory {:?}", parent);
            self.entries.insert(parent.to_string(), implicit_dir(parent));
            self.children.entry(parent.to_string()).or_default();
            self.add_child(parent);
        }

        let siblings = self.children.entry(parent.to_string()).or_default();
        if !siblings.iter().any(|s| s == base) {
            siblings.push(base.to_string());
        }
    }

    /// Fill in blob ranges and validate chunk layout
    fn finish_chunks(&mut self) -> Result<()> {
        let offsets: BTreeSet<u64> = self
            .chunks
            .values()
            .flatten()
            .map(|c| c.blob_offset)
            .collect();

        for (name, chunks) in self.chunks.iter_mut() {
            let size = self.entries.get(name).map(|e| e.size).unwrap_or(0);
            let mut expected = 0u64;

            for chunk in chunks.iter_mut() {
                if chunk.blob_offset >= self.toc_offset {
                    return Err(Error::MalformedIndex(format!(
                        "{}: data offset {} past TOC",
                        name, chunk.blob_offset
                    )));
                }
                if chunk.chunk_offset != expected || chunk.end() > size {
                    return Err(Error::MalformedIndex(format!(
                        "{}: chunk at {} (+{}) breaks layout of {} byte file",
                        name, chunk.chunk_offset, chunk.chunk_size, size
                    )));
                }
                expected = chunk.end();

                chunk.blob_end = offsets
                    .range(chunk.blob_offset + 1..)
                    .next()
                    .copied()
                    .unwrap_or(self.toc_offset);
            }

            if expected != size {
                return Err(Error::MalformedIndex(format!(
                    "{}: chunks cover {} of {} bytes",
                    name, expected, size
                )));
            }
        }
        Ok(())
    }

    /// Look up an entry by path
    pub fn lookup(&self, path: &str) -> Option<&TocEntry> {
        self.entries.get(&clean_name(path))
    }

    /// Child basenames of a directory, in index order
    pub fn children(&self, dir: &str) -> Option<&[String]> {
        self.children.get(&clean_name(dir)).map(|c| c.as_slice())
    }

    /// Chunk layout of a regular file (empty for empty files)
    pub fn chunks(&self, path: &str) -> &[ChunkRef] {
        self.chunks
            .get(&clean_name(path))
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    /// Find the chunk holding byte `offset` of a file
    pub fn chunk_for_offset(&self, path: &str, offset: u64) -> Option<&ChunkRef> {
        let chunks = self.chunks(path);
        let idx = chunks.partition_point(|c| c.end() <= offset);
        chunks.get(idx).filter(|c| c.chunk_offset <= offset)
    }

    /// Fetch and decompress one chunk
    ///
    /// The bytes are not verified here; callers check them against the
    /// chunk or file digest.
    pub fn read_chunk(&self, chunk: &ChunkRef) -> Result<Bytes> {
        let len = (chunk.blob_end - chunk.blob_offset) as usize;
        let compressed = self.source.read_at(chunk.blob_offset, len)?;

        let mut decoder = MultiGzDecoder::new(&compressed[..]).take(chunk.chunk_size);
        let mut out = Vec::with_capacity(chunk.chunk_size as usize);
        decoder.read_to_end(&mut out).map_err(|e| {
            Error::Fetch(format!(
                "decompressing chunk at blob offset {}: {}",
                chunk.blob_offset, e
            ))
        })?;

        if out.len() as u64 != chunk.chunk_size {
            return Err(Error::Fetch(format!(
                "short chunk at blob offset {}: {} of {} bytes",
                chunk.blob_offset,
                out.len(),
                chunk.chunk_size
            )));
        }
        Ok(Bytes::from(out))
    }

    pub fn toc_offset(&self) -> u64 {
        self.toc_offset
    }

    /// Number of entries including the root
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn implicit_dir(name: &str) -> TocEntry {
    TocEntry {
        name: name.to_string(),
        entry_type: EntryType::Dir,
        mode: 0o755,
        ..Default::default()
    }
}

fn chunk_of(entry: &TocEntry, file_size: u64) -> Result<ChunkRef> {
    let chunk_size = if entry.chunk_size == 0 {
        file_size.saturating_sub(entry.chunk_offset)
    } else {
        entry.chunk_size
    };

    let digest = if entry.chunk_digest.is_empty() {
        None
    } else {
        Some(entry.chunk_digest.parse::<Digest>()?)
    };

    Ok(ChunkRef {
        chunk_offset: entry.chunk_offset,
        chunk_size,
        blob_offset: entry.offset,
        blob_end: 0,
        digest,
    })
}

/// Unpack the TOC member: a gzipped tar holding `stargz.index.json`
fn decode_toc(member: &[u8]) -> Result<Toc> {
    let mut archive = tar::Archive::new(GzDecoder::new(member));
    let entries = archive
        .entries()
        .map_err(|e| Error::MalformedIndex(format!("reading TOC archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::MalformedIndex(format!("reading TOC archive: {}", e)))?;
        let is_toc = entry
            .path()
            .map(|p| p.as_os_str() == TOC_TAR_NAME)
            .unwrap_or(false);
        if !is_toc {
            continue;
        }

        let mut json = Vec::new();
        entry
            .read_to_end(&mut json)
            .map_err(|e| Error::MalformedIndex(format!("reading {}: {}", TOC_TAR_NAME, e)))?;
        return serde_json::from_slice(&json)
            .map_err(|e| Error::MalformedIndex(format!("{}: {}", TOC_TAR_NAME, e)));
    }

    Err(Error::MalformedIndex(format!(
        "TOC archive has no {}",
        TOC_TAR_NAME
    )))
}
