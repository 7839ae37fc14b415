//! Test fixtures: an in-memory stargz writer and instrumented blob sources

use crate::crypto::Digest;
use crate::error::{Error, Result};
use crate::remote::BlobSource;
use crate::stargz::{EntryType, Toc, TocEntry, TOC_TAR_NAME, TOC_VERSION};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const MODTIME: &str = "2019-03-01T10:00:00Z";
const DEFAULT_CHUNK_SIZE: usize = 4 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestMode {
    Correct,
    Wrong,
    Absent,
}

/// One entry to be written by [`LayerBuilder`]
#[derive(Debug, Clone)]
pub struct TestEntry {
    toc: TocEntry,
    content: Vec<u8>,
    digest: DigestMode,
}

fn entry(name: &str, entry_type: EntryType, mode: u32) -> TestEntry {
    TestEntry {
        toc: TocEntry {
            name: name.to_string(),
            entry_type,
            mode,
            mod_time_3339: MODTIME.to_string(),
            ..Default::default()
        },
        content: Vec::new(),
        digest: DigestMode::Correct,
    }
}

pub fn dir(name: &str) -> TestEntry {
    entry(name, EntryType::Dir, 0o755)
}

pub fn dir_with_xattrs(name: &str, xattrs: &[(&str, &str)]) -> TestEntry {
    let mut e = dir(name);
    e.toc.xattrs = xattrs
        .iter()
        .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
        .collect::<BTreeMap<_, _>>();
    e
}

pub fn file(name: &str, content: &str) -> TestEntry {
    let mut e = entry(name, EntryType::Reg, 0o644);
    e.content = content.as_bytes().to_vec();
    e
}

/// Regular file whose recorded digest does not match its content
pub fn file_with_wrong_digest(name: &str, content: &str) -> TestEntry {
    let mut e = file(name, content);
    e.digest = DigestMode::Wrong;
    e
}

pub fn file_without_digest(name: &str, content: &str) -> TestEntry {
    let mut e = file(name, content);
    e.digest = DigestMode::Absent;
    e
}

pub fn symlink(name: &str, target: &str) -> TestEntry {
    let mut e = entry(name, EntryType::Symlink, 0o777);
    e.toc.link_name = target.to_string();
    e
}

pub fn hardlink(name: &str, target: &str) -> TestEntry {
    let mut e = entry(name, EntryType::Hardlink, 0o644);
    e.toc.link_name = target.to_string();
    e
}

pub fn chardev(name: &str, major: u32, minor: u32) -> TestEntry {
    let mut e = entry(name, EntryType::Char, 0o666);
    e.toc.dev_major = major;
    e.toc.dev_minor = minor;
    e
}

/// Writes a stargz blob: tar headers and file data in gzip members, one
/// member per chunk, then the TOC member and a legacy footer
pub struct LayerBuilder {
    entries: Vec<TestEntry>,
    chunk_size: usize,
    chunk_digests: bool,
    toc_version: i64,
}

impl LayerBuilder {
    pub fn new() -> Self {
        LayerBuilder {
            entries: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_digests: true,
            toc_version: TOC_VERSION,
        }
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Omit `chunkDigest` so whole files become the verification unit
    pub fn without_chunk_digests(mut self) -> Self {
        self.chunk_digests = false;
        self
    }

    pub fn toc_version(mut self, version: i64) -> Self {
        self.toc_version = version;
        self
    }

    pub fn entry(mut self, entry: TestEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn build(self) -> Bytes {
        let mut blob = Vec::new();
        let mut member = Vec::new();
        let mut toc = Vec::new();

        for e in &self.entries {
            member.extend_from_slice(tar_header(e).as_bytes());

            let mut head = e.toc.clone();
            if head.entry_type != EntryType::Reg {
                toc.push(head);
                continue;
            }

            head.size = e.content.len() as u64;
            head.digest = match e.digest {
                DigestMode::Correct => Digest::sha256(&e.content).to_string(),
                DigestMode::Wrong => Digest::sha256(b"something else").to_string(),
                DigestMode::Absent => String::new(),
            };

            let pieces: Vec<&[u8]> = e.content.chunks(self.chunk_size).collect();
            if pieces.is_empty() {
                toc.push(head);
                continue;
            }

            let single = pieces.len() == 1;
            let mut chunk_offset = 0u64;
            for (i, piece) in pieces.into_iter().enumerate() {
                flush(&mut blob, &mut member);
                member.extend_from_slice(piece);

                let mut c = if i == 0 {
                    head.clone()
                } else {
                    TocEntry {
                        name: head.name.clone(),
                        entry_type: EntryType::Chunk,
                        ..Default::default()
                    }
                };
                c.offset = blob.len() as u64;
                c.chunk_offset = chunk_offset;
                // A lone chunk keeps the "to end of file" encoding
                c.chunk_size = if single { 0 } else { piece.len() as u64 };
                if self.chunk_digests {
                    c.chunk_digest = Digest::sha256(piece).to_string();
                }
                chunk_offset += piece.len() as u64;
                toc.push(c);
            }

            let pad = (512 - e.content.len() % 512) % 512;
            member.extend(std::iter::repeat(0u8).take(pad));
        }

        // End-of-archive marker
        member.extend_from_slice(&[0u8; 1024]);
        flush(&mut blob, &mut member);

        let toc_offset = blob.len() as u64;
        let doc = Toc {
            version: self.toc_version,
            entries: toc,
        };
        blob.extend(gzip(&toc_tar(&doc)));
        blob.extend(legacy_footer(toc_offset));
        Bytes::from(blob)
    }
}

impl Default for LayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn tar_header(e: &TestEntry) -> tar::Header {
    let mut h = tar::Header::new_ustar();
    let _ = h.set_path(e.toc.name.trim_end_matches('/'));
    h.set_mode(e.toc.mode);
    h.set_mtime(0);
    let (kind, size) = match e.toc.entry_type {
        EntryType::Dir => (tar::EntryType::Directory, 0),
        EntryType::Reg => (tar::EntryType::Regular, e.content.len() as u64),
        EntryType::Symlink => (tar::EntryType::Symlink, 0),
        EntryType::Hardlink => (tar::EntryType::Link, 0),
        EntryType::Char => (tar::EntryType::Char, 0),
        EntryType::Block => (tar::EntryType::Block, 0),
        EntryType::Fifo => (tar::EntryType::Fifo, 0),
        EntryType::Chunk => (tar::EntryType::Regular, 0),
    };
    h.set_entry_type(kind);
    h.set_size(size);
    if !e.toc.link_name.is_empty() {
        let _ = h.set_link_name(&e.toc.link_name);
    }
    if matches!(e.toc.entry_type, EntryType::Char | EntryType::Block) {
        let _ = h.set_device_major(e.toc.dev_major);
        let _ = h.set_device_minor(e.toc.dev_minor);
    }
    h.set_cksum();
    h
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn flush(blob: &mut Vec<u8>, member: &mut Vec<u8>) {
    if !member.is_empty() {
        blob.extend(gzip(member));
        member.clear();
    }
}

fn toc_tar(toc: &Toc) -> Vec<u8> {
    let json = serde_json::to_vec(toc).unwrap();
    let mut header = tar::Header::new_ustar();
    header.set_size(json.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, TOC_TAR_NAME, json.as_slice())
        .unwrap();
    builder.into_inner().unwrap()
}

fn footer_payload(toc_offset: u64) -> Vec<u8> {
    format!("{:016x}STARGZ", toc_offset).into_bytes()
}

/// Empty gzip member carrying `extra` in its header
fn empty_member_with_extra(extra: &[u8]) -> Vec<u8> {
    let mut out = vec![0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0x00, 0xff];
    out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
    out.extend_from_slice(extra);
    // Final stored block of length zero
    out.extend_from_slice(&[0x01, 0x00, 0x00, 0xff, 0xff]);
    // CRC32 and ISIZE of empty input
    out.extend_from_slice(&[0u8; 8]);
    out
}

/// 47-byte footer with the payload as the raw extra field
pub fn legacy_footer(toc_offset: u64) -> Vec<u8> {
    empty_member_with_extra(&footer_payload(toc_offset))
}

/// 51-byte footer with the payload in an `SG` subfield
pub fn subfield_footer(toc_offset: u64) -> Vec<u8> {
    let payload = footer_payload(toc_offset);
    let mut extra = b"SG".to_vec();
    extra.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    extra.extend_from_slice(&payload);
    empty_member_with_extra(&extra)
}

/// Counts range reads, optionally slowing each one down
pub struct CountingBlob {
    inner: Bytes,
    count: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingBlob {
    pub fn new(inner: Bytes) -> Self {
        CountingBlob {
            inner,
            count: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

impl BlobSource for CountingBlob {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        self.count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.inner.read_at(offset, len)
    }
}

/// Fails the first `fail_count` reads
pub struct FlakyBlob {
    inner: Bytes,
    fail_count: usize,
    attempts: AtomicUsize,
}

impl FlakyBlob {
    pub fn new(inner: Bytes, fail_count: usize) -> Self {
        FlakyBlob {
            inner,
            fail_count,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl BlobSource for FlakyBlob {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_count {
            return Err(Error::Fetch("injected failure".to_string()));
        }
        self.inner.read_at(offset, len)
    }
}
