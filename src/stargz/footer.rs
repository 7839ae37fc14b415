//! Blob footer parsing
//!
//! A stargz blob ends with an empty gzip member whose header `extra` field
//! records where the TOC member starts: 16 hex digits followed by `STARGZ`.
//! The legacy footer stores that payload as the raw extra field (47 bytes
//! total); the newer one wraps it in an `SG` subfield (51 bytes).

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::io::Read;

/// Size of the legacy footer
pub const FOOTER_SIZE: usize = 47;

/// Size of the footer carrying an `SG` extra subfield
pub const SUBFIELD_FOOTER_SIZE: usize = 51;

const MAGIC: &[u8] = b"STARGZ";
const PAYLOAD_LEN: usize = 16 + 6;
const SUBFIELD_ID: &[u8] = b"SG";

/// Location of the TOC as recorded by the footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub toc_offset: u64,
    pub size: usize,
}

/// Locate the footer within the trailing bytes of a blob
///
/// `tail` is at most [`SUBFIELD_FOOTER_SIZE`] bytes taken from the end of
/// the blob.
pub fn parse_footer(tail: &[u8]) -> Result<Footer> {
    if tail.len() >= SUBFIELD_FOOTER_SIZE {
        let p = &tail[tail.len() - SUBFIELD_FOOTER_SIZE..];
        if let Ok(extra) = gzip_extra(p) {
            if let Some(toc_offset) = subfield_payload(&extra).and_then(parse_payload) {
                return Ok(Footer {
                    toc_offset,
                    size: SUBFIELD_FOOTER_SIZE,
                });
            }
        }
    }

    if tail.len() < FOOTER_SIZE {
        return Err(Error::InvalidFooter(format!(
            "blob too small: {} bytes",
            tail.len()
        )));
    }

    let p = &tail[tail.len() - FOOTER_SIZE..];
    let extra = gzip_extra(p)?;
    let toc_offset = parse_payload(&extra)
        .ok_or_else(|| Error::InvalidFooter("missing STARGZ magic".to_string()))?;

    Ok(Footer {
        toc_offset,
        size: FOOTER_SIZE,
    })
}

/// Decode the (empty) gzip member and return its header extra field
fn gzip_extra(p: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(p);
    let mut sink = Vec::new();
    decoder
        .read_to_end(&mut sink)
        .map_err(|e| Error::InvalidFooter(format!("not a gzip member: {}", e)))?;
    if !sink.is_empty() {
        return Err(Error::InvalidFooter("footer member is not empty".to_string()));
    }
    decoder
        .header()
        .and_then(|h| h.extra())
        .map(|e| e.to_vec())
        .ok_or_else(|| Error::InvalidFooter("no extra field".to_string()))
}

fn subfield_payload(extra: &[u8]) -> Option<&[u8]> {
    if extra.len() != 4 + PAYLOAD_LEN || &extra[..2] != SUBFIELD_ID {
        return None;
    }
    let len = u16::from_le_bytes([extra[2], extra[3]]) as usize;
    if len != PAYLOAD_LEN {
        return None;
    }
    Some(&extra[4..])
}

fn parse_payload(payload: &[u8]) -> Option<u64> {
    if payload.len() != PAYLOAD_LEN || &payload[16..] != MAGIC {
        return None;
    }
    let hex = std::str::from_utf8(&payload[..16]).ok()?;
    u64::from_str_radix(hex, 16).ok()
}
