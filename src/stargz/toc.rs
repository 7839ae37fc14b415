//! Table-of-contents wire format
//!
//! Mirrors the `stargz.index.json` document: field names, omission of
//! zero values and base64-encoded xattr values all match the format
//! produced by existing stargz writers.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Only TOC version understood by the reader
pub const TOC_VERSION: i64 = 1;

/// Kind of a TOC entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Dir,
    #[default]
    Reg,
    Symlink,
    Hardlink,
    Char,
    Block,
    Fifo,
    /// Continuation of the preceding `reg` entry with the same name
    Chunk,
}

/// Top-level TOC document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toc {
    pub version: i64,
    pub entries: Vec<TocEntry>,
}

/// One entry of the table of contents
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TocEntry {
    pub name: String,

    #[serde(rename = "type")]
    pub entry_type: EntryType,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,

    #[serde(rename = "modtime", default, skip_serializing_if = "String::is_empty")]
    pub mod_time_3339: String,

    #[serde(rename = "linkName", default, skip_serializing_if = "String::is_empty")]
    pub link_name: String,

    #[serde(default, skip_serializing_if = "is_zero32")]
    pub mode: u32,

    #[serde(default, skip_serializing_if = "is_zero32")]
    pub uid: u32,

    #[serde(default, skip_serializing_if = "is_zero32")]
    pub gid: u32,

    #[serde(rename = "userName", default, skip_serializing_if = "String::is_empty")]
    pub user_name: String,

    #[serde(rename = "groupName", default, skip_serializing_if = "String::is_empty")]
    pub group_name: String,

    /// Blob offset of the gzip member where this entry's data begins
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,

    #[serde(rename = "devMajor", default, skip_serializing_if = "is_zero32")]
    pub dev_major: u32,

    #[serde(rename = "devMinor", default, skip_serializing_if = "is_zero32")]
    pub dev_minor: u32,

    #[serde(rename = "NumLink", default, skip_serializing_if = "is_zero32")]
    pub num_link: u32,

    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        with = "xattr_serde"
    )]
    pub xattrs: BTreeMap<String, Vec<u8>>,

    /// Digest of the whole regular file
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,

    #[serde(rename = "chunkOffset", default, skip_serializing_if = "is_zero")]
    pub chunk_offset: u64,

    /// Zero means "to the end of the file"
    #[serde(rename = "chunkSize", default, skip_serializing_if = "is_zero")]
    pub chunk_size: u64,

    #[serde(rename = "chunkDigest", default, skip_serializing_if = "String::is_empty")]
    pub chunk_digest: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero32(v: &u32) -> bool {
    *v == 0
}

impl TocEntry {
    /// Modification time, or the epoch when absent or unparseable
    pub fn mod_time(&self) -> SystemTime {
        if self.mod_time_3339.is_empty() {
            return SystemTime::UNIX_EPOCH;
        }
        match DateTime::parse_from_rfc3339(&self.mod_time_3339) {
            Ok(t) => SystemTime::from(t),
            Err(e) => {
                tracing::debug!("Bad modtime {:?} on {}: {}", self.mod_time_3339, self.name, e);
                SystemTime::UNIX_EPOCH
            }
        }
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Dir
    }
}

/// Normalize a TOC name to a root-relative path
///
/// Empty and `.` components are dropped and `..` never climbs above the
/// root, matching `path.Clean("/" + name)` without the leading slash.
pub fn clean_name(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    parts.join("/")
}

/// Split a cleaned path into (parent, basename)
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// Base64 serialization for xattr values, as Go encodes `[]byte`
mod xattr_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(map: &BTreeMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: BTreeMap<&str, String> = map
            .iter()
            .map(|(k, v)| (k.as_str(), STANDARD.encode(v)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<BTreeMap<String, Option<String>>>::deserialize(deserializer)?;
        encoded
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| match v {
                Some(v) => STANDARD
                    .decode(v)
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom),
                None => Ok((k, Vec::new())),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("./foo/bar.txt"), "foo/bar.txt");
        assert_eq!(clean_name("/foo/"), "foo");
        assert_eq!(clean_name("foo/"), "foo");
        assert_eq!(clean_name("./"), "");
        assert_eq!(clean_name("."), "");
        assert_eq!(clean_name(""), "");
        assert_eq!(clean_name("a//b"), "a/b");
        assert_eq!(clean_name("a/./b/"), "a/b");
        assert_eq!(clean_name("../escape"), "escape");
        assert_eq!(clean_name("a/../../b"), "b");
        assert_eq!(clean_name("a/b/.."), "a");
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("foo/bar.txt"), ("foo", "bar.txt"));
        assert_eq!(split_parent("a/b/c"), ("a/b", "c"));
        assert_eq!(split_parent("top"), ("", "top"));
    }

    #[test]
    fn test_parse_go_style_entry() {
        let json = r#"{
            "name": "foo/bar.txt",
            "type": "reg",
            "size": 4,
            "modtime": "2019-03-01T10:00:00Z",
            "mode": 420,
            "uid": 1000,
            "gid": 1000,
            "offset": 512,
            "xattrs": {"user.k": "dg==", "user.nil": null},
            "digest": "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        }"#;
        let e: TocEntry = serde_json::from_str(json).unwrap();
        assert_eq!(e.entry_type, EntryType::Reg);
        assert_eq!(e.size, 4);
        assert_eq!(e.mode, 0o644);
        assert_eq!(e.xattrs["user.k"], b"v");
        assert!(e.xattrs["user.nil"].is_empty());
        assert_eq!(e.chunk_size, 0);
        assert!(e.mod_time() > SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_zero_fields_omitted() {
        let e = TocEntry {
            name: "foo".into(),
            entry_type: EntryType::Dir,
            mode: 0o755,
            ..Default::default()
        };
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, r#"{"name":"foo","type":"dir","mode":493}"#);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<TocEntry, _> = serde_json::from_str(r#"{"name":"x","type":"socket"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_modtime_falls_back_to_epoch() {
        let e = TocEntry {
            name: "x".into(),
            mod_time_3339: "yesterday".into(),
            ..Default::default()
        };
        assert_eq!(e.mod_time(), SystemTime::UNIX_EPOCH);
    }
}
