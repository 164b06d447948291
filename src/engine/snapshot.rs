//! Snapshot Files
//!
//! Whole-store image written by `synchronize`, `close` and `dump_snapshot`,
//! read back at open and by `load_snapshot`.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                       │
//! │   Magic: "ACSN" (4) | Version: u16 (2) | Count: u64 (8) │
//! ├─────────────────────────────────────────────────────────┤
//! │ Body (variable)                                         │
//! │   bincode-encoded records, ascending key order          │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (4 bytes)                                        │
//! │   CRC32 of header + body                                │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes go to a sibling temp file that is renamed over the target, so a
//! crash mid-write leaves the previous snapshot intact.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult, ErrorKind};

/// Magic bytes identifying an AtlasCab snapshot
pub const MAGIC: &[u8; 4] = b"ACSN";

/// Current snapshot format version
pub const VERSION: u16 = 1;

/// Magic (4) + Version (2) + Count (8)
pub const HEADER_SIZE: usize = 14;

/// CRC32 (4)
pub const FOOTER_SIZE: usize = 4;

#[derive(Serialize)]
struct BodyRef<'a> {
    records: Vec<(&'a [u8], &'a [u8])>,
}

#[derive(Deserialize)]
struct Body {
    records: Vec<(Vec<u8>, Vec<u8>)>,
}

fn corrupt(path: &Path, what: impl std::fmt::Display) -> EngineError {
    EngineError::new(
        ErrorKind::DataCorruption,
        format!("{}: {}", path.display(), what),
    )
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `records` to `path`
///
/// `hard` syncs file contents to the device before the rename.
pub fn write(path: &Path, records: &BTreeMap<Bytes, Bytes>, hard: bool) -> EngineResult<()> {
    let body = BodyRef {
        records: records.iter().map(|(k, v)| (&k[..], &v[..])).collect(),
    };
    let encoded = bincode::serialize(&body)
        .map_err(|e| EngineError::new(ErrorKind::SystemError, e.to_string()))?;

    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6..].copy_from_slice(&(records.len() as u64).to_le_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&encoded);
    let crc = hasher.finalize();

    let tmp = temp_path(path);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&header)?;
    writer.write_all(&encoded)?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.flush()?;

    let file = writer
        .into_inner()
        .map_err(|e| EngineError::new(ErrorKind::SystemError, e.to_string()))?;
    if hard {
        file.sync_all()?;
    }
    drop(file);

    fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), records = records.len(), hard, "snapshot written");
    Ok(())
}

/// Read the records stored at `path`
pub fn read(path: &Path) -> EngineResult<BTreeMap<Bytes, Bytes>> {
    let data = fs::read(path)?;
    if data.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(corrupt(path, "file too small"));
    }
    if &data[..4] != MAGIC {
        return Err(corrupt(path, "bad magic"));
    }

    let mut version = [0u8; 2];
    version.copy_from_slice(&data[4..6]);
    let version = u16::from_le_bytes(version);
    if version != VERSION {
        return Err(corrupt(path, format!("unsupported version {}", version)));
    }

    let mut count = [0u8; 8];
    count.copy_from_slice(&data[6..HEADER_SIZE]);
    let count = u64::from_le_bytes(count);

    let crc_at = data.len() - FOOTER_SIZE;
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&data[crc_at..]);
    if crc32fast::hash(&data[..crc_at]) != u32::from_le_bytes(stored) {
        return Err(corrupt(path, "checksum mismatch"));
    }

    let body: Body =
        bincode::deserialize(&data[HEADER_SIZE..crc_at]).map_err(|e| corrupt(path, e))?;
    if body.records.len() as u64 != count {
        return Err(corrupt(path, "record count mismatch"));
    }

    Ok(body
        .records
        .into_iter()
        .map(|(k, v)| (Bytes::from(k), Bytes::from(v)))
        .collect())
}
