//! Snapshot file codec.
//!
//! A snapshot bounds replay length: it is the full CRDT state at some
//! historical point, plus the vector of per-writer log sequences it has
//! consumed (so compaction knows which delta logs it supersedes).
//!
//! Byte layout: one status byte (`0x00` = being written, `0x01` = complete)
//! followed by the payload. The payload is zstd-framed iff it begins with
//! the zstd magic `28 B5 2F FD`; readers handle both compressed and raw
//! payloads. The decompressed payload is a little-endian u32 header length,
//! a JSON header carrying the consumed vector, then the raw CRDT state
//! bytes.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fs::FileSystem;

/// Status byte: the writer has not finished this snapshot. Readers treat the
/// file as absent.
pub const STATUS_INCOMPLETE: u8 = 0x00;

/// Status byte: the snapshot is complete and safe to decode.
pub const STATUS_COMPLETE: u8 = 0x01;

/// Magic bytes of a zstd frame.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// zstd level used when writing. Moderate: snapshots are rewritten on every
/// compaction, so encode speed matters more than the last few percent.
const ZSTD_LEVEL: i32 = 3;

/// Errors from decoding a snapshot file. The store converts these into
/// `CorruptSnapshot` with target context.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Underlying read failed.
    #[error("snapshot read failed: {0}")]
    Io(#[from] std::io::Error),

    /// The complete-status payload could not be decoded.
    #[error("snapshot decode failed: {0}")]
    Decode(String),
}

/// JSON header stored ahead of the CRDT state bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SnapshotHeader {
    /// Per-writer log sequence consumed into this snapshot.
    consumed: BTreeMap<String, u64>,
    /// Unix timestamp of the write (milliseconds). Diagnostic only.
    created_at: i64,
}

/// A decoded snapshot: CRDT state plus the consumed sequence vector.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Full encoded CRDT state at the snapshot point.
    pub state: Vec<u8>,
    /// Highest log sequence per writer key folded into `state`.
    pub consumed: BTreeMap<String, u64>,
}

impl Snapshot {
    /// Build a snapshot from state bytes and a consumed vector.
    pub fn new(state: Vec<u8>, consumed: BTreeMap<String, u64>) -> Self {
        Self { state, consumed }
    }
}

/// Encode a snapshot payload (header + state), without status byte or
/// compression.
fn encode_payload(snapshot: &Snapshot) -> Vec<u8> {
    let header = SnapshotHeader {
        consumed: snapshot.consumed.clone(),
        created_at: chrono::Utc::now().timestamp_millis(),
    };
    // Header is always serializable: string keys, integer values.
    let header_json = serde_json::to_vec(&header).unwrap_or_default();
    let mut out = Vec::with_capacity(4 + header_json.len() + snapshot.state.len());
    out.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_json);
    out.extend_from_slice(&snapshot.state);
    out
}

fn decode_payload(payload: &[u8]) -> Result<Snapshot, SnapshotError> {
    if payload.len() < 4 {
        return Err(SnapshotError::Decode("payload shorter than header length".into()));
    }
    let header_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let rest = &payload[4..];
    if rest.len() < header_len {
        return Err(SnapshotError::Decode("truncated header".into()));
    }
    let header: SnapshotHeader = serde_json::from_slice(&rest[..header_len])
        .map_err(|e| SnapshotError::Decode(format!("bad header: {e}")))?;
    Ok(Snapshot {
        state: rest[header_len..].to_vec(),
        consumed: header.consumed,
    })
}

/// Write a snapshot with the two-phase status discipline:
/// write `<path>.tmp` with status `0x00`, fsync, flip to `0x01`, fsync,
/// rename into place. A crash at any point leaves the previous snapshot
/// readable.
pub fn write_snapshot(
    fs: &dyn FileSystem,
    path: &Path,
    snapshot: &Snapshot,
) -> std::io::Result<()> {
    let payload = encode_payload(snapshot);
    let compressed = zstd::encode_all(payload.as_slice(), ZSTD_LEVEL)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let mut bytes = Vec::with_capacity(1 + compressed.len());
    bytes.push(STATUS_INCOMPLETE);
    bytes.extend_from_slice(&compressed);

    let tmp = {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        path.with_file_name(name)
    };

    fs.write(&tmp, &bytes)?;
    fs.sync_file(&tmp)?;
    bytes[0] = STATUS_COMPLETE;
    fs.write(&tmp, &bytes)?;
    fs.sync_file(&tmp)?;
    fs.rename(&tmp, path)
}

/// Read a snapshot file.
///
/// Returns `Ok(None)` when the file is absent, empty, or carries the
/// incomplete status byte — all cases the caller treats as "no snapshot".
/// A complete-status file that fails to decode is an error (the caller
/// rebuilds from logs and surfaces a warning).
pub fn read_snapshot(fs: &dyn FileSystem, path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    if !fs.exists(path) {
        return Ok(None);
    }
    let bytes = fs.read(path)?;
    let Some((&status, payload)) = bytes.split_first() else {
        return Ok(None);
    };
    if status == STATUS_INCOMPLETE {
        tracing::warn!("snapshot {:?} has incomplete status, treating as absent", path);
        return Ok(None);
    }
    if status != STATUS_COMPLETE {
        return Err(SnapshotError::Decode(format!("unknown status byte {status:#04x}")));
    }

    let payload = if payload.starts_with(&ZSTD_MAGIC) {
        zstd::decode_all(payload).map_err(|e| SnapshotError::Decode(format!("zstd: {e}")))?
    } else {
        payload.to_vec()
    };
    decode_payload(&payload).map(Some)
}
