//! On-disk clip container.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! header : "PVCL" | u16 version | u16 flags | u32 camera_id
//! record : "FRAM" | u32 payload_len | u64 pts_ns | u8 key | payload
//! trailer: "IDXX" | u64 record_count | (u64 offset, u64 pts_ns)* |
//!          u64 trailer_len | "PVCL"
//! ```
//!
//! The trailer is written once at close. A crashed recording leaves records
//! with no trailer; `repair` truncates the incomplete tail and rebuilds the
//! index so the prefix stays playable.

use common_io::{EncodedUnit, RecorderError, Result};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{info, warn};

pub const CLIP_MAGIC: &[u8; 4] = b"PVCL";
pub const RECORD_MAGIC: &[u8; 4] = b"FRAM";
pub const INDEX_MAGIC: &[u8; 4] = b"IDXX";
pub const CLIP_VERSION: u16 = 1;

pub const HEADER_LEN: u64 = 12;
pub const RECORD_OVERHEAD: u64 = 17;
/// Sanity bound on a single record payload (a 4K frame plus headroom).
const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipHeader {
    pub version: u16,
    pub camera_id: u32,
}

/// One index entry: where a record starts and its presentation timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub pts_ns: u64,
}

pub fn encode_header(camera_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN as usize);
    buf.extend_from_slice(CLIP_MAGIC);
    buf.extend_from_slice(&CLIP_VERSION.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&camera_id.to_le_bytes());
    buf
}

pub fn encode_record(unit: &EncodedUnit) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD as usize + unit.data.len());
    buf.extend_from_slice(RECORD_MAGIC);
    buf.extend_from_slice(&(unit.data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&unit.pts_ns.to_le_bytes());
    buf.push(unit.key_frame as u8);
    buf.extend_from_slice(&unit.data);
    buf
}

pub fn encode_trailer(index: &[IndexEntry]) -> Vec<u8> {
    let trailer_len = 4 + 8 + index.len() as u64 * 16 + 8 + 4;
    let mut buf = Vec::with_capacity(trailer_len as usize);
    buf.extend_from_slice(INDEX_MAGIC);
    buf.extend_from_slice(&(index.len() as u64).to_le_bytes());
    for entry in index {
        buf.extend_from_slice(&entry.offset.to_le_bytes());
        buf.extend_from_slice(&entry.pts_ns.to_le_bytes());
    }
    buf.extend_from_slice(&trailer_len.to_le_bytes());
    buf.extend_from_slice(CLIP_MAGIC);
    buf
}

fn read_exact_at(r: &mut (impl Read + Seek), offset: u64, buf: &mut [u8]) -> std::io::Result<bool> {
    r.seek(SeekFrom::Start(offset))?;
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..]) {
            Ok(0) => return Ok(false),
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

pub fn read_header(r: &mut (impl Read + Seek)) -> Result<ClipHeader> {
    let mut buf = [0u8; HEADER_LEN as usize];
    if !read_exact_at(r, 0, &mut buf)? {
        return Err(RecorderError::Corruption("clip shorter than header".into()));
    }
    if &buf[0..4] != CLIP_MAGIC {
        return Err(RecorderError::Corruption("bad clip magic".into()));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != CLIP_VERSION {
        return Err(RecorderError::Corruption(format!(
            "unsupported clip version {}",
            version
        )));
    }
    let camera_id = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    Ok(ClipHeader { version, camera_id })
}

/// Read and validate the trailer of a finalized clip, if one is present.
pub fn read_trailer(r: &mut (impl Read + Seek), file_len: u64) -> Result<Option<Vec<IndexEntry>>> {
    if file_len < HEADER_LEN + 12 {
        return Ok(None);
    }
    let mut tail = [0u8; 12];
    if !read_exact_at(r, file_len - 12, &mut tail)? {
        return Ok(None);
    }
    if &tail[8..12] != CLIP_MAGIC {
        return Ok(None);
    }
    let trailer_len = u64::from_le_bytes(tail[0..8].try_into().unwrap());
    if trailer_len < 24 || trailer_len > file_len - HEADER_LEN {
        return Ok(None);
    }

    let start = file_len - trailer_len;
    let mut trailer = vec![0u8; trailer_len as usize];
    if !read_exact_at(r, start, &mut trailer)? {
        return Ok(None);
    }
    if &trailer[0..4] != INDEX_MAGIC {
        return Ok(None);
    }
    let count = u64::from_le_bytes(trailer[4..12].try_into().unwrap());
    let expected_len = count
        .checked_mul(16)
        .and_then(|n| n.checked_add(24))
        .ok_or_else(|| RecorderError::Corruption("index count overflow".into()))?;
    if expected_len != trailer_len {
        return Err(RecorderError::Corruption("index length mismatch".into()));
    }

    let mut index = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let base = 12 + i * 16;
        index.push(IndexEntry {
            offset: u64::from_le_bytes(trailer[base..base + 8].try_into().unwrap()),
            pts_ns: u64::from_le_bytes(trailer[base + 8..base + 16].try_into().unwrap()),
        });
    }
    Ok(Some(index))
}

/// Walk records forward from the header. Returns the index of every complete
/// record and the offset just past the last one; scanning stops at the first
/// incomplete or unrecognizable record (including a preallocated zero tail).
pub fn scan_records(r: &mut (impl Read + Seek), file_len: u64) -> Result<(Vec<IndexEntry>, u64)> {
    let mut index = Vec::new();
    let mut offset = HEADER_LEN;

    loop {
        if offset + RECORD_OVERHEAD > file_len {
            break;
        }
        let mut head = [0u8; RECORD_OVERHEAD as usize];
        if !read_exact_at(r, offset, &mut head)? {
            break;
        }
        if &head[0..4] == INDEX_MAGIC {
            // trailer reached on a finalized file
            break;
        }
        if &head[0..4] != RECORD_MAGIC {
            break;
        }
        let payload_len = u32::from_le_bytes(head[4..8].try_into().unwrap());
        if payload_len > MAX_PAYLOAD_LEN {
            break;
        }
        let end = offset + RECORD_OVERHEAD + payload_len as u64;
        if end > file_len {
            // record body torn by the crash
            break;
        }
        let pts_ns = u64::from_le_bytes(head[8..16].try_into().unwrap());
        index.push(IndexEntry { offset, pts_ns });
        offset = end;
    }

    Ok((index, offset))
}

/// Result of a salvage pass over one clip file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipRepair {
    pub camera_id: u32,
    pub frames: u64,
    pub truncated: bool,
    pub bytes: u64,
}

/// Verify a clip and, if its trailer is missing, truncate the torn tail and
/// rebuild the index over the complete records. Valid finalized files are
/// never touched.
pub fn repair(path: &Path) -> Result<ClipRepair> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let file_len = file.metadata()?.len();

    let header = read_header(&mut file)?;

    if let Some(index) = read_trailer(&mut file, file_len)? {
        info!(
            path = %path.display(),
            camera = header.camera_id,
            frames = index.len(),
            "clip already finalized; salvage not needed"
        );
        return Ok(ClipRepair {
            camera_id: header.camera_id,
            frames: index.len() as u64,
            truncated: false,
            bytes: file_len,
        });
    }

    let (index, data_end) = scan_records(&mut file, file_len)?;
    warn!(
        path = %path.display(),
        camera = header.camera_id,
        frames = index.len(),
        discarded_bytes = file_len - data_end,
        "rebuilding index for torn clip"
    );

    file.set_len(data_end)?;
    file.seek(SeekFrom::Start(data_end))?;
    file.write_all(&encode_trailer(&index))?;
    file.sync_data()?;

    let bytes = file.metadata()?.len();
    Ok(ClipRepair {
        camera_id: header.camera_id,
        frames: index.len() as u64,
        truncated: true,
        bytes,
    })
}
