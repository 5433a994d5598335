//! Binary delta instruction stream consumed by PATCH operations.
//!
//! A delta payload is a sequence of copy/literal instructions produced by an
//! off-the-shelf byte-level differ. Only the apply side lives here; the
//! encoder exists so containers can be assembled from precomputed chunks.
//!
//! Wire layout, repeated until exactly `payload.length` bytes are consumed:
//! - `0x00` ‖ `u64-BE source offset` ‖ `u32-BE length`: copy from the
//!   reference file.
//! - `0x01` ‖ `u32-BE length` ‖ literal bytes.

use std::io::{Read, Write};

use crate::cancel::CancelToken;
use crate::error::{PatchError, Result};

const TAG_COPY: u8 = 0x00;
const TAG_INSERT: u8 = 0x01;

const COPY_INSTR_LEN: u64 = 1 + 8 + 4;
const INSERT_HEADER_LEN: u64 = 1 + 4;

/// Chunk granularity for literal streaming and cancellation checks.
const CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaChunk {
    Copy { offset: u64, length: u32 },
    Insert { data: Vec<u8> },
}

/// Serialize a chunk list into the wire encoding.
pub fn encode(chunks: &[DeltaChunk]) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in chunks {
        match chunk {
            DeltaChunk::Copy { offset, length } => {
                out.push(TAG_COPY);
                out.extend_from_slice(&offset.to_be_bytes());
                out.extend_from_slice(&length.to_be_bytes());
            }
            DeltaChunk::Insert { data } => {
                out.push(TAG_INSERT);
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
        }
    }
    out
}

/// Reconstruct the new file by replaying `payload_len` bytes of instructions
/// against `source` (the pre-patch destination, random access via mmap).
///
/// Every instruction and every literal chunk passes a cancellation
/// checkpoint, so an interrupt mid-reconstruction leaves only a partial
/// staged file behind, never a mutated destination.
pub fn apply<R: Read, W: Write>(
    payload: &mut R,
    payload_len: u64,
    source: &[u8],
    out: &mut W,
    cancel: &CancelToken,
) -> Result<()> {
    let mut remaining = payload_len;
    while remaining > 0 {
        cancel.checkpoint()?;
        let tag = read_u8(payload)?;
        match tag {
            TAG_COPY => {
                if remaining < COPY_INSTR_LEN {
                    return Err(truncated());
                }
                remaining -= COPY_INSTR_LEN;
                let offset = read_u64(payload)?;
                let length = read_u32(payload)? as u64;
                let end = offset
                    .checked_add(length)
                    .ok_or_else(|| PatchError::Format("delta copy range overflow".into()))?;
                if end > source.len() as u64 {
                    return Err(PatchError::Format(format!(
                        "delta copy range {offset}..{end} exceeds source of {} bytes",
                        source.len()
                    )));
                }
                out.write_all(&source[offset as usize..end as usize])?;
            }
            TAG_INSERT => {
                if remaining < INSERT_HEADER_LEN {
                    return Err(truncated());
                }
                let length = read_u32(payload)? as u64;
                if remaining - INSERT_HEADER_LEN < length {
                    return Err(truncated());
                }
                remaining -= INSERT_HEADER_LEN + length;
                let mut left = length;
                let mut buf = vec![0u8; CHUNK.min(length as usize).max(1)];
                while left > 0 {
                    cancel.checkpoint()?;
                    let want = left.min(buf.len() as u64) as usize;
                    payload
                        .read_exact(&mut buf[..want])
                        .map_err(|_| truncated())?;
                    out.write_all(&buf[..want])?;
                    left -= want as u64;
                }
            }
            other => {
                return Err(PatchError::Format(format!(
                    "unknown delta instruction tag 0x{other:02x}"
                )));
            }
        }
    }
    Ok(())
}

fn truncated() -> PatchError {
    PatchError::Format("truncated delta payload".into())
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b).map_err(|_| truncated())?;
    Ok(b[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).map_err(|_| truncated())?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b).map_err(|_| truncated())?;
    Ok(u64::from_be_bytes(b))
}
