//! Binary encodings for values crossing the sandbox boundary.
//!
//! - **String lists**: each non-empty element followed by a NUL byte.
//! - **Cluster events**: 8-byte records, little-endian
//!   `(resource kind: u32, action bits: u32)`.
//! - **Ask-then-write**: a producer is handed `(ptr, limit)` and always
//!   returns the size it needs. It writes only when that size fits in
//!   `limit`, so a guest can probe with a small buffer and retry once.
//!
//! Decoders are lenient the same way encoders are: empty strings and a
//! trailing partial event record are dropped, not reported.

use thiserror::Error;

use crate::event::{ActionType, ClusterEvent, ResourceKind};

/// Size of one encoded [`ClusterEvent`].
pub const EVENT_RECORD_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("guest memory access out of bounds: ptr={ptr}, len={len}, memory size={size}")]
    OutOfBounds { ptr: u32, len: u32, size: usize },

    #[error("value of {0} bytes exceeds the 32-bit guest address space")]
    TooLarge(usize),
}

/// Encode a string list as NUL-terminated entries, skipping empty strings.
pub fn encode_string_list<S: AsRef<str>>(items: &[S]) -> Vec<u8> {
    let size = items
        .iter()
        .map(|s| s.as_ref().len())
        .filter(|len| *len > 0)
        .map(|len| len + 1)
        .sum();
    let mut buf = Vec::with_capacity(size);
    for item in items.iter().map(AsRef::as_ref).filter(|s| !s.is_empty()) {
        buf.extend_from_slice(item.as_bytes());
        buf.push(0);
    }
    buf
}

/// Decode NUL-terminated entries. Zero-length entries are skipped and an
/// unterminated tail is kept as a final entry.
pub fn decode_string_list(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| String::from_utf8_lossy(entry).into_owned())
        .collect()
}

pub fn encode_cluster_events(events: &[ClusterEvent]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(events.len() * EVENT_RECORD_LEN);
    for event in events {
        buf.extend_from_slice(&(event.resource as u32).to_le_bytes());
        buf.extend_from_slice(&event.action.bits().to_le_bytes());
    }
    buf
}

/// Decode whole 8-byte records; a trailing partial record is ignored.
pub fn decode_cluster_events(bytes: &[u8]) -> Vec<ClusterEvent> {
    bytes
        .chunks_exact(EVENT_RECORD_LEN)
        .filter_map(|record| {
            let kind = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            let bits = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);
            match ResourceKind::from_u32(kind) {
                Some(resource) => Some(ClusterEvent::new(resource, ActionType::from_bits(bits))),
                None => {
                    tracing::debug!(kind, "dropping cluster event with unknown resource kind");
                    None
                }
            }
        })
        .collect()
}

/// Ask-then-write `value` into `memory` at `ptr` with capacity `limit`.
///
/// Returns the number of bytes `value` needs. The bytes are written only
/// when they fit in `limit`; otherwise `memory` is left untouched.
pub fn write_if_fits(memory: &mut [u8], ptr: u32, limit: u32, value: &[u8]) -> Result<u32, WireError> {
    let required = u32::try_from(value.len()).map_err(|_| WireError::TooLarge(value.len()))?;
    if required > limit {
        return Ok(required);
    }
    let dest = guest_range_mut(memory, ptr, required)?;
    dest.copy_from_slice(value);
    Ok(required)
}

/// Borrow `len` bytes of guest memory starting at `ptr`.
pub fn guest_range(memory: &[u8], ptr: u32, len: u32) -> Result<&[u8], WireError> {
    let start = ptr as usize;
    let end = start.checked_add(len as usize).filter(|end| *end <= memory.len());
    match end {
        Some(end) => Ok(&memory[start..end]),
        None => Err(WireError::OutOfBounds {
            ptr,
            len,
            size: memory.len(),
        }),
    }
}

fn guest_range_mut(memory: &mut [u8], ptr: u32, len: u32) -> Result<&mut [u8], WireError> {
    let size = memory.len();
    let start = ptr as usize;
    match start.checked_add(len as usize).filter(|end| *end <= size) {
        Some(end) => Ok(&mut memory[start..end]),
        None => Err(WireError::OutOfBounds { ptr, len, size }),
    }
}
