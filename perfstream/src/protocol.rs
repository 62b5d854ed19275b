//! Stream-level framing: the handshake header sent once per connection and
//! the header in front of every frame.
//!
//! ```ignore
//!   handshake = [u8; 4] magic, u32 format version, u32 metadata length, metadata JSON
//!   frame     = u32 body length, body
//!   body      = u32 sequence, record*
//! ```
//!
//! The body length counts every byte after the length field, the sequence
//! number included.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

pub const STREAM_MAGIC: &[u8; 4] = b"PRF1";
pub const CURRENT_FORMAT_VERSION: u32 = 1;

/// Magic, version and metadata length.
pub const HANDSHAKE_PREFIX_SIZE: usize = 12;

pub const FRAME_LENGTH_SIZE: usize = 4;
pub const FRAME_SEQUENCE_SIZE: usize = 4;
pub const FRAME_HEADER_SIZE: usize = FRAME_LENGTH_SIZE + FRAME_SEQUENCE_SIZE;

/// Describes the producing process. Sent as JSON inside the handshake.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Nanoseconds since the UNIX epoch at which the session started.
    pub start_time: u64,
    pub process_id: u32,
    pub cmd: String,
    /// Name of the counter timestamps are taken from, see `Counter::by_name`.
    pub counter: String,
}

impl SessionInfo {
    pub fn for_current_process(counter: &str) -> SessionInfo {
        let mut args = String::new();
        for arg in std::env::args() {
            args.push_str(&arg.escape_default().to_string());
            args.push(' ');
        }

        SessionInfo {
            start_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            process_id: std::process::id(),
            cmd: args,
            counter: counter.to_string(),
        }
    }
}

/// Writes the handshake header for `info` to `w`.
pub fn write_handshake<W: Write>(w: &mut W, info: &SessionInfo) -> io::Result<()> {
    let metadata = serde_json::to_vec(info)?;
    let mut header = Vec::with_capacity(HANDSHAKE_PREFIX_SIZE + metadata.len());
    header.extend_from_slice(STREAM_MAGIC);
    header.extend_from_slice(&CURRENT_FORMAT_VERSION.to_le_bytes());
    header.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    header.extend_from_slice(&metadata);
    w.write_all(&header)
}

/// Writes the length and sequence number that precede a frame's records.
#[inline]
pub fn frame_header(sequence: u32, records_len: usize) -> [u8; FRAME_HEADER_SIZE] {
    let body_len = (FRAME_SEQUENCE_SIZE + records_len) as u32;
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header[0..4].copy_from_slice(&body_len.to_le_bytes());
    header[4..8].copy_from_slice(&sequence.to_le_bytes());
    header
}
