//! Event records and their byte-level encoding.
//!
//! A record is `[u8 tag][payload]`, all integers little-endian:
//!
//! ```ignore
//!   StringDef      1  [u32 id][u16 len][name bytes]
//!   ThreadInfo     2  [u32 thread_id][u16 len][name bytes]
//!   ZoneBegin      3  [u32 thread_id][u64 timestamp][u32 name_id]
//!   ZoneEnd        4  [u32 thread_id][u64 timestamp]
//!   Marker         5  [u32 thread_id][u64 timestamp][u32 name_id]
//!   DroppedEvents  6  [u64 total]
//! ```
//!
//! If you change this layout, make sure that you increment
//! `protocol::CURRENT_FORMAT_VERSION`.

use thiserror::Error;

pub const TAG_STRING_DEF: u8 = 1;
pub const TAG_THREAD_INFO: u8 = 2;
pub const TAG_ZONE_BEGIN: u8 = 3;
pub const TAG_ZONE_END: u8 = 4;
pub const TAG_MARKER: u8 = 5;
pub const TAG_DROPPED_EVENTS: u8 = 6;

/// Longest name the wire format can carry.
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

/// Identifies an entry in the per-session string table.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[repr(C)]
pub struct StringId(u32);

impl StringId {
    #[inline]
    pub const fn new(id: u32) -> StringId {
        StringId(id)
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Record {
    StringDef {
        id: StringId,
        name: String,
    },
    ThreadInfo {
        thread_id: u32,
        name: String,
    },
    ZoneBegin {
        thread_id: u32,
        timestamp: u64,
        name_id: StringId,
    },
    ZoneEnd {
        thread_id: u32,
        timestamp: u64,
    },
    Marker {
        thread_id: u32,
        timestamp: u64,
        name_id: StringId,
    },
    DroppedEvents {
        total: u64,
    },
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RecordError {
    #[error("invalid record tag {0:#04x}")]
    InvalidTag(u8),
    #[error("record with tag {tag} needs {needed} bytes but only {available} remain in the frame")]
    Truncated {
        tag: u8,
        needed: usize,
        available: usize,
    },
    #[error("name in record with tag {0} is not valid UTF-8")]
    InvalidUtf8(u8),
}

impl Record {
    #[inline]
    pub fn tag(&self) -> u8 {
        match self {
            Record::StringDef { .. } => TAG_STRING_DEF,
            Record::ThreadInfo { .. } => TAG_THREAD_INFO,
            Record::ZoneBegin { .. } => TAG_ZONE_BEGIN,
            Record::ZoneEnd { .. } => TAG_ZONE_END,
            Record::Marker { .. } => TAG_MARKER,
            Record::DroppedEvents { .. } => TAG_DROPPED_EVENTS,
        }
    }

    /// The thread a record belongs to, if any.
    pub fn thread_id(&self) -> Option<u32> {
        match *self {
            Record::ThreadInfo { thread_id, .. }
            | Record::ZoneBegin { thread_id, .. }
            | Record::ZoneEnd { thread_id, .. }
            | Record::Marker { thread_id, .. } => Some(thread_id),
            Record::StringDef { .. } | Record::DroppedEvents { .. } => None,
        }
    }

    #[inline]
    pub fn encoded_size(&self) -> usize {
        1 + match self {
            Record::StringDef { name, .. } | Record::ThreadInfo { name, .. } => {
                4 + 2 + truncate_name(name).len()
            }
            Record::ZoneBegin { .. } | Record::Marker { .. } => 4 + 8 + 4,
            Record::ZoneEnd { .. } => 4 + 8,
            Record::DroppedEvents { .. } => 8,
        }
    }

    /// Writes the record into `bytes`, which must be exactly
    /// `self.encoded_size()` long.
    pub fn encode(&self, bytes: &mut [u8]) {
        assert!(bytes.len() == self.encoded_size());

        bytes[0] = self.tag();
        let payload = &mut bytes[1..];

        match *self {
            Record::StringDef { id, ref name } => encode_named(payload, id.0, name),
            Record::ThreadInfo {
                thread_id,
                ref name,
            } => encode_named(payload, thread_id, name),
            Record::ZoneBegin {
                thread_id,
                timestamp,
                name_id,
            }
            | Record::Marker {
                thread_id,
                timestamp,
                name_id,
            } => {
                payload[0..4].copy_from_slice(&thread_id.to_le_bytes());
                payload[4..12].copy_from_slice(&timestamp.to_le_bytes());
                payload[12..16].copy_from_slice(&name_id.0.to_le_bytes());
            }
            Record::ZoneEnd {
                thread_id,
                timestamp,
            } => {
                payload[0..4].copy_from_slice(&thread_id.to_le_bytes());
                payload[4..12].copy_from_slice(&timestamp.to_le_bytes());
            }
            Record::DroppedEvents { total } => {
                payload[0..8].copy_from_slice(&total.to_le_bytes());
            }
        }
    }

    /// Appends the encoded record to `out`.
    pub fn encode_to_vec(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + self.encoded_size(), 0);
        self.encode(&mut out[start..]);
    }

    /// Decodes one record from the start of `bytes`, returning it together
    /// with the number of bytes it occupied. `bytes` is expected to be the
    /// rest of a complete frame, so running out of bytes is an error rather
    /// than a request for more input.
    pub fn decode(bytes: &[u8]) -> Result<(Record, usize), RecordError> {
        let tag = match bytes.first() {
            Some(&tag) => tag,
            None => {
                return Err(RecordError::Truncated {
                    tag: 0,
                    needed: 1,
                    available: 0,
                })
            }
        };
        let payload = &bytes[1..];

        let fixed = match tag {
            TAG_STRING_DEF | TAG_THREAD_INFO => 6,
            TAG_ZONE_BEGIN | TAG_MARKER => 16,
            TAG_ZONE_END => 12,
            TAG_DROPPED_EVENTS => 8,
            _ => return Err(RecordError::InvalidTag(tag)),
        };
        check_len(tag, payload, fixed)?;

        let record = match tag {
            TAG_STRING_DEF | TAG_THREAD_INFO => {
                let id = read_u32(&payload[0..4]);
                let len = u16::from_le_bytes([payload[4], payload[5]]) as usize;
                check_len(tag, payload, fixed + len)?;
                let name = std::str::from_utf8(&payload[6..6 + len])
                    .map_err(|_| RecordError::InvalidUtf8(tag))?
                    .to_owned();
                let record = if tag == TAG_STRING_DEF {
                    Record::StringDef {
                        id: StringId(id),
                        name,
                    }
                } else {
                    Record::ThreadInfo {
                        thread_id: id,
                        name,
                    }
                };
                return Ok((record, 1 + fixed + len));
            }
            TAG_ZONE_BEGIN => Record::ZoneBegin {
                thread_id: read_u32(&payload[0..4]),
                timestamp: read_u64(&payload[4..12]),
                name_id: StringId(read_u32(&payload[12..16])),
            },
            TAG_MARKER => Record::Marker {
                thread_id: read_u32(&payload[0..4]),
                timestamp: read_u64(&payload[4..12]),
                name_id: StringId(read_u32(&payload[12..16])),
            },
            TAG_ZONE_END => Record::ZoneEnd {
                thread_id: read_u32(&payload[0..4]),
                timestamp: read_u64(&payload[4..12]),
            },
            _ => Record::DroppedEvents {
                total: read_u64(&payload[0..8]),
            },
        };

        Ok((record, 1 + fixed))
    }
}

/// Cuts `name` down to what fits in a record, respecting char boundaries.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

fn encode_named(payload: &mut [u8], id: u32, name: &str) {
    let name = truncate_name(name);
    payload[0..4].copy_from_slice(&id.to_le_bytes());
    payload[4..6].copy_from_slice(&(name.len() as u16).to_le_bytes());
    payload[6..].copy_from_slice(name.as_bytes());
}

#[inline]
fn check_len(tag: u8, payload: &[u8], needed: usize) -> Result<(), RecordError> {
    if payload.len() < needed {
        Err(RecordError::Truncated {
            tag,
            needed: needed + 1,
            available: payload.len() + 1,
        })
    } else {
        Ok(())
    }
}

#[inline]
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[0..4].try_into().unwrap())
}

#[inline]
fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[0..8].try_into().unwrap())
}
