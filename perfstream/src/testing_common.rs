//! Helpers for writing tests against the wire format without a live server.

use crate::protocol::{frame_header, write_handshake, SessionInfo};
use crate::record::{Record, StringId};

/// A `FrameBuilder` produces the exact byte stream a server would send:
/// the handshake followed by frames of records. It is meant for tests and
/// makes no effort to be efficient.
pub struct FrameBuilder {
    bytes: Vec<u8>,
    current: Vec<u8>,
    sequence: u32,
}

impl FrameBuilder {
    /// Starts a stream with a handshake describing a fake process.
    pub fn new() -> FrameBuilder {
        let mut bytes = Vec::new();
        write_handshake(&mut bytes, &test_session_info()).unwrap();
        FrameBuilder::from_bytes(bytes)
    }

    /// Starts a stream without a handshake, e.g. for frame-level tests.
    pub fn without_handshake() -> FrameBuilder {
        FrameBuilder::from_bytes(Vec::new())
    }

    fn from_bytes(bytes: Vec<u8>) -> FrameBuilder {
        FrameBuilder {
            bytes,
            current: Vec::new(),
            sequence: 0,
        }
    }

    /// Appends a record to the frame under construction.
    pub fn record(&mut self, record: Record) -> &mut Self {
        record.encode_to_vec(&mut self.current);
        self
    }

    pub fn string(&mut self, id: u32, name: &str) -> &mut Self {
        self.record(Record::StringDef {
            id: StringId::new(id),
            name: name.to_string(),
        })
    }

    pub fn thread(&mut self, thread_id: u32, name: &str) -> &mut Self {
        self.record(Record::ThreadInfo {
            thread_id,
            name: name.to_string(),
        })
    }

    pub fn begin(&mut self, thread_id: u32, timestamp: u64, name_id: u32) -> &mut Self {
        self.record(Record::ZoneBegin {
            thread_id,
            timestamp,
            name_id: StringId::new(name_id),
        })
    }

    pub fn end(&mut self, thread_id: u32, timestamp: u64) -> &mut Self {
        self.record(Record::ZoneEnd {
            thread_id,
            timestamp,
        })
    }

    pub fn marker(&mut self, thread_id: u32, timestamp: u64, name_id: u32) -> &mut Self {
        self.record(Record::Marker {
            thread_id,
            timestamp,
            name_id: StringId::new(name_id),
        })
    }

    /// Appends raw bytes to the frame under construction, for injecting
    /// corrupt data.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.current.extend_from_slice(bytes);
        self
    }

    /// Closes the frame under construction.
    pub fn frame(&mut self) -> &mut Self {
        let header = frame_header(self.sequence, self.current.len());
        self.bytes.extend_from_slice(&header);
        self.bytes.append(&mut self.current);
        self.sequence = self.sequence.wrapping_add(1);
        self
    }

    /// Skips `n` sequence numbers, as if frames had been lost.
    pub fn skip_sequence(&mut self, n: u32) -> &mut Self {
        self.sequence = self.sequence.wrapping_add(n);
        self
    }

    /// Returns the stream, closing a pending frame first.
    pub fn into_bytes(mut self) -> Vec<u8> {
        if !self.current.is_empty() {
            self.frame();
        }
        self.bytes
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        FrameBuilder::new()
    }
}

pub fn test_session_info() -> SessionInfo {
    SessionInfo {
        start_time: 0,
        process_id: 0,
        cmd: "test cmd".to_string(),
        counter: "wall-time".to_string(),
    }
}
