//! Incremental decoder turning an arbitrarily chunked byte stream into
//! records.
//!
//! The parser is a state machine over a growable scratch buffer:
//!
//! ```ignore
//!   ReadHandshake -> ReadFrameHeader -> ReadFrameBody -> DecodeRecords
//!                          ^                                  |
//!                          +----------------------------------+
//! ```
//!
//! Whenever the bytes needed for the next step have not arrived yet,
//! [`Parser::next`] returns `Ok(None)` and keeps its state. Feeding more
//! bytes resumes exactly where it stopped, so it does not matter where the
//! transport happens to split the stream.
//!
//! Records are only decoded once their whole frame is buffered, which means a
//! record running past the end of its frame is a protocol error and never a
//! reason to wait for more input.

use crate::error::ProtocolError;
use crate::Metadata;
use perfstream::protocol::{
    CURRENT_FORMAT_VERSION, FRAME_LENGTH_SIZE, FRAME_SEQUENCE_SIZE, HANDSHAKE_PREFIX_SIZE,
    STREAM_MAGIC,
};
use perfstream::Record;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParserState {
    ReadHandshake,
    ReadFrameHeader,
    ReadFrameBody {
        body_len: usize,
    },
    DecodeRecords {
        sequence: u32,
        /// Offset of the next record within the frame body.
        offset: usize,
        /// Body bytes left to decode.
        remaining: usize,
    },
    /// A fatal error occurred; nothing more will be decoded.
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Parsed {
    Handshake(Metadata),
    FrameStart { sequence: u32 },
    Record(Record),
}

/// Bytes received but not yet consumed.
#[derive(Default, Debug)]
struct ParserData {
    scratch: Vec<u8>,
    pos: usize,
}

impl ParserData {
    #[inline]
    fn available(&self) -> &[u8] {
        &self.scratch[self.pos..]
    }

    #[inline]
    fn consume(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.scratch.len());
        self.pos += n;
    }

    fn append(&mut self, bytes: &[u8]) {
        // Drop consumed bytes once they make up half of the buffer, so the
        // scratch buffer does not grow with the length of the session.
        if self.pos > 0 && self.pos * 2 >= self.scratch.len() {
            self.scratch.drain(..self.pos);
            self.pos = 0;
        }
        self.scratch.extend_from_slice(bytes);
    }
}

#[derive(Debug)]
pub struct Parser {
    state: ParserState,
    data: ParserData,
    max_frame_len: usize,
}

impl Parser {
    /// A parser for a full connection, starting with the handshake.
    pub fn new(max_frame_len: usize) -> Parser {
        Parser {
            state: ParserState::ReadHandshake,
            data: ParserData::default(),
            max_frame_len,
        }
    }

    /// A parser for a stream of frames with no handshake in front.
    pub fn without_handshake(max_frame_len: usize) -> Parser {
        Parser {
            state: ParserState::ReadFrameHeader,
            ..Parser::new(max_frame_len)
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn is_failed(&self) -> bool {
        self.state == ParserState::Failed
    }

    /// Number of received bytes not consumed yet.
    pub fn buffered_len(&self) -> usize {
        self.data.available().len()
    }

    /// Whether the parser sits exactly between two frames, i.e. the stream
    /// could end here without losing a partial frame.
    pub fn at_frame_boundary(&self) -> bool {
        self.state == ParserState::ReadFrameHeader && self.buffered_len() == 0
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        if self.state != ParserState::Failed {
            self.data.append(bytes);
        }
    }

    /// Decodes the next item. `Ok(None)` means more input is needed (or the
    /// parser has failed). After a non-fatal error the rest of the offending
    /// frame has been skipped and parsing can simply continue.
    pub fn next(&mut self) -> Result<Option<Parsed>, ProtocolError> {
        loop {
            match self.state {
                ParserState::ReadHandshake => return self.read_handshake(),

                ParserState::ReadFrameHeader => {
                    let available = self.data.available();
                    if available.len() < FRAME_LENGTH_SIZE {
                        return Ok(None);
                    }

                    let body_len = read_u32(available) as usize;
                    self.data.consume(FRAME_LENGTH_SIZE);

                    if body_len > self.max_frame_len {
                        self.state = ParserState::Failed;
                        return Err(ProtocolError::FrameTooLarge {
                            sequence: None,
                            len: body_len,
                            max: self.max_frame_len,
                        });
                    }

                    self.state = ParserState::ReadFrameBody { body_len };
                }

                ParserState::ReadFrameBody { body_len } => {
                    let available = self.data.available();
                    if available.len() < body_len {
                        return Ok(None);
                    }

                    if body_len < FRAME_SEQUENCE_SIZE {
                        self.data.consume(body_len);
                        self.state = ParserState::ReadFrameHeader;
                        return Err(ProtocolError::FrameTooShort(body_len));
                    }

                    let sequence = read_u32(available);
                    self.data.consume(FRAME_SEQUENCE_SIZE);
                    log::debug!("frame {}: {} bytes", sequence, body_len);
                    self.state = ParserState::DecodeRecords {
                        sequence,
                        offset: FRAME_SEQUENCE_SIZE,
                        remaining: body_len - FRAME_SEQUENCE_SIZE,
                    };

                    return Ok(Some(Parsed::FrameStart { sequence }));
                }

                ParserState::DecodeRecords {
                    sequence,
                    offset,
                    remaining,
                } => {
                    if remaining == 0 {
                        self.state = ParserState::ReadFrameHeader;
                        continue;
                    }

                    let body = &self.data.available()[..remaining];
                    match Record::decode(body) {
                        Ok((record, len)) => {
                            self.data.consume(len);
                            self.state = ParserState::DecodeRecords {
                                sequence,
                                offset: offset + len,
                                remaining: remaining - len,
                            };
                            return Ok(Some(Parsed::Record(record)));
                        }
                        Err(source) => {
                            // Records are not self-delimiting once the tag is
                            // bad, so resynchronize at the next frame.
                            self.data.consume(remaining);
                            self.state = ParserState::ReadFrameHeader;
                            return Err(ProtocolError::Record {
                                sequence,
                                offset,
                                source,
                            });
                        }
                    }
                }

                ParserState::Failed => return Ok(None),
            }
        }
    }

    fn read_handshake(&mut self) -> Result<Option<Parsed>, ProtocolError> {
        let available = self.data.available();
        if available.len() < HANDSHAKE_PREFIX_SIZE {
            return Ok(None);
        }

        let magic: [u8; 4] = available[0..4].try_into().unwrap();
        if &magic != STREAM_MAGIC {
            self.state = ParserState::Failed;
            return Err(ProtocolError::BadMagic(magic));
        }

        let version = read_u32(&available[4..8]);
        if version != CURRENT_FORMAT_VERSION {
            self.state = ParserState::Failed;
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let metadata_len = read_u32(&available[8..12]) as usize;
        if metadata_len > self.max_frame_len {
            self.state = ParserState::Failed;
            return Err(ProtocolError::BadMetadata(format!(
                "{} bytes of metadata exceed the limit of {}",
                metadata_len, self.max_frame_len
            )));
        }

        let total = HANDSHAKE_PREFIX_SIZE + metadata_len;
        if available.len() < total {
            return Ok(None);
        }

        let metadata: Metadata =
            match serde_json::from_slice(&available[HANDSHAKE_PREFIX_SIZE..total]) {
                Ok(metadata) => metadata,
                Err(e) => {
                    self.state = ParserState::Failed;
                    return Err(ProtocolError::BadMetadata(e.to_string()));
                }
            };

        self.data.consume(total);
        self.state = ParserState::ReadFrameHeader;
        Ok(Some(Parsed::Handshake(metadata)))
    }
}

#[inline]
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[0..4].try_into().unwrap())
}
