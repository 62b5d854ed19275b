use perfstream::RecordError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("stream does not start with the expected magic bytes, found {0:?}")]
    BadMagic([u8; 4]),
    #[error("stream format version {0} is not supported by this version of perfdecode")]
    UnsupportedVersion(u32),
    #[error("could not parse session metadata: {0}")]
    BadMetadata(String),
    #[error("frame {sequence:?} declares {len} bytes, more than the limit of {max}")]
    FrameTooLarge {
        sequence: Option<u32>,
        len: usize,
        max: usize,
    },
    #[error("frame body of {0} bytes is too short to hold a sequence number")]
    FrameTooShort(usize),
    #[error("bad record in frame {sequence} at offset {offset}: {source}")]
    Record {
        sequence: u32,
        offset: usize,
        #[source]
        source: RecordError,
    },
}

impl ProtocolError {
    /// Fatal errors leave the parser unable to find the next frame boundary,
    /// so the session has to end. After any other error, parsing continues
    /// with the next frame.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::BadMagic(_)
            | ProtocolError::UnsupportedVersion(_)
            | ProtocolError::BadMetadata(_)
            | ProtocolError::FrameTooLarge { .. } => true,
            ProtocolError::FrameTooShort(_) | ProtocolError::Record { .. } => false,
        }
    }
}
