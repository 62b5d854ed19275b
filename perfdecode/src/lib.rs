//! Decoding of the byte stream produced by `perfstream`.
//!
//! A [`Receiver`] pulls chunks off a connection and hands them to a
//! [`Parser`], which reassembles the handshake and frames regardless of how
//! the bytes were split and yields [`Parsed`] items one at a time.

use serde::{de, Deserialize, Deserializer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

mod error;
mod parser;
mod receiver;

pub use crate::error::ProtocolError;
pub use crate::parser::{Parsed, Parser, ParserState};
pub use crate::receiver::Receiver;

fn system_time_from_nanos<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
where
    D: Deserializer<'de>,
{
    let duration_from_epoch = Duration::from_nanos(u64::deserialize(deserializer)?);
    UNIX_EPOCH
        .checked_add(duration_from_epoch)
        .ok_or_else(|| de::Error::custom("start_time cannot be represented as SystemTime"))
}

fn default_counter() -> String {
    "wall-time".to_string()
}

/// Session description sent by the server in the handshake.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Metadata {
    #[serde(deserialize_with = "system_time_from_nanos")]
    pub start_time: SystemTime,
    pub process_id: u32,
    pub cmd: String,
    #[serde(default = "default_counter")]
    pub counter: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfstream::protocol::SessionInfo;

    #[test]
    fn metadata_from_session_info() {
        let info = SessionInfo {
            start_time: 1_500_000_000,
            process_id: 42,
            cmd: "game --fast".to_string(),
            counter: "wall-time".to_string(),
        };
        let json = serde_json::to_string(&info).unwrap();
        let metadata: Metadata = serde_json::from_str(&json).unwrap();

        assert_eq!(
            metadata.start_time,
            UNIX_EPOCH + Duration::from_nanos(1_500_000_000)
        );
        assert_eq!(metadata.process_id, 42);
        assert_eq!(metadata.cmd, "game --fast");
    }

    #[test]
    fn counter_defaults_to_wall_time() {
        let json = r#"{"start_time":0,"process_id":1,"cmd":""}"#;
        let metadata: Metadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.counter, "wall-time");
    }
}
