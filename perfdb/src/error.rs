use thiserror::Error;

/// Input that decodes fine but breaks the rules of a trace. The database
/// repairs what it can and counts the incident; none of these end a session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("zone end on thread {thread_id} at {timestamp} without an open zone")]
    ZoneEndWithoutBegin { thread_id: u32, timestamp: u64 },
    #[error("string id {id} redefined as {name:?}, keeping {existing:?}")]
    DuplicateStringId {
        id: u32,
        existing: String,
        name: String,
    },
    #[error("zone on thread {thread_id} ends at {end}, before its start at {start}")]
    EndBeforeStart { thread_id: u32, start: u64, end: u64 },
}
