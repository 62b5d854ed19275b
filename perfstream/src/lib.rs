//! This crate provides the producer half of a live tracing pipeline.
//!
//! Instrumented code records named *zones* (nested, timed intervals) and
//! *markers* (instants) on a [`Recorder`]. Records are appended to pooled,
//! per-thread buffers, full buffers are queued, and a [`Server`] streams
//! them as length-prefixed frames to a single connected viewer.
//!
//! # Recording
//!
//! ```no_run
//! use perfstream::{Server, ServerConfig};
//!
//! let server = Server::new(ServerConfig::default());
//! server.start().unwrap();
//!
//! let recorder = server.recorder();
//! recorder.register_thread(1, "Main");
//! {
//!     let _zone = recorder.zone(1, "Update");
//!     recorder.marker(1, "Tick");
//! }
//! ```
//!
//! Nothing is recorded while no viewer is connected, each call is then a
//! single atomic load.

mod buffer_pool;
mod config;
mod counters;
mod error;
mod packet_queue;
pub mod protocol;
pub mod record;
mod recorder;
mod sender;
mod server;

pub mod testing_common;

pub use crate::buffer_pool::{Buffer, BufferPool};
pub use crate::config::ServerConfig;
pub use crate::counters::{Counter, WallTime};
pub use crate::error::{CapacityError, TransportError};
pub use crate::packet_queue::PacketQueue;
pub use crate::record::{Record, RecordError, StringId};
pub use crate::recorder::{Recorder, ZoneGuard, ZoneToken};
pub use crate::sender::Sender;
pub use crate::server::{Server, ServerState};
