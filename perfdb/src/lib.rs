//! This crate provides the viewer half of the tracing pipeline.
//!
//! # Collecting a trace
//!
//! A [`Visualizer`] connects to a running `perfstream` server and fills a
//! [`Database`] from a background [`Worker`] for as long as the producer
//! stays connected:
//!
//! ```no_run
//! use perfdb::{Visualizer, VisualizerConfig};
//! use std::time::Duration;
//!
//! let visualizer = Visualizer::new(VisualizerConfig::default());
//! let db = visualizer.connect("127.0.0.1:28077").unwrap();
//! visualizer.wait_closed(Duration::from_secs(10));
//!
//! for thread in db.threads() {
//!     for zone in db.zones(thread.thread_id, 0, u64::MAX) {
//!         println!("{:?} {:?}", zone.name, zone.zone.duration());
//!     }
//! }
//! ```
//!
//! The database can be queried at any time, also while the worker is still
//! writing to it.

mod config;
mod database;
mod dispatcher;
mod error;
mod visualizer;
mod worker;

pub mod testing_common;

pub use crate::config::VisualizerConfig;
pub use crate::database::{
    Database, Marker, NamedMarker, NamedZone, Stats, ThreadSummary, Zone,
};
pub use crate::dispatcher::Batch;
pub use crate::error::InvariantViolation;
pub use crate::visualizer::{SessionState, Visualizer};
pub use crate::worker::Worker;

pub use perfdecode::Metadata;
pub use perfstream::StringId;
