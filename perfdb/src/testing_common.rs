//! Helpers shared by the tests of this crate and of the tools built on it.

use crate::dispatcher::Batch;
use crate::{Database, SessionState, Visualizer, VisualizerConfig};
use perfdecode::Parser;
use perfstream::{Recorder, Server, ServerConfig, ServerState};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(30);

/// Parses a complete stream, handshake included, into a batch.
pub fn batch_from_bytes(bytes: &[u8]) -> Batch {
    parse_batch(Parser::new(bytes.len().max(4)), bytes)
}

/// Parses a stream of frames without a handshake into a batch.
pub fn batch_from_frames(bytes: &[u8]) -> Batch {
    parse_batch(Parser::without_handshake(bytes.len().max(4)), bytes)
}

fn parse_batch(mut parser: Parser, bytes: &[u8]) -> Batch {
    let mut batch = Batch::new();
    parser.feed(bytes);

    loop {
        match parser.next() {
            Ok(Some(item)) => batch.push(item),
            Ok(None) => break,
            Err(e) => {
                batch.push_error(&e);
                if e.is_fatal() {
                    break;
                }
            }
        }
    }

    batch
}

/// Builds a database from a complete stream.
pub fn database_from_bytes(bytes: &[u8]) -> Database {
    let db = Database::new();
    db.apply(batch_from_bytes(bytes));
    db
}

const ZONE_NAMES: &[&str] = &["Generic", "Query", "Update", "Draw"];
const MARKER_NAMES: &[&str] = &["Tick", "Flush"];

#[derive(Clone, Debug, PartialEq, Eq)]
enum Expected {
    // In the order the zones are closed.
    Zone { name: &'static str, depth: u32 },
    Marker { name: &'static str },
}

// Record nested zones and markers. This is the part that would run in the
// instrumented application.
fn generate_trace(
    recorder: &Arc<Recorder>,
    num_threads: usize,
    num_stacks: usize,
) -> FxHashMap<u32, Vec<Expected>> {
    let threads: Vec<_> = (0..num_threads)
        .map(|index| {
            let recorder = recorder.clone();
            let thread_id = index as u32 + 1;

            std::thread::spawn(move || {
                recorder.register_thread(thread_id, &format!("worker-{}", index));
                let mut expected = Vec::new();

                for i in 0..num_stacks {
                    pseudo_invocation(&recorder, i + index, thread_id, 0, 4, &mut expected);
                }

                (thread_id, expected)
            })
        })
        .collect();

    threads.into_iter().map(|t| t.join().unwrap()).collect()
}

fn pseudo_invocation(
    recorder: &Recorder,
    random: usize,
    thread_id: u32,
    depth: u32,
    recursions_left: usize,
    expected: &mut Vec<Expected>,
) {
    if recursions_left == 0 {
        return;
    }

    let name = ZONE_NAMES[random % ZONE_NAMES.len()];
    let token = recorder.begin_zone(thread_id, name);
    assert!(token.is_recorded());

    if random % 3 == 0 {
        let marker = MARKER_NAMES[(random / 3) % MARKER_NAMES.len()];
        recorder.marker(thread_id, marker);
        expected.push(Expected::Marker { name: marker });
    }

    // Vary the shape of the stacks.
    let recursions_left = if random % 5 == 0 { 1 } else { recursions_left };
    pseudo_invocation(
        recorder,
        random * 17 + 1,
        thread_id,
        depth + 1,
        recursions_left - 1,
        expected,
    );

    recorder.end_zone(token);
    expected.push(Expected::Zone { name, depth });
}

// Check what arrived in the database. This is the part that would run in
// the viewer.
fn check_database(db: &Database, expected: &FxHashMap<u32, Vec<Expected>>) {
    assert_eq!(db.dropped_events(), 0);
    let stats = db.stats();
    assert_eq!(stats.protocol_errors, 0);
    assert_eq!(stats.invariant_violations, 0);
    assert_eq!(stats.frames_lost, 0);
    assert_eq!(stats.unresolved_references, 0);

    let threads = db.threads();
    let mut thread_ids: Vec<u32> = expected.keys().copied().collect();
    thread_ids.sort_unstable();
    assert_eq!(
        threads.iter().map(|t| t.thread_id).collect::<Vec<_>>(),
        thread_ids
    );

    for thread in &threads {
        let expected = &expected[&thread.thread_id];
        assert_eq!(
            thread.name.as_deref(),
            Some(&format!("worker-{}", thread.thread_id - 1)[..])
        );
        assert_eq!(thread.open_zones, 0);

        let zones = db.zones(thread.thread_id, 0, u64::MAX);
        let markers = db.markers(thread.thread_id, 0, u64::MAX);

        let expected_zones: Vec<_> = expected
            .iter()
            .filter(|e| matches!(e, Expected::Zone { .. }))
            .collect();
        let expected_markers: Vec<_> = expected
            .iter()
            .filter(|e| matches!(e, Expected::Marker { .. }))
            .collect();
        assert_eq!(zones.len(), expected_zones.len());
        assert_eq!(markers.len(), expected_markers.len());

        for (zone, expected) in zones.iter().zip(expected_zones) {
            match *expected {
                Expected::Zone { name, depth } => {
                    assert_eq!(zone.name.as_deref(), Some(name));
                    assert_eq!(zone.zone.depth, depth);
                }
                Expected::Marker { .. } => unreachable!(),
            }
            assert!(zone.zone.end.map_or(false, |end| end >= zone.zone.start));
        }

        // A zone closing right after a deeper one encloses it.
        for pair in zones.windows(2) {
            let (inner, outer) = (&pair[0].zone, &pair[1].zone);
            if outer.depth + 1 == inner.depth {
                assert!(outer.start <= inner.start);
                assert!(outer.end >= inner.end);
            }
        }

        for (marker, expected) in markers.iter().zip(expected_markers) {
            match expected {
                Expected::Marker { name } => assert_eq!(marker.name.as_deref(), Some(*name)),
                Expected::Zone { .. } => unreachable!(),
            }
        }
        for pair in markers.windows(2) {
            assert!(pair[0].marker.timestamp <= pair[1].marker.timestamp);
        }
    }
}

/// Starts a server on an ephemeral port, connects a visualizer, records
/// `num_stacks` nested zone stacks on each of `num_threads` threads and
/// checks that the database ends up with exactly what was recorded.
pub fn run_end_to_end_test(num_threads: usize, num_stacks: usize) {
    let server = Server::new(ServerConfig {
        address: "127.0.0.1:0".to_string(),
        // Small buffers so that hand-offs happen a lot.
        buffer_size: 4096,
        max_buffers: None,
        queue_capacity: 1 << 16,
        flush_interval_ms: 5,
        ..ServerConfig::default()
    });
    let addr = server.start().unwrap();

    let visualizer = Visualizer::new(VisualizerConfig::default());
    let db = visualizer.connect(addr).unwrap();
    assert!(server.wait_for_state(ServerState::Connected, TIMEOUT));

    let expected = generate_trace(server.recorder(), num_threads, num_stacks);

    // Stopping sends whatever is still buffered before hanging up.
    server.stop();
    assert!(visualizer.wait_closed(TIMEOUT));
    assert_eq!(visualizer.state(), SessionState::Closed);
    assert_eq!(server.recorder().dropped_events(), 0);

    check_database(&db, &expected);
}
