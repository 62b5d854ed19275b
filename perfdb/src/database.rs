use crate::dispatcher::{Batch, Dispatcher};
use parking_lot::{Condvar, Mutex, RwLock};
use perfdecode::Metadata;
use perfstream::StringId;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A timed interval on one thread. `end` is `None` while the zone is open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Zone {
    pub start: u64,
    pub end: Option<u64>,
    /// Number of zones that were open on the thread when this one began.
    pub depth: u32,
    pub name_id: StringId,
}

impl Zone {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    pub fn duration(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    /// Whether the zone intersects the inclusive range `[start, end]`. Open
    /// zones extend to infinity.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start <= end && self.end.map_or(true, |zone_end| zone_end >= start)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Marker {
    pub timestamp: u64,
    pub name_id: StringId,
}

/// A zone together with its name, if the name is known yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedZone {
    pub zone: Zone,
    pub name: Option<Arc<str>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedMarker {
    pub marker: Marker,
    pub name: Option<Arc<str>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadSummary {
    pub thread_id: u32,
    pub name: Option<Arc<str>>,
    pub closed_zones: usize,
    pub open_zones: usize,
    pub markers: usize,
    /// Sum of the durations of all closed outermost zones.
    pub busy_time: u64,
}

/// Diagnostic counters. None of the incidents counted here end a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub protocol_errors: u64,
    pub invariant_violations: u64,
    pub frames_lost: u64,
    pub unresolved_references: u64,
    pub records_applied: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ThreadTimeline {
    pub(crate) name: Option<Arc<str>>,
    /// Closed zones in the order they were closed.
    pub(crate) closed: Vec<Zone>,
    pub(crate) open: SmallVec<[Zone; 16]>,
    pub(crate) markers: Vec<Marker>,
    pub(crate) busy_time: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TraceData {
    pub(crate) metadata: Option<Metadata>,
    pub(crate) strings: FxHashMap<StringId, Arc<str>>,
    pub(crate) threads: FxHashMap<u32, ThreadTimeline>,
    pub(crate) dropped_events: u64,
    pub(crate) stats: Stats,
    pub(crate) last_sequence: Option<u32>,
    pub(crate) bounds: Option<(u64, u64)>,
}

impl TraceData {
    fn resolve(&self, id: StringId) -> Option<Arc<str>> {
        self.strings.get(&id).cloned()
    }
}

/// The in-memory trace of one session.
///
/// All data sits behind a single `RwLock`. The worker applies every batch of
/// decoded records under one write lock, and every query takes a read lock
/// and returns owned copies. A reader therefore never sees a partially
/// applied batch and never holds the lock beyond a single call.
///
/// Names are resolved when queried, so a zone recorded before its name was
/// defined picks the name up as soon as the definition arrives.
#[derive(Debug, Default)]
pub struct Database {
    data: RwLock<TraceData>,
    closed: Mutex<bool>,
    closed_changed: Condvar,
}

impl Database {
    pub fn new() -> Database {
        Database::default()
    }

    /// Applies a batch of decoded items in order.
    pub fn apply(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }

        let mut data = self.data.write();
        Dispatcher::new(&mut data).dispatch_batch(batch);
    }

    /// Marks the session as over. The data stays readable.
    pub(crate) fn mark_closed(&self) {
        *self.closed.lock() = true;
        self.closed_changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Blocks until the session is over or `timeout` elapses.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut closed = self.closed.lock();

        while !*closed {
            if self
                .closed_changed
                .wait_until(&mut closed, deadline)
                .timed_out()
            {
                return *closed;
            }
        }

        true
    }

    pub fn metadata(&self) -> Option<Metadata> {
        self.data.read().metadata.clone()
    }

    /// All threads seen so far, sorted by id.
    pub fn threads(&self) -> Vec<ThreadSummary> {
        let data = self.data.read();
        let mut threads: Vec<ThreadSummary> = data
            .threads
            .iter()
            .map(|(&thread_id, thread)| ThreadSummary {
                thread_id,
                name: thread.name.clone(),
                closed_zones: thread.closed.len(),
                open_zones: thread.open.len(),
                markers: thread.markers.len(),
                busy_time: thread.busy_time,
            })
            .collect();

        threads.sort_unstable_by_key(|t| t.thread_id);
        threads
    }

    /// Zones of `thread_id` intersecting `[start, end]`: closed zones in the
    /// order they were closed, then zones still open, outermost first.
    pub fn zones(&self, thread_id: u32, start: u64, end: u64) -> Vec<NamedZone> {
        let data = self.data.read();
        let thread = match data.threads.get(&thread_id) {
            Some(thread) => thread,
            None => return Vec::new(),
        };

        thread
            .closed
            .iter()
            .chain(thread.open.iter())
            .filter(|zone| zone.overlaps(start, end))
            .map(|&zone| NamedZone {
                zone,
                name: data.resolve(zone.name_id),
            })
            .collect()
    }

    /// Markers of `thread_id` with a timestamp in `[start, end]`, in the
    /// order they were recorded.
    pub fn markers(&self, thread_id: u32, start: u64, end: u64) -> Vec<NamedMarker> {
        let data = self.data.read();
        let thread = match data.threads.get(&thread_id) {
            Some(thread) => thread,
            None => return Vec::new(),
        };

        thread
            .markers
            .iter()
            .filter(|marker| marker.timestamp >= start && marker.timestamp <= end)
            .map(|&marker| NamedMarker {
                marker,
                name: data.resolve(marker.name_id),
            })
            .collect()
    }

    pub fn resolve(&self, id: StringId) -> Option<Arc<str>> {
        self.data.read().resolve(id)
    }

    /// Events the producer reported as dropped.
    pub fn dropped_events(&self) -> u64 {
        self.data.read().dropped_events
    }

    pub fn stats(&self) -> Stats {
        self.data.read().stats
    }

    /// Earliest and latest timestamp seen, across all threads.
    pub fn time_bounds(&self) -> Option<(u64, u64)> {
        self.data.read().bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing_common::{batch_from_bytes, batch_from_frames};
    use perfstream::testing_common::FrameBuilder;

    fn database(build: impl FnOnce(&mut FrameBuilder)) -> Database {
        let mut b = FrameBuilder::new();
        build(&mut b);
        let db = Database::new();
        db.apply(batch_from_bytes(&b.into_bytes()));
        db
    }

    #[test]
    fn single_zone() {
        let db = database(|b| {
            b.thread(1, "Main").string(7, "Update").begin(1, 100, 7).end(1, 150);
        });

        let threads = db.threads();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].thread_id, 1);
        assert_eq!(threads[0].name.as_deref(), Some("Main"));
        assert_eq!(threads[0].busy_time, 50);

        let zones = db.zones(1, 0, u64::MAX);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name.as_deref(), Some("Update"));
        assert_eq!(zones[0].zone.start, 100);
        assert_eq!(zones[0].zone.end, Some(150));
        assert_eq!(zones[0].zone.depth, 0);

        assert_eq!(db.time_bounds(), Some((100, 150)));
        assert_eq!(db.metadata().unwrap().cmd, "test cmd");
        assert_eq!(db.stats().records_applied, 4);
    }

    #[test]
    fn range_queries() {
        let db = database(|b| {
            b.string(1, "a").string(2, "m");
            b.begin(1, 10, 1).end(1, 20);
            b.begin(1, 30, 1).marker(1, 35, 2).end(1, 40);
            b.begin(1, 50, 1).begin(1, 55, 1);
        });

        let starts = |start, end| -> Vec<u64> {
            db.zones(1, start, end).iter().map(|z| z.zone.start).collect()
        };

        assert_eq!(starts(0, 5), Vec::<u64>::new());
        assert_eq!(starts(15, 30), vec![10, 30]);
        assert_eq!(starts(21, 29), Vec::<u64>::new());
        // Open zones, outermost first.
        assert_eq!(starts(52, 54), vec![50]);
        assert_eq!(starts(0, u64::MAX), vec![10, 30, 50, 55]);

        let open: Vec<bool> = db
            .zones(1, 0, u64::MAX)
            .iter()
            .map(|z| z.zone.is_open())
            .collect();
        assert_eq!(open, vec![false, false, true, true]);

        assert_eq!(db.markers(1, 0, 34).len(), 0);
        assert_eq!(db.markers(1, 35, 35)[0].name.as_deref(), Some("m"));
        assert!(db.zones(2, 0, u64::MAX).is_empty());
        assert!(db.markers(2, 0, u64::MAX).is_empty());
    }

    #[test]
    fn closed_zones_are_in_close_order() {
        let db = database(|b| {
            b.string(1, "outer").string(2, "inner");
            b.begin(3, 0, 1).begin(3, 1, 2).end(3, 2).end(3, 5);
        });

        let zones = db.zones(3, 0, u64::MAX);
        let names: Vec<_> = zones.iter().map(|z| z.name.as_deref().unwrap()).collect();
        assert_eq!(names, vec!["inner", "outer"]);
        assert_eq!(zones[0].zone.depth, 1);
        assert_eq!(zones[1].zone.depth, 0);
        assert_eq!(zones[1].zone.duration(), Some(5));
        assert_eq!(db.threads()[0].busy_time, 5);
    }

    #[test]
    fn threads_sorted_by_id() {
        let db = database(|b| {
            b.thread(9, "nine").thread(2, "two").string(1, "x").marker(5, 1, 1);
        });

        let ids: Vec<u32> = db.threads().iter().map(|t| t.thread_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert_eq!(db.threads()[1].name, None);
    }

    #[test]
    fn wait_closed() {
        let db = Database::new();
        assert!(!db.wait_closed(Duration::from_millis(10)));
        db.mark_closed();
        assert!(db.is_closed());
        assert!(db.wait_closed(Duration::from_millis(10)));
    }

    #[test]
    fn readers_run_alongside_writer() {
        let db = Arc::new(Database::new());
        db.apply(batch_from_bytes(&{
            let mut b = FrameBuilder::new();
            b.thread(1, "Main").string(1, "z");
            b.into_bytes()
        }));

        let reader = {
            let db = db.clone();
            std::thread::spawn(move || {
                while !db.is_closed() {
                    for zone in db.zones(1, 0, u64::MAX) {
                        assert!(zone.zone.end.map_or(true, |end| end >= zone.zone.start));
                        assert_eq!(zone.name.as_deref(), Some("z"));
                    }
                }
            })
        };

        for i in 0..200u64 {
            let mut b = FrameBuilder::without_handshake();
            b.skip_sequence(i as u32 + 1);
            b.begin(1, i * 10, 1).end(1, i * 10 + 5);
            db.apply(batch_from_frames(&b.into_bytes()));
        }
        db.mark_closed();
        reader.join().unwrap();

        assert_eq!(db.zones(1, 0, u64::MAX).len(), 200);
        assert_eq!(db.stats().frames_lost, 0);
    }
}
