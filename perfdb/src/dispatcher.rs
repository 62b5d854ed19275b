use crate::database::{Marker, ThreadTimeline, TraceData, Zone};
use crate::error::InvariantViolation;
use perfdecode::{Parsed, ProtocolError};
use perfstream::{Record, StringId};
use std::collections::hash_map::Entry;
use std::sync::Arc;

/// Decoded items waiting to be applied to a [`Database`](crate::Database)
/// in one go.
#[derive(Debug, Default)]
pub struct Batch {
    items: Vec<Parsed>,
    protocol_errors: u64,
}

impl Batch {
    pub fn new() -> Batch {
        Batch::default()
    }

    pub fn push(&mut self, item: Parsed) {
        self.items.push(item);
    }

    /// Counts a protocol error the parser recovered from.
    pub fn push_error(&mut self, error: &ProtocolError) {
        log::warn!("protocol error: {}", error);
        self.protocol_errors += 1;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.protocol_errors == 0
    }
}

/// Maps decoded items onto mutations of the trace data. Every incident it
/// cannot apply as-is is logged and counted, never returned.
pub(crate) struct Dispatcher<'a> {
    data: &'a mut TraceData,
}

impl<'a> Dispatcher<'a> {
    pub(crate) fn new(data: &'a mut TraceData) -> Dispatcher<'a> {
        Dispatcher { data }
    }

    pub(crate) fn dispatch_batch(&mut self, batch: Batch) {
        self.data.stats.protocol_errors += batch.protocol_errors;
        for item in batch.items {
            self.dispatch(item);
        }
    }

    pub(crate) fn dispatch(&mut self, item: Parsed) {
        match item {
            Parsed::Handshake(metadata) => {
                log::info!(
                    "session with process {} ({})",
                    metadata.process_id,
                    metadata.cmd.trim_end()
                );
                self.data.metadata = Some(metadata);
            }
            Parsed::FrameStart { sequence } => self.frame_start(sequence),
            Parsed::Record(record) => {
                self.data.stats.records_applied += 1;
                if let Err(violation) = self.apply(record) {
                    log::warn!("{}", violation);
                    self.data.stats.invariant_violations += 1;
                }
            }
        }
    }

    /// Applies one record. A violation that could be repaired has already
    /// been repaired when it is returned.
    fn apply(&mut self, record: Record) -> Result<(), InvariantViolation> {
        match record {
            Record::StringDef { id, name } => self.define_string(id, name),

            Record::ThreadInfo { thread_id, name } => {
                self.thread(thread_id).name = Some(Arc::from(name));
                Ok(())
            }

            Record::ZoneBegin {
                thread_id,
                timestamp,
                name_id,
            } => {
                self.check_name(name_id);
                self.extend_bounds(timestamp);

                let thread = self.thread(thread_id);
                let depth = thread.open.len() as u32;
                thread.open.push(Zone {
                    start: timestamp,
                    end: None,
                    depth,
                    name_id,
                });
                Ok(())
            }

            Record::ZoneEnd {
                thread_id,
                timestamp,
            } => self.end_zone(thread_id, timestamp),

            Record::Marker {
                thread_id,
                timestamp,
                name_id,
            } => {
                self.check_name(name_id);
                self.extend_bounds(timestamp);
                self.thread(thread_id).markers.push(Marker { timestamp, name_id });
                Ok(())
            }

            Record::DroppedEvents { total } => {
                // The producer reports a running total.
                self.data.dropped_events = self.data.dropped_events.max(total);
                Ok(())
            }
        }
    }

    fn define_string(&mut self, id: StringId, name: String) -> Result<(), InvariantViolation> {
        match self.data.strings.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::from(name));
                Ok(())
            }
            Entry::Occupied(entry) => Err(InvariantViolation::DuplicateStringId {
                id: id.as_u32(),
                existing: entry.get().to_string(),
                name,
            }),
        }
    }

    fn end_zone(&mut self, thread_id: u32, timestamp: u64) -> Result<(), InvariantViolation> {
        let without_begin = InvariantViolation::ZoneEndWithoutBegin {
            thread_id,
            timestamp,
        };
        let (thread, mut zone) = match self.data.threads.get_mut(&thread_id) {
            Some(thread) => match thread.open.pop() {
                Some(zone) => (thread, zone),
                None => return Err(without_begin),
            },
            None => return Err(without_begin),
        };

        let end = timestamp.max(zone.start);
        zone.end = Some(end);
        if zone.depth == 0 {
            thread.busy_time += end - zone.start;
        }
        thread.closed.push(zone);
        self.extend_bounds(end);

        if timestamp < zone.start {
            return Err(InvariantViolation::EndBeforeStart {
                thread_id,
                start: zone.start,
                end: timestamp,
            });
        }

        Ok(())
    }

    fn frame_start(&mut self, sequence: u32) {
        let expected = self.data.last_sequence.map_or(0, |last| last.wrapping_add(1));
        if sequence != expected {
            let lost = sequence.wrapping_sub(expected);
            log::warn!("{} frame(s) lost before frame {}", lost, sequence);
            self.data.stats.frames_lost += u64::from(lost);
        }

        self.data.last_sequence = Some(sequence);
    }

    /// Counts references to names that are not defined (yet).
    fn check_name(&mut self, name_id: StringId) {
        if !self.data.strings.contains_key(&name_id) {
            log::debug!("reference to undefined string {}", name_id.as_u32());
            self.data.stats.unresolved_references += 1;
        }
    }

    fn extend_bounds(&mut self, timestamp: u64) {
        self.data.bounds = Some(match self.data.bounds {
            Some((min, max)) => (min.min(timestamp), max.max(timestamp)),
            None => (timestamp, timestamp),
        });
    }

    fn thread(&mut self, thread_id: u32) -> &mut ThreadTimeline {
        self.data.threads.entry(thread_id).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing_common::batch_from_frames;
    use crate::Database;
    use perfstream::testing_common::FrameBuilder;

    fn apply(build: impl FnOnce(&mut FrameBuilder)) -> Database {
        let mut b = FrameBuilder::without_handshake();
        build(&mut b);
        let db = Database::new();
        db.apply(batch_from_frames(&b.into_bytes()));
        db
    }

    #[test]
    fn duplicate_string_keeps_first_name() {
        let db = apply(|b| {
            b.string(1, "first").string(1, "second").marker(1, 0, 1);
        });

        assert_eq!(db.resolve(StringId::new(1)).as_deref(), Some("first"));
        assert_eq!(db.stats().invariant_violations, 1);
        assert_eq!(db.markers(1, 0, 0)[0].name.as_deref(), Some("first"));
    }

    #[test]
    fn end_without_begin_is_ignored() {
        let db = apply(|b| {
            b.string(1, "z").end(1, 5).begin(1, 10, 1).end(1, 20).end(1, 30);
        });

        let zones = db.zones(1, 0, u64::MAX);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].zone.end, Some(20));
        assert_eq!(db.stats().invariant_violations, 2);
        assert_eq!(db.stats().records_applied, 5);
    }

    #[test]
    fn end_before_start_is_clamped() {
        let db = apply(|b| {
            b.string(1, "z").begin(1, 100, 1).end(1, 90);
        });

        let zones = db.zones(1, 0, u64::MAX);
        assert_eq!(zones[0].zone.start, 100);
        assert_eq!(zones[0].zone.end, Some(100));
        assert_eq!(zones[0].zone.duration(), Some(0));
        assert_eq!(db.stats().invariant_violations, 1);
    }

    #[test]
    fn names_resolve_once_defined() {
        let db = apply(|b| {
            b.begin(1, 1, 9).marker(1, 2, 9).end(1, 3);
        });

        assert_eq!(db.stats().unresolved_references, 2);
        assert_eq!(db.zones(1, 0, u64::MAX)[0].name, None);

        let mut b = FrameBuilder::without_handshake();
        b.skip_sequence(1).string(9, "late");
        db.apply(batch_from_frames(&b.into_bytes()));

        assert_eq!(db.zones(1, 0, u64::MAX)[0].name.as_deref(), Some("late"));
        assert_eq!(db.markers(1, 0, u64::MAX)[0].name.as_deref(), Some("late"));
        assert_eq!(db.stats().frames_lost, 0);
    }

    #[test]
    fn sequence_gaps_count_lost_frames() {
        let db = apply(|b| {
            b.string(1, "x").frame();
            b.skip_sequence(3).marker(1, 1, 1).frame();
            b.marker(1, 2, 1).frame();
        });

        assert_eq!(db.stats().frames_lost, 3);
        assert_eq!(db.markers(1, 0, u64::MAX).len(), 2);
    }

    #[test]
    fn dropped_events_total() {
        let db = apply(|b| {
            b.record(Record::DroppedEvents { total: 4 });
            b.record(Record::DroppedEvents { total: 11 });
        });
        assert_eq!(db.dropped_events(), 11);
    }

    #[test]
    fn nesting_depths() {
        let db = apply(|b| {
            b.string(1, "z");
            b.begin(1, 0, 1).begin(1, 1, 1).begin(1, 2, 1);
            b.end(1, 3).begin(1, 4, 1).end(1, 5).end(1, 6).end(1, 7);
        });

        let depths: Vec<u32> = db
            .zones(1, 0, u64::MAX)
            .iter()
            .map(|z| z.zone.depth)
            .collect();
        assert_eq!(depths, vec![2, 2, 1, 0]);
        assert_eq!(db.threads()[0].busy_time, 7);
    }

    #[test]
    fn protocol_errors_are_counted() {
        let mut b = FrameBuilder::without_handshake();
        b.raw(&[0xFF]).frame();
        b.marker(1, 1, 1).frame();

        let db = Database::new();
        db.apply(batch_from_frames(&b.into_bytes()));

        assert_eq!(db.stats().protocol_errors, 1);
        assert_eq!(db.markers(1, 0, u64::MAX).len(), 1);
    }
}
