use crate::buffer_pool::{Buffer, BufferPool};
use crate::counters::Counter;
use crate::packet_queue::PacketQueue;
use crate::record::{truncate_name, Record, StringId};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// The API instrumented code calls to record zones and markers.
///
/// Every profiled thread gets its own context (looked up by thread id)
/// holding the buffer its records are appended to. A full buffer is pushed
/// onto the [`PacketQueue`] without blocking and a fresh one is taken from
/// the [`BufferPool`]. When no buffer can be had, or the queue is full, the
/// affected records are dropped and counted instead.
///
/// Names are interned into a string table that is private to the current
/// session. The `StringDef` records introducing new names, as well as
/// `ThreadInfo` records, go into a shared control buffer, and that buffer is
/// always queued ahead of any thread buffer. This way a name is on the wire
/// before the first record referring to it.
pub struct Recorder {
    pool: Arc<BufferPool>,
    queue: Arc<PacketQueue>,
    counter: Counter,
    high_water_mark: usize,
    enabled: AtomicBool,
    epoch: AtomicU32,
    dropped: AtomicU64,
    threads: RwLock<FxHashMap<u32, Arc<Mutex<ThreadContext>>>>,
    strings: Mutex<StringTableBuilder>,
}

struct ThreadContext {
    thread_id: u32,
    name: Option<String>,
    epoch: u32,
    buffer: Option<Buffer>,
    // Per-thread cache of `strings.ids`, valid for `epoch` only.
    names: FxHashMap<String, StringId>,
    // Serial number the next recorded ZoneBegin gets.
    begins: u64,
    // Serial of the first ZoneBegin in `buffer`.
    buffer_first_begin: u64,
    // Serials of begins that went down with a discarded buffer, ascending.
    lost_begins: Vec<Range<u64>>,
}

impl ThreadContext {
    /// Whether the begin numbered `serial` was discarded. Zones nest, so
    /// every begin after `serial` has been ended by now and is forgotten.
    fn take_lost_begin(&mut self, serial: u64) -> bool {
        self.lost_begins.retain(|lost| lost.start <= serial);

        match self.lost_begins.last_mut() {
            Some(lost) if lost.contains(&serial) => {
                lost.end = serial;
                if lost.is_empty() {
                    self.lost_begins.pop();
                }
                true
            }
            _ => false,
        }
    }
}

struct StringTableBuilder {
    ids: FxHashMap<String, StringId>,
    next_id: u32,
    control: Option<Buffer>,
    pending: VecDeque<Buffer>,
}

/// Returned by [`Recorder::begin_zone`], consumed by [`Recorder::end_zone`].
#[must_use]
#[derive(Debug)]
pub struct ZoneToken {
    thread_id: u32,
    epoch: u32,
    serial: u64,
    recorded: bool,
}

impl ZoneToken {
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Whether the zone's begin record made it into a buffer. Tokens that
    /// were not recorded end without emitting anything.
    pub fn is_recorded(&self) -> bool {
        self.recorded
    }
}

/// When dropped, this `ZoneGuard` ends the zone it was created for.
#[must_use]
pub struct ZoneGuard<'a> {
    recorder: &'a Recorder,
    token: Option<ZoneToken>,
}

impl<'a> Drop for ZoneGuard<'a> {
    #[inline]
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.recorder.end_zone(token);
        }
    }
}

impl Recorder {
    pub fn new(pool: Arc<BufferPool>, queue: Arc<PacketQueue>, high_water_mark: usize) -> Recorder {
        Self::with_counter(pool, queue, high_water_mark, Counter::default())
    }

    pub fn with_counter(
        pool: Arc<BufferPool>,
        queue: Arc<PacketQueue>,
        high_water_mark: usize,
        counter: Counter,
    ) -> Recorder {
        let high_water_mark = high_water_mark.clamp(1, pool.buffer_size());

        Recorder {
            pool,
            queue,
            counter,
            high_water_mark,
            enabled: AtomicBool::new(false),
            epoch: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
            threads: RwLock::new(FxHashMap::default()),
            strings: Mutex::new(StringTableBuilder {
                ids: FxHashMap::default(),
                next_id: 1,
                control: None,
                pending: VecDeque::new(),
            }),
        }
    }

    /// Current timestamp in ticks of the recorder's counter.
    #[inline]
    pub fn now(&self) -> u64 {
        self.counter.since_start()
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Total number of records dropped because no buffer was available or
    /// the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    /// Starts a new session: clears the string table, discards anything
    /// buffered so far and re-announces every named thread. Called by the
    /// server once a viewer is connected.
    pub fn enable(&self) {
        self.reset();
        self.enabled.store(true, Ordering::Release);

        let contexts: Vec<_> = self.threads.read().values().cloned().collect();
        for ctx in contexts {
            let ctx = ctx.lock();
            if let Some(name) = &ctx.name {
                self.announce_thread(ctx.thread_id, name);
            }
        }
    }

    /// Stops recording and discards anything buffered. Every recording call
    /// made while disabled costs a single atomic load.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.reset();
    }

    fn reset(&self) {
        let epoch = {
            let mut strings = self.strings.lock();
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            strings.ids.clear();
            strings.next_id = 1;
            if let Some(control) = strings.control.take() {
                self.pool.release(control);
            }
            for buffer in strings.pending.drain(..) {
                self.pool.release(buffer);
            }
            epoch
        };

        let contexts: Vec<_> = self.threads.read().values().cloned().collect();
        for ctx in contexts {
            let mut ctx = ctx.lock();
            self.start_epoch(&mut ctx, epoch);
        }
    }

    fn start_epoch(&self, ctx: &mut ThreadContext, epoch: u32) {
        if ctx.epoch == epoch {
            return;
        }
        ctx.epoch = epoch;
        ctx.names.clear();
        ctx.begins = 0;
        ctx.buffer_first_begin = 0;
        ctx.lost_begins.clear();
        if let Some(buffer) = ctx.buffer.take() {
            self.pool.release(buffer);
        }
    }

    /// Registers `thread_id` under a display name. The name is sent to the
    /// viewer now if a session is active, and again at the start of every
    /// later session.
    pub fn register_thread(&self, thread_id: u32, name: &str) {
        let ctx = self.thread_context(thread_id);
        let mut ctx = ctx.lock();
        ctx.name = Some(name.to_owned());

        if self.is_enabled() {
            self.announce_thread(thread_id, name);
        }
    }

    /// Hands off whatever the thread has buffered and forgets its context.
    pub fn deregister_thread(&self, thread_id: u32) {
        let ctx = self.threads.write().remove(&thread_id);

        if let Some(ctx) = ctx {
            let mut ctx = ctx.lock();
            if let Some(buffer) = ctx.buffer.take() {
                self.hand_off(buffer);
            }
        }
    }

    pub fn registered_threads(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.threads.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Records the start of a zone named `name` on `thread_id`.
    #[inline]
    pub fn begin_zone(&self, thread_id: u32, name: &str) -> ZoneToken {
        if !self.is_enabled() {
            return ZoneToken {
                thread_id,
                epoch: 0,
                serial: 0,
                recorded: false,
            };
        }

        let timestamp = self.now();
        let (epoch, serial, recorded) = self.write_named(thread_id, name, |name_id| Record::ZoneBegin {
            thread_id,
            timestamp,
            name_id,
        });

        ZoneToken {
            thread_id,
            epoch,
            serial,
            recorded,
        }
    }

    /// Records the end of the zone `token` was issued for. Tokens from an
    /// earlier session, or whose begin was dropped (possibly together with
    /// the buffer holding it), are ignored so that the viewer never sees an
    /// end without a begin.
    #[inline]
    pub fn end_zone(&self, token: ZoneToken) {
        if !token.recorded || !self.is_enabled() {
            return;
        }

        let timestamp = self.now();
        let record = Record::ZoneEnd {
            thread_id: token.thread_id,
            timestamp,
        };

        let ctx = self.thread_context(token.thread_id);
        let mut ctx = ctx.lock();
        if ctx.epoch != token.epoch || self.epoch.load(Ordering::Acquire) != token.epoch {
            return;
        }
        if ctx.take_lost_begin(token.serial) {
            return;
        }
        if !self.append(&mut ctx, &record) {
            self.count_dropped(1);
        }
    }

    /// Begins a zone that ends when the returned guard is dropped.
    #[inline]
    pub fn zone(&self, thread_id: u32, name: &str) -> ZoneGuard<'_> {
        ZoneGuard {
            recorder: self,
            token: Some(self.begin_zone(thread_id, name)),
        }
    }

    /// Records an instantaneous event.
    #[inline]
    pub fn marker(&self, thread_id: u32, name: &str) {
        if !self.is_enabled() {
            return;
        }

        let timestamp = self.now();
        self.write_named(thread_id, name, |name_id| Record::Marker {
            thread_id,
            timestamp,
            name_id,
        });
    }

    /// Queues every non-empty thread buffer along with pending names, so
    /// that records from idle threads do not linger.
    pub fn flush(&self) {
        let contexts: Vec<_> = self.threads.read().values().cloned().collect();

        for ctx in contexts {
            let mut ctx = ctx.lock();
            let non_empty = ctx.buffer.as_ref().map_or(false, |b| !b.is_empty());
            if non_empty {
                if let Some(buffer) = ctx.buffer.take() {
                    self.hand_off_thread(&mut ctx, buffer);
                }
            }
        }

        let mut strings = self.strings.lock();
        self.queue_control(&mut strings);
    }

    fn thread_context(&self, thread_id: u32) -> Arc<Mutex<ThreadContext>> {
        if let Some(ctx) = self.threads.read().get(&thread_id) {
            return ctx.clone();
        }

        self.threads
            .write()
            .entry(thread_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(ThreadContext {
                    thread_id,
                    name: None,
                    epoch: self.epoch.load(Ordering::Acquire),
                    buffer: None,
                    names: FxHashMap::default(),
                    begins: 0,
                    buffer_first_begin: 0,
                    lost_begins: Vec::new(),
                }))
            })
            .clone()
    }

    /// Resolves `name` and appends the record `make` builds from its id.
    /// Returns the epoch the record belongs to, the serial a ZoneBegin gets
    /// and whether the record was written.
    fn write_named<F>(&self, thread_id: u32, name: &str, make: F) -> (u32, u64, bool)
    where
        F: FnOnce(StringId) -> Record,
    {
        let ctx = self.thread_context(thread_id);
        let mut ctx = ctx.lock();

        let epoch = self.epoch.load(Ordering::Acquire);
        self.start_epoch(&mut ctx, epoch);

        let name_id = match ctx.names.get(name) {
            Some(&id) => Some(id),
            None => {
                let id = self.intern(name);
                if let Some(id) = id {
                    ctx.names.insert(name.to_owned(), id);
                }
                id
            }
        };

        let serial = ctx.begins;
        let written = match name_id {
            Some(name_id) => self.append(&mut ctx, &make(name_id)),
            None => false,
        };

        if !written {
            self.count_dropped(1);
        }

        (epoch, serial, written)
    }

    fn intern(&self, name: &str) -> Option<StringId> {
        let mut strings = self.strings.lock();

        if let Some(&id) = strings.ids.get(name) {
            return Some(id);
        }

        let id = StringId::new(strings.next_id);
        let def = Record::StringDef {
            id,
            name: truncate_name(name).to_owned(),
        };

        if !self.write_control(&mut strings, &def) {
            return None;
        }

        strings.next_id += 1;
        strings.ids.insert(name.to_owned(), id);
        Some(id)
    }

    fn announce_thread(&self, thread_id: u32, name: &str) {
        let record = Record::ThreadInfo {
            thread_id,
            name: truncate_name(name).to_owned(),
        };

        let mut strings = self.strings.lock();
        if !self.write_control(&mut strings, &record) {
            self.count_dropped(1);
        }
    }

    fn write_control(&self, strings: &mut StringTableBuilder, record: &Record) -> bool {
        if let Some(control) = strings.control.as_mut() {
            if control.push_record(record) {
                return true;
            }
        }

        if let Some(full) = strings.control.take() {
            strings.pending.push_back(full);
        }

        match self.pool.acquire() {
            Ok(mut control) => {
                let written = control.push_record(record);
                strings.control = Some(control);
                if !written {
                    log::warn!(
                        "record of {} bytes does not fit into a {} byte buffer",
                        record.encoded_size(),
                        self.pool.buffer_size()
                    );
                }
                written
            }
            Err(_) => false,
        }
    }

    /// Appends `record` to the thread's buffer, handing the buffer off when
    /// it is full or past the high-water mark.
    fn append(&self, ctx: &mut ThreadContext, record: &Record) -> bool {
        let mut buffer = match ctx.buffer.take() {
            Some(buffer) => buffer,
            None => match self.pool.acquire() {
                Ok(buffer) => {
                    ctx.buffer_first_begin = ctx.begins;
                    buffer
                }
                Err(_) => return false,
            },
        };

        if !buffer.push_record(record) {
            // Does not fit any more; ship what we have and start over.
            self.hand_off_thread(ctx, buffer);
            buffer = match self.pool.acquire() {
                Ok(buffer) => buffer,
                Err(_) => return false,
            };
            ctx.buffer_first_begin = ctx.begins;
            if !buffer.push_record(record) {
                self.pool.release(buffer);
                return false;
            }
        }

        if let Record::ZoneBegin { .. } = record {
            ctx.begins += 1;
        }

        if buffer.len() >= self.high_water_mark {
            self.hand_off_thread(ctx, buffer);
        } else {
            ctx.buffer = Some(buffer);
        }

        true
    }

    /// Hands off the thread's current buffer. If it gets discarded, the
    /// begins it held are remembered so their ends are not sent either.
    fn hand_off_thread(&self, ctx: &mut ThreadContext, buffer: Buffer) {
        if !self.hand_off(buffer) && ctx.buffer_first_begin < ctx.begins {
            ctx.lost_begins.push(ctx.buffer_first_begin..ctx.begins);
        }
        ctx.buffer_first_begin = ctx.begins;
    }

    /// Queues a thread buffer behind all pending control data. If the
    /// control data cannot be queued, the thread buffer is dropped as it
    /// might refer to names the viewer would never see. Returns `false` if
    /// the buffer was dropped.
    fn hand_off(&self, buffer: Buffer) -> bool {
        if buffer.is_empty() {
            self.pool.release(buffer);
            return true;
        }

        let mut strings = self.strings.lock();

        if !self.queue_control(&mut strings) {
            self.discard(buffer);
            return false;
        }

        match self.queue.try_push(buffer) {
            Ok(()) => true,
            Err(buffer) => {
                self.discard(buffer);
                false
            }
        }
    }

    /// Pushes the current and all full control buffers. Returns `false` if
    /// some of them are still pending.
    fn queue_control(&self, strings: &mut StringTableBuilder) -> bool {
        if let Some(control) = strings.control.take() {
            if control.is_empty() {
                strings.control = Some(control);
            } else {
                strings.pending.push_back(control);
            }
        }

        while let Some(control) = strings.pending.pop_front() {
            if let Err(control) = self.queue.try_push(control) {
                strings.pending.push_front(control);
                return false;
            }
        }

        true
    }

    fn discard(&self, buffer: Buffer) {
        self.count_dropped(buffer.record_count() as u64);
        self.pool.release(buffer);
    }

    #[inline]
    fn count_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }
}

// Make sure that `Recorder` can be shared between profiled threads.
fn _assert_bounds() {
    fn assert_bounds_inner<S: Sized + Send + Sync + 'static>() {}
    assert_bounds_inner::<Recorder>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recorder(buffer_size: usize, max_buffers: Option<usize>, queue: usize) -> Recorder {
        Recorder::new(
            Arc::new(BufferPool::new(buffer_size, max_buffers)),
            Arc::new(PacketQueue::new(queue)),
            buffer_size,
        )
    }

    fn queued_records(recorder: &Recorder) -> Vec<Record> {
        let mut records = Vec::new();
        while let Some(buffer) = recorder.queue.pop_timeout(Duration::from_millis(1)) {
            let mut pos = 0;
            let bytes = buffer.bytes();
            while pos < bytes.len() {
                let (record, len) = Record::decode(&bytes[pos..]).unwrap();
                records.push(record);
                pos += len;
            }
            recorder.pool.release(buffer);
        }
        records
    }

    #[test]
    fn disabled_recorder_records_nothing() {
        let recorder = recorder(256, None, 8);
        let token = recorder.begin_zone(1, "zone");
        assert!(!token.is_recorded());
        recorder.end_zone(token);
        recorder.marker(1, "marker");
        recorder.flush();

        assert!(recorder.queue.is_empty());
        assert_eq!(recorder.pool.allocated_count(), 0);
        assert_eq!(recorder.dropped_events(), 0);
    }

    #[test]
    fn string_defs_precede_their_first_use() {
        let recorder = recorder(256, None, 8);
        recorder.enable();
        recorder.register_thread(1, "Main");

        let token = recorder.begin_zone(1, "Update");
        recorder.marker(1, "Tick");
        recorder.end_zone(token);
        recorder.flush();

        let records = queued_records(&recorder);
        let kinds: Vec<u8> = records.iter().map(Record::tag).collect();
        assert_eq!(kinds, vec![2, 1, 1, 3, 5, 4]);

        assert_eq!(
            records[0],
            Record::ThreadInfo {
                thread_id: 1,
                name: "Main".to_string()
            }
        );
        assert_eq!(
            records[1],
            Record::StringDef {
                id: StringId::new(1),
                name: "Update".to_string()
            }
        );
        match records[3] {
            Record::ZoneBegin { name_id, .. } => assert_eq!(name_id, StringId::new(1)),
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn names_are_interned_once_per_session() {
        let recorder = recorder(1024, None, 8);
        recorder.enable();

        for thread_id in 0..3 {
            for _ in 0..4 {
                recorder.marker(thread_id, "same");
            }
        }
        recorder.flush();

        let defs = queued_records(&recorder)
            .into_iter()
            .filter(|r| matches!(r, Record::StringDef { .. }))
            .count();
        assert_eq!(defs, 1);

        // A new session starts a fresh table.
        recorder.enable();
        recorder.marker(0, "same");
        recorder.flush();
        assert_eq!(
            queued_records(&recorder)[0],
            Record::StringDef {
                id: StringId::new(1),
                name: "same".to_string()
            }
        );
    }

    #[test]
    fn full_buffers_are_handed_off() {
        // Room for three 17-byte markers per buffer.
        let recorder = recorder(60, None, 64);
        recorder.enable();

        for _ in 0..10 {
            recorder.marker(7, "m");
        }
        assert!(recorder.queue.len() >= 3);

        recorder.flush();
        let markers = queued_records(&recorder)
            .into_iter()
            .filter(|r| matches!(r, Record::Marker { .. }))
            .count();
        assert_eq!(markers, 10);
        assert_eq!(recorder.dropped_events(), 0);
    }

    #[test]
    fn exhausted_pool_drops_and_counts() {
        // One buffer for names, one for the thread.
        let recorder = recorder(40, Some(2), 64);
        recorder.enable();

        for _ in 0..10 {
            recorder.marker(1, "m");
        }

        // Two markers fit into the thread buffer; after that it is queued
        // and the pool has nothing left to give.
        assert!(recorder.dropped_events() > 0);
        let recorded = recorder.queue.len() as u64;
        assert!(recorded > 0);
    }

    #[test]
    fn tokens_from_an_old_session_are_ignored() {
        let recorder = recorder(256, None, 8);
        recorder.enable();
        let token = recorder.begin_zone(1, "outer");
        assert!(token.is_recorded());

        // Reconnect: the begin record is gone with the old session.
        recorder.enable();
        recorder.end_zone(token);
        recorder.flush();

        assert!(queued_records(&recorder).is_empty());
    }

    #[test]
    fn guard_ends_zone_on_drop() {
        let recorder = recorder(256, None, 8);
        recorder.enable();
        {
            let _outer = recorder.zone(3, "outer");
            let _inner = recorder.zone(3, "inner");
        }
        recorder.flush();

        let kinds: Vec<u8> = queued_records(&recorder)
            .iter()
            .filter(|r| r.thread_id() == Some(3))
            .map(Record::tag)
            .collect();
        assert_eq!(kinds, vec![3, 3, 4, 4]);
    }

    #[test]
    fn deregister_hands_off_buffer() {
        let recorder = recorder(256, None, 8);
        recorder.enable();
        recorder.register_thread(5, "worker");
        recorder.marker(5, "m");
        recorder.deregister_thread(5);

        assert!(recorder.registered_threads().is_empty());
        assert_eq!(queued_records(&recorder).len(), 3);
    }

    #[test]
    fn full_queue_drops_buffers() {
        let recorder = recorder(40, None, 1);
        recorder.enable();
        for _ in 0..20 {
            recorder.marker(1, "m");
        }
        assert!(recorder.dropped_events() > 0);
        assert_eq!(recorder.queue.len(), 1);
    }

    #[test]
    fn ends_of_discarded_begins_are_not_sent() {
        let recorder = recorder(256, None, 2);
        recorder.enable();

        let outer = recorder.begin_zone(1, "outer");
        recorder.flush();

        // The queue is full, so the buffer holding this begin is dropped.
        let inner = recorder.begin_zone(1, "inner");
        assert!(inner.is_recorded());
        recorder.flush();
        assert_eq!(recorder.dropped_events(), 1);

        let mut kinds: Vec<u8> = queued_records(&recorder).iter().map(Record::tag).collect();

        recorder.end_zone(inner);
        recorder.end_zone(outer);
        recorder.flush();
        kinds.extend(queued_records(&recorder).iter().map(Record::tag));

        assert_eq!(kinds, vec![1, 3, 1, 4]);
    }

    #[test]
    fn enclosing_zones_survive_a_discarded_buffer() {
        let recorder = recorder(256, None, 2);
        recorder.enable();

        let a = recorder.begin_zone(1, "a");
        recorder.flush();
        let b = recorder.begin_zone(1, "b");
        let c = recorder.begin_zone(1, "c");
        recorder.flush();
        assert_eq!(recorder.dropped_events(), 2);
        let mut records = queued_records(&recorder);

        // A begin recorded after the loss is delivered together with its end.
        let d = recorder.begin_zone(1, "d");
        recorder.end_zone(d);
        recorder.end_zone(c);
        recorder.end_zone(b);
        recorder.end_zone(a);
        recorder.flush();
        records.extend(queued_records(&recorder));

        let begins = records.iter().filter(|r| r.tag() == 3).count();
        let ends = records.iter().filter(|r| r.tag() == 4).count();
        assert_eq!((begins, ends), (2, 2));
        assert_eq!(records.last().map(Record::tag), Some(4));
    }
}
