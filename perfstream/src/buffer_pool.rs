//! Fixed-size byte buffers recycled between recording threads and the sender.
//!
//! The pool is an arena of slots. A [`Buffer`] is checked out of a slot by
//! [`BufferPool::acquire`] and checked back in by [`BufferPool::release`].
//! Buffers are moved, never shared, so at any time a buffer is owned by
//! exactly one of: the pool, a recording thread, the packet queue or the
//! sender.

use crate::error::CapacityError;
use crate::record::Record;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

pub struct Buffer {
    pool_id: u64,
    slot: usize,
    data: Box<[u8]>,
    pos: usize,
    records: u32,
}

impl Buffer {
    /// The arena slot this buffer was checked out of.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Number of records written since the buffer was acquired.
    #[inline]
    pub fn record_count(&self) -> u32 {
        self.records
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    /// Reserves `num_bytes` and lets `write` fill them. Returns `false`
    /// without calling `write` if the buffer does not have enough room left.
    #[inline]
    pub fn write_atomic<W>(&mut self, num_bytes: usize, write: W) -> bool
    where
        W: FnOnce(&mut [u8]),
    {
        let start = self.pos;
        let end = start + num_bytes;

        if end > self.data.len() {
            return false;
        }

        write(&mut self.data[start..end]);
        self.pos = end;
        self.records += 1;
        true
    }

    #[inline]
    pub fn push_record(&mut self, record: &Record) -> bool {
        self.write_atomic(record.encoded_size(), |bytes| record.encode(bytes))
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.records = 0;
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("slot", &self.slot)
            .field("len", &self.pos)
            .field("capacity", &self.data.len())
            .field("records", &self.records)
            .finish()
    }
}

struct Inner {
    free: Vec<Buffer>,
    // `in_pool[slot]` is true while the slot's buffer sits in `free`.
    in_pool: Vec<bool>,
}

pub struct BufferPool {
    id: u64,
    buffer_size: usize,
    max_buffers: Option<usize>,
    inner: Mutex<Inner>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_buffers: Option<usize>) -> BufferPool {
        assert!(buffer_size > 0);

        BufferPool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            buffer_size,
            max_buffers,
            inner: Mutex::new(Inner {
                free: Vec::new(),
                in_pool: Vec::new(),
            }),
        }
    }

    /// Checks out an idle buffer, allocating a new slot if none is idle and
    /// the pool is still below its maximum.
    pub fn acquire(&self) -> Result<Buffer, CapacityError> {
        let slot = {
            let mut inner = self.inner.lock();

            if let Some(buffer) = inner.free.pop() {
                inner.in_pool[buffer.slot] = false;
                return Ok(buffer);
            }

            let allocated = inner.in_pool.len();
            if let Some(max) = self.max_buffers {
                if allocated >= max {
                    return Err(CapacityError { allocated, max });
                }
            }

            inner.in_pool.push(false);
            allocated
        };

        // The slot is reserved, so the allocation can happen outside the lock.
        Ok(Buffer {
            pool_id: self.id,
            slot,
            data: vec![0; self.buffer_size].into_boxed_slice(),
            pos: 0,
            records: 0,
        })
    }

    /// Checks a buffer back in. Buffers that do not belong to this pool are
    /// rejected and dropped.
    pub fn release(&self, mut buffer: Buffer) {
        if buffer.pool_id != self.id || buffer.capacity() != self.buffer_size {
            log::warn!("rejecting buffer from slot {} of a foreign pool", buffer.slot);
            return;
        }

        buffer.reset();

        let mut inner = self.inner.lock();
        match inner.in_pool.get(buffer.slot).copied() {
            Some(false) => {
                inner.in_pool[buffer.slot] = true;
                inner.free.push(buffer);
            }
            Some(true) => {
                log::warn!("slot {} released twice, dropping duplicate", buffer.slot);
            }
            None => {
                log::warn!("slot {} was never allocated by this pool", buffer.slot);
            }
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn max_buffers(&self) -> Option<usize> {
        self.max_buffers
    }

    /// Buffers currently sitting in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Slots allocated so far, whether idle or checked out.
    pub fn allocated_count(&self) -> usize {
        self.inner.lock().in_pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StringId;
    use std::sync::Arc;

    #[test]
    fn acquire_reuses_released_buffers() {
        let pool = BufferPool::new(64, None);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.slot(), b.slot());
        assert_eq!(pool.allocated_count(), 2);
        assert_eq!(pool.idle_count(), 0);

        let slot_a = a.slot();
        pool.release(a);
        assert_eq!(pool.idle_count(), 1);

        let c = pool.acquire().unwrap();
        assert_eq!(c.slot(), slot_a);
        assert_eq!(pool.allocated_count(), 2);

        pool.release(b);
        pool.release(c);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn release_resets_write_cursor() {
        let pool = BufferPool::new(64, None);
        let mut buffer = pool.acquire().unwrap();
        assert!(buffer.push_record(&Record::ZoneEnd {
            thread_id: 1,
            timestamp: 2
        }));
        assert_eq!(buffer.len(), 13);
        assert_eq!(buffer.record_count(), 1);

        pool.release(buffer);
        let buffer = pool.acquire().unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.record_count(), 0);
    }

    #[test]
    fn exhausted_pool_reports_capacity_error() {
        let pool = BufferPool::new(16, Some(2));
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();

        assert_eq!(
            pool.acquire().unwrap_err(),
            CapacityError {
                allocated: 2,
                max: 2
            }
        );

        pool.release(a);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn full_buffer_refuses_writes() {
        let pool = BufferPool::new(20, None);
        let mut buffer = pool.acquire().unwrap();
        let record = Record::Marker {
            thread_id: 1,
            timestamp: 1,
            name_id: StringId::new(1),
        };
        assert!(buffer.push_record(&record));
        assert!(!buffer.push_record(&record));
        assert_eq!(buffer.len(), 17);
        assert_eq!(buffer.remaining(), 3);
    }

    #[test]
    fn foreign_buffers_are_rejected() {
        let pool_a = BufferPool::new(16, None);
        let pool_b = BufferPool::new(16, None);

        let foreign = pool_b.acquire().unwrap();
        pool_a.release(foreign);
        assert_eq!(pool_a.idle_count(), 0);
        assert_eq!(pool_a.allocated_count(), 0);
    }

    #[test]
    fn concurrent_acquire_release_conserves_buffers() {
        let pool = Arc::new(BufferPool::new(32, Some(8)));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        if let Ok(buffer) = pool.acquire() {
                            pool.release(buffer);
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert!(pool.allocated_count() <= 8);
        assert_eq!(pool.idle_count(), pool.allocated_count());
    }
}
