use crate::buffer_pool::Buffer;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Bounded FIFO of filled buffers waiting to be sent.
///
/// Producers only ever use [`PacketQueue::try_push`], which never blocks, so
/// a slow or stalled connection cannot hold up recording threads. The single
/// consumer (the sender) waits in [`PacketQueue::pop_timeout`].
pub struct PacketQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

struct Inner {
    buffers: VecDeque<Buffer>,
    closed: bool,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> PacketQueue {
        assert!(capacity > 0);

        PacketQueue {
            capacity,
            inner: Mutex::new(Inner {
                buffers: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Appends `buffer` unless the queue is full or closed, in which case the
    /// buffer is handed back to the caller.
    pub fn try_push(&self, buffer: Buffer) -> Result<(), Buffer> {
        let mut inner = self.inner.lock();

        if inner.closed || inner.buffers.len() >= self.capacity {
            return Err(buffer);
        }

        inner.buffers.push_back(buffer);
        drop(inner);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest buffer, waiting up to `timeout` for one to arrive.
    /// Returns `None` on timeout or once the queue is closed and empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Buffer> {
        let mut inner = self.inner.lock();

        if inner.buffers.is_empty() && !inner.closed {
            self.not_empty.wait_for(&mut inner, timeout);
        }

        inner.buffers.pop_front()
    }

    /// Rejects further pushes and wakes the consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_all();
    }

    /// Accepts pushes again after a `close`.
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Takes every queued buffer, oldest first.
    pub fn drain(&self) -> Vec<Buffer> {
        self.inner.lock().buffers.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
