use crate::buffer_pool::Buffer;
use crate::error::TransportError;
use crate::protocol::frame_header;
use crate::record::Record;
use crate::recorder::Recorder;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Drains the packet queue into a connected socket.
///
/// Buffers are taken strictly in queue order and each one becomes one frame,
/// `[u32 body length][u32 sequence][records]`. After a buffer is written it
/// goes back to the pool. The sender also flushes idle thread buffers every
/// `flush_interval` and reports changes of the dropped-event counter.
///
/// A writer with a timeout (see [`TcpStream::set_write_timeout`]) keeps a
/// stalled viewer from blocking shutdown: writes that time out are retried
/// until `stop` is raised, then the session is abandoned.
///
/// [`TcpStream::set_write_timeout`]: std::net::TcpStream::set_write_timeout
pub struct Sender<W: Write> {
    writer: W,
    recorder: Arc<Recorder>,
    flush_interval: Duration,
    sequence: u32,
    reported_dropped: u64,
    frame: Vec<u8>,
    frames_sent: u64,
    bytes_sent: u64,
}

impl<W: Write> Sender<W> {
    pub fn new(writer: W, recorder: Arc<Recorder>, flush_interval: Duration) -> Sender<W> {
        Sender {
            writer,
            recorder,
            flush_interval,
            sequence: 0,
            reported_dropped: 0,
            frame: Vec::new(),
            frames_sent: 0,
            bytes_sent: 0,
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Writes one buffer as a frame.
    pub fn send_buffer(&mut self, buffer: &Buffer) -> io::Result<()> {
        self.send_frame(buffer.bytes(), &NEVER_STOP)
    }

    fn send_frame(&mut self, records: &[u8], stop: &AtomicBool) -> io::Result<()> {
        self.frame.clear();
        self.frame
            .extend_from_slice(&frame_header(self.sequence, records.len()));
        self.frame.extend_from_slice(records);
        write_all_until(&mut self.writer, &self.frame, stop)?;

        log::debug!(
            "sent frame {} with {} bytes of records",
            self.sequence,
            records.len()
        );

        self.sequence = self.sequence.wrapping_add(1);
        self.frames_sent += 1;
        self.bytes_sent += self.frame.len() as u64;
        Ok(())
    }

    /// Sends a `DroppedEvents` frame if the recorder's counter moved since
    /// the last report.
    pub fn report_dropped(&mut self) -> io::Result<()> {
        self.report_dropped_until(&NEVER_STOP)
    }

    fn report_dropped_until(&mut self, stop: &AtomicBool) -> io::Result<()> {
        let total = self.recorder.dropped_events();
        if total == self.reported_dropped {
            return Ok(());
        }

        let mut records = Vec::with_capacity(9);
        Record::DroppedEvents { total }.encode_to_vec(&mut records);
        self.send_frame(&records, stop)?;
        self.reported_dropped = total;
        Ok(())
    }

    /// Sends until `stop` is raised or a write fails. On stop, whatever is
    /// still buffered is flushed and sent before returning, unless a write
    /// times out.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), TransportError> {
        let queue = self.recorder.queue().clone();
        let mut last_flush = Instant::now();

        while !stop.load(Ordering::Acquire) {
            if let Some(buffer) = queue.pop_timeout(self.flush_interval) {
                self.send_pooled(buffer, stop)?;
            } else if queue.is_closed() {
                return Ok(());
            }

            if last_flush.elapsed() >= self.flush_interval {
                self.recorder.flush();
                last_flush = Instant::now();
            }

            self.report_dropped_until(stop)?;
        }

        self.recorder.flush();
        let mut remaining = queue.drain().into_iter();
        while let Some(buffer) = remaining.next() {
            if let Err(e) = self.send_pooled(buffer, stop) {
                for buffer in remaining {
                    self.recorder.pool().release(buffer);
                }
                return Err(e);
            }
        }
        self.report_dropped_until(stop)?;
        self.writer.flush()?;
        Ok(())
    }

    fn send_pooled(&mut self, buffer: Buffer, stop: &AtomicBool) -> Result<(), TransportError> {
        let result = self.send_frame(buffer.bytes(), stop);
        self.recorder.pool().release(buffer);
        result.map_err(TransportError::from)
    }
}

static NEVER_STOP: AtomicBool = AtomicBool::new(false);

/// Like [`Write::write_all`], but a write that times out is retried until
/// `stop` is raised. Partial writes are never repeated, so the stream stays
/// intact as long as this returns `Ok`.
fn write_all_until<W: Write>(writer: &mut W, mut buf: &[u8], stop: &AtomicBool) -> io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole frame",
                ));
            }
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                if stop.load(Ordering::Acquire) {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "viewer stopped reading",
                    ));
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
