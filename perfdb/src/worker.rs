use crate::database::Database;
use crate::dispatcher::Batch;
use perfdecode::{Parser, Receiver};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Runs receive, parse and dispatch on a dedicated thread until the
/// producer disconnects, a fatal protocol error occurs, or a stop is
/// requested. The database is marked closed when the thread exits.
pub struct Worker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Starts a worker. `parser` may already hold bytes read before, e.g.
    /// while waiting for the handshake.
    pub fn spawn<R>(receiver: Receiver<R>, parser: Parser, database: Arc<Database>) -> io::Result<Worker>
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));

        let handle = std::thread::Builder::new()
            .name("perfdb-worker".to_string())
            .spawn({
                let stop = stop.clone();
                move || run(receiver, parser, &database, &stop)
            })?;

        Ok(Worker {
            stop,
            handle: Some(handle),
        })
    }

    /// Asks the worker to exit once the batch at hand is applied. A worker
    /// blocked in a read only notices once the read returns, so the caller
    /// should also shut the connection down.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Joining here could block on a read forever, so just detach.
        self.request_stop();
    }
}

/// Marks the database closed however the worker exits.
struct CloseOnExit<'a>(&'a Database);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        self.0.mark_closed();
    }
}

fn run<R: Read>(mut receiver: Receiver<R>, mut parser: Parser, database: &Database, stop: &AtomicBool) {
    let _close = CloseOnExit(database);

    loop {
        let mut batch = Batch::new();
        let fatal = drain_parser(&mut parser, &mut batch);
        database.apply(batch);

        if fatal {
            log::error!("ending session after a fatal protocol error");
            break;
        }
        if stop.load(Ordering::Acquire) {
            log::info!("worker stopped");
            break;
        }

        match receiver.receive_into(&mut parser) {
            Ok(0) => {
                log::info!("producer closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if stop.load(Ordering::Acquire) {
                    log::info!("worker stopped");
                } else {
                    log::error!("receiving failed: {}", e);
                }
                break;
            }
        }
    }

    if !parser.is_failed() && !parser.at_frame_boundary() {
        log::warn!(
            "connection ended inside a frame, discarding {} bytes",
            parser.buffered_len()
        );
    }
    log::info!(
        "worker exiting after receiving {} bytes",
        receiver.bytes_received()
    );
}

/// Moves everything the parser can decode right now into `batch`. Returns
/// whether parsing ended with a fatal error.
fn drain_parser(parser: &mut Parser, batch: &mut Batch) -> bool {
    loop {
        match parser.next() {
            Ok(Some(item)) => batch.push(item),
            Ok(None) => return false,
            Err(e) => {
                batch.push_error(&e);
                if e.is_fatal() {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfstream::testing_common::FrameBuilder;
    use std::io::Cursor;
    use std::time::Duration;

    fn run_on(bytes: Vec<u8>, chunk_size: usize) -> Arc<Database> {
        let database = Arc::new(Database::new());
        let receiver = Receiver::new(Cursor::new(bytes), chunk_size);
        let mut worker = Worker::spawn(receiver, Parser::new(1 << 16), database.clone()).unwrap();
        worker.join();
        assert!(worker.is_finished());
        database
    }

    #[test]
    fn runs_until_end_of_stream() {
        let mut b = FrameBuilder::new();
        b.thread(1, "Main").string(7, "Update").frame();
        b.begin(1, 100, 7).frame();
        b.end(1, 150).frame();

        let db = run_on(b.into_bytes(), 5);

        assert!(db.is_closed());
        assert!(db.wait_closed(Duration::from_millis(1)));
        assert!(db.metadata().is_some());
        let zones = db.zones(1, 0, u64::MAX);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name.as_deref(), Some("Update"));
        assert_eq!(db.stats().protocol_errors, 0);
    }

    #[test]
    fn fatal_error_ends_session() {
        let mut b = FrameBuilder::new();
        b.string(1, "a").marker(1, 1, 1).frame();
        let mut bytes = b.into_bytes();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0; 64]);

        let db = run_on(bytes, 1024);

        assert!(db.is_closed());
        assert_eq!(db.stats().protocol_errors, 1);
        assert_eq!(db.markers(1, 0, u64::MAX).len(), 1);
    }

    #[test]
    fn truncated_stream_keeps_complete_frames() {
        let mut b = FrameBuilder::new();
        b.string(1, "a").marker(1, 1, 1).frame();
        b.marker(1, 2, 1).frame();
        let mut bytes = b.into_bytes();
        bytes.truncate(bytes.len() - 3);

        let db = run_on(bytes, 16);

        assert!(db.is_closed());
        assert_eq!(db.markers(1, 0, u64::MAX).len(), 1);
    }

    #[test]
    fn wrong_peer_closes_database() {
        let db = run_on(b"SSH-2.0-OpenSSH\r\n".to_vec(), 64);
        assert!(db.is_closed());
        assert!(db.metadata().is_none());
        assert_eq!(db.stats().protocol_errors, 1);
    }
}
