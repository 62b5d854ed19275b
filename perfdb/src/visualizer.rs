use crate::config::VisualizerConfig;
use crate::database::Database;
use crate::dispatcher::Batch;
use crate::worker::Worker;
use parking_lot::Mutex;
use perfdecode::{Parsed, Parser, Receiver};
use perfstream::TransportError;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// The producer went away. The data is still readable.
    Closed,
}

/// One connection to a producer together with the data received over it.
struct Session {
    socket: TcpStream,
    peer: SocketAddr,
    worker: Worker,
    database: Arc<Database>,
}

impl Session {
    fn open<A: ToSocketAddrs>(config: &VisualizerConfig, addr: A) -> Result<Session, TransportError> {
        let timeout = config.connect_timeout();
        let socket = connect_any(addr, timeout)?;
        socket.set_nodelay(true)?;
        socket.set_read_timeout(Some(timeout))?;
        let peer = socket.peer_addr()?;

        let mut receiver = Receiver::new(socket.try_clone()?, config.read_chunk_size);
        let mut parser = Parser::new(config.max_frame_len);

        // Wait for the handshake here, so that talking to something that is
        // not a producer fails the connect call.
        let deadline = Instant::now() + timeout;
        let metadata = loop {
            match parser.next() {
                Ok(Some(Parsed::Handshake(metadata))) => break metadata,
                Ok(Some(item)) => {
                    return Err(TransportError::Handshake(format!(
                        "expected a handshake, got {:?}",
                        item
                    )))
                }
                Ok(None) => {}
                Err(e) => return Err(TransportError::Handshake(e.to_string())),
            }

            if Instant::now() >= deadline {
                return Err(TransportError::Handshake(
                    "timed out waiting for the handshake".to_string(),
                ));
            }

            if receiver.receive_into(&mut parser)? == 0 {
                return Err(TransportError::Handshake(
                    "connection closed before the handshake".to_string(),
                ));
            }
        };

        socket.set_read_timeout(None)?;

        let database = Arc::new(Database::new());
        let mut batch = Batch::new();
        batch.push(Parsed::Handshake(metadata));
        database.apply(batch);

        let worker = Worker::spawn(receiver, parser, database.clone())?;
        log::info!("connected to {}", peer);

        Ok(Session {
            socket,
            peer,
            worker,
            database,
        })
    }

    fn close(mut self) {
        self.worker.request_stop();
        // Unblocks the worker's read.
        let _ = self.socket.shutdown(Shutdown::Both);
        self.worker.join();
        log::info!("disconnected from {}", self.peer);
    }
}

fn connect_any<A: ToSocketAddrs>(addr: A, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;

    for addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    }))
}

/// The viewer side of the pipeline: connects to a producer and collects its
/// trace into a [`Database`] on a background worker.
///
/// Connecting again replaces the previous session. Databases handed out
/// earlier stay readable after their session is gone.
pub struct Visualizer {
    config: VisualizerConfig,
    session: Mutex<Option<Session>>,
    // Serializes connect and disconnect.
    control: Mutex<()>,
    connecting: AtomicBool,
}

impl Visualizer {
    pub fn new(config: VisualizerConfig) -> Visualizer {
        Visualizer {
            config,
            session: Mutex::new(None),
            control: Mutex::new(()),
            connecting: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &VisualizerConfig {
        &self.config
    }

    /// Connects to a producer and waits for its handshake. Returns the
    /// database the session fills.
    pub fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<Arc<Database>, TransportError> {
        let _control = self.control.lock();

        let previous = self.session.lock().take();
        if let Some(previous) = previous {
            previous.close();
        }

        self.connecting.store(true, Ordering::Release);
        let result = Session::open(&self.config, addr);
        let result = result.map(|session| {
            let database = session.database.clone();
            *self.session.lock() = Some(session);
            database
        });
        self.connecting.store(false, Ordering::Release);

        if let Err(e) = &result {
            log::error!("connecting failed: {}", e);
        }
        result
    }

    /// Ends the current session, if any.
    pub fn disconnect(&self) {
        let _control = self.control.lock();

        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close();
        }
    }

    pub fn state(&self) -> SessionState {
        if self.connecting.load(Ordering::Acquire) {
            return SessionState::Connecting;
        }

        match &*self.session.lock() {
            Some(session) if session.database.is_closed() => SessionState::Closed,
            Some(_) => SessionState::Connected,
            None => SessionState::Disconnected,
        }
    }

    pub fn database(&self) -> Option<Arc<Database>> {
        self.session.lock().as_ref().map(|s| s.database.clone())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.lock().as_ref().map(|s| s.peer)
    }

    /// Blocks until the producer ends the session or `timeout` elapses.
    /// Returns `true` right away if there is no session.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        match self.database() {
            Some(database) => database.wait_closed(timeout),
            None => true,
        }
    }
}

impl Drop for Visualizer {
    fn drop(&mut self) {
        self.disconnect();
    }
}
