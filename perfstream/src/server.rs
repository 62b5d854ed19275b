use crate::buffer_pool::BufferPool;
use crate::config::ServerConfig;
use crate::counters::Counter;
use crate::error::TransportError;
use crate::packet_queue::PacketQueue;
use crate::protocol::{write_handshake, SessionInfo};
use crate::recorder::Recorder;
use crate::sender::Sender;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerState {
    Idle,
    Listening,
    Connected,
}

/// Owns the listening socket and the single viewer connection.
///
/// `Idle -> Listening -> Connected -> Idle`: [`Server::start`] binds and
/// waits for one viewer on a background thread. Once it connects the
/// handshake is written, the recorder is enabled and the same thread runs the
/// [`Sender`]. [`Server::stop`] sends what is still buffered before hanging
/// up; when the viewer goes away instead, buffered data is discarded. Either
/// way recording is disabled and the server is idle again.
pub struct Server {
    config: ServerConfig,
    recorder: Arc<Recorder>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<ServerState>,
    state_changed: Condvar,
    stop: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Shared {
    fn set_state(&self, state: ServerState) {
        *self.state.lock() = state;
        self.state_changed.notify_all();
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        let pool = Arc::new(BufferPool::new(config.buffer_size, config.max_buffers));
        let queue = Arc::new(PacketQueue::new(config.queue_capacity));
        let counter = Counter::by_name(&config.counter).unwrap_or_else(|e| {
            log::warn!("{}, falling back to {}", e, Counter::default().name());
            Counter::default()
        });
        let recorder = Arc::new(Recorder::with_counter(
            pool,
            queue,
            config.high_water_bytes(),
            counter,
        ));

        Server {
            config,
            recorder,
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState::Idle),
                state_changed: Condvar::new(),
                stop: AtomicBool::new(false),
                local_addr: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The recorder instrumented code should use. It stays valid across
    /// sessions and only records while a viewer is connected.
    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state.lock()
    }

    /// Address the server is listening on, if it is.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Binds the configured address and starts waiting for a viewer.
    /// Returns the bound address, which matters when the configured port
    /// is 0.
    pub fn start(&self) -> Result<SocketAddr, TransportError> {
        let mut thread = self.thread.lock();

        if self.state() != ServerState::Idle {
            return Err(TransportError::AlreadyRunning);
        }
        if let Some(finished) = thread.take() {
            let _ = finished.join();
        }

        let listener = TcpListener::bind(&self.config.address)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        self.shared.stop.store(false, Ordering::Release);
        *self.shared.local_addr.lock() = Some(addr);
        self.shared.set_state(ServerState::Listening);
        log::info!("listening for a viewer on {}", addr);

        let shared = self.shared.clone();
        let recorder = self.recorder.clone();
        let config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name("perfstream-server".to_string())
            .spawn(move || {
                serve(listener, &shared, &recorder, &config);
                *shared.local_addr.lock() = None;
                shared.set_state(ServerState::Idle);
            });

        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(addr)
            }
            Err(e) => {
                *self.shared.local_addr.lock() = None;
                self.shared.set_state(ServerState::Idle);
                Err(TransportError::Io(e))
            }
        }
    }

    /// Ends the current session, if any, and stops listening. Data still
    /// buffered is sent to a connected viewer first. A viewer that stopped
    /// reading holds this up for at most the configured write timeout.
    pub fn stop(&self) {
        let mut thread = self.thread.lock();
        self.shared.stop.store(true, Ordering::Release);

        if let Some(handle) = thread.take() {
            if handle.join().is_err() {
                log::error!("server thread panicked");
                self.recorder.disable();
                self.shared.set_state(ServerState::Idle);
            }
        }
    }

    /// Blocks until the server reaches `state` or `timeout` elapses.
    pub fn wait_for_state(&self, state: ServerState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.shared.state.lock();

        while *current != state {
            if self
                .shared
                .state_changed
                .wait_until(&mut current, deadline)
                .timed_out()
            {
                return *current == state;
            }
        }

        true
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(listener: TcpListener, shared: &Shared, recorder: &Arc<Recorder>, config: &ServerConfig) {
    let stream = loop {
        if shared.stop.load(Ordering::Acquire) {
            return;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!("viewer connected from {}", peer);
                break stream;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(config.accept_poll_interval());
            }
            Err(e) => {
                log::error!("accepting a viewer failed: {}", e);
                return;
            }
        }
    };

    // Exactly one viewer per session.
    drop(listener);

    if let Err(e) = run_session(stream, shared, recorder, config) {
        log::error!("session ended: {}", e);
    } else {
        log::info!("session ended");
    }
}

fn run_session(
    stream: TcpStream,
    shared: &Shared,
    recorder: &Arc<Recorder>,
    config: &ServerConfig,
) -> Result<(), TransportError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(config.write_timeout()))?;
    let mut writer = stream.try_clone()?;

    let info = SessionInfo::for_current_process(recorder.counter().name());
    write_handshake(&mut writer, &info)?;

    let queue = recorder.queue();
    queue.reopen();
    for stale in queue.drain() {
        recorder.pool().release(stale);
    }

    recorder.enable();
    shared.set_state(ServerState::Connected);

    let mut sender = Sender::new(writer, recorder.clone(), config.flush_interval());
    let result = sender.run(&shared.stop);

    log::debug!(
        "sent {} frames, {} bytes",
        sender.frames_sent(),
        sender.bytes_sent()
    );

    recorder.disable();
    queue.close();
    for buffer in queue.drain() {
        recorder.pool().release(buffer);
    }
    let _ = stream.shutdown(Shutdown::Both);

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn local_config() -> ServerConfig {
        ServerConfig {
            address: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn lifecycle() {
        let server = Server::new(local_config());
        assert_eq!(server.state(), ServerState::Idle);

        let addr = server.start().unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        assert!(matches!(server.start(), Err(TransportError::AlreadyRunning)));

        let mut viewer = TcpStream::connect(addr).unwrap();
        assert!(server.wait_for_state(ServerState::Connected, Duration::from_secs(5)));
        assert!(server.recorder().is_enabled());

        let mut magic = [0u8; 4];
        viewer.read_exact(&mut magic).unwrap();
        assert_eq!(&magic, crate::protocol::STREAM_MAGIC);

        drop(viewer);
        server.stop();
        assert_eq!(server.state(), ServerState::Idle);
        assert!(!server.recorder().is_enabled());
        assert_eq!(server.local_addr(), None);
    }

    #[test]
    fn stop_while_listening() {
        let server = Server::new(local_config());
        server.start().unwrap();
        server.stop();
        assert_eq!(server.state(), ServerState::Idle);

        // Can be started again.
        server.start().unwrap();
        assert_eq!(server.state(), ServerState::Listening);
    }

    #[test]
    fn configured_counter_is_used() {
        let server = Server::new(ServerConfig {
            counter: "wall-time".to_string(),
            ..local_config()
        });
        assert_eq!(server.recorder().counter().name(), "wall-time");

        // Unknown names fall back to the default instead of failing.
        let server = Server::new(ServerConfig {
            counter: "cycles".to_string(),
            ..local_config()
        });
        assert_eq!(server.recorder().counter().name(), Counter::default().name());
    }

    #[test]
    fn stop_returns_when_viewer_never_reads() {
        let server = Arc::new(Server::new(ServerConfig {
            address: "127.0.0.1:0".to_string(),
            queue_capacity: 4,
            write_timeout_ms: 100,
            ..ServerConfig::default()
        }));
        let addr = server.start().unwrap();

        // Connected, but never reads a byte.
        let viewer = TcpStream::connect(addr).unwrap();
        assert!(server.wait_for_state(ServerState::Connected, Duration::from_secs(5)));

        // Produce until the socket is backed up and the queue overflows.
        let deadline = Instant::now() + Duration::from_secs(10);
        while server.recorder().dropped_events() < 10_000 && Instant::now() < deadline {
            for _ in 0..1000 {
                server.recorder().marker(1, "spin");
            }
        }
        assert!(server.recorder().dropped_events() > 0);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let stopper = server.clone();
        let handle = std::thread::spawn(move || {
            stopper.stop();
            let _ = done_tx.send(());
        });

        assert!(done_rx.recv_timeout(Duration::from_secs(10)).is_ok());
        handle.join().unwrap();
        assert_eq!(server.state(), ServerState::Idle);
        assert!(!server.recorder().is_enabled());
        drop(viewer);
    }

    #[test]
    fn viewer_disconnect_returns_to_idle() {
        let server = Server::new(local_config());
        let addr = server.start().unwrap();

        let viewer = TcpStream::connect(addr).unwrap();
        assert!(server.wait_for_state(ServerState::Connected, Duration::from_secs(5)));
        viewer.shutdown(Shutdown::Both).unwrap();
        drop(viewer);

        // Keep producing until a write notices the peer is gone.
        let deadline = Instant::now() + Duration::from_secs(10);
        while server.state() != ServerState::Idle && Instant::now() < deadline {
            server.recorder().marker(1, "tick");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(server.state(), ServerState::Idle);
        assert!(!server.recorder().is_enabled());
    }
}
