//! Threads around the dispatcher.
//!
//! Two accept threads and one reader thread per connection turn socket
//! activity into [`Event`]s. A single dispatch thread owns the
//! [`Dispatcher`] and handles the events in arrival order, running the
//! periodic flush between them.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dltrelay_transport::{
    ConnectionId, ConnectionIds, Endpoint, IpcStream, Listener, TransportError, UnixDomainSocket,
};
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::output::{stream_channel, Channel, OutputChannels, WriterTraceSink};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_POLL: Duration = Duration::from_millis(200);
const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Producer,
    Consumer,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Consumer => "consumer",
        }
    }
}

enum Event {
    ProducerConnected {
        id: ConnectionId,
        channel: Box<dyn Channel>,
        pid: Option<u32>,
    },
    ConsumerConnected {
        id: ConnectionId,
        channel: Box<dyn Channel>,
    },
    Data {
        role: Role,
        id: ConnectionId,
        bytes: Vec<u8>,
    },
    Closed {
        role: Role,
        id: ConnectionId,
    },
}

/// What accepted connections need to start their reader.
#[derive(Clone)]
struct Acceptor {
    role: Role,
    ids: Arc<ConnectionIds>,
    events: Sender<Event>,
    shutdown: Arc<AtomicBool>,
    send_timeout: Duration,
}

/// A running daemon.
pub struct Daemon {
    producer_socket: PathBuf,
    consumer_endpoint: Endpoint,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Bind both listeners and start the threads.
    ///
    /// Returns once the daemon accepts connections. Setting `shutdown` stops
    /// every thread; [`Daemon::join`] waits for them.
    pub fn spawn(config: DaemonConfig, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let producers = UnixDomainSocket::bind_with_mode(&config.producer_socket, config.socket_mode)?;
        producers.set_nonblocking(true)?;
        let producer_socket = producers.path().to_path_buf();
        let consumers = config.consumer_endpoint.bind(config.socket_mode)?;
        consumers.set_nonblocking(true)?;
        let consumer_endpoint = consumers.endpoint();

        let mut dispatcher = Dispatcher::new(config.clone(), Arc::new(OutputChannels::new()))?;
        if let Some(path) = &config.offline_trace {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            info!(path = ?path, "writing offline trace");
            dispatcher = dispatcher.with_trace_sink(Box::new(WriterTraceSink::new(file)));
        }
        let state = dispatcher.transports_ready();
        info!(
            state = %state,
            producers = ?producer_socket,
            consumers = %consumer_endpoint,
            "daemon started"
        );

        let (events, inbox) = mpsc::channel();
        let ids = Arc::new(ConnectionIds::new());
        let acceptor = |role| Acceptor {
            role,
            ids: ids.clone(),
            events: events.clone(),
            shutdown: shutdown.clone(),
            send_timeout: config.send_timeout,
        };
        let producer_acceptor = acceptor(Role::Producer);
        let consumer_acceptor = acceptor(Role::Consumer);
        drop(events);

        let flush_interval = config.flush_interval;
        let dispatch_shutdown = shutdown.clone();
        let threads = vec![
            thread::Builder::new()
                .name("dlt-dispatch".to_string())
                .spawn(move || dispatch_loop(dispatcher, inbox, flush_interval, dispatch_shutdown))?,
            thread::Builder::new()
                .name("dlt-accept-producers".to_string())
                .spawn(move || accept_loop(Listener::Unix(producers), producer_acceptor))?,
            thread::Builder::new()
                .name("dlt-accept-consumers".to_string())
                .spawn(move || accept_loop(consumers, consumer_acceptor))?,
        ];

        Ok(Self {
            producer_socket,
            consumer_endpoint,
            shutdown,
            threads,
        })
    }

    pub fn producer_socket(&self) -> &Path {
        &self.producer_socket
    }

    /// Where consumers connect; a TCP port 0 bind shows the assigned port.
    pub fn consumer_endpoint(&self) -> &Endpoint {
        &self.consumer_endpoint
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the accept and dispatch threads to finish.
    pub fn join(self) {
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("dlt").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "daemon thread panicked");
            }
        }
        info!("daemon stopped");
    }
}

fn dispatch_loop(
    mut dispatcher: Dispatcher,
    inbox: mpsc::Receiver<Event>,
    flush_interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut last_tick = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        match inbox.recv_timeout(flush_interval) {
            Ok(event) => handle_event(&mut dispatcher, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_tick.elapsed() >= flush_interval {
            dispatcher.tick();
            last_tick = Instant::now();
        }
    }
    info!(
        state = %dispatcher.state(),
        buffered = dispatcher.ring_buffer().message_count(),
        "dispatcher stopped"
    );
}

fn handle_event(dispatcher: &mut Dispatcher, event: Event) {
    match event {
        Event::ProducerConnected { id, channel, pid } => {
            dispatcher.producer_connected(id, channel, pid)
        }
        Event::ConsumerConnected { id, channel } => dispatcher.consumer_connected(id, channel),
        Event::Data {
            role: Role::Producer,
            id,
            bytes,
        } => dispatcher.on_producer_bytes(id, &bytes),
        Event::Data {
            role: Role::Consumer,
            id,
            bytes,
        } => dispatcher.on_consumer_bytes(id, &bytes),
        Event::Closed {
            role: Role::Producer,
            id,
        } => dispatcher.producer_closed(id),
        Event::Closed {
            role: Role::Consumer,
            id,
        } => dispatcher.consumer_closed(id),
    }
}

fn accept_loop(listener: Listener, acceptor: Acceptor) {
    let role = acceptor.role.as_str();
    while !acceptor.shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok(stream) => {
                if let Err(err) = acceptor.attach(stream) {
                    warn!(role, error = %err, "connection not attached");
                }
            }
            Err(TransportError::Accept(err)) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                warn!(role, error = %err, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!(role, "accept loop stopped");
}

impl Acceptor {
    fn attach(&self, stream: IpcStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(READ_POLL))?;
        let id = self.ids.next_id();
        let channel = stream_channel(stream.try_clone()?, self.send_timeout)?;
        let event = match self.role {
            Role::Producer => Event::ProducerConnected {
                id,
                channel,
                pid: stream.peer_pid(),
            },
            Role::Consumer => Event::ConsumerConnected { id, channel },
        };
        if self.events.send(event).is_err() {
            // dispatcher is gone
            return Ok(());
        }

        let reader = self.clone();
        thread::Builder::new()
            .name(format!("dlt-{}-{}", self.role.as_str(), id.get()))
            .spawn(move || reader.read_loop(id, stream))?;
        Ok(())
    }

    fn read_loop(self, id: ConnectionId, mut stream: IpcStream) {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        while !self.shutdown.load(Ordering::Relaxed) {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let event = Event::Data {
                        role: self.role,
                        id,
                        bytes: chunk[..n].to_vec(),
                    };
                    if self.events.send(event).is_err() {
                        return;
                    }
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    debug!(role = self.role.as_str(), connection = %id, error = %err, "read failed");
                    break;
                }
            }
        }
        let _ = self.events.send(Event::Closed {
            role: self.role,
            id,
        });
    }
}
