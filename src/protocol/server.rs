use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::config::MllpConfig;

use super::{
    Headers, ThreadPool,
    ack::{self, AckCode},
    charset::Charset,
    error::MllpError,
    exchange::{Exchange, HandlerError},
    header,
    hl7::{self, MshSegment},
    registry::HandlerRegistry,
    transport::{self, FrameTransport, ReadTimeouts, TransportError},
};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// An MLLP listener.
///
/// Each accepted connection is served by one worker of a pool sized
/// `max_concurrent_consumers`; connections beyond that are refused.
pub struct MllpServer {
    config: Arc<MllpConfig>,
    handlers: Arc<HandlerRegistry>,
}

impl MllpServer {
    pub fn new(config: MllpConfig, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            handlers,
        }
    }

    /// Binds the listening socket and starts accepting connections in the background.
    ///
    /// Binding is retried every `bind_retry_interval` until `bind_timeout` has passed.
    pub fn bind(self) -> Result<ServerHandle, MllpError> {
        let listener = bind_with_retry(&self.config)?;
        let local_addr = listener.local_addr()?;
        info!("listening at {local_addr}");

        let pool = ThreadPool::new(
            &format!("mllp-{}", local_addr.port()),
            self.config.max_concurrent_consumers,
        )?;
        let shared = Arc::new(Shared {
            local_addr,
            running: AtomicBool::new(true),
            refused: AtomicUsize::new(0),
            connections: ConnectionTable::default(),
        });
        let context = Arc::new(Context {
            config: self.config,
            handlers: self.handlers,
            shared: Arc::clone(&shared),
        });

        let accept = thread::Builder::new()
            .name(format!("mllp-accept-{}", local_addr.port()))
            .spawn(move || accept_loop(listener, pool, context))?;

        Ok(ServerHandle {
            shared,
            accept: Some(accept),
        })
    }

    /// Binds and serves until the server is shut down through a [`ShutdownSignal`].
    pub fn listen(self) -> Result<(), MllpError> {
        self.bind()?.wait();
        Ok(())
    }
}

fn bind_with_retry(config: &MllpConfig) -> Result<TcpListener, MllpError> {
    let address = config.address();
    let deadline = Instant::now() + config.bind_timeout;

    loop {
        match TcpListener::bind(&address) {
            Ok(listener) => return Ok(listener),
            Err(source) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(MllpError::Bind {
                        address,
                        timeout: config.bind_timeout,
                        source,
                    });
                }
                warn!(
                    "failed to bind {address}: {source}; retrying in {:?}",
                    config.bind_retry_interval
                );
                thread::sleep(config.bind_retry_interval.min(deadline - now));
            }
        }
    }
}

/// A snapshot of one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub exchanges: usize,
}

struct Connection {
    stream: TcpStream,
    info: ConnectionInfo,
}

#[derive(Default)]
struct ConnectionTable {
    inner: Mutex<TableInner>,
}

#[derive(Default)]
struct TableInner {
    next_id: u64,
    closed: bool,
    entries: HashMap<u64, Connection>,
}

impl ConnectionTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking `stream`. Returns `None` once the table has been closed.
    fn register(&self, stream: &TcpStream) -> io::Result<Option<u64>> {
        let now = Instant::now();
        let info = ConnectionInfo {
            local: stream.local_addr()?,
            remote: stream.peer_addr()?,
            connected_at: now,
            last_activity: now,
            exchanges: 0,
        };
        let stream = stream.try_clone()?;

        let mut inner = self.lock();
        if inner.closed {
            return Ok(None);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, Connection { stream, info });
        Ok(Some(id))
    }

    fn touch(&self, id: u64, exchanged: bool) {
        if let Some(connection) = self.lock().entries.get_mut(&id) {
            connection.info.last_activity = Instant::now();
            if exchanged {
                connection.info.exchanges += 1;
            }
        }
    }

    fn remove(&self, id: u64) {
        self.lock().entries.remove(&id);
    }

    fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<_> = self
            .lock()
            .entries
            .values()
            .map(|c| c.info.clone())
            .collect();
        connections.sort_by_key(|info| info.connected_at);
        connections
    }

    /// Shuts down every tracked socket; workers see the peer as gone.
    fn close_all(&self, refuse_new: bool) -> usize {
        let mut inner = self.lock();
        inner.closed |= refuse_new;
        for connection in inner.entries.values() {
            if let Err(e) = connection.stream.shutdown(Shutdown::Both) {
                debug!("failed to shut down {}: {e}", connection.info.remote);
            }
        }
        inner.entries.len()
    }
}

struct Shared {
    local_addr: SocketAddr,
    running: AtomicBool,
    /// Connections turned away because every consumer was busy.
    refused: AtomicUsize,
    connections: ConnectionTable,
}

impl Shared {
    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let closed = self.connections.close_all(true);
        info!(
            "stopping listener at {} ({closed} connections closed, {} refused at capacity)",
            self.local_addr,
            self.refused.load(Ordering::SeqCst)
        );

        // The accept loop only notices the flag once accept returns.
        let wake = SocketAddr::new(reachable_ip(self.local_addr.ip()), self.local_addr.port());
        if let Err(e) = TcpStream::connect_timeout(&wake, WAKE_TIMEOUT) {
            debug!("failed to wake accept loop at {wake}: {e}");
        }
    }
}

fn reachable_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    }
}

/// Stops a running server from another thread, e.g. a signal handler.
#[derive(Clone)]
pub struct ShutdownSignal {
    shared: Arc<Shared>,
}

impl ShutdownSignal {
    pub fn trigger(&self) {
        self.shared.stop();
    }
}

/// A bound, running listener. Dropping the handle stops it.
pub struct ServerHandle {
    shared: Arc<Shared>,
    accept: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Live connections, oldest first.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared.connections.snapshot()
    }

    /// Connections refused so far because all consumers were busy.
    pub fn refused_connections(&self) -> usize {
        self.shared.refused.load(Ordering::SeqCst)
    }

    /// Closes every live connection while the listener keeps accepting new ones.
    pub fn close_connections(&self) -> usize {
        self.shared.connections.close_all(false)
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Closes all connections, stops accepting and waits for the workers to finish.
    pub fn shutdown(mut self) {
        self.shared.stop();
        self.join();
    }

    /// Blocks until the server is stopped through a [`ShutdownSignal`].
    pub fn wait(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(accept) = self.accept.take() {
            if accept.join().is_err() {
                error!("accept loop for {} panicked", self.shared.local_addr);
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shared.stop();
        self.join();
    }
}

struct Context {
    config: Arc<MllpConfig>,
    handlers: Arc<HandlerRegistry>,
    shared: Arc<Shared>,
}

fn accept_loop(listener: TcpListener, pool: ThreadPool, context: Arc<Context>) {
    for stream in listener.incoming() {
        if !context.shared.running.load(Ordering::SeqCst) {
            break;
        }

        match stream {
            Ok(stream) => {
                // Health checks end up here as well, so refusals are counted and
                // reported on shutdown instead of being logged one by one.
                if !pool.has_capacity() {
                    let refused = context.shared.refused.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(
                        "refusing connection from {}: all {} consumers are busy ({refused} refused)",
                        peer(&stream),
                        pool.size()
                    );
                    continue;
                }

                let id = match context.shared.connections.register(&stream) {
                    Ok(Some(id)) => id,
                    Ok(None) => break,
                    Err(e) if transport::is_disconnect(&e) => {
                        debug!("connection gone before it was registered: {e}");
                        continue;
                    }
                    Err(e) => {
                        warn!("failed to register connection: {e}");
                        continue;
                    }
                };

                let worker = Arc::clone(&context);
                let queued = pool.execute(move || {
                    handle_connection(stream, &worker, id);
                    worker.shared.connections.remove(id);
                });
                if !queued {
                    context.shared.connections.remove(id);
                }
            }
            Err(e) if transport::is_disconnect(&e) => {
                debug!("connection gone before it was accepted: {e}");
            }
            Err(e) => warn!("failed to accept connection: {e}"),
        }
    }

    debug!("accept loop for {} finished", context.shared.local_addr);
    // Dropping the pool joins the workers.
    drop(pool);
}

fn peer(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

fn handle_connection(stream: TcpStream, context: &Context, id: u64) {
    let config = &context.config;
    let (local, remote) = match (stream.local_addr(), stream.peer_addr()) {
        (Ok(local), Ok(remote)) => (local, remote),
        (Err(e), _) | (_, Err(e)) => {
            debug!("connection gone before it was served: {e}");
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(config.tcp_no_delay) {
        debug!("{remote}: failed to set TCP_NODELAY: {e}");
    }

    let mut transport = FrameTransport::new(stream).require_end_of_data(config.require_end_of_data);
    let timeouts = ReadTimeouts {
        initial: config.idle_timeout,
        between: config.read_timeout,
    };

    loop {
        let payload = match transport.read_frame(timeouts) {
            Ok(payload) => payload,
            Err(TransportError::Silent) => return,
            Err(TransportError::Frame(e)) => {
                warn!("{remote}: {e}");
                continue;
            }
            Err(TransportError::Closed { in_frame, partial }) => {
                if in_frame {
                    warn!("{remote}: connection closed mid-frame; {partial} bytes discarded");
                } else {
                    debug!("{remote}: connection closed by peer");
                }
                return;
            }
            Err(TransportError::Timeout { in_frame, partial }) => {
                if in_frame {
                    warn!(
                        "{remote}: no data for {:?} mid-frame; {partial} bytes discarded, closing connection",
                        config.read_timeout
                    );
                } else {
                    info!("{remote}: closing idle connection");
                }
                return;
            }
            Err(TransportError::Io(e)) => {
                error!("{remote}: {e}");
                return;
            }
        };
        context.shared.connections.touch(id, false);

        let Some(acknowledgement) = dispatch(payload, context, local, remote) else {
            return;
        };
        context.shared.connections.touch(id, true);

        if let Err(e) = transport.write_frame(&acknowledgement) {
            warn!("{remote}: failed to write acknowledgement: {e}");
            return;
        }
        debug!(
            "{remote}: sent acknowledgement {}",
            hl7::loggable(&acknowledgement, config.log_phi)
        );
    }
}

/// Runs one exchange. Returns the acknowledgement to write, or `None` when the
/// connection should be closed instead.
fn dispatch(
    payload: Vec<u8>,
    context: &Context,
    local: SocketAddr,
    remote: SocketAddr,
) -> Option<Vec<u8>> {
    let config = &context.config;
    let charset = Charset::resolve(config.charset, &payload);

    let mut headers = if config.hl7_headers {
        hl7::headers(&payload, charset)
    } else {
        Headers::new()
    };
    headers.insert(header::MLLP_LOCAL_ADDRESS.to_string(), local.to_string());
    headers.insert(header::MLLP_REMOTE_ADDRESS.to_string(), remote.to_string());

    let control_id = hl7::message_control_id(&payload, charset);
    let label = control_id.as_deref().unwrap_or("<no control id>");
    info!("{remote}: received message {label}");
    debug!("{remote}: {}", hl7::loggable(&payload, config.log_phi));

    let mut exchange = Exchange::new(payload, charset, headers);

    let validated = if config.validate_payload {
        hl7::validate(exchange.payload()).map_err(|e| HandlerError::Failed(e.to_string()))
    } else {
        Ok(())
    };
    let result = match validated {
        Ok(()) => invoke(&context.handlers, &mut exchange, remote)?,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        warn!("{remote}: message {label} failed: {e}");
    }

    if let Some(acknowledgement) = exchange.take_acknowledgement() {
        return Some(acknowledgement);
    }
    if !config.auto_ack {
        error!("{remote}: no acknowledgement for message {label} and auto-ack is disabled; closing connection");
        return None;
    }

    let (code, text) = match &result {
        Ok(()) => (
            exchange.ack_code().unwrap_or(AckCode::ApplicationAccept),
            exchange.ack_text(),
        ),
        Err(e) => (e.ack_code(), Some(e.text())),
    };
    match ack::generate(exchange.payload(), code, text) {
        Ok(acknowledgement) => Some(acknowledgement),
        Err(e) => {
            error!("{remote}: cannot acknowledge message {label}: {e}; closing connection");
            None
        }
    }
}

/// Calls the handler routed for the exchange. `None` means the handler panicked.
fn invoke(
    handlers: &HandlerRegistry,
    exchange: &mut Exchange,
    remote: SocketAddr,
) -> Option<Result<(), HandlerError>> {
    let msh = MshSegment::parse(exchange.payload()).ok();
    let message_type = msh
        .as_ref()
        .and_then(|msh| msh.field(9))
        .map(|value| String::from_utf8_lossy(value).into_owned());
    let event_type = msh
        .as_ref()
        .and_then(|msh| msh.message_type())
        .map(|(event, _)| String::from_utf8_lossy(event).into_owned());

    let Some(handler) = handlers.lookup(message_type.as_deref(), event_type.as_deref()) else {
        if handlers.is_empty() {
            return Some(Ok(()));
        }
        return Some(Err(HandlerError::Rejected(format!(
            "no handler for message type '{}'",
            message_type.unwrap_or_default()
        ))));
    };

    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(exchange))) {
        Ok(result) => Some(result),
        Err(_) => {
            error!("{remote}: message handler panicked; closing connection");
            None
        }
    }
}
