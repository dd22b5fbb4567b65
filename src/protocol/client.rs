use std::{
    io,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Instant,
};

use log::{debug, info, warn};

use crate::config::{MllpConfig, ReconnectPolicy};

use super::{
    Headers,
    ack::{self, Acknowledgement, Outcome},
    charset::Charset,
    error::MllpError,
    header, hl7,
    transport::{self, FrameTransport, ReadTimeouts, TransportError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Sending,
    AwaitingAck,
    /// The last exchange failed. The next send starts over.
    Failed,
}

struct Connection {
    transport: FrameTransport<TcpStream>,
    local: SocketAddr,
    remote: SocketAddr,
    last_used: Instant,
}

/// What to do with the connection once an exchange has ended.
enum Keep {
    Open,
    Close,
}

/// A client session: one connection, one message in flight.
///
/// The connection is opened on the first send and reused afterwards. Failures that
/// leave the stream in an unknown state close it, so the next send reconnects.
pub struct MllpClient {
    config: Arc<MllpConfig>,
    state: SessionState,
    connection: Option<Connection>,
}

impl MllpClient {
    pub fn new(config: MllpConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: SessionState::Idle,
            connection: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Whether bytes arrived after the last acknowledgement, either buffered or
    /// still waiting on the socket. Checked without blocking.
    ///
    /// [`MllpClient::send`] drops such a connection and reconnects before sending.
    pub fn has_pending_data(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.transport.has_buffered() || socket_has_data(c.transport.get_ref()))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().map(|c| c.local)
    }

    pub fn connect(&mut self) -> Result<(), MllpError> {
        if self.connection.is_none() {
            let connection = self.open()?;
            self.connection = Some(connection);
            self.state = SessionState::Idle;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            info!("closing connection to {}", connection.remote);
        }
    }

    fn open(&mut self) -> Result<Connection, MllpError> {
        self.state = SessionState::Connecting;
        let result = connect(&self.config);
        if result.is_err() {
            self.state = SessionState::Failed;
        }
        result
    }

    /// Sends one message and waits for its acknowledgement.
    ///
    /// An `AA` acknowledgement is returned as `Ok`; everything else, including `AE` and
    /// `AR`, is an error carrying the [`Outcome`]. `headers` may name a charset
    /// ([`header::MLLP_CHARSET`]) or a correlation id ([`header::MLLP_MESSAGE_CONTROL`])
    /// for payloads that do not carry them in MSH.
    pub fn send(&mut self, payload: &[u8], headers: &Headers) -> Result<Acknowledgement, MllpError> {
        if self.config.validate_payload {
            if let Err(e) = hl7::validate(payload) {
                self.state = SessionState::Failed;
                return Err(e.into());
            }
        }

        let charset = headers
            .get(header::MLLP_CHARSET)
            .and_then(|name| Charset::from_msh18(name))
            .or(self.config.charset)
            .unwrap_or_else(|| Charset::resolve(None, payload));
        let correlation_id = hl7::message_control_id(payload, charset)
            .or_else(|| headers.get(header::MLLP_MESSAGE_CONTROL).cloned());

        self.expire_idle();
        let mut connection = match self.take_clean_connection() {
            Some(connection) => connection,
            None => self.open()?,
        };

        let (result, keep) = self.exchange(&mut connection, payload, charset, correlation_id);
        connection.last_used = Instant::now();
        if let Keep::Open = keep {
            self.connection = Some(connection);
        } else {
            debug!("closing connection to {} after failed exchange", connection.remote);
        }

        self.state = match result {
            Ok(_) => SessionState::Idle,
            Err(_) => SessionState::Failed,
        };
        result
    }

    fn exchange(
        &mut self,
        connection: &mut Connection,
        payload: &[u8],
        charset: Charset,
        correlation_id: Option<String>,
    ) -> (Result<Acknowledgement, MllpError>, Keep) {
        let config = Arc::clone(&self.config);
        let remote = connection.remote;
        let label = correlation_id.clone().unwrap_or_else(|| "<no control id>".to_string());

        self.state = SessionState::Sending;
        debug!("{remote}: sending message {label}: {}", hl7::loggable(payload, config.log_phi));
        if let Err(e) = connection.transport.write_frame(payload) {
            warn!("{remote}: failed to send message {label}: {e}");
            return (Err(transport_error(e, &config, correlation_id)), Keep::Close);
        }

        self.state = SessionState::AwaitingAck;
        let timeouts = ReadTimeouts {
            initial: Some(config.receive_timeout),
            between: config.read_timeout,
        };
        let response = match connection.transport.read_frame(timeouts) {
            Ok(response) => response,
            Err(e) => {
                warn!("{remote}: no acknowledgement for message {label}: {e}");
                // Only a silent peer leaves the stream in a known state.
                let keep = match (&e, config.reconnect) {
                    (TransportError::Timeout { in_frame: false, .. }, ReconnectPolicy::Caller) => {
                        Keep::Open
                    }
                    _ => Keep::Close,
                };
                return (Err(transport_error(e, &config, correlation_id)), keep);
            }
        };
        debug!(
            "{remote}: received acknowledgement {}",
            hl7::loggable(&response, config.log_phi)
        );

        // The acknowledgement's own MSH-18 wins over the charset of the request.
        let ack_charset = match config.charset {
            Some(configured) => configured,
            None if hl7::field(&response, 18).is_some_and(|v| !v.is_empty()) => {
                Charset::resolve(None, &response)
            }
            None => charset,
        };
        let mut headers = Headers::new();
        headers.insert(header::MLLP_LOCAL_ADDRESS.to_string(), connection.local.to_string());
        headers.insert(header::MLLP_REMOTE_ADDRESS.to_string(), remote.to_string());
        headers.insert(
            header::MLLP_ACKNOWLEDGEMENT_STRING.to_string(),
            ack_charset.decode(&response),
        );
        if let Some(code) = ack::status_field(&response) {
            headers.insert(
                header::MLLP_ACKNOWLEDGEMENT_TYPE.to_string(),
                ack_charset.decode(code),
            );
        }
        if let Some(id) = &correlation_id {
            headers.insert(header::MLLP_MESSAGE_CONTROL.to_string(), id.clone());
        }
        let acknowledged = ack::correlation_id(&response).map(|id| ack_charset.decode(id));
        if let Some(acked) = &acknowledged {
            headers.insert(header::MLLP_ACKNOWLEDGEMENT_CONTROL.to_string(), acked.clone());
        }

        let validation = if config.validate_payload {
            hl7::validate(&response).err()
        } else {
            None
        };
        let outcome = ack::classify(&response);
        let acknowledgement = Box::new(Acknowledgement {
            outcome,
            payload: response,
            headers,
        });

        if let (Some(expected), Some(acked)) = (correlation_id, acknowledged) {
            if expected != acked {
                let err = MllpError::AckMismatch {
                    correlation_id: expected,
                    acknowledged: acked,
                    acknowledgement,
                };
                warn!("{remote}: {err}; closing connection");
                return (Err(err), Keep::Close);
            }
        }

        let result = match (validation, outcome) {
            (Some(e), _) => Err(MllpError::MalformedAck {
                reason: e.to_string(),
                acknowledgement,
            }),
            (None, Outcome::Accept) => {
                debug!("{remote}: message {label} accepted");
                Ok(*acknowledgement)
            }
            (None, Outcome::ApplicationError) => Err(MllpError::ApplicationErrorAck(acknowledgement)),
            (None, Outcome::ApplicationReject) => {
                Err(MllpError::ApplicationRejectAck(acknowledgement))
            }
            (None, Outcome::Malformed | Outcome::Timeout) => Err(MllpError::MalformedAck {
                reason: "no AA, AE or AR code in MSA-1".to_string(),
                acknowledgement,
            }),
        };
        if let Err(e) = &result {
            warn!("{remote}: message {label}: {e}");
        }

        (result, Keep::Open)
    }

    /// Takes the open connection if nothing arrived on it since the last exchange.
    ///
    /// Unsolicited bytes are most likely a late acknowledgement; reading them as the
    /// answer to the next message would pair it with the wrong message.
    fn take_clean_connection(&mut self) -> Option<Connection> {
        let mut connection = self.connection.take()?;
        match connection.transport.drain() {
            Ok(0) => Some(connection),
            Ok(stale) => {
                warn!(
                    "{}: {stale} bytes arrived after the last exchange; reconnecting",
                    connection.remote
                );
                None
            }
            Err(e) => {
                debug!("{}: connection no longer usable ({e}); reconnecting", connection.remote);
                None
            }
        }
    }

    /// Drops a connection that has been unused for longer than the idle timeout.
    fn expire_idle(&mut self) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };
        if self
            .connection
            .as_ref()
            .is_some_and(|c| c.last_used.elapsed() >= idle_timeout)
        {
            info!("connection idle for more than {idle_timeout:?}; reconnecting");
            self.close();
        }
    }
}

fn transport_error(
    err: TransportError,
    config: &MllpConfig,
    correlation_id: Option<String>,
) -> MllpError {
    match err {
        TransportError::Silent => MllpError::ConnectionReset {
            partial: 0,
            correlation_id,
        },
        TransportError::Closed { partial, .. } => MllpError::ConnectionReset {
            partial,
            correlation_id,
        },
        TransportError::Frame(source) => MllpError::Frame {
            source,
            correlation_id,
        },
        TransportError::Io(e) if transport::is_disconnect(&e) => MllpError::ConnectionReset {
            partial: 0,
            correlation_id,
        },
        TransportError::Io(e) => MllpError::Io(e),
        TransportError::Timeout { partial, .. } => MllpError::ResponseTimeout {
            timeout: config.receive_timeout,
            partial,
            correlation_id,
        },
    }
}

fn socket_has_data(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let pending = matches!(stream.peek(&mut [0; 1]), Ok(n) if n > 0);
    if let Err(e) = stream.set_nonblocking(false) {
        debug!("failed to restore blocking mode: {e}");
    }
    pending
}

fn connect(config: &MllpConfig) -> Result<Connection, MllpError> {
    let address = config.address();
    let candidates: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(|source| MllpError::Connect {
            address: address.clone(),
            source,
        })?
        .collect();

    let mut last_error = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, config.connect_timeout) {
            Ok(stream) => {
                stream.set_nodelay(config.tcp_no_delay)?;
                let local = stream.local_addr()?;
                info!("connected to {candidate} from {local}");

                return Ok(Connection {
                    transport: FrameTransport::new(stream)
                        .require_end_of_data(config.require_end_of_data),
                    local,
                    remote: candidate,
                    last_used: Instant::now(),
                });
            }
            Err(e) => {
                debug!("failed to connect to {candidate}: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
            MllpError::ConnectTimeout {
                address,
                timeout: config.connect_timeout,
            }
        }
        Some(source) => MllpError::Connect { address, source },
        None => MllpError::Connect {
            address,
            source: io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"),
        },
    })
}
