//! Endpoint configuration shared by listeners and client sessions.
//!
//! [`MllpConfig`] derives [`clap::Args`] so both binaries can flatten it into their
//! own parsers; library users build it from [`Default`] and override fields.
//! Durations are given in milliseconds on the command line.
use std::{net::SocketAddr, num::ParseIntError, time::Duration};

use clap::{ArgAction, Args, ValueEnum};

use crate::protocol::Charset;

pub const DEFAULT_PORT: u16 = 2575;

/// What a client session does with its connection after a response timeout in
/// which no acknowledgement bytes arrived at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ReconnectPolicy {
    /// Keep the connection; the caller decides whether to close it.
    #[default]
    Caller,
    /// Close the connection so the next send starts on a fresh one.
    AutoClose,
}

#[derive(Debug, Clone, Args)]
pub struct MllpConfig {
    /// Host to bind (listener) or connect to (client)
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// TCP port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Timeout for establishing a connection, in milliseconds
    #[arg(long = "connect-timeout", value_name = "MILLIS", default_value = "30000", value_parser = parse_millis)]
    pub connect_timeout: Duration,

    /// Time to wait for the first byte of an acknowledgement, in milliseconds
    #[arg(long = "receive-timeout", value_name = "MILLIS", default_value = "15000", value_parser = parse_millis)]
    pub receive_timeout: Duration,

    /// Time to wait for each further read once a frame has started, in milliseconds
    #[arg(long = "read-timeout", value_name = "MILLIS", default_value = "5000", value_parser = parse_millis)]
    pub read_timeout: Duration,

    /// Close connections unused for this long, in milliseconds
    #[arg(long = "idle-timeout", value_name = "MILLIS", value_parser = parse_millis)]
    pub idle_timeout: Option<Duration>,

    /// Give up binding the listener after this long, in milliseconds
    #[arg(long = "bind-timeout", value_name = "MILLIS", default_value = "30000", value_parser = parse_millis)]
    pub bind_timeout: Duration,

    /// Pause between bind attempts, in milliseconds
    #[arg(long = "bind-retry-interval", value_name = "MILLIS", default_value = "5000", value_parser = parse_millis)]
    pub bind_retry_interval: Duration,

    /// Maximum number of connections a listener serves at once
    #[arg(long = "max-consumers", default_value_t = 5)]
    pub max_concurrent_consumers: usize,

    /// Generate acknowledgements for handled messages
    #[arg(long = "auto-ack", action = ArgAction::Set, default_value_t = true)]
    pub auto_ack: bool,

    /// Extract MSH fields into exchange headers
    #[arg(long = "hl7-headers", action = ArgAction::Set, default_value_t = true)]
    pub hl7_headers: bool,

    /// Reject frames whose END_OF_BLOCK is not followed by END_OF_DATA
    #[arg(long = "require-end-of-data", action = ArgAction::Set, default_value_t = true)]
    pub require_end_of_data: bool,

    /// Check that payloads look like HL7 before handing them on
    #[arg(long = "validate-payload", action = ArgAction::Set, default_value_t = false)]
    pub validate_payload: bool,

    /// Set TCP_NODELAY on connections
    #[arg(long = "tcp-no-delay", action = ArgAction::Set, default_value_t = true)]
    pub tcp_no_delay: bool,

    /// Character set for payload text; resolved from MSH-18 when not given
    #[arg(long)]
    pub charset: Option<Charset>,

    /// Include payload contents in log records
    #[arg(long = "log-phi", action = ArgAction::Set, default_value_t = false)]
    pub log_phi: bool,

    /// Connection handling after a response timeout with nothing received
    #[arg(long, value_enum, default_value_t = ReconnectPolicy::Caller)]
    pub reconnect: ReconnectPolicy,
}

impl Default for MllpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(5),
            idle_timeout: None,
            bind_timeout: Duration::from_secs(30),
            bind_retry_interval: Duration::from_secs(5),
            max_concurrent_consumers: 5,
            auto_ack: true,
            hl7_headers: true,
            require_end_of_data: true,
            validate_payload: false,
            tcp_no_delay: true,
            charset: None,
            log_phi: false,
            reconnect: ReconnectPolicy::Caller,
        }
    }
}

impl MllpConfig {
    /// `host:port`, ready for [`std::net::ToSocketAddrs`].
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.host = address.ip().to_string();
        self.port = address.port();
        self
    }
}

pub fn parse_millis(s: &str) -> Result<Duration, ParseIntError> {
    s.trim().parse().map(Duration::from_millis)
}
