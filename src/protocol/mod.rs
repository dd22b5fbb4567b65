//! MLLP transport.
//!
//! This module implements the Minimal Lower-Layer Protocol used to carry HL7 v2
//! messages over TCP, in both the accepting ([`MllpServer`]) and the initiating
//! ([`MllpClient`]) role.
//!
//! # Overview
//!
//! Messages travel as opaque byte payloads wrapped in a three byte envelope (see
//! [`frame`]). Every message is answered by exactly one acknowledgement on the same
//! connection before the next message is sent, so a connection always alternates
//! strictly between request and acknowledgement.
//!
//! The server side decodes frames, hands each payload to a [`MessageHandler`] looked
//! up in a [`HandlerRegistry`], and writes back either the acknowledgement chosen by
//! the handler or one generated from the request's MSH segment. The client side
//! sends a payload, waits for the acknowledgement and classifies it into an
//! [`Outcome`].
//!
//! # Key Components
//!
//! - [`FrameDecoder`]: resumable envelope decoder, one per connection.
//! - [`FrameTransport`]: frames over a byte stream with read deadlines.
//! - [`MllpServer`]: listener with a bounded worker pool.
//! - [`ListenerRegistry`]: shares one listener per port between several routes.
//! - [`MllpClient`]: a single connection with one exchange in flight.
//! - [`MllpError`]: failures with their [`Outcome`] and a [`Redelivery`] hint.
//!
//! # Failure handling
//!
//! Nothing in this module retries. A connection that opens and closes without sending
//! a byte is a health check and is dropped without a log record; connections refused
//! at capacity are counted instead of logged. An invalid frame
//! only costs the message it carried; the connection and every other connection keep
//! working.
//!
//! # See Also
//!
//! - [`config`](crate::config): the options every component is built from.
pub mod ack;
pub mod charset;
pub mod frame;
pub mod hl7;

mod client;
mod error;
mod exchange;
mod registry;
mod server;
mod thread;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;

use thread::ThreadPool;

pub use ack::{AckCode, Acknowledgement, Outcome};
pub use charset::Charset;
pub use client::{MllpClient, SessionState};
pub use error::{MllpError, Redelivery};
pub use exchange::{Exchange, HandlerError, MessageHandler};
pub use frame::{Decoded, FrameDecoder, FrameError};
pub use registry::{DEFAULT_ROUTE, HandlerRegistry, ListenerRegistry};
pub use server::{ConnectionInfo, MllpServer, ServerHandle, ShutdownSignal};
pub use transport::{FrameTransport, ReadTimeouts, Stream, TransportError};

/// Exchange and acknowledgement headers, keyed by the names in [`header`].
pub type Headers = BTreeMap<String, String>;

/// Header names set on exchanges and acknowledgements.
pub mod header {
    pub const MLLP_SENDING_APPLICATION: &str = "MllpSendingApplication";
    pub const MLLP_SENDING_FACILITY: &str = "MllpSendingFacility";
    pub const MLLP_RECEIVING_APPLICATION: &str = "MllpReceivingApplication";
    pub const MLLP_RECEIVING_FACILITY: &str = "MllpReceivingFacility";
    pub const MLLP_TIMESTAMP: &str = "MllpTimestamp";
    pub const MLLP_SECURITY: &str = "MllpSecurity";
    pub const MLLP_MESSAGE_TYPE: &str = "MllpMessageType";
    pub const MLLP_EVENT_TYPE: &str = "MllpEventType";
    pub const MLLP_TRIGGER_EVENT: &str = "MllpTriggerEvent";
    /// MSH-10, the correlation id of an exchange.
    pub const MLLP_MESSAGE_CONTROL: &str = "MllpMessageControlId";
    pub const MLLP_PROCESSING_ID: &str = "MllpProcessingId";
    pub const MLLP_VERSION_ID: &str = "MllpVersionId";
    pub const MLLP_CHARSET: &str = "MllpCharset";

    pub const MLLP_LOCAL_ADDRESS: &str = "MllpLocalAddress";
    pub const MLLP_REMOTE_ADDRESS: &str = "MllpRemoteAddress";

    /// `AA`, `AE` or `AR`.
    pub const MLLP_ACKNOWLEDGEMENT_TYPE: &str = "MllpAcknowledgementType";
    pub const MLLP_ACKNOWLEDGEMENT_STRING: &str = "MllpAcknowledgementString";
    /// MSA-2 of a received acknowledgement.
    pub const MLLP_ACKNOWLEDGEMENT_CONTROL: &str = "MllpAcknowledgementControlId";
}
