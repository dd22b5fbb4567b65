//! Failures surfaced to whoever drives the transport.
//!
//! The core never retries on its own. Each [`MllpError`] instead says which
//! [`Outcome`] it stands for and gives a [`Redelivery`] hint, so a routing engine can
//! decide whether to send the same message again and on which connection.
use std::{io, time::Duration};

use thiserror::Error;

use super::{
    ack::{Acknowledgement, Outcome},
    frame::FrameError,
    hl7::PayloadError,
};

#[derive(Debug, Error)]
pub enum MllpError {
    #[error("timed out after {timeout:?} connecting to {address}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {address} within {timeout:?}: {source}")]
    Bind {
        address: String,
        timeout: Duration,
        #[source]
        source: io::Error,
    },

    #[error("no acknowledgement within {timeout:?} ({partial} bytes of a partial frame received)")]
    ResponseTimeout {
        timeout: Duration,
        partial: usize,
        correlation_id: Option<String>,
    },

    #[error("invalid acknowledgement frame: {source}")]
    Frame {
        #[source]
        source: FrameError,
        correlation_id: Option<String>,
    },

    #[error("connection closed by peer before an acknowledgement was received ({partial} bytes pending)")]
    ConnectionReset {
        partial: usize,
        correlation_id: Option<String>,
    },

    #[error("application error acknowledgement (AE) received{}", for_message(.0))]
    ApplicationErrorAck(Box<Acknowledgement>),

    #[error("application reject acknowledgement (AR) received{}", for_message(.0))]
    ApplicationRejectAck(Box<Acknowledgement>),

    #[error("malformed acknowledgement{}: {reason}", for_message(.acknowledgement))]
    MalformedAck {
        reason: String,
        acknowledgement: Box<Acknowledgement>,
    },

    /// The acknowledgement answers another message, typically one that timed out
    /// earlier on the same connection.
    #[error("acknowledgement for message {acknowledged} received for message {correlation_id}")]
    AckMismatch {
        correlation_id: String,
        acknowledged: String,
        acknowledgement: Box<Acknowledgement>,
    },

    #[error("invalid HL7 payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
}

/// Whether sending the same message again can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// Send again; the connection is still usable.
    Retry,
    /// Send again on a fresh connection.
    Reconnect,
    /// Sending the same bytes again will fail the same way.
    Never,
}

impl MllpError {
    /// The exchange outcome this error stands for, when an exchange was attempted.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            MllpError::ResponseTimeout { .. } => Some(Outcome::Timeout),
            MllpError::ApplicationErrorAck(_) => Some(Outcome::ApplicationError),
            MllpError::ApplicationRejectAck(_) => Some(Outcome::ApplicationReject),
            MllpError::MalformedAck { .. }
            | MllpError::AckMismatch { .. }
            | MllpError::Frame { .. } => Some(Outcome::Malformed),
            _ => None,
        }
    }

    pub fn redelivery(&self) -> Redelivery {
        match self {
            MllpError::ApplicationRejectAck(_)
            | MllpError::MalformedAck { .. }
            | MllpError::InvalidPayload(_) => Redelivery::Never,
            MllpError::ResponseTimeout { .. }
            | MllpError::AckMismatch { .. }
            | MllpError::Frame { .. }
            | MllpError::ConnectionReset { .. }
            | MllpError::Io(_) => Redelivery::Reconnect,
            MllpError::ConnectTimeout { .. }
            | MllpError::Connect { .. }
            | MllpError::Bind { .. }
            | MllpError::ApplicationErrorAck(_) => Redelivery::Retry,
        }
    }

    /// MSH-10 of the message the failed exchange carried.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            MllpError::ResponseTimeout { correlation_id, .. }
            | MllpError::Frame { correlation_id, .. }
            | MllpError::ConnectionReset { correlation_id, .. } => correlation_id.as_deref(),
            MllpError::AckMismatch { correlation_id, .. } => Some(correlation_id),
            _ => self.acknowledgement()?.correlation_id(),
        }
    }

    /// The acknowledgement behind an AE, AR or malformed outcome.
    pub fn acknowledgement(&self) -> Option<&Acknowledgement> {
        match self {
            MllpError::ApplicationErrorAck(ack) | MllpError::ApplicationRejectAck(ack) => Some(&**ack),
            MllpError::MalformedAck {
                acknowledgement, ..
            }
            | MllpError::AckMismatch {
                acknowledgement, ..
            } => Some(&**acknowledgement),
            _ => None,
        }
    }
}

fn for_message(acknowledgement: &Acknowledgement) -> String {
    acknowledgement
        .correlation_id()
        .map(|id| format!(" for message {id}"))
        .unwrap_or_default()
}
