//! HL7 acknowledgements.
//!
//! An acknowledgement is an ordinary HL7 message whose `MSA` segment carries the
//! status of the message it answers:
//!
//! ```text
//! MSH|^~\&|RECEIVER|FAC|SENDER|FAC|20240101||ACK^A01|00001A|P|2.3\r
//! MSA|AA|00001\r
//! ```
//!
//! [`classify`] turns the `MSA-1` code into an [`Outcome`] without ever failing,
//! and [`generate`] builds the acknowledgement a listener sends back when it
//! acknowledges on the application's behalf.
use std::{fmt, str::FromStr};

use thiserror::Error;

use super::{
    Headers, header,
    hl7::{self, MshSegment, PayloadError},
};

/// MSA is only looked for in segments starting with this tag.
const MSA: &[u8] = b"MSA";

/// An acknowledgement needs MSH-10 of the original message.
const REQUIRED_MSH_FIELDS: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("unsupported acknowledgement code '{0}'; expected AA, AE or AR")]
    UnsupportedCode(String),

    #[error("cannot acknowledge message: {0}")]
    InvalidMessage(#[from] PayloadError),
}

/// Result of a single exchange as seen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Accept,
    ApplicationError,
    ApplicationReject,
    Malformed,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckCode {
    /// `AA`
    ApplicationAccept,
    /// `AE`
    ApplicationError,
    /// `AR`
    ApplicationReject,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::ApplicationAccept => "AA",
            AckCode::ApplicationError => "AE",
            AckCode::ApplicationReject => "AR",
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            AckCode::ApplicationAccept => Outcome::Accept,
            AckCode::ApplicationError => Outcome::ApplicationError,
            AckCode::ApplicationReject => Outcome::ApplicationReject,
        }
    }

    fn from_bytes(code: &[u8]) -> Option<Self> {
        match code {
            b"AA" => Some(AckCode::ApplicationAccept),
            b"AE" => Some(AckCode::ApplicationError),
            b"AR" => Some(AckCode::ApplicationReject),
            _ => None,
        }
    }
}

impl FromStr for AckCode {
    type Err = AckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AckCode::from_bytes(s.trim().to_ascii_uppercase().as_bytes())
            .ok_or_else(|| AckError::UnsupportedCode(s.to_string()))
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An acknowledgement received by a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub outcome: Outcome,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl Acknowledgement {
    /// MSH-10 of the message this acknowledgement was received for, falling back
    /// to the control id the acknowledgement itself names in MSA-2.
    pub fn correlation_id(&self) -> Option<&str> {
        self.headers
            .get(header::MLLP_MESSAGE_CONTROL)
            .or_else(|| self.headers.get(header::MLLP_ACKNOWLEDGEMENT_CONTROL))
            .map(String::as_str)
    }
}

/// Fields of the first MSA segment, split on the payload's field separator.
fn msa_fields(payload: &[u8]) -> Option<Vec<&[u8]>> {
    let separator = hl7::field_separator(payload);

    payload
        .split(|&b| hl7::is_segment_end(b))
        .find(|segment| segment.starts_with(MSA) && segment.get(MSA.len()) == Some(&separator))
        .map(|segment| segment.split(|&b| b == separator).collect())
}

/// Raw `MSA-1` value when present.
pub fn status_field(payload: &[u8]) -> Option<&[u8]> {
    msa_fields(payload)?.get(1).copied()
}

/// The acknowledgement code, if the payload carries a supported one.
pub fn status_code(payload: &[u8]) -> Option<AckCode> {
    status_field(payload).and_then(AckCode::from_bytes)
}

/// Maps an acknowledgement payload to an [`Outcome`].
///
/// Anything that is not exactly `AA`, `AE` or `AR` in `MSA-1`, including a missing
/// MSA segment, is [`Outcome::Malformed`].
pub fn classify(payload: &[u8]) -> Outcome {
    status_code(payload)
        .map(|code| code.outcome())
        .unwrap_or(Outcome::Malformed)
}

/// `MSA-2`: the control id of the message being acknowledged.
pub fn correlation_id(payload: &[u8]) -> Option<&[u8]> {
    msa_fields(payload)?
        .get(2)
        .copied()
        .filter(|id| !id.is_empty())
}

/// Builds an acknowledgement for `message`.
///
/// Sender and receiver are swapped, MSH-9 becomes `ACK^<trigger>`, MSH-10 gets an
/// `A` suffix and the remaining MSH fields are copied. `text`, when given, goes into
/// MSA-3 with separators and segment delimiters blanked out.
pub fn generate(message: &[u8], code: AckCode, text: Option<&str>) -> Result<Vec<u8>, AckError> {
    let msh = MshSegment::parse(message)?;
    if msh.len() < REQUIRED_MSH_FIELDS {
        return Err(PayloadError::MissingFields {
            found: msh.len(),
            required: REQUIRED_MSH_FIELDS,
        }
        .into());
    }

    let separator = msh.separator();
    let field = |n| msh.field(n).unwrap_or_default();
    let control_id = field(10);

    let mut out = Vec::with_capacity(message.len().min(256) + 32);
    out.extend_from_slice(b"MSH");
    out.push(separator);
    out.extend_from_slice(field(2));
    for n in [5, 6, 3, 4, 7, 8] {
        out.push(separator);
        out.extend_from_slice(field(n));
    }

    out.push(separator);
    out.extend_from_slice(b"ACK");
    if let Some((_, Some(trigger))) = msh.message_type() {
        out.push(msh.component_separator());
        out.extend_from_slice(trigger);
    }

    out.push(separator);
    out.extend_from_slice(control_id);
    out.push(b'A');
    for value in msh.fields_from(11) {
        out.push(separator);
        out.extend_from_slice(value);
    }
    out.push(hl7::SEGMENT_DELIMITER);

    out.extend_from_slice(MSA);
    out.push(separator);
    out.extend_from_slice(code.as_str().as_bytes());
    out.push(separator);
    out.extend_from_slice(control_id);
    if let Some(text) = text.filter(|t| !t.is_empty()) {
        out.push(separator);
        out.extend(text.bytes().map(|b| {
            if b == separator || hl7::is_segment_end(b) {
                b' '
            } else {
                b
            }
        }));
    }
    out.push(hl7::SEGMENT_DELIMITER);

    Ok(out)
}
