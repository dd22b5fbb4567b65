//! Minimal HL7 v2 helpers.
//!
//! The transport never interprets message content beyond the MSH segment: it reads a
//! handful of MSH fields to populate exchange headers and to build acknowledgements,
//! and can optionally check that a payload looks like an HL7 message at all.
use thiserror::Error;

use super::{
    Headers,
    charset::Charset,
    frame::{END_OF_BLOCK, START_OF_BLOCK},
    header,
};

pub const SEGMENT_DELIMITER: u8 = b'\r';

const MSH: &[u8] = b"MSH";
const DEFAULT_FIELD_SEPARATOR: u8 = b'|';
const DEFAULT_COMPONENT_SEPARATOR: u8 = b'^';

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("HL7 payload is empty")]
    Empty,

    #[error("the first segment of the HL7 payload {{{0}}} is not an MSH segment")]
    NotMsh(String),

    #[error("HL7 payload contains an embedded START_OF_BLOCK {{0x0b, ASCII <VT>}} at index {0}")]
    EmbeddedStartOfBlock(usize),

    #[error("HL7 payload contains an embedded END_OF_BLOCK {{0x1c, ASCII <FS>}} at index {0}")]
    EmbeddedEndOfBlock(usize),

    #[error("the HL7 payload terminating byte [{0:#x}] is incorrect - expected [0xd] {{ASCII [<CR>]}}")]
    Terminator(u8),

    #[error("MSH segment has {found} fields; at least {required} are needed")]
    MissingFields { found: usize, required: usize },
}

/// The MSH segment of a payload, split on its field separator.
///
/// Field numbers follow HL7: MSH-1 is the separator itself, MSH-2 the encoding
/// characters, MSH-3 the sending application and so on.
#[derive(Debug)]
pub struct MshSegment<'a> {
    separator: u8,
    fields: Vec<&'a [u8]>,
}

impl<'a> MshSegment<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, PayloadError> {
        if payload.is_empty() {
            return Err(PayloadError::Empty);
        }
        if !payload.starts_with(MSH) || payload.len() < 4 {
            return Err(PayloadError::NotMsh(first_segment_name(payload)));
        }

        let separator = payload[3];
        let end = payload
            .iter()
            .position(|&b| is_segment_end(b))
            .unwrap_or(payload.len());
        let fields = payload[..end].split(|&b| b == separator).collect();

        Ok(Self { separator, fields })
    }

    pub fn separator(&self) -> u8 {
        self.separator
    }

    pub fn component_separator(&self) -> u8 {
        self.field(2)
            .and_then(|chars| chars.first().copied())
            .unwrap_or(DEFAULT_COMPONENT_SEPARATOR)
    }

    /// Number of fields including MSH-1.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.len() <= 1
    }

    /// Returns MSH-`n` for `n >= 2`. MSH-1 is available through [`MshSegment::separator`].
    pub fn field(&self, n: usize) -> Option<&'a [u8]> {
        if n < 2 {
            return None;
        }
        self.fields.get(n - 1).copied()
    }

    /// Fields from MSH-`n` to the end of the segment.
    pub fn fields_from(&self, n: usize) -> &[&'a [u8]] {
        self.fields.get(n.max(2) - 1..).unwrap_or(&[])
    }

    /// MSH-9 split into message type and trigger event.
    pub fn message_type(&self) -> Option<(&'a [u8], Option<&'a [u8]>)> {
        let value = self.field(9).filter(|v| !v.is_empty())?;
        let component = self.component_separator();
        let mut parts = value.splitn(3, |&b| b == component);
        let event = parts.next()?;
        let trigger = parts.next().filter(|t| !t.is_empty());
        Some((event, trigger))
    }
}

/// Returns MSH-`n` of `payload` when it carries an MSH segment.
pub fn field(payload: &[u8], n: usize) -> Option<&[u8]> {
    MshSegment::parse(payload).ok()?.field(n)
}

/// MSH-10, used as the correlation id of an exchange.
pub fn message_control_id(payload: &[u8], charset: Charset) -> Option<String> {
    field(payload, 10)
        .filter(|id| !id.is_empty())
        .map(|id| charset.decode(id))
}

/// Exchange headers derived from the MSH segment. Empty fields produce no header.
pub fn headers(payload: &[u8], charset: Charset) -> Headers {
    let mut headers = Headers::new();
    let Ok(msh) = MshSegment::parse(payload) else {
        return headers;
    };

    let named = [
        (3, header::MLLP_SENDING_APPLICATION),
        (4, header::MLLP_SENDING_FACILITY),
        (5, header::MLLP_RECEIVING_APPLICATION),
        (6, header::MLLP_RECEIVING_FACILITY),
        (7, header::MLLP_TIMESTAMP),
        (8, header::MLLP_SECURITY),
        (9, header::MLLP_MESSAGE_TYPE),
        (10, header::MLLP_MESSAGE_CONTROL),
        (11, header::MLLP_PROCESSING_ID),
        (12, header::MLLP_VERSION_ID),
        (18, header::MLLP_CHARSET),
    ];
    for (n, name) in named {
        if let Some(value) = msh.field(n).filter(|v| !v.is_empty()) {
            headers.insert(name.to_string(), charset.decode(value));
        }
    }

    if let Some((event, trigger)) = msh.message_type() {
        headers.insert(header::MLLP_EVENT_TYPE.to_string(), charset.decode(event));
        if let Some(trigger) = trigger {
            headers.insert(header::MLLP_TRIGGER_EVENT.to_string(), charset.decode(trigger));
        }
    }

    headers
}

/// Checks that `payload` is shaped like an HL7 message.
pub fn validate(payload: &[u8]) -> Result<(), PayloadError> {
    if payload.is_empty() {
        return Err(PayloadError::Empty);
    }
    if !payload.starts_with(MSH) {
        return Err(PayloadError::NotMsh(first_segment_name(payload)));
    }
    for (index, byte) in payload.iter().enumerate() {
        match *byte {
            START_OF_BLOCK => return Err(PayloadError::EmbeddedStartOfBlock(index)),
            END_OF_BLOCK => return Err(PayloadError::EmbeddedEndOfBlock(index)),
            _ => {}
        }
    }
    match payload.last() {
        Some(&SEGMENT_DELIMITER) | None => Ok(()),
        Some(&other) => Err(PayloadError::Terminator(other)),
    }
}

/// Renders control characters visibly so payloads can be logged on one line.
pub fn print_friendly(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }

    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        match byte {
            b'\r' => out.push_str("<0x0D CR>"),
            b'\n' => out.push_str("<0x0A LF>"),
            START_OF_BLOCK => out.push_str("<0x0B VT>"),
            END_OF_BLOCK => out.push_str("<0x1C FS>"),
            other => out.push(other as char),
        }
    }
    out
}

/// Payload as it may appear in logs: contents only when `log_phi` allows it.
pub fn loggable(bytes: &[u8], log_phi: bool) -> String {
    if log_phi {
        print_friendly(bytes)
    } else {
        format!("<{} bytes>", bytes.len())
    }
}

pub(crate) fn field_separator(payload: &[u8]) -> u8 {
    match payload.get(3) {
        Some(&separator) if payload.starts_with(MSH) => separator,
        _ => DEFAULT_FIELD_SEPARATOR,
    }
}

pub(crate) fn is_segment_end(byte: u8) -> bool {
    byte == SEGMENT_DELIMITER || byte == b'\n'
}

fn first_segment_name(payload: &[u8]) -> String {
    let end = payload.len().min(3);
    Charset::Iso8859_1.decode(&payload[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::TEST_MESSAGE;

    #[test]
    fn msh_fields() {
        let msh = MshSegment::parse(TEST_MESSAGE).unwrap();

        assert_eq!(msh.separator(), b'|');
        assert_eq!(msh.component_separator(), b'^');
        assert_eq!(msh.field(1), None);
        assert_eq!(msh.field(2), Some(&b"^~\\&"[..]));
        assert_eq!(msh.field(3), Some(&b"REQUESTING"[..]));
        assert_eq!(msh.field(10), Some(&b"00001"[..]));
        assert_eq!(msh.field(40), None);
        assert_eq!(msh.message_type(), Some((&b"ORM"[..], Some(&b"O01"[..]))));
        assert_eq!(msh.fields_from(11)[0], b"D");
    }

    #[test]
    fn headers_from_msh() {
        let headers = headers(TEST_MESSAGE, Charset::Iso8859_1);

        assert_eq!(headers[header::MLLP_SENDING_APPLICATION], "REQUESTING");
        assert_eq!(headers[header::MLLP_RECEIVING_FACILITY], "RTH00");
        assert_eq!(headers[header::MLLP_MESSAGE_TYPE], "ORM^O01");
        assert_eq!(headers[header::MLLP_EVENT_TYPE], "ORM");
        assert_eq!(headers[header::MLLP_TRIGGER_EVENT], "O01");
        assert_eq!(headers[header::MLLP_MESSAGE_CONTROL], "00001");
        assert_eq!(headers[header::MLLP_VERSION_ID], "2.3");
        assert!(!headers.contains_key(header::MLLP_SECURITY));
        assert!(!headers.contains_key(header::MLLP_CHARSET));
    }

    #[test]
    fn headers_from_non_hl7_payload() {
        assert!(headers(b"hello", Charset::Utf8).is_empty());
        assert_eq!(message_control_id(b"hello", Charset::Utf8), None);
    }

    #[test]
    fn validate_payloads() {
        assert_eq!(validate(TEST_MESSAGE), Ok(()));
        assert_eq!(validate(b""), Err(PayloadError::Empty));
        assert_eq!(
            validate(b"MSA|AA|00001|\r"),
            Err(PayloadError::NotMsh("MSA".into()))
        );
        assert_eq!(
            validate(&TEST_MESSAGE[..9]),
            Err(PayloadError::Terminator(b'|'))
        );

        let mut embedded = TEST_MESSAGE.to_vec();
        embedded.insert(20, END_OF_BLOCK);
        assert_eq!(validate(&embedded), Err(PayloadError::EmbeddedEndOfBlock(20)));

        embedded[20] = START_OF_BLOCK;
        assert_eq!(validate(&embedded), Err(PayloadError::EmbeddedStartOfBlock(20)));
    }

    #[test]
    fn print_friendly_payload() {
        assert_eq!(print_friendly(b""), "<empty>");
        assert_eq!(
            print_friendly(b"MSH|^~\\&\rPID|1\r"),
            "MSH|^~\\&<0x0D CR>PID|1<0x0D CR>"
        );
        assert_eq!(loggable(b"secret", false), "<6 bytes>");
        assert_eq!(loggable(b"secret", true), "secret");
    }
}
