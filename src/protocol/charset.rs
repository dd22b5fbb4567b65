//! Character encodings used to turn HL7 payload bytes into text and back.
//!
//! Payloads travel as raw bytes; text is only needed for headers, logging and
//! acknowledgement strings. The encoding is resolved in this order: explicitly
//! configured, then MSH-18 of the payload, then ISO-8859-1.
use std::{fmt, str::FromStr};

use thiserror::Error;

use super::hl7;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CharsetError {
    #[error("unsupported character set '{0}'")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    UsAscii,
    #[default]
    Iso8859_1,
    Utf8,
}

impl Charset {
    pub fn name(&self) -> &'static str {
        match self {
            Charset::UsAscii => "US-ASCII",
            Charset::Iso8859_1 => "ISO-8859-1",
            Charset::Utf8 => "UTF-8",
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Charset::UsAscii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
                .collect(),
            Charset::Iso8859_1 => bytes.iter().map(|&b| b as char).collect(),
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Encodes `text`, replacing characters the charset cannot represent with `?`.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let limit = match self {
            Charset::Utf8 => return text.as_bytes().to_vec(),
            Charset::UsAscii => 0x7F,
            Charset::Iso8859_1 => 0xFF,
        };

        text.chars()
            .map(|c| u8::try_from(c as u32).ok().filter(|b| *b <= limit).unwrap_or(b'?'))
            .collect()
    }

    /// Maps an MSH-18 value to a charset.
    ///
    /// HL7 uses its own names (`ASCII`, `8859/1`, `UNICODE UTF-8`); standard names are
    /// accepted as well.
    pub fn from_msh18(value: &str) -> Option<Charset> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ASCII" => Some(Charset::UsAscii),
            "8859/1" => Some(Charset::Iso8859_1),
            "UNICODE UTF-8" => Some(Charset::Utf8),
            other => other.parse().ok(),
        }
    }

    /// Picks the charset for `payload`.
    pub fn resolve(configured: Option<Charset>, payload: &[u8]) -> Charset {
        configured
            .or_else(|| {
                hl7::field(payload, 18)
                    .and_then(|value| Charset::from_msh18(&Charset::UsAscii.decode(value)))
            })
            .unwrap_or_default()
    }
}

impl FromStr for Charset {
    type Err = CharsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "US-ASCII" | "ASCII" => Ok(Charset::UsAscii),
            "ISO-8859-1" | "ISO8859-1" | "LATIN1" | "LATIN-1" => Ok(Charset::Iso8859_1),
            "UTF-8" | "UTF8" => Ok(Charset::Utf8),
            _ => Err(CharsetError::Unsupported(s.to_string())),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
