//! One request/acknowledgement cycle as seen by the application.
use thiserror::Error;

use super::{Headers, ack::AckCode, charset::Charset, header};

/// Failure reported by a [`MessageHandler`].
///
/// With auto-acknowledgement enabled, `Failed` is answered with `AE` and `Rejected`
/// with `AR`; the message goes into MSA-3 either way.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("message processing failed: {0}")]
    Failed(String),

    #[error("message rejected: {0}")]
    Rejected(String),
}

impl HandlerError {
    pub fn ack_code(&self) -> AckCode {
        match self {
            HandlerError::Failed(_) => AckCode::ApplicationError,
            HandlerError::Rejected(_) => AckCode::ApplicationReject,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            HandlerError::Failed(text) | HandlerError::Rejected(text) => text,
        }
    }
}

/// Application callback invoked once per received message.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&mut Exchange) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        self(exchange)
    }
}

#[derive(Debug, Clone)]
pub struct Exchange {
    payload: Vec<u8>,
    charset: Charset,
    headers: Headers,
    acknowledgement: Option<Vec<u8>>,
    ack_code: Option<AckCode>,
    ack_text: Option<String>,
}

impl Exchange {
    pub fn new(payload: Vec<u8>, charset: Charset, headers: Headers) -> Self {
        Self {
            payload,
            charset,
            headers,
            acknowledgement: None,
            ack_code: None,
            ack_text: None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload decoded with the exchange charset.
    pub fn body(&self) -> String {
        self.charset.decode(&self.payload)
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// MSH-10 of the request, when HL7 headers were extracted.
    pub fn correlation_id(&self) -> Option<&str> {
        self.header(header::MLLP_MESSAGE_CONTROL)
    }

    /// Replies with `payload` verbatim instead of a generated acknowledgement.
    pub fn set_acknowledgement(&mut self, payload: impl Into<Vec<u8>>) {
        self.acknowledgement = Some(payload.into());
    }

    pub fn acknowledgement(&self) -> Option<&[u8]> {
        self.acknowledgement.as_deref()
    }

    /// Chooses the code (and optional MSA-3 text) of the generated acknowledgement.
    pub fn acknowledge(&mut self, code: AckCode, text: Option<&str>) {
        self.ack_code = Some(code);
        self.ack_text = text.map(str::to_string);
    }

    pub fn ack_code(&self) -> Option<AckCode> {
        self.ack_code
    }

    pub fn ack_text(&self) -> Option<&str> {
        self.ack_text.as_deref()
    }

    pub(crate) fn take_acknowledgement(&mut self) -> Option<Vec<u8>> {
        self.acknowledgement.take()
    }
}
