use std::{
    io::{self, ErrorKind, Read, Write},
    net::TcpStream,
    time::Duration,
};

use log::trace;
use thiserror::Error;

use super::frame::{self, Decoded, FrameDecoder, FrameError, Phase};

const READ_CHUNK: usize = 8192;

/// Sockets refuse a zero read timeout; it is raised to this.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed without ever sending a byte, as load balancer health checks do.
    #[error("connection closed before any data was received")]
    Silent,

    #[error("connection closed by peer ({partial} bytes of an unfinished frame discarded)")]
    Closed { in_frame: bool, partial: usize },

    #[error("read timed out ({partial} bytes of an unfinished frame discarded)")]
    Timeout { in_frame: bool, partial: usize },

    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Byte stream a [`FrameTransport`] can put a read deadline on.
pub trait Stream: Read + Write {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// In non-blocking mode a read with nothing to return fails with `WouldBlock`.
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()>;
}

impl Stream for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout.map(|t| t.max(MIN_READ_TIMEOUT)))
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

/// Errors meaning the peer went away rather than the socket misbehaving.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

/// Read deadlines for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTimeouts {
    /// Wait for the first byte of the frame; `None` waits forever.
    pub initial: Option<Duration>,
    /// Wait for every further read once the frame has started.
    pub between: Duration,
}

pub struct FrameTransport<T: Stream> {
    stream: T,
    decoder: FrameDecoder,
    bytes_read: usize,
    require_end_of_data: bool,
    chunk: Box<[u8]>,
}

impl<T: Stream> FrameTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            bytes_read: 0,
            require_end_of_data: true,
            chunk: vec![0; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Whether a frame cut short after its END_OF_BLOCK is rejected (the default) or
    /// accepted when the stream ends or goes quiet.
    pub fn require_end_of_data(mut self, require: bool) -> Self {
        self.require_end_of_data = require;
        self
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(&frame::encode(payload))?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads until one frame is complete.
    ///
    /// Frames already buffered from an earlier read are returned first. An invalid
    /// frame is reported once and the transport stays usable; EOF and timeouts are
    /// terminal for the frame in progress.
    pub fn read_frame(&mut self, timeouts: ReadTimeouts) -> Result<Vec<u8>, TransportError> {
        let mut decoded = self.decoder.poll();

        loop {
            match decoded {
                Decoded::Complete(payload) => return Ok(payload),
                Decoded::Invalid(err) => return Err(err.into()),
                Decoded::Partial => {}
            }

            let timeout = match self.decoder.phase() {
                Phase::AwaitingHeader => timeouts.initial,
                Phase::Framing | Phase::AwaitingEndOfData => Some(timeouts.between),
            };
            self.stream.set_read_timeout(timeout)?;

            let n = match self.stream.read(&mut self.chunk) {
                Ok(0) => return self.settle(false),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return self.settle(true);
                }
                Err(e) if is_disconnect(&e) => {
                    trace!("read failed with {e}; treating as close");
                    return self.settle(false);
                }
                Err(e) => return Err(e.into()),
            };

            trace!("read {n} bytes");
            self.bytes_read += n;
            decoded = self.decoder.feed(&self.chunk[..n]);
        }
    }

    /// Ends the frame in progress after EOF or a timeout.
    fn settle(&mut self, timed_out: bool) -> Result<Vec<u8>, TransportError> {
        if !timed_out && self.bytes_read == 0 {
            return Err(TransportError::Silent);
        }

        match self.decoder.finish(self.require_end_of_data) {
            Some(Decoded::Complete(payload)) => return Ok(payload),
            Some(Decoded::Invalid(err)) => return Err(err.into()),
            Some(Decoded::Partial) | None => {}
        }

        let in_frame = self.decoder.phase() != Phase::AwaitingHeader;
        let partial = self.decoder.take_partial().len();
        if timed_out {
            Err(TransportError::Timeout { in_frame, partial })
        } else {
            Err(TransportError::Closed { in_frame, partial })
        }
    }

    /// Bytes read over the lifetime of the connection.
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    pub fn has_buffered(&self) -> bool {
        self.decoder.has_buffered()
    }

    /// Drops anything received but not yet returned as a frame.
    pub fn discard_buffered(&mut self) {
        self.decoder.reset();
    }

    /// Throws away whatever the peer sent that nobody asked for: bytes still
    /// buffered plus bytes already waiting on the stream. Never blocks.
    ///
    /// Returns the number of bytes dropped. A peer that has closed its side is
    /// reported as [`TransportError::Closed`].
    pub fn drain(&mut self) -> Result<usize, TransportError> {
        let buffered = self.decoder.buffered_len();
        self.decoder.reset();

        self.stream.set_nonblocking(true)?;
        let drained = self.drain_stream();
        self.stream.set_nonblocking(false)?;

        let dropped = drained?;
        if dropped > 0 {
            trace!("drained {dropped} unsolicited bytes");
        }
        Ok(dropped + buffered)
    }

    fn drain_stream(&mut self) -> Result<usize, TransportError> {
        let mut dropped = 0;
        loop {
            match self.stream.read(&mut self.chunk) {
                Ok(0) => {
                    return Err(TransportError::Closed {
                        in_frame: false,
                        partial: dropped,
                    });
                }
                Ok(n) => {
                    self.bytes_read += n;
                    dropped += n;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(dropped),
                Err(e) if is_disconnect(&e) => {
                    return Err(TransportError::Closed {
                        in_frame: false,
                        partial: dropped,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }
}
