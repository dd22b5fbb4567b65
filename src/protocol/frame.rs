//! MLLP envelope codec.
//!
//! Every message on the wire is wrapped in a three byte envelope:
//!
//! ```text
//! START_OF_BLOCK (0x0B) | payload ... | END_OF_BLOCK (0x1C) | END_OF_DATA (0x0D)
//! ```
//!
//! [`encode`] wraps a payload. [`FrameDecoder`] is the resumable half: bytes are fed
//! in as they come off the socket and complete payloads are handed back once the
//! trailer has been matched.
//!
//! # Decoding rules
//!
//! - Bytes received before a `START_OF_BLOCK` are out-of-band noise. They are dropped
//!   and counted, never reported as an error.
//! - A `START_OF_BLOCK` inside a frame abandons the partial frame
//!   ([`FrameError::EmbeddedStartOfBlock`]) and opens a new one.
//! - `END_OF_BLOCK` directly followed by `START_OF_BLOCK` is a frame whose
//!   `END_OF_DATA` went missing ([`FrameError::MissingEndOfData`]); the new block is
//!   decoded normally.
//! - `END_OF_BLOCK` followed by any other byte is ordinary payload.
//!
//! The envelope has no escaping. A payload must not contain `START_OF_BLOCK`, nor
//! `END_OF_BLOCK` immediately followed by `END_OF_DATA`: such a pair ends the frame
//! early, and whatever follows it up to the real trailer is dropped as noise.
use std::mem;

use log::debug;
use thiserror::Error;

pub const START_OF_BLOCK: u8 = 0x0B;
pub const END_OF_BLOCK: u8 = 0x1C;
pub const END_OF_DATA: u8 = 0x0D;

/// Number of bytes the envelope adds to a payload.
pub const ENVELOPE_SIZE: usize = 3;

/// Wraps `payload` in an MLLP envelope.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + ENVELOPE_SIZE);
    out.push(START_OF_BLOCK);
    out.extend_from_slice(payload);
    out.push(END_OF_BLOCK);
    out.push(END_OF_DATA);
    out
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("START_OF_BLOCK received inside a frame; dropped {dropped} bytes of partial payload")]
    EmbeddedStartOfBlock { dropped: usize },

    #[error("END_OF_BLOCK not followed by END_OF_DATA; dropped {dropped} bytes of payload")]
    MissingEndOfData { dropped: usize },
}

/// Result of feeding bytes to a [`FrameDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// No complete frame yet.
    Partial,
    /// A frame was matched; its payload without the envelope.
    Complete(Vec<u8>),
    /// The frame being assembled broke the envelope grammar and was dropped.
    Invalid(FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingHeader,
    Framing,
    AwaitingEndOfData,
}

#[derive(Debug)]
pub struct FrameDecoder {
    /// Received bytes; everything before `cursor` has been scanned.
    backlog: Vec<u8>,
    cursor: usize,
    frame: Vec<u8>,
    phase: Phase,
    discarded: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            backlog: Vec::new(),
            cursor: 0,
            frame: Vec::new(),
            phase: Phase::AwaitingHeader,
            discarded: 0,
        }
    }

    /// Appends `bytes` and scans for the next complete frame.
    ///
    /// Only one result is returned per call. If `bytes` carried more than one frame
    /// the rest stay buffered and are returned by subsequent [`FrameDecoder::poll`]
    /// calls.
    pub fn feed(&mut self, bytes: &[u8]) -> Decoded {
        self.backlog.extend_from_slice(bytes);
        self.poll()
    }

    /// Continues scanning bytes that were already fed.
    pub fn poll(&mut self) -> Decoded {
        let decoded = self.scan();
        self.compact();
        decoded
    }

    fn scan(&mut self) -> Decoded {
        while let Some(&byte) = self.backlog.get(self.cursor) {
            self.cursor += 1;

            match (self.phase, byte) {
                (Phase::AwaitingHeader, START_OF_BLOCK) => {
                    if self.discarded > 0 {
                        debug!("{} out-of-band bytes discarded so far", self.discarded);
                    }
                    self.phase = Phase::Framing;
                }
                (Phase::AwaitingHeader, _) => self.discarded += 1,
                (Phase::Framing, START_OF_BLOCK) => {
                    let dropped = self.restart();
                    return Decoded::Invalid(FrameError::EmbeddedStartOfBlock { dropped });
                }
                (Phase::Framing, END_OF_BLOCK) => self.phase = Phase::AwaitingEndOfData,
                (Phase::Framing, _) => self.frame.push(byte),
                (Phase::AwaitingEndOfData, END_OF_DATA) => {
                    self.phase = Phase::AwaitingHeader;
                    return Decoded::Complete(mem::take(&mut self.frame));
                }
                (Phase::AwaitingEndOfData, START_OF_BLOCK) => {
                    let dropped = self.restart();
                    return Decoded::Invalid(FrameError::MissingEndOfData { dropped });
                }
                // The earlier END_OF_BLOCK was payload; this one may still be the trailer.
                (Phase::AwaitingEndOfData, END_OF_BLOCK) => self.frame.push(END_OF_BLOCK),
                (Phase::AwaitingEndOfData, _) => {
                    self.frame.push(END_OF_BLOCK);
                    self.frame.push(byte);
                    self.phase = Phase::Framing;
                }
            }
        }

        Decoded::Partial
    }

    /// Settles a frame left hanging when the stream ended or stopped producing data.
    ///
    /// Only a frame waiting on its `END_OF_DATA` can be settled: it is accepted when
    /// `require_end_of_data` is false and rejected otherwise. Returns `None` when
    /// there is nothing to settle.
    pub fn finish(&mut self, require_end_of_data: bool) -> Option<Decoded> {
        if self.phase != Phase::AwaitingEndOfData {
            return None;
        }

        self.phase = Phase::AwaitingHeader;
        let frame = mem::take(&mut self.frame);
        if require_end_of_data {
            Some(Decoded::Invalid(FrameError::MissingEndOfData {
                dropped: frame.len(),
            }))
        } else {
            debug!("accepting frame without END_OF_DATA");
            Some(Decoded::Complete(frame))
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True when a frame has started or fed bytes are still waiting to be scanned.
    pub fn has_buffered(&self) -> bool {
        self.phase != Phase::AwaitingHeader || self.cursor < self.backlog.len()
    }

    /// Payload bytes of the frame in progress plus fed bytes not yet scanned.
    pub fn buffered_len(&self) -> usize {
        self.frame.len() + (self.backlog.len() - self.cursor)
    }

    /// Total out-of-band bytes dropped since creation or the last [`FrameDecoder::reset`].
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Removes and returns the payload of the frame in progress.
    pub fn take_partial(&mut self) -> Vec<u8> {
        self.phase = Phase::AwaitingHeader;
        mem::take(&mut self.frame)
    }

    pub fn reset(&mut self) {
        self.backlog.clear();
        self.cursor = 0;
        self.frame.clear();
        self.phase = Phase::AwaitingHeader;
        self.discarded = 0;
    }

    /// Drops the frame in progress; the byte just scanned opens the next one.
    fn restart(&mut self) -> usize {
        let dropped = self.frame.len();
        self.frame.clear();
        self.phase = Phase::Framing;
        dropped
    }

    fn compact(&mut self) {
        if self.cursor == self.backlog.len() {
            self.backlog.clear();
        } else {
            self.backlog.drain(..self.cursor);
        }
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const MESSAGE: &[u8] = b"MSH|^~\\&|APP|FAC|||20240101||ADT^A01|1|P|2.3\rPID|1\r";

    #[test]
    fn encode_wraps_payload() {
        let frame = encode(b"abc");
        assert_eq!(frame, vec![START_OF_BLOCK, b'a', b'b', b'c', END_OF_BLOCK, END_OF_DATA]);
        assert_eq!(encode(b"").len(), ENVELOPE_SIZE);
    }

    #[test]
    fn decode_encoded_message() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(
            decoder.feed(&encode(MESSAGE)),
            Decoded::Complete(MESSAGE.to_vec())
        );
        assert!(!decoder.has_buffered());
    }

    #[test]
    fn decode_across_single_byte_reads() {
        let mut decoder = FrameDecoder::new();
        let frame = encode(MESSAGE);
        let (last, rest) = frame.split_last().unwrap();

        for byte in rest {
            assert_eq!(decoder.feed(&[*byte]), Decoded::Partial);
        }
        assert_eq!(decoder.phase(), Phase::AwaitingEndOfData);
        assert_eq!(decoder.feed(&[*last]), Decoded::Complete(MESSAGE.to_vec()));
        assert_eq!(decoder.phase(), Phase::AwaitingHeader);
    }

    #[test]
    fn out_of_band_bytes_are_discarded() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = b"noise".to_vec();
        bytes.extend(encode(b"payload"));

        assert_eq!(decoder.feed(&bytes), Decoded::Complete(b"payload".to_vec()));
        assert_eq!(decoder.discarded(), 5);
    }

    #[test]
    fn noise_alone_is_partial() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(b"\r\n"), Decoded::Partial);
        assert!(!decoder.has_buffered());
    }

    #[test]
    fn embedded_start_of_block_restarts_frame() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = vec![START_OF_BLOCK, b'x', b'y'];
        bytes.extend(encode(b"next"));

        assert_eq!(
            decoder.feed(&bytes),
            Decoded::Invalid(FrameError::EmbeddedStartOfBlock { dropped: 2 })
        );
        assert_eq!(decoder.poll(), Decoded::Complete(b"next".to_vec()));
    }

    #[test]
    fn missing_end_of_data_before_next_frame() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = vec![START_OF_BLOCK, b'a', END_OF_BLOCK];
        bytes.extend(encode(b"b"));

        assert_eq!(
            decoder.feed(&bytes),
            Decoded::Invalid(FrameError::MissingEndOfData { dropped: 1 })
        );
        assert_eq!(decoder.poll(), Decoded::Complete(b"b".to_vec()));
    }

    #[test]
    fn end_of_block_inside_payload() {
        let mut decoder = FrameDecoder::new();
        let bytes = [
            START_OF_BLOCK,
            b'a',
            END_OF_BLOCK,
            b'b',
            END_OF_BLOCK,
            END_OF_BLOCK,
            END_OF_DATA,
        ];

        assert_eq!(
            decoder.feed(&bytes),
            Decoded::Complete(vec![b'a', END_OF_BLOCK, b'b', END_OF_BLOCK])
        );
    }

    #[test]
    fn several_frames_in_one_read() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = encode(b"one");
        bytes.extend(encode(b"two"));
        bytes.push(START_OF_BLOCK);

        assert_eq!(decoder.feed(&bytes), Decoded::Complete(b"one".to_vec()));
        assert_eq!(decoder.poll(), Decoded::Complete(b"two".to_vec()));
        assert_eq!(decoder.poll(), Decoded::Partial);
        assert_eq!(decoder.phase(), Phase::Framing);
        assert_eq!(decoder.buffered_len(), 0);

        decoder.feed(b"ab");
        assert_eq!(decoder.buffered_len(), 2);
    }

    #[test]
    fn finish_settles_missing_end_of_data() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[START_OF_BLOCK, b'a', b'b', END_OF_BLOCK]);
        assert_eq!(
            decoder.finish(true),
            Some(Decoded::Invalid(FrameError::MissingEndOfData { dropped: 2 }))
        );
        assert_eq!(decoder.phase(), Phase::AwaitingHeader);

        decoder.feed(&[START_OF_BLOCK, b'c', END_OF_BLOCK]);
        assert_eq!(decoder.finish(false), Some(Decoded::Complete(b"c".to_vec())));
    }

    #[test]
    fn finish_ignores_unterminated_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[START_OF_BLOCK, b'a']);
        assert_eq!(decoder.finish(false), None);
        assert_eq!(decoder.take_partial(), b"a".to_vec());
        assert!(!decoder.has_buffered());
    }

    #[test]
    fn payload_with_trailer_pair_is_cut_short() {
        let mut decoder = FrameDecoder::new();
        let frame = encode(&[b'a', END_OF_BLOCK, END_OF_DATA, b'b']);

        assert_eq!(decoder.feed(&frame), Decoded::Complete(b"a".to_vec()));
        assert_eq!(decoder.poll(), Decoded::Partial);
        assert_eq!(decoder.discarded(), 3);
        assert!(!decoder.has_buffered());
    }

    #[test]
    fn reset_clears_state() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"xx");
        decoder.feed(&[START_OF_BLOCK, b'a']);
        decoder.reset();

        assert_eq!(decoder.phase(), Phase::AwaitingHeader);
        assert_eq!(decoder.discarded(), 0);
        assert_eq!(decoder.feed(&encode(b"z")), Decoded::Complete(b"z".to_vec()));
    }

    /// Payloads the envelope can carry: no `START_OF_BLOCK` and no trailer pair.
    fn frameable_payload() -> impl Strategy<Value = Vec<u8>> {
        let byte = any::<u8>().prop_filter("start block", |b| *b != START_OF_BLOCK);
        proptest::collection::vec(byte, 0..512).prop_map(|mut payload| {
            for i in 1..payload.len() {
                if payload[i - 1] == END_OF_BLOCK && payload[i] == END_OF_DATA {
                    payload[i] = b'x';
                }
            }
            payload
        })
    }

    /// Feeds `bytes` in chunks of the given sizes, cycling through them.
    fn decode_in_chunks(bytes: &[u8], sizes: &[usize]) -> Vec<Decoded> {
        let mut decoder = FrameDecoder::new();
        let mut results = Vec::new();
        let mut rest = bytes;

        for size in sizes.iter().cycle() {
            if rest.is_empty() {
                break;
            }
            let (chunk, tail) = rest.split_at((*size).min(rest.len()));
            rest = tail;

            let mut decoded = decoder.feed(chunk);
            while decoded != Decoded::Partial {
                results.push(decoded);
                decoded = decoder.poll();
            }
        }
        assert!(!decoder.has_buffered());
        results
    }

    proptest! {
        #[test]
        fn prop_round_trip_any_split(
            payload in frameable_payload(),
            sizes in proptest::collection::vec(1usize..64, 1..16),
        ) {
            prop_assert_eq!(
                decode_in_chunks(&encode(&payload), &sizes),
                vec![Decoded::Complete(payload)]
            );
        }

        #[test]
        fn prop_back_to_back_frames_stay_in_order(
            payloads in proptest::collection::vec(frameable_payload(), 1..8),
            sizes in proptest::collection::vec(1usize..128, 1..16),
        ) {
            let bytes: Vec<u8> = payloads.iter().flat_map(|p| encode(p)).collect();
            let expected: Vec<_> = payloads.into_iter().map(Decoded::Complete).collect();
            prop_assert_eq!(decode_in_chunks(&bytes, &sizes), expected);
        }
    }
}
