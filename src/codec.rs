//! grpc-web message framing.
//!
//! Every grpc-web message, in both directions, travels as a length prefixed frame:
//!
//! ```text
//! [flags:1][length:4 (big endian)][payload:length]
//! ```
//!
//! The lowest bit of the flags marks a compressed payload, the highest bit
//! (`0x80`) marks a trailer frame carrying the call status as http/1 style headers.
//! This crate never compresses, so [`encode_frame`] always writes a flag of `0`.

use std::fmt;

use rama::bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use rama::http::{HeaderMap, HeaderName, HeaderValue};
use rama::telemetry::tracing;
use rama::utils::macros::generate_set_and_with;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the frame header: one flag byte followed by a `u32` length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Largest payload a frame can carry, bound by its `u32` length field.
pub const MAX_FRAME_PAYLOAD_LEN: usize = u32::MAX as usize;

/// Default limit on the payload size of a decoded frame (4 MiB).
pub const DEFAULT_MAX_DECODING_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_TRAILER: u8 = 0x80;

/// A single decoded grpc-web frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    flags: u8,
    payload: Bytes,
}

impl Frame {
    /// Create a new [`Frame`] from its raw flags and payload.
    #[must_use]
    pub fn new(flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            flags,
            payload: payload.into(),
        }
    }

    /// Raw flag byte of this frame.
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Returns `true` if this frame carries a message,
    /// meaning the flag byte is either `0` (plain) or `1` (compressed).
    ///
    /// Any other flag value denotes a non-data frame (e.g. trailers).
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.flags & !FLAG_COMPRESSED == 0
    }

    /// Returns `true` if the payload is marked as compressed.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.is_data() && self.flags & FLAG_COMPRESSED == FLAG_COMPRESSED
    }

    /// Returns `true` if the trailer bit is set.
    #[must_use]
    pub fn is_trailer(&self) -> bool {
        self.flags & FLAG_TRAILER == FLAG_TRAILER
    }

    /// View the payload of this frame.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame into its payload.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[derive(Debug)]
/// Error returned when a frame could not be decoded.
pub enum FrameError {
    /// Input ended in the middle of a frame header or payload.
    Truncated {
        /// Bytes required to complete the frame.
        expected: usize,
        /// Bytes that were available.
        available: usize,
    },
    /// Declared payload length exceeds the configured maximum.
    TooLarge {
        /// Declared payload length.
        size: usize,
        /// Maximum allowed payload length.
        max: usize,
    },
    /// Reading from the underlying reader failed.
    ///
    /// Only produced when the codec is driven over an async reader,
    /// e.g. through `FramedRead`.
    Io(std::io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated {
                expected,
                available,
            } => write!(
                f,
                "truncated frame: expected {expected} bytes, only {available} available"
            ),
            Self::TooLarge { size, max } => {
                write!(f, "frame payload too large: {size} > {max}")
            }
            Self::Io(err) => write!(f, "failed to read frame: {err}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Truncated { .. } | Self::TooLarge { .. } => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Wrap the payload into a grpc-web frame with an uncompressed flag.
///
/// The payload must not exceed [`MAX_FRAME_PAYLOAD_LEN`],
/// use the [`Encoder`] of [`GrpcWebFrameCodec`] for payloads of unchecked size.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_FRAME_PAYLOAD_LEN);
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    put_frame(0, payload.len() as u32, payload, &mut buf);
    buf.freeze()
}

/// Decode the next frame from a buffer holding everything the peer sent.
///
/// Returns `Ok(None)` if the buffer is empty (clean end of stream),
/// and [`FrameError::Truncated`] if it ends in the middle of a frame.
/// A frame with a declared length of zero decodes to an empty payload.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    GrpcWebFrameCodec::new().decode_eof(buf)
}

/// Parse the payload of a trailer frame into a [`HeaderMap`].
///
/// Trailers are encoded as http/1 style `name: value` lines, separated by `\r\n`.
/// Malformed lines are skipped.
#[must_use]
pub fn decode_trailers(payload: &[u8]) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    for line in payload.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let Some(idx) = line.iter().position(|b| *b == b':') else {
            tracing::debug!("skip grpc-web trailer line without separator");
            continue;
        };
        let name = line[..idx].trim_ascii().to_ascii_lowercase();
        let value = line[idx + 1..].trim_ascii();
        match (HeaderName::from_bytes(&name), HeaderValue::from_bytes(value)) {
            (Ok(name), Ok(value)) => {
                trailers.append(name, value);
            }
            _ => tracing::debug!("skip malformed grpc-web trailer line"),
        }
    }
    trailers
}

/// Length field for a payload of the given size,
/// [`FrameError::TooLarge`] if it exceeds [`MAX_FRAME_PAYLOAD_LEN`].
pub fn frame_len(size: usize) -> Result<u32, FrameError> {
    u32::try_from(size).ok().ok_or(FrameError::TooLarge {
        size,
        max: MAX_FRAME_PAYLOAD_LEN,
    })
}

fn put_frame(flags: u8, len: u32, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(flags);
    buf.put_u32(len);
    buf.put_slice(payload);
}

#[derive(Debug, Clone, Copy)]
/// [`Decoder`] and [`Encoder`] for grpc-web frames.
///
/// Can be used directly on buffered bytes,
/// or with `FramedRead` on top of any async reader.
pub struct GrpcWebFrameCodec {
    max_decoding_message_size: usize,
}

impl Default for GrpcWebFrameCodec {
    fn default() -> Self {
        Self {
            max_decoding_message_size: DEFAULT_MAX_DECODING_MESSAGE_SIZE,
        }
    }
}

impl GrpcWebFrameCodec {
    /// Create a new [`GrpcWebFrameCodec`] using the default message size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    generate_set_and_with! {
        /// Limit the maximum payload size of a decoded frame.
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.max_decoding_message_size = limit;
            self
        }
    }

    /// Maximum payload size of a decoded frame.
    #[must_use]
    pub fn max_decoding_message_size(&self) -> usize {
        self.max_decoding_message_size
    }
}

impl Decoder for GrpcWebFrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            src.reserve(FRAME_HEADER_LEN - src.len());
            return Ok(None);
        }

        let flags = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_decoding_message_size {
            return Err(FrameError::TooLarge {
                size: len,
                max: self.max_decoding_message_size,
            });
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { flags, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                let expected = if src.len() < FRAME_HEADER_LEN {
                    FRAME_HEADER_LEN
                } else {
                    FRAME_HEADER_LEN
                        + u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize
                };
                Err(FrameError::Truncated {
                    expected,
                    available: src.len(),
                })
            }
        }
    }
}

impl Encoder<Frame> for GrpcWebFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame_len(item.payload.len())?;
        put_frame(item.flags, len, &item.payload, dst);
        Ok(())
    }
}
