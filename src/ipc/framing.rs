//! Length-prefixed envelope framing for events over Unix sockets.
//!
//! Every frame is a 4-byte big-endian length followed by exactly that many
//! bytes of JSON envelope. The length is always known before any payload byte
//! is parsed, so payload contents never need to be scanned for a terminator.
//!
//! # Wire Format
//!
//! ```text
//! [u32 BE length] {"event":"greet","payload":{"name":"Alice"}}
//! ```
//!
//! A single socket read may carry a partial frame, exactly one frame, or
//! several frames; [`FrameDecoder`] reassembles all three cases.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{EventsError, Result};

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Default maximum envelope size (16MB) to prevent OOM from a malformed peer.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A decoded `(event, payload)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: String,
    pub payload: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Borrowed envelope used on the encode path, avoiding an intermediate `Value`.
#[derive(Serialize)]
struct EnvelopeRef<'a, T: ?Sized> {
    event: &'a str,
    payload: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    payload: Value,
}

/// Encode an event and payload into one wire frame (header included).
///
/// # Errors
///
/// Returns `EventsError::Serialization` if the payload cannot be represented
/// as JSON (for example a map with non-string keys) and
/// `EventsError::FrameTooLarge` if the envelope exceeds `max_frame_size`.
/// Nothing is written anywhere in either case.
pub fn encode<T: Serialize + ?Sized>(
    event: &str,
    payload: &T,
    max_frame_size: usize,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 64);
    buf.extend_from_slice(&[0u8; HEADER_LEN]);
    serde_json::to_writer(&mut buf, &EnvelopeRef { event, payload })?;

    let size = buf.len() - HEADER_LEN;
    if size > max_frame_size {
        return Err(EventsError::FrameTooLarge {
            size,
            max: max_frame_size,
        });
    }
    let length = u32::try_from(size).map_err(|_| EventsError::FrameTooLarge {
        size,
        max: u32::MAX as usize,
    })?;
    buf[..HEADER_LEN].copy_from_slice(&length.to_be_bytes());

    Ok(buf)
}

/// Decode one envelope body (without its header).
pub fn decode_envelope(body: &[u8]) -> Result<Frame> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| EventsError::CorruptFrame(format!("Invalid envelope: {e}")))?;
    Ok(Frame {
        event: envelope.event,
        payload: envelope.payload,
    })
}

/// Write an already encoded frame and flush it.
///
/// The caller is responsible for making sure only one frame is written at a
/// time on a given stream.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Incremental frame decoder that handles partial reads.
///
/// Push bytes with [`FrameDecoder::push`] and pull complete frames with
/// [`FrameDecoder::next_frame`] until it returns `Ok(None)`.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Offset of the first unconsumed byte in `buf`.
    start: usize,
    max_frame_size: usize,
}

/// Capacity kept across pushes once a large frame has been consumed.
const RETAINED_CAPACITY: usize = 64 * 1024;

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            max_frame_size,
        }
    }

    /// Append bytes received from the socket.
    ///
    /// Bytes consumed by earlier `next_frame` calls are discarded here, once
    /// per push, so a batch of frames costs one compaction.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        if self.buf.is_empty() && self.buf.capacity() > RETAINED_CAPACITY {
            self.buf.shrink_to(RETAINED_CAPACITY);
        }
        self.buf.extend_from_slice(bytes);
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Extract the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns `EventsError::CorruptFrame` when the declared length is zero or
    /// above the limit, or when the envelope is not `{event, payload}` JSON.
    /// The decoder is unusable afterwards; the connection should be dropped.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let pending = self.pending();
        if pending.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
        if length == 0 {
            return Err(EventsError::CorruptFrame("zero length frame".to_string()));
        }
        if length > self.max_frame_size {
            return Err(EventsError::CorruptFrame(format!(
                "Frame size {length} exceeds maximum {} bytes",
                self.max_frame_size
            )));
        }

        let total = HEADER_LEN + length;
        if pending.len() < total {
            return Ok(None);
        }

        let frame = decode_envelope(&pending[HEADER_LEN..total])?;
        self.start += total;
        Ok(Some(frame))
    }

    /// Push bytes and drain every complete frame.
    ///
    /// Frames decoded before a corrupt one are lost with the error, so the read
    /// loop uses `push`/`next_frame` directly to deliver them first.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.push(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        self.start < self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
