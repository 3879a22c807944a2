//! Socket plumbing for the event bus.
//!
//! This module owns everything that touches the Unix domain socket: the frame
//! codec, the connection sessions on both roles, and the client reconnection
//! loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐          Unix Socket          ┌──────────────────┐
//! │  Linker (server) │  ◄──────────────────────────► │  Linker (client) │
//! │  accept loop     │   [u32 BE len][JSON envelope] │  reconnect loop  │
//! └──────────────────┘                               └──────────────────┘
//! ```
//!
//! Each side runs one reader per connection and a single writer task, so
//! frames from one instance never interleave on the wire.
//!
//! # Protocol
//!
//! ```text
//! 00 00 00 2b {"event":"greet","payload":{"name":"Alice"}}
//! ```

mod framing;
pub(crate) mod reconnect;
pub(crate) mod transport;

pub use framing::{
    decode_envelope, encode, write_frame, Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN,
};
pub use reconnect::Backoff;
