//! Framed duplex pipes between the parent and its workers.
//!
//! Every message is one frame: a tag byte, and for data frames a big-endian
//! length and a postcard payload. A close frame tells the reader the peer is
//! done; a reader that sees one reports [`SandboxError::ClosedByPeer`] and
//! decodes nothing.
//!
//! The blocking halves ([`FramedReader`], [`FramedWriter`], [`Duplex`]) run
//! in the worker. The tokio halves ([`AsyncFramedReader`],
//! [`AsyncFramedWriter`], [`AsyncDuplex`]) run in the supervising parent.

mod async_pipe;
mod frame;
#[cfg(feature = "wasm")]
mod messages;
mod pipe;

pub use async_pipe::{async_reader_channel, half_async_duplex, AsyncDuplex, AsyncFramedReader, AsyncFramedWriter};
pub use frame::{encode_data, read_frame, Frame, MAX_FRAME_LEN, TAG_CLOSE, TAG_DATA};
#[cfg(feature = "wasm")]
pub use messages::{Job, WorkerMessage};
pub use pipe::{channel, duplex, Duplex, FramedReader, FramedWriter};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SandboxError};

/// Encode a payload.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| SandboxError::Codec(e.to_string()))
}

/// Decode a payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(|e| SandboxError::Codec(e.to_string()))
}
