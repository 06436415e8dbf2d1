//! Frame layout shared by the sync and async pipe halves.
//!
//! ```text
//! data:  [0x00][len: u32 BE][payload: len bytes]
//! close: [0x01]
//! ```

use std::io::{self, Read};

use crate::error::{Result, SandboxError};

/// Tag of a data frame.
pub const TAG_DATA: u8 = 0;
/// Tag of a close frame.
pub const TAG_CLOSE: u8 = 1;
/// Bytes in a data frame header.
pub const HEADER_LEN: usize = 5;
/// Largest payload a reader accepts.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A payload
    Data(Vec<u8>),
    /// The peer will send nothing more
    Close,
}

/// Encode a data frame.
pub fn encode_data(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(SandboxError::Corrupt(format!(
            "payload of {} bytes exceeds frame limit",
            payload.len()
        )));
    }
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.push(TAG_DATA);
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Check a tag byte and return whether it opens a data frame.
pub(crate) fn check_tag(tag: u8) -> Result<bool> {
    match tag {
        TAG_DATA => Ok(true),
        TAG_CLOSE => Ok(false),
        other => Err(SandboxError::Corrupt(format!("unknown frame tag {:#04x}", other))),
    }
}

/// Decode a big-endian length prefix and check it against the limit.
pub(crate) fn check_len(raw: [u8; 4]) -> Result<usize> {
    let len = u32::from_be_bytes(raw) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SandboxError::Corrupt(format!("frame length {} exceeds limit", len)));
    }
    Ok(len)
}

pub(crate) fn truncated(what: &str, err: io::Error) -> SandboxError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        SandboxError::Corrupt(format!("stream ended inside frame {}", what))
    } else {
        SandboxError::Io(err)
    }
}

/// Read one frame.
///
/// The tag is read alone first, so a close frame never pulls further bytes
/// off the stream. End of stream before a tag is [`SandboxError::Disconnected`];
/// end of stream inside a frame is corruption.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut tag = [0u8; 1];
    loop {
        match reader.read(&mut tag) {
            Ok(0) => return Err(SandboxError::Disconnected),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if !check_tag(tag[0])? {
        return Ok(Frame::Close);
    }

    let mut len = [0u8; 4];
    reader.read_exact(&mut len).map_err(|e| truncated("header", e))?;
    let len = check_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| truncated("payload", e))?;
    Ok(Frame::Data(payload))
}
