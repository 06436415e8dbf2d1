//! Blocking framed pipes, used on the worker side.

use std::fs::File;
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::frame::{encode_data, read_frame, Frame, TAG_CLOSE};
use super::{decode, encode};
use crate::error::{Result, SandboxError};

/// Sending half of a framed pipe.
pub struct FramedWriter<W: Write> {
    inner: Option<W>,
}

impl<W: Write> FramedWriter<W> {
    /// Frame values onto `inner`.
    pub fn new(inner: W) -> Self {
        Self { inner: Some(inner) }
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Serialize `value` and write it as one data frame.
    pub fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(SandboxError::ClosedLocally)?;
        let frame = encode_data(&encode(value)?)?;
        inner.write_all(&frame)?;
        inner.flush()?;
        Ok(())
    }

    /// Write a close frame and release the handle.
    pub fn close(&mut self) -> Result<()> {
        let mut inner = self.inner.take().ok_or(SandboxError::ClosedLocally)?;
        inner.write_all(&[TAG_CLOSE])?;
        inner.flush()?;
        Ok(())
    }
}

/// Receiving half of a framed pipe.
pub struct FramedReader<R: Read> {
    inner: R,
    local_closed: bool,
    peer_closed: bool,
}

impl<R: Read> FramedReader<R> {
    /// Read frames from `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            local_closed: false,
            peer_closed: false,
        }
    }

    /// Block until the next value arrives.
    ///
    /// After the peer's close frame every call fails with
    /// [`SandboxError::ClosedByPeer`] without touching the stream.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        if self.local_closed {
            return Err(SandboxError::ReceiveAfterClose);
        }
        if self.peer_closed {
            return Err(SandboxError::ClosedByPeer);
        }
        match read_frame(&mut self.inner)? {
            Frame::Data(payload) => decode(&payload),
            Frame::Close => {
                self.peer_closed = true;
                Err(SandboxError::ClosedByPeer)
            }
        }
    }

    /// Stop receiving. Later calls to `recv` fail.
    pub fn close(&mut self) {
        self.local_closed = true;
    }
}

/// A bidirectional handle made of two one-way pipes.
pub struct Duplex<R: Read, W: Write> {
    reader: FramedReader<R>,
    writer: FramedWriter<W>,
}

impl<R: Read, W: Write> Duplex<R, W> {
    /// Combine a reader and a writer.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedReader::new(reader),
            writer: FramedWriter::new(writer),
        }
    }

    /// See [`FramedWriter::send`].
    pub fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.writer.send(value)
    }

    /// See [`FramedReader::recv`].
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.reader.recv()
    }

    /// Send a close frame and stop receiving.
    pub fn close(&mut self) -> Result<()> {
        self.reader.close();
        self.writer.close()
    }

    /// Split into the two halves.
    pub fn split(self) -> (FramedReader<R>, FramedWriter<W>) {
        (self.reader, self.writer)
    }
}

/// A one-way OS pipe.
pub fn channel() -> Result<(FramedReader<File>, FramedWriter<File>)> {
    let (read, write) = nix::unistd::pipe().map_err(std::io::Error::from)?;
    Ok((FramedReader::new(File::from(read)), FramedWriter::new(File::from(write))))
}

/// Two OS pipes crossed into a pair of connected duplex handles.
pub fn duplex() -> Result<(Duplex<File, File>, Duplex<File, File>)> {
    let (a_read, b_write) = nix::unistd::pipe().map_err(std::io::Error::from)?;
    let (b_read, a_write) = nix::unistd::pipe().map_err(std::io::Error::from)?;
    Ok((
        Duplex::new(File::from(a_read), File::from(a_write)),
        Duplex::new(File::from(b_read), File::from(b_write)),
    ))
}

#[cfg(feature = "wasm")]
impl<W: Write + Send> crate::wasm::ReplySink for FramedWriter<W> {
    fn reply(&mut self, content: String) -> Result<()> {
        self.send(&super::WorkerMessage::Reply { content })
    }

    fn close(&mut self) -> Result<()> {
        FramedWriter::close(self)
    }
}
