//! Tokio framed pipes, used on the parent side.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;

use super::frame::{check_len, check_tag, encode_data, truncated, TAG_CLOSE};
use super::pipe::{Duplex, FramedReader, FramedWriter};
use super::{decode, encode};
use crate::error::{Result, SandboxError};

/// Async sending half of a framed pipe.
pub struct AsyncFramedWriter<W> {
    inner: Option<W>,
}

impl<W: AsyncWrite + Unpin> AsyncFramedWriter<W> {
    /// Frame values onto `inner`.
    pub fn new(inner: W) -> Self {
        Self { inner: Some(inner) }
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Serialize `value` and write it as one data frame.
    pub async fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(SandboxError::ClosedLocally)?;
        let frame = encode_data(&encode(value)?)?;
        inner.write_all(&frame).await?;
        inner.flush().await?;
        Ok(())
    }

    /// Write a close frame, then shut down and release the handle.
    pub async fn close(&mut self) -> Result<()> {
        let mut inner = self.inner.take().ok_or(SandboxError::ClosedLocally)?;
        inner.write_all(&[TAG_CLOSE]).await?;
        inner.flush().await?;
        inner.shutdown().await?;
        Ok(())
    }
}

/// Async receiving half of a framed pipe.
pub struct AsyncFramedReader<R> {
    inner: R,
    local_closed: bool,
    peer_closed: bool,
}

impl<R: AsyncRead + Unpin> AsyncFramedReader<R> {
    /// Read frames from `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            local_closed: false,
            peer_closed: false,
        }
    }

    /// Wait for the next value.
    ///
    /// Dropping the future mid-frame leaves the stream misaligned; callers
    /// that give up on a read must give up on the pipe too.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        if self.local_closed {
            return Err(SandboxError::ReceiveAfterClose);
        }
        if self.peer_closed {
            return Err(SandboxError::ClosedByPeer);
        }

        let mut tag = [0u8; 1];
        loop {
            match self.inner.read(&mut tag).await {
                Ok(0) => return Err(SandboxError::Disconnected),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if !check_tag(tag[0])? {
            self.peer_closed = true;
            return Err(SandboxError::ClosedByPeer);
        }

        let mut len = [0u8; 4];
        self.inner
            .read_exact(&mut len)
            .await
            .map_err(|e| truncated("header", e))?;
        let mut payload = vec![0u8; check_len(len)?];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|e| truncated("payload", e))?;
        decode(&payload)
    }

    /// Stop receiving. Later calls to `recv` fail.
    pub fn close(&mut self) {
        self.local_closed = true;
    }
}

/// Async bidirectional handle.
pub struct AsyncDuplex<R, W> {
    reader: AsyncFramedReader<R>,
    writer: AsyncFramedWriter<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> AsyncDuplex<R, W> {
    /// Combine a reader and a writer.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: AsyncFramedReader::new(reader),
            writer: AsyncFramedWriter::new(writer),
        }
    }

    /// See [`AsyncFramedWriter::send`].
    pub async fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.writer.send(value).await
    }

    /// See [`AsyncFramedReader::recv`].
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.reader.recv().await
    }

    /// Send a close frame and stop receiving.
    pub async fn close(&mut self) -> Result<()> {
        self.reader.close();
        self.writer.close().await
    }

    /// Split into the two halves.
    pub fn split(self) -> (AsyncFramedReader<R>, AsyncFramedWriter<W>) {
        (self.reader, self.writer)
    }
}

/// A one-way OS pipe with an async reader and a blocking writer.
///
/// Must be called inside a tokio runtime.
pub fn async_reader_channel() -> Result<(AsyncFramedReader<pipe::Receiver>, FramedWriter<std::fs::File>)> {
    let (read, write) = nix::unistd::pipe().map_err(io::Error::from)?;
    let receiver = pipe::Receiver::from_owned_fd(read)?;
    Ok((AsyncFramedReader::new(receiver), FramedWriter::new(std::fs::File::from(write))))
}

/// A duplex pair with one blocking end and one async end.
///
/// The blocking end is meant for a thread or child process, the async end
/// for the task that supervises it. Must be called inside a tokio runtime.
pub fn half_async_duplex() -> Result<(Duplex<std::fs::File, std::fs::File>, AsyncDuplex<pipe::Receiver, pipe::Sender>)> {
    let (sync_read, async_write) = nix::unistd::pipe().map_err(io::Error::from)?;
    let (async_read, sync_write) = nix::unistd::pipe().map_err(io::Error::from)?;
    let receiver = pipe::Receiver::from_owned_fd(async_read)?;
    let sender = pipe::Sender::from_owned_fd(async_write)?;
    Ok((
        Duplex::new(std::fs::File::from(sync_read), std::fs::File::from(sync_write)),
        AsyncDuplex::new(receiver, sender),
    ))
}
