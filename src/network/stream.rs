use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

use super::{transport_error, ChannelReceiver, ChannelResult, ChannelSender};
use crate::core::ProbeError;
use crate::protocol::{tlv, MAX_MESSAGE_SIZE};

/// Channel half that writes to any async byte stream
pub struct StreamSender<W> {
    writer: W,
}

/// Channel half that reads whole TLV messages from any async byte stream
pub struct StreamReceiver<R> {
    reader: R,
    buf: BytesMut,
}

/// Splits a byte stream into a channel
pub fn stream_channel<S>(stream: S) -> (StreamSender<tokio::io::WriteHalf<S>>, StreamReceiver<tokio::io::ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    (StreamSender::new(writer), StreamReceiver::new(reader))
}

impl<W> StreamSender<W> {
    pub fn new(writer: W) -> Self {
        StreamSender { writer }
    }
}

impl<R> StreamReceiver<R> {
    pub fn new(reader: R) -> Self {
        StreamReceiver {
            reader,
            buf: BytesMut::with_capacity(MAX_MESSAGE_SIZE),
        }
    }
}

#[async_trait]
impl<W> ChannelSender for StreamSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, bytes: &[u8]) -> ChannelResult<()> {
        self.writer.write_all(bytes).await.map_err(transport_error)?;
        self.writer.flush().await.map_err(transport_error)
    }
}

#[async_trait]
impl<R> ChannelReceiver for StreamReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn receive(&mut self, timeout: Duration) -> ChannelResult<Bytes> {
        let deadline = Instant::now() + timeout;

        // Keep reading while the last record is cut short. A message that
        // lands on a record boundary mid-way counts as complete, so peers
        // must write each message in one piece.
        loop {
            let read = timeout_at(deadline, self.reader.read_buf(&mut self.buf)).await;
            let n = match read {
                Err(_) => return Err(ProbeError::Timeout),
                Ok(Err(e)) => return Err(transport_error(e)),
                Ok(Ok(n)) => n,
            };
            if n == 0 || !tlv::is_incomplete(&self.buf) || self.buf.len() >= MAX_MESSAGE_SIZE {
                return Ok(self.buf.split().freeze());
            }
        }
    }
}
