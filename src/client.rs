//! Echo client.
//!
//! A [`Client`] owns one connection. Frames can be sent and received through
//! it directly, or it can be split into a [`FrameSender`] and a
//! [`FrameReceiver`] that run concurrently so a large outbound burst never
//! deadlocks against unread echoes.

use crate::codec::{FrameCodec, FrameError};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Failure to establish the connection.
#[derive(Debug)]
pub struct ConnectError {
    pub addr: String,
    pub source: io::Error,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to connect to {}: {}", self.addr, self.source)
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Failure to send a frame.
#[derive(Debug)]
pub enum SendError {
    Frame(FrameError),
    Io(io::Error),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Frame(e) => write!(f, "send failed: {e}"),
            SendError::Io(e) => write!(f, "send failed: {e}"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<FrameError> for SendError {
    fn from(e: FrameError) -> Self {
        SendError::Frame(e)
    }
}

impl From<io::Error> for SendError {
    fn from(e: io::Error) -> Self {
        SendError::Io(e)
    }
}

/// Failure to receive a frame.
#[derive(Debug)]
pub enum RecvError {
    /// The server closed the connection cleanly.
    ConnectionClosed,
    Frame(FrameError),
    Io(io::Error),
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::ConnectionClosed => write!(f, "connection closed"),
            RecvError::Frame(e) => write!(f, "receive failed: {e}"),
            RecvError::Io(e) => write!(f, "receive failed: {e}"),
        }
    }
}

impl std::error::Error for RecvError {}

impl From<FrameError> for RecvError {
    fn from(e: FrameError) -> Self {
        RecvError::Frame(e)
    }
}

impl From<io::Error> for RecvError {
    fn from(e: io::Error) -> Self {
        RecvError::Io(e)
    }
}

/// A connection to an echo server.
#[derive(Debug)]
pub struct Client {
    peer: SocketAddr,
    sender: FrameSender,
    receiver: FrameReceiver,
}

impl Client {
    /// Connect to `addr`.
    pub async fn connect<A>(addr: A, codec: FrameCodec) -> Result<Self, ConnectError>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let stream = TcpStream::connect(&addr).await.map_err(|source| ConnectError {
            addr: addr.to_string(),
            source,
        })?;
        let peer = stream.peer_addr().map_err(|source| ConnectError {
            addr: addr.to_string(),
            source,
        })?;
        // Echo latency matters more than batching
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        debug!(peer = %peer, "Connected");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            peer,
            sender: FrameSender {
                writer,
                codec,
                buf: BytesMut::new(),
            },
            receiver: FrameReceiver {
                reader,
                codec,
                buf: BytesMut::with_capacity(8 * 1024),
            },
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Encode and send one frame.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), SendError> {
        self.sender.send(payload).await
    }

    /// Wait for the next echoed frame.
    pub async fn receive(&mut self) -> Result<Bytes, RecvError> {
        self.receiver.receive().await
    }

    /// Finish sending. Echoes already in flight can still be received.
    pub async fn close(&mut self) -> Result<(), SendError> {
        self.sender.close().await
    }

    /// Split into independently usable halves.
    pub fn into_split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a [`Client`].
#[derive(Debug)]
pub struct FrameSender {
    writer: OwnedWriteHalf,
    codec: FrameCodec,
    buf: BytesMut,
}

impl FrameSender {
    /// Encode and send one frame. Frames go out in call order.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), SendError> {
        self.buf.clear();
        self.codec.encode_into(payload, &mut self.buf)?;
        self.writer.write_all(&self.buf).await?;
        Ok(())
    }

    /// Half-close the connection.
    pub async fn close(&mut self) -> Result<(), SendError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Receiving half of a [`Client`].
#[derive(Debug)]
pub struct FrameReceiver {
    reader: OwnedReadHalf,
    codec: FrameCodec,
    buf: BytesMut,
}

impl FrameReceiver {
    /// Wait for the next complete frame.
    ///
    /// Fails with [`RecvError::ConnectionClosed`] once the server closes
    /// the connection on a frame boundary.
    pub async fn receive(&mut self) -> Result<Bytes, RecvError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(frame);
            }

            if self.reader.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Err(RecvError::ConnectionClosed);
                }
                return Err(RecvError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed with {} bytes of a partial frame", self.buf.len()),
                )));
            }
        }
    }
}
