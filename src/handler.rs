//! Per-connection echo handler.
//!
//! One task per connection drives the state machine in
//! [`ConnState`](crate::connection::ConnState):
//!
//! ```text
//! Accepted -> Reading <-> Writing -> Closing -> Closed
//!                  \_________\__________\-----> Error
//! ```
//!
//! Reads and writes overlap: inbound bytes are decoded into frames and
//! queued for echo while earlier replies are still being written. When the
//! write queue reaches its high water mark the handler stops reading from
//! the peer until the queue drains to the low water mark. Echoed frames are
//! written in exactly the order they were decoded.

use crate::codec::{FrameCodec, FrameError};
use crate::connection::{ConnState, Connection, ConnectionGuard, ConnectionId};
use crate::shutdown::Shutdown;
use crate::write_queue::{WaterMarks, WriteQueue};
use bytes::BytesMut;
use std::borrow::Cow;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Read buffer size
const READ_CHUNK: usize = 16 * 1024;

/// Payload bytes shown when logging a received frame
const PREVIEW_LEN: usize = 64;

/// Settings shared by every handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerConfig {
    pub codec: FrameCodec,
    pub water_marks: WaterMarks,
}

/// Connection-scoped failures. Never affect other connections.
#[derive(Debug)]
pub enum ConnectionError {
    /// Peer sent a length prefix above the maximum frame size.
    Frame(FrameError),
    /// Stream ended in the middle of a frame.
    TruncatedFrame { buffered: usize },
    /// Socket read or write failed.
    Io(io::Error),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Frame(e) => write!(f, "{e}"),
            ConnectionError::TruncatedFrame { buffered } => {
                write!(f, "connection closed with {buffered} bytes of an incomplete frame")
            }
            ConnectionError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Frame(e) => Some(e),
            ConnectionError::Io(e) => Some(e),
            ConnectionError::TruncatedFrame { .. } => None,
        }
    }
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        ConnectionError::Frame(e)
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// What a handler did over the lifetime of its connection.
#[derive(Debug)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    /// `Closed` or `Error`.
    pub final_state: ConnState,
    pub frames_echoed: u64,
    pub bytes_echoed: u64,
    pub peak_queued_bytes: usize,
    pub read_pauses: u64,
    /// Queued echo bytes dropped because the connection failed.
    pub discarded_bytes: usize,
    pub error: Option<ConnectionError>,
}

#[derive(Debug, Default)]
struct EchoStats {
    frames: u64,
    bytes: u64,
}

/// Serve one connection until the peer closes, an error occurs, or shutdown
/// is requested.
///
/// Errors are logged here and reported in the summary; they are never
/// propagated to the caller.
pub async fn handle_connection<S>(
    stream: S,
    mut guard: ConnectionGuard,
    config: HandlerConfig,
    mut shutdown: Shutdown,
) -> ConnectionSummary
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut queue = WriteQueue::new(config.water_marks);
    let mut stats = EchoStats::default();
    let conn = guard.connection_mut();

    let result = serve(
        conn,
        &mut reader,
        &mut writer,
        &mut queue,
        &mut stats,
        &config.codec,
        &mut shutdown,
    )
    .await;

    let mut discarded_bytes = 0;
    let error = match result {
        Ok(()) => {
            conn.transition(ConnState::Closed);
            debug!(
                conn_id = conn.id,
                peer = %conn.peer,
                frames = stats.frames,
                age_ms = conn.age_ms(),
                "Connection closed"
            );
            None
        }
        Err(e) => {
            conn.transition(ConnState::Error);
            discarded_bytes = queue.discard();
            warn!(
                conn_id = conn.id,
                peer = %conn.peer,
                error = %e,
                discarded_bytes,
                "Connection error"
            );
            Some(e)
        }
    };

    ConnectionSummary {
        id: conn.id,
        final_state: conn.state(),
        frames_echoed: stats.frames,
        bytes_echoed: stats.bytes,
        peak_queued_bytes: queue.peak_bytes(),
        read_pauses: queue.pause_count(),
        discarded_bytes,
        error,
    }
}

async fn serve<R, W>(
    conn: &mut Connection,
    reader: &mut R,
    writer: &mut W,
    queue: &mut WriteQueue,
    stats: &mut EchoStats,
    codec: &FrameCodec,
    shutdown: &mut Shutdown,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut read_buf = BytesMut::with_capacity(READ_CHUNK);
    conn.transition(ConnState::Reading);

    loop {
        if read_buf.capacity() - read_buf.len() < READ_CHUNK / 4 {
            read_buf.reserve(READ_CHUNK);
        }
        let was_paused = queue.is_paused();

        tokio::select! {
            biased;

            _ = shutdown.recv(), if !shutdown.is_shutdown() => {
                debug!(conn_id = conn.id, pending = queue.queued_bytes(), "Shutdown requested");
                break;
            }

            written = queue.write_to(writer), if !queue.is_empty() => {
                written?;
                if queue.is_empty() {
                    conn.transition(ConnState::Reading);
                }
                if was_paused && !queue.is_paused() {
                    trace!(conn_id = conn.id, queued = queue.queued_bytes(), "Resuming reads");
                    // Frames held back while paused
                    echo_frames(conn, &mut read_buf, queue, stats, codec)?;
                }
            }

            read = reader.read_buf(&mut read_buf), if !was_paused => {
                if read? == 0 {
                    if !read_buf.is_empty() {
                        return Err(ConnectionError::TruncatedFrame {
                            buffered: read_buf.len(),
                        });
                    }
                    trace!(conn_id = conn.id, "Peer closed");
                    break;
                }
                echo_frames(conn, &mut read_buf, queue, stats, codec)?;
            }
        }
    }

    conn.transition(ConnState::Closing);
    queue.flush_all(writer).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Decode complete frames from `read_buf` and queue their echoes, stopping
/// early if the queue crosses its high water mark.
fn echo_frames(
    conn: &mut Connection,
    read_buf: &mut BytesMut,
    queue: &mut WriteQueue,
    stats: &mut EchoStats,
    codec: &FrameCodec,
) -> Result<(), FrameError> {
    while !queue.is_paused() {
        let Some(payload) = codec.decode(read_buf)? else {
            break;
        };

        trace!(
            conn_id = conn.id,
            seq = stats.frames,
            len = payload.len(),
            payload = %preview(&payload),
            "Received frame"
        );

        let frame = codec.encode(&payload)?;
        stats.frames += 1;
        stats.bytes += payload.len() as u64;
        conn.transition(ConnState::Writing);

        if queue.push(frame) {
            trace!(conn_id = conn.id, queued = queue.queued_bytes(), "Pausing reads");
        }
    }
    Ok(())
}

/// Lossy UTF-8 rendering of the start of a payload.
fn preview(payload: &[u8]) -> Cow<'_, str> {
    let shown = &payload[..payload.len().min(PREVIEW_LEN)];
    if shown.len() < payload.len() {
        Cow::Owned(format!("{}...", String::from_utf8_lossy(shown)))
    } else {
        String::from_utf8_lossy(shown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::logging::capture::CapturedLogs;
    use crate::shutdown::ShutdownCoordinator;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn frames(codec: &FrameCodec, payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for payload in payloads {
            codec.encode_into(payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_echo_in_order() {
        let codec = FrameCodec::default();
        let wire = frames(&codec, &[&b"a"[..], &b"bb"[..], &b"ccc"[..]]);

        let mock = tokio_test::io::Builder::new()
            .read(&wire)
            .write(&wire)
            .build();

        let registry = ConnectionRegistry::new();
        let coordinator = ShutdownCoordinator::default();
        let summary = handle_connection(
            mock,
            registry.register(peer()),
            HandlerConfig::default(),
            coordinator.subscribe(),
        )
        .await;

        assert!(summary.error.is_none());
        assert_eq!(summary.final_state, ConnState::Closed);
        assert_eq!(summary.frames_echoed, 3);
        assert_eq!(summary.bytes_echoed, 6);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let codec = FrameCodec::default();
        let wire = frames(&codec, &[&b"hello"[..]]);

        let mock = tokio_test::io::Builder::new()
            .read(&wire[..2])
            .read(&wire[2..6])
            .read(&wire[6..])
            .write(&wire)
            .build();

        let registry = ConnectionRegistry::new();
        let coordinator = ShutdownCoordinator::default();
        let summary = handle_connection(
            mock,
            registry.register(peer()),
            HandlerConfig::default(),
            coordinator.subscribe(),
        )
        .await;

        assert!(summary.error.is_none());
        assert_eq!(summary.frames_echoed, 1);
    }

    #[tokio::test]
    async fn test_oversize_prefix_closes_without_echo() {
        let config = HandlerConfig {
            codec: FrameCodec::new(4),
            water_marks: WaterMarks::default(),
        };
        let mock = tokio_test::io::Builder::new()
            .read(b"\x00\x00\x00\x05hello")
            .build();

        let registry = ConnectionRegistry::new();
        let coordinator = ShutdownCoordinator::default();
        let summary =
            handle_connection(mock, registry.register(peer()), config, coordinator.subscribe())
                .await;

        assert_eq!(summary.final_state, ConnState::Error);
        assert!(matches!(
            summary.error,
            Some(ConnectionError::Frame(FrameError::InvalidFrame { declared: 5, max: 4 }))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let mock = tokio_test::io::Builder::new()
            .read(b"\x00\x00\x00\x0aabc")
            .build();

        let registry = ConnectionRegistry::new();
        let coordinator = ShutdownCoordinator::default();
        let summary = handle_connection(
            mock,
            registry.register(peer()),
            HandlerConfig::default(),
            coordinator.subscribe(),
        )
        .await;

        assert_eq!(summary.final_state, ConnState::Error);
        assert!(matches!(
            summary.error,
            Some(ConnectionError::TruncatedFrame { buffered: 7 })
        ));
    }

    #[tokio::test]
    async fn test_slow_consumer_bounds_queue() {
        const PAYLOAD: usize = 32;
        const COUNT: usize = 200;
        const HIGH: usize = 256;

        let codec = FrameCodec::default();
        let config = HandlerConfig {
            codec,
            water_marks: WaterMarks { high: HIGH, low: 64 },
        };

        let (client, server) = tokio::io::duplex(64);
        let registry = ConnectionRegistry::new();
        let coordinator = ShutdownCoordinator::default();
        let handler = tokio::spawn(handle_connection(
            server,
            registry.register(peer()),
            config,
            coordinator.subscribe(),
        ));

        let payloads: Vec<Vec<u8>> = (0..COUNT).map(|i| vec![i as u8; PAYLOAD]).collect();
        let mut expected = BytesMut::new();
        for payload in &payloads {
            codec.encode_into(payload, &mut expected).unwrap();
        }

        let (mut rd, mut wr) = tokio::io::split(client);
        let wire = expected.clone();
        let writer = tokio::spawn(async move {
            wr.write_all(&wire).await.unwrap();
            wr.shutdown().await.unwrap();
        });

        // Nobody reads the echoes yet, so the handler must stop reading
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        let mut echoed = vec![0u8; expected.len()];
        rd.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, &expected[..]);

        writer.await.unwrap();
        let mut rest = Vec::new();
        rd.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let summary = handler.await.unwrap();
        assert!(summary.error.is_none());
        assert_eq!(summary.frames_echoed, COUNT as u64);
        assert!(summary.read_pauses >= 1);
        assert!(summary.peak_queued_bytes <= HIGH + PAYLOAD + 4);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_then_closes() {
        let codec = FrameCodec::default();
        let (client, server) = tokio::io::duplex(1024);
        let registry = ConnectionRegistry::new();
        let coordinator = ShutdownCoordinator::default();
        let handler = tokio::spawn(handle_connection(
            server,
            registry.register(peer()),
            HandlerConfig::default(),
            coordinator.subscribe(),
        ));

        let (mut rd, mut wr) = tokio::io::split(client);
        wr.write_all(&codec.encode(b"ping").unwrap()).await.unwrap();

        let mut echoed = vec![0u8; 8];
        rd.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed[4..], b"ping");

        // Peer keeps its write side open; only the stop signal ends the handler
        coordinator.trigger();
        let summary = tokio::time::timeout(Duration::from_secs(1), handler)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.final_state, ConnState::Closed);
        assert!(registry.is_empty());

        let mut rest = Vec::new();
        rd.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_preview_truncates_and_is_lossy() {
        assert_eq!(preview(b"hello"), "hello");
        assert_eq!(preview(b"\xffok"), "\u{fffd}ok");

        let long = vec![b'x'; PREVIEW_LEN + 10];
        let shown = preview(&long);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.len(), PREVIEW_LEN + 3);
    }

    #[tokio::test]
    async fn test_received_frames_are_logged() {
        let logs = CapturedLogs::default();
        let _logging = logs.install();

        let codec = FrameCodec::default();
        let wire = frames(&codec, &[&b"hi"[..], &b"there"[..]]);
        let mock = tokio_test::io::Builder::new()
            .read(&wire)
            .write(&wire)
            .build();

        let registry = ConnectionRegistry::new();
        let coordinator = ShutdownCoordinator::default();
        let summary = handle_connection(
            mock,
            registry.register(peer()),
            HandlerConfig::default(),
            coordinator.subscribe(),
        )
        .await;
        assert_eq!(summary.frames_echoed, 2);

        let received = logs.lines_containing("Received frame");
        assert_eq!(received.len(), 2);
        assert!(received[0].contains("seq=0") && received[0].contains("payload=hi"));
        assert!(received[1].contains("seq=1") && received[1].contains("len=5"));
    }
}
