//! frame-echo-client: send frames to an echo server and print the echoes
//!
//! Frames come from `--message` values, a fixed demo payload with `--demo`,
//! or one per line of standard input. Each echoed frame is written to
//! standard output followed by a newline.

use clap::Parser;
use frame_echo::{logging, Client, FrameCodec, RecvError, SendError, DEFAULT_MAX_FRAME_SIZE};
use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

const DEMO_PAYLOAD: &str = "hello from frame-echo";

/// Command-line arguments for the echo client
#[derive(Parser, Debug)]
#[command(name = "frame-echo-client")]
#[command(version)]
#[command(about = "Length-prefixed TCP echo client", long_about = None)]
struct ClientArgs {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Maximum frame payload size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,

    /// Frame to send (repeatable); stdin is read when none are given
    #[arg(short, long)]
    message: Vec<String>,

    /// Send a single fixed demo frame
    #[arg(long, conflicts_with = "message")]
    demo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = ClientArgs::parse();
    logging::init(&args.log_level, true);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Client failed");
            eprintln!("frame-echo-client: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: ClientArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let codec = FrameCodec::new(args.max_frame_size);
    let addr = format!("{}:{}", args.host, args.port);
    let client = Client::connect(addr, codec).await?;

    let frames = if args.demo {
        from_messages(vec![DEMO_PAYLOAD.to_string()])
    } else if !args.message.is_empty() {
        from_messages(args.message)
    } else {
        from_stdin()
    };

    let mut stdout = tokio::io::stdout();
    let exchanged = exchange(client, frames, &mut stdout).await?;
    if exchanged.received < exchanged.sent {
        return Err(format!(
            "server closed after {} of {} echoes",
            exchanged.received, exchanged.sent
        )
        .into());
    }
    Ok(())
}

/// Frame counts for one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Exchanged {
    sent: usize,
    received: usize,
}

fn from_messages(messages: Vec<String>) -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel(messages.len().max(1));
    for message in messages {
        // Capacity covers every message
        let _ = tx.try_send(Ok(message));
    }
    rx
}

/// Read stdin lines on a plain thread.
///
/// A blocked read on the runtime's blocking pool would hold up runtime
/// shutdown; this thread simply dies with the process.
fn from_stdin() -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Send every frame from `frames` while printing echoes to `out`.
///
/// Ends when the server closes the connection. If that happens before
/// `frames` is exhausted, the remaining input is abandoned.
async fn exchange<W>(
    client: Client,
    mut frames: mpsc::Receiver<io::Result<String>>,
    out: &mut W,
) -> Result<Exchanged, Box<dyn std::error::Error + Send + Sync>>
where
    W: AsyncWrite + Unpin,
{
    let (mut sender, mut receiver) = client.into_split();
    let sent = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&sent);
    let mut send = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let frame = frame.map_err(SendError::Io)?;
            sender.send(frame.as_bytes()).await?;
            counter.fetch_add(1, Ordering::Relaxed);
        }
        sender.close().await?;
        debug!(sent = counter.load(Ordering::Relaxed), "Finished sending");
        Ok::<_, SendError>(())
    });

    let mut received = 0usize;
    let mut send_done = false;
    loop {
        tokio::select! {
            joined = &mut send, if !send_done => {
                // A send failure ends the session; success leaves the
                // receive side to drain outstanding echoes
                joined??;
                send_done = true;
            }

            next = receiver.receive() => match next {
                Ok(frame) => {
                    out.write_all(&frame).await?;
                    out.write_all(b"\n").await?;
                    out.flush().await?;
                    received += 1;
                }
                Err(RecvError::ConnectionClosed) => break,
                Err(e) => return Err(e.into()),
            },
        }
    }

    if !send_done {
        debug!("Server closed the connection, abandoning remaining input");
        send.abort();
    }

    Ok(Exchanged {
        sent: sent.load(Ordering::Relaxed),
        received,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Echo `count` frames then close.
    async fn echo_then_close(listener: TcpListener, count: usize) {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut rd, mut wr) = stream.into_split();
        let codec = FrameCodec::default();
        let mut buf = bytes::BytesMut::new();
        let mut echoed = 0;
        while echoed < count {
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                wr.write_all(&codec.encode(&frame).unwrap()).await.unwrap();
                echoed += 1;
                continue;
            }
            assert_ne!(rd.read_buf(&mut buf).await.unwrap(), 0);
        }
        wr.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_close_ends_session_with_open_input() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(echo_then_close(listener, 1));

        let client = Client::connect(addr, FrameCodec::default()).await.unwrap();
        // Input stays open, like an idle terminal
        let (tx, frames) = mpsc::channel(4);
        tx.send(Ok("hello".to_string())).await.unwrap();

        let mut out = Vec::new();
        let exchanged = tokio::time::timeout(
            Duration::from_secs(5),
            exchange(client, frames, &mut out),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(exchanged, Exchanged { sent: 1, received: 1 });
        assert_eq!(out, b"hello\n");
        server.await.unwrap();
        drop(tx);
    }

    #[tokio::test]
    async fn test_messages_are_echoed_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(echo_then_close(listener, 2));

        let client = Client::connect(addr, FrameCodec::default()).await.unwrap();
        let frames = from_messages(vec!["one".to_string(), "two".to_string()]);

        let mut out = Vec::new();
        let exchanged = exchange(client, frames, &mut out).await.unwrap();
        assert_eq!(exchanged, Exchanged { sent: 2, received: 2 });
        assert_eq!(out, b"one\ntwo\n");
        server.await.unwrap();
    }
}
