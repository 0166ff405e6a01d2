//! frame-echo: a length-prefixed TCP echo service
//!
//! Every message travels as a frame: a 4-byte big-endian length followed by
//! that many payload bytes. The server echoes each frame back on the
//! connection it arrived on.
//!
//! Features:
//! - One task per connection with overlapping reads and writes
//! - High/low water mark backpressure on each connection's write queue
//! - Connection-scoped error handling: a bad peer never affects others
//! - Graceful shutdown with a bounded drain period and forced close
//! - Configuration via CLI arguments or TOML file

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod listener;
pub mod logging;
pub mod server;
pub mod shutdown;
pub mod write_queue;

pub use client::{Client, ConnectError, FrameReceiver, FrameSender, RecvError, SendError};
pub use codec::{FrameCodec, FrameError, DEFAULT_MAX_FRAME_SIZE};
pub use config::{Config, ConfigError};
pub use connection::{ConnState, ConnectionRegistry};
pub use handler::{ConnectionError, ConnectionSummary, HandlerConfig};
pub use listener::{BindError, Listener, ListenerHandle};
pub use server::Server;
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use write_queue::WaterMarks;
