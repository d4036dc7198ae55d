//! Connection Handling Module
//!
//! This module manages individual client connections. Each accepted
//! socket is driven by its own async task, so the server can hold
//! thousands of concurrent (mostly idle, keep-alive) clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Listener                             │
//! │                   (server/listener.rs)                      │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept() + optional TLS handshake
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ConnectionContext                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────┐    │
//! │  │ Read bytes  │───>│ Parse HTTP   │───>│ Submit to    │    │
//! │  │ (buffer)    │    │ (events)     │    │ RequestSink  │    │
//! │  └─────────────┘    └──────────────┘    └──────┬───────┘    │
//! │                                                │            │
//! │  ┌─────────────┐    ConnectionHandle::send     │            │
//! │  │ Writer task │<──────────────────────────────┘            │
//! │  └─────────────┘                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Async I/O**: Tokio for non-blocking network operations
//! - **Fixed read buffer**: compacted after every parse pass
//! - **Pipelining**: several requests in a single TCP packet are handled in order
//! - **Statistics**: connection, request and byte counters
//!
//! ## Example
//!
//! ```no_run
//! use portico::connection::{ConnectionContext, ConnectionInfo, ConnectionSettings, ConnectionStats, RequestSink};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! # async fn serve(sink: Arc<dyn RequestSink>) -> std::io::Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! let stats = Arc::new(ConnectionStats::new());
//! let settings = ConnectionSettings::default();
//!
//! let mut next_id = 0;
//! loop {
//!     let (stream, addr) = listener.accept().await?;
//!     next_id += 1;
//!     let info = ConnectionInfo::new(next_id, addr, false);
//!     let ctx = ConnectionContext::new(stream, info, &settings, Arc::clone(&sink), Arc::clone(&stats));
//!     tokio::spawn(ctx.run());
//! }
//! # }
//! ```

pub mod buffer;
pub mod context;
pub mod error;
pub mod handle;
pub mod stats;

// Re-export commonly used types
pub use buffer::{ReadBuffer, DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};
pub use context::{
    ConnectionContext, ConnectionSettings, Disposition, RequestSink, Submission,
    CONTINUE_RESPONSE,
};
pub use error::{ConnectionClosed, ConnectionError, DisconnectReason};
pub use handle::{ConnectionHandle, ConnectionInfo, Outbound, OUTBOUND_CAPACITY};
pub use stats::{ConnectionObserver, ConnectionStats, StatsSnapshot};
