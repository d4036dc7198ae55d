//! # Portico - An Embeddable HTTP/1.x Server Core
//!
//! Portico owns the part of an HTTP server that sits between the socket and
//! the application: accepting connections, reading and parsing pipelined
//! requests, admitting them under a concurrency cap, dispatching them through
//! rules, authentication and modules, and writing the responses back in
//! order.
//!
//! ## Features
//!
//! - **Pipelining**: Several requests in one read are answered in order
//! - **Admission Control**: A fixed number of requests run at once; the rest
//!   wait in a bounded FIFO, and clients beyond it get `503`
//! - **Keep-Alive**: Connections persist per HTTP/1.0 and HTTP/1.1 rules
//! - **Sessions**: Cookie-bound sessions with a background sweeper
//! - **TLS**: Optional rustls-secured listener
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               Portico                                │
//! │                                                                      │
//! │  ┌────────────┐   ┌───────────────────┐   ┌──────────────────────┐   │
//! │  │  Listener  │──>│ ConnectionContext │──>│    AdmissionQueue    │   │
//! │  │ filter/TLS │   │  buffer + parser  │   │ cap + overflow FIFO  │   │
//! │  └────────────┘   └─────────┬─────────┘   └──────────┬───────────┘   │
//! │                             │ ConnectionHandle       │               │
//! │                             ▼                        ▼               │
//! │                   ┌───────────────────┐   ┌──────────────────────┐   │
//! │                   │   writer task     │<──│      Dispatcher      │   │
//! │                   │ (ordered output)  │   │ rules > auth > mods  │   │
//! │                   └───────────────────┘   └──────────┬───────────┘   │
//! │                                                      │               │
//! │                   ┌───────────────────┐   ┌──────────▼───────────┐   │
//! │                   │  SessionSweeper   │──>│     SessionStore     │   │
//! │                   └───────────────────┘   └──────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use portico::config::ServerConfig;
//! use portico::dispatch::FnModule;
//! use portico::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::default().with_address("127.0.0.1", 8080)?;
//!
//!     let server = Server::builder(config)
//!         .module(FnModule::new(|request, response, _session| {
//!             if request.path() != "/" {
//!                 return Ok(false);
//!             }
//!             response.set_content_type("text/plain");
//!             response.write("Hello from portico");
//!             Ok(true)
//!         }))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: Incremental HTTP/1.x request parser and wire types
//! - [`http`]: Request, response, headers, cookies and form decoding
//! - [`connection`]: Per-connection read loop, buffering and ordered writes
//! - [`server`]: Listener, admission queue and server assembly
//! - [`dispatch`]: Rules, modules, authentication and error pages
//! - [`session`]: Session storage and expiry
//! - [`config`]: Server configuration and TLS loading
//!
//! ## Design Highlights
//!
//! ### Blocking Modules, Async Sockets
//!
//! Modules are plain synchronous functions. Admitted requests run on the
//! blocking thread pool and write through a channel to the connection's
//! writer task, so a slow module never stalls a socket.
//!
//! ### One Request at a Time per Connection
//!
//! A connection does not parse its next pipelined request until the current
//! one has a disposition. Responses therefore leave in request order without
//! any reordering buffer.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod http;
pub mod protocol;
pub mod server;
pub mod session;

// Re-export commonly used types for convenience
pub use config::{ConfigError, ServerConfig, TlsConfig};
pub use connection::{ConnectionHandle, ConnectionStats};
pub use dispatch::{Dispatcher, FnModule, HttpError, Module, Rule};
pub use http::{Request, Response};
pub use protocol::{HttpParser, Method, StatusCode, Version};
pub use server::{RunningServer, Server, ServerBuilder};
pub use session::{MemorySessionStore, Session, SessionStore};

/// The default port Portico listens on
pub const DEFAULT_PORT: u16 = 8080;

/// The default host Portico binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of Portico
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
