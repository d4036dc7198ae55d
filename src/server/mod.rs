//! Server Assembly
//!
//! Wires the listener, the admission queue, the dispatcher and the session
//! sweeper into a running server.
//!
//! ## Modules
//!
//! - `admission`: bounded concurrency with an overflow FIFO
//! - `listener`: the accept loop, connection filter and TLS handshake
//!
//! ## Example
//!
//! ```no_run
//! use portico::config::ServerConfig;
//! use portico::dispatch::FnModule;
//! use portico::server::Server;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let server = Server::builder(ServerConfig::default())
//!     .module(FnModule::new(|_request, response, _session| {
//!         response.write("hello");
//!         Ok(true)
//!     }))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! println!("listening on {}", server.local_addr());
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod listener;

pub use admission::{AdmissionQueue, AdmissionSettings, RequestProcessor};
pub use listener::{
    AcceptErrorHook, ConnectionFilter, Listener, ListenerError, ListenerOptions,
};

use crate::config::{ConfigError, ServerConfig};
use crate::connection::{ConnectionSettings, ConnectionStats, RequestSink};
use crate::dispatch::{AuthenticationModule, DispatchSettings, Dispatcher, Module, Rule};
use crate::http::FormDecoderProvider;
use crate::protocol::ParseLimits;
use crate::session::{MemorySessionStore, SessionStore, SessionSweeper, SweeperConfig};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Collects configuration and extensions for a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    dispatcher: Dispatcher,
    filter: Option<Arc<dyn ConnectionFilter>>,
    on_accept_error: Option<Arc<AcceptErrorHook>>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        let settings = DispatchSettings {
            session_cookie_name: config.session_cookie_name.clone(),
            server_name: config.server_name.clone(),
            keep_alive_timeout: config.idle_timeout,
            show_error_details: config.show_error_details,
        };
        let dispatcher = Dispatcher::new(Arc::new(MemorySessionStore::new()), settings);

        Self {
            config,
            dispatcher,
            filter: None,
            on_accept_error: None,
        }
    }

    pub fn rule(mut self, rule: impl Rule + 'static) -> Self {
        self.dispatcher.add_rule(rule);
        self
    }

    pub fn module(mut self, module: impl Module + 'static) -> Self {
        self.dispatcher.add_module(module);
        self
    }

    pub fn auth_module(mut self, module: impl AuthenticationModule + 'static) -> Self {
        self.dispatcher.add_auth_module(module);
        self
    }

    /// Replaces the in-memory session store.
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.dispatcher.set_session_store(store);
        self
    }

    pub fn form_decoders(mut self, decoders: FormDecoderProvider) -> Self {
        self.dispatcher.set_decoders(decoders);
        self
    }

    pub fn connection_filter(mut self, filter: impl ConnectionFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn realm_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.dispatcher.set_realm_resolver(resolver);
        self
    }

    pub fn exception_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.dispatcher.set_exception_hook(hook);
        self
    }

    /// Replaces the default logging of failed accepts.
    pub fn on_accept_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&io::Error) + Send + Sync + 'static,
    {
        self.on_accept_error = Some(Arc::new(hook));
        self
    }

    /// Validates the configuration and loads the TLS certificate, if any.
    pub fn build(self) -> Result<Server, ConfigError> {
        self.config.validate()?;
        let tls = self
            .config
            .tls
            .as_ref()
            .map(|tls| tls.load_acceptor())
            .transpose()?;

        Ok(Server {
            config: self.config,
            dispatcher: Arc::new(self.dispatcher),
            tls,
            filter: self.filter,
            on_accept_error: self.on_accept_error,
        })
    }
}

/// A configured server, not yet listening.
pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    tls: Option<TlsAcceptor>,
    filter: Option<Arc<dyn ConnectionFilter>>,
    on_accept_error: Option<Arc<AcceptErrorHook>>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listener and starts every background task.
    pub async fn start(self) -> Result<RunningServer, ListenerError> {
        let config = self.config;
        let stats = Arc::new(ConnectionStats::new());

        let options = ListenerOptions {
            backlog: config.backlog,
            connection: ConnectionSettings {
                buffer_size: config.buffer_size,
                idle_timeout: config.idle_timeout,
                limits: ParseLimits {
                    max_headers: config.max_headers,
                    max_body_size: config.max_body_size,
                },
            },
            tls: self.tls,
            handshake_timeout: config.handshake_timeout,
            filter: self.filter,
            on_accept_error: self.on_accept_error,
        };
        let listener = Listener::bind(config.bind_address, options)?;

        let sweeper = SessionSweeper::start(
            Arc::clone(self.dispatcher.sessions()),
            SweeperConfig {
                max_idle: config.session_timeout,
                ..SweeperConfig::default()
            },
        );

        let queue = Arc::new(AdmissionQueue::start(
            self.dispatcher as Arc<dyn RequestProcessor>,
            AdmissionSettings {
                max_concurrent_requests: config.max_concurrent_requests,
                max_queue_size: config.max_queue_size,
            },
            Arc::clone(&stats),
        ));

        let (connection_shutdown, shutdown_rx) = watch::channel(false);
        listener.start(
            Arc::clone(&queue) as Arc<dyn RequestSink>,
            Arc::clone(&stats),
            shutdown_rx,
        )?;

        info!(
            address = %listener.local_addr(),
            max_concurrent_requests = config.max_concurrent_requests,
            max_queue_size = config.max_queue_size,
            "Server started"
        );

        Ok(RunningServer {
            config,
            listener,
            queue,
            stats,
            sweeper,
            connection_shutdown,
        })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// A listening server.
pub struct RunningServer {
    config: ServerConfig,
    listener: Listener,
    queue: Arc<AdmissionQueue>,
    stats: Arc<ConnectionStats>,
    sweeper: SessionSweeper,
    connection_shutdown: watch::Sender<bool>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    /// Live connections.
    pub fn connections(&self) -> usize {
        self.listener.connections()
    }

    /// Stops the server.
    ///
    /// Accepting stops first, then queued requests are answered with 503,
    /// then idle connections are closed. Each step waits at most the
    /// configured shutdown grace.
    pub async fn stop(self) {
        let grace = self.config.shutdown_grace;
        info!("Shutting down");

        self.listener.stop(grace).await;
        self.queue.stop(grace).await;

        self.connection_shutdown.send_replace(true);
        if !self.listener.drain_connections(grace).await {
            warn!(
                remaining = self.listener.connections(),
                "Connections still open after grace period"
            );
        }

        self.sweeper.stop();
        info!("Server stopped");
    }
}

impl std::fmt::Debug for RunningServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningServer")
            .field("local_addr", &self.local_addr())
            .field("queue", &self.queue)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{BasicAuthentication, FnModule, HttpError};
    use crate::http::{Request, Response};
    use crate::session::Session;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            shutdown_grace: Duration::from_secs(2),
            ..ServerConfig::default()
        }
    }

    fn hello(request: &Request, response: &mut Response, _session: &mut Session) -> anyhow::Result<bool> {
        match request.path() {
            "/hello" => {
                response.set_content_type("text/plain");
                response.write("hello");
                Ok(true)
            }
            "/forbidden" => Err(HttpError::forbidden("no").into()),
            _ => Ok(false),
        }
    }

    async fn exchange(addr: SocketAddr, request: &[u8]) -> String {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut out))
            .await
            .expect("server did not close the connection")
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_unhandled_request_404_and_close() {
        let server = Server::builder(config()).build().unwrap().start().await.unwrap();

        let text = exchange(
            server.local_addr(),
            b"GET /foo HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;

        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Server: portico\r\n"));
        assert!(text.ends_with("Resource not found: /foo"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_pipelined_requests_answered_in_order() {
        let server = Server::builder(config())
            .module(FnModule::new(hello))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let text = exchange(
            server.local_addr(),
            b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n\
              GET /missing HTTP/1.1\r\nHost: x\r\n\r\n\
              GET /forbidden HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;

        let ok = text.find("HTTP/1.1 200 OK").unwrap();
        let missing = text.find("HTTP/1.1 404 Not Found").unwrap();
        let forbidden = text.find("HTTP/1.1 403 Forbidden").unwrap();
        assert!(ok < missing && missing < forbidden);
        assert_eq!(server.stats().snapshot().requests_received, 3);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_keep_alive_advertises_timeout() {
        let server = Server::builder(config())
            .module(FnModule::new(hello))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client
            .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let mut text = String::new();
        while !text.ends_with("hello") {
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "connection closed early");
            text.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Keep-Alive: timeout=30\r\n"));
        assert_eq!(server.connections(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_basic_auth_end_to_end() {
        let server = Server::builder(config())
            .auth_module(
                BasicAuthentication::new(|_realm, user, pass| user == "ada" && pass == "secret")
                    .require_for(|_| true),
            )
            .module(FnModule::new(hello))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let text = exchange(server.local_addr(), b"GET /hello HTTP/1.0\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.0 401 "));
        assert!(text.contains("WWW-Authenticate: Basic realm=\"portico\"\r\n"));

        // ada:secret
        let text = exchange(
            server.local_addr(),
            b"GET /hello HTTP/1.0\r\nAuthorization: Basic YWRhOnNlY3JldA==\r\n\r\n",
        )
        .await;
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Set-Cookie: __tiny_sessid="));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_filter_and_exception_hook() {
        let hooked = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&hooked);
        let server = Server::builder(config())
            .connection_filter(|addr: SocketAddr| addr.ip().is_loopback())
            .exception_hook(move |_| seen.store(true, Ordering::SeqCst))
            .module(FnModule::new(|_request, _response, _session| {
                Err(anyhow::anyhow!("broken"))
            }))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let text = exchange(server.local_addr(), b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(hooked.load(Ordering::SeqCst));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ServerConfig {
            buffer_size: 16,
            ..config()
        };
        assert!(matches!(
            Server::builder(config).build(),
            Err(ConfigError::BufferTooSmall { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_closes_idle_connections() {
        let server = Server::builder(config()).build().unwrap().start().await.unwrap();
        let addr = server.local_addr();

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Let the connection get established before stopping
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.stop().await;

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .expect("idle connection survived shutdown")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
