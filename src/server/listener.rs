//! The accept loop.
//!
//! Each accepted socket is handed to its own task right away, so the loop
//! is already waiting on the next `accept` while the previous socket is
//! still being filtered or going through its TLS handshake.

use crate::connection::{
    ConnectionContext, ConnectionInfo, ConnectionSettings, ConnectionStats, RequestSink,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Errors from setting up the listening socket.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listener already started")]
    AlreadyStarted,
}

/// Decides whether an accepted client may connect at all.
///
/// Refused sockets are closed before any byte is read.
pub trait ConnectionFilter: Send + Sync {
    fn accept(&self, remote_addr: SocketAddr) -> bool;
}

impl<F> ConnectionFilter for F
where
    F: Fn(SocketAddr) -> bool + Send + Sync,
{
    fn accept(&self, remote_addr: SocketAddr) -> bool {
        self(remote_addr)
    }
}

/// Called with every failed `accept`; by default failures are logged.
pub type AcceptErrorHook = dyn Fn(&io::Error) + Send + Sync;

/// Counts tasks in some phase and lets a caller wait for none to remain.
#[derive(Default)]
struct Tracker {
    count: AtomicUsize,
    idle: Notify,
}

impl Tracker {
    fn enter(self: &Arc<Self>) -> TrackerGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        TrackerGuard(Arc::clone(self))
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct TrackerGuard(Arc<Tracker>);

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Everything an accepted socket needs to become a connection.
struct Acceptor {
    sink: Arc<dyn RequestSink>,
    stats: Arc<ConnectionStats>,
    settings: ConnectionSettings,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    filter: Option<Arc<dyn ConnectionFilter>>,
    on_accept_error: Option<Arc<AcceptErrorHook>>,
    connection_shutdown: watch::Receiver<bool>,
    next_id: AtomicU64,
    in_flight: Arc<Tracker>,
    connections: Arc<Tracker>,
}

impl Acceptor {
    /// Filter, handshake and run one accepted socket.
    async fn establish(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let accepting = self.in_flight.enter();

        if let Some(filter) = &self.filter {
            if !filter.accept(addr) {
                warn!(client = %addr, "Connection refused by filter");
                return;
            }
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        match &self.tls {
            Some(tls) => {
                let handshake = tokio::time::timeout(self.handshake_timeout, tls.accept(stream));
                let stream = match handshake.await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        warn!(client = %addr, error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        warn!(client = %addr, "TLS handshake timed out");
                        return;
                    }
                };
                debug!(client = %addr, "TLS handshake complete");
                self.serve(stream, ConnectionInfo::new(id, addr, true), accepting)
                    .await;
            }
            None => {
                self.serve(stream, ConnectionInfo::new(id, addr, false), accepting)
                    .await
            }
        }
    }

    async fn serve<S>(&self, stream: S, info: ConnectionInfo, accepting: TrackerGuard)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let _live = self.connections.enter();
        let ctx = ConnectionContext::new(
            stream,
            info,
            &self.settings,
            Arc::clone(&self.sink),
            Arc::clone(&self.stats),
        )
        .with_shutdown(self.connection_shutdown.clone());

        // The accept is complete once the connection exists
        drop(accepting);
        ctx.run().await;
    }

    fn accept_failed(&self, err: &io::Error) {
        match &self.on_accept_error {
            Some(hook) => hook(err),
            None => error!(error = %err, "Failed to accept connection"),
        }
    }
}

/// Listener configuration.
#[derive(Clone)]
pub struct ListenerOptions {
    pub backlog: u32,
    pub connection: ConnectionSettings,
    pub tls: Option<TlsAcceptor>,
    pub handshake_timeout: Duration,
    pub filter: Option<Arc<dyn ConnectionFilter>>,
    pub on_accept_error: Option<Arc<AcceptErrorHook>>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            backlog: 1024,
            connection: ConnectionSettings::default(),
            tls: None,
            handshake_timeout: Duration::from_secs(10),
            filter: None,
            on_accept_error: None,
        }
    }
}

impl std::fmt::Debug for ListenerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerOptions")
            .field("backlog", &self.backlog)
            .field("connection", &self.connection)
            .field("tls", &self.tls.is_some())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// A bound listening socket and, once started, its accept loop.
pub struct Listener {
    local_addr: SocketAddr,
    socket: Mutex<Option<TcpListener>>,
    options: ListenerOptions,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<TcpListener>>>,
    in_flight: Arc<Tracker>,
    connections: Arc<Tracker>,
}

impl Listener {
    /// Binds `addr` with the configured backlog. Does not accept yet.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(addr: SocketAddr, options: ListenerOptions) -> Result<Self, ListenerError> {
        let bind_error = |source: io::Error| ListenerError::Bind { addr, source };

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(addr).map_err(bind_error)?;
        let listener = socket.listen(options.backlog).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            local_addr,
            socket: Mutex::new(Some(listener)),
            options,
            shutdown_tx,
            accept_task: Mutex::new(None),
            in_flight: Arc::new(Tracker::default()),
            connections: Arc::new(Tracker::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_secure(&self) -> bool {
        self.options.tls.is_some()
    }

    /// Sockets accepted but not yet turned into connections.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Live connections.
    pub fn connections(&self) -> usize {
        self.connections.count()
    }

    /// Starts accepting. Connections submit completed requests to `sink`
    /// and close, once idle, when `connection_shutdown` turns true.
    pub fn start(
        &self,
        sink: Arc<dyn RequestSink>,
        stats: Arc<ConnectionStats>,
        connection_shutdown: watch::Receiver<bool>,
    ) -> Result<(), ListenerError> {
        let listener = self
            .socket
            .lock()
            .unwrap()
            .take()
            .ok_or(ListenerError::AlreadyStarted)?;

        let acceptor = Arc::new(Acceptor {
            sink,
            stats,
            settings: self.options.connection.clone(),
            tls: self.options.tls.clone(),
            handshake_timeout: self.options.handshake_timeout,
            filter: self.options.filter.clone(),
            on_accept_error: self.options.on_accept_error.clone(),
            connection_shutdown,
            next_id: AtomicU64::new(0),
            in_flight: Arc::clone(&self.in_flight),
            connections: Arc::clone(&self.connections),
        });

        info!(
            address = %self.local_addr,
            secure = self.is_secure(),
            backlog = self.options.backlog,
            "Listening"
        );
        let task = tokio::spawn(accept_loop(listener, acceptor, self.shutdown_tx.subscribe()));
        *self.accept_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Stops accepting and waits up to `grace` for accepts in progress.
    ///
    /// The listening socket stays bound until that wait is over and is
    /// released when this returns. Established connections are not touched.
    pub async fn stop(&self, grace: Duration) {
        self.shutdown_tx.send_replace(true);

        // An unstarted listener still owns its socket
        let mut socket = self.socket.lock().unwrap().take();

        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            match task.await {
                Ok(listener) => socket = Some(listener),
                Err(e) if e.is_panic() => error!("Accept loop panicked"),
                Err(_) => {}
            }
        }

        if tokio::time::timeout(grace, self.in_flight.wait_idle())
            .await
            .is_err()
        {
            warn!(pending = self.in_flight(), "Accepts still in progress after grace period");
        }
        drop(socket);
        info!(address = %self.local_addr, "Listener stopped");
    }

    /// Waits up to `grace` for every connection to end.
    ///
    /// Returns false if some were still open at the deadline.
    pub async fn drain_connections(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.connections.wait_idle())
            .await
            .is_ok()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("options", &self.options)
            .field("connections", &self.connections())
            .finish()
    }
}

/// Main loop that accepts incoming connections.
///
/// Hands the socket back once shutdown is signalled.
async fn accept_loop(
    listener: TcpListener,
    acceptor: Arc<Acceptor>,
    mut shutdown: watch::Receiver<bool>,
) -> TcpListener {
    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!(client = %addr, "Accepted connection");
                tokio::spawn(Arc::clone(&acceptor).establish(stream, addr));
            }
            Err(e) => {
                acceptor.accept_failed(&e);
                // Typically out of file descriptors; give connections a moment to close
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    listener
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use crate::connection::{ConnectionHandle, Disposition, Submission};
    use crate::http::{Request, Response};
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::rustls::{self, pki_types::CertificateDer, pki_types::ServerName};
    use tokio_rustls::TlsConnector;

    struct Hello;

    impl RequestSink for Hello {
        fn submit(&self, conn: &ConnectionHandle, request: Request) -> Submission {
            let mut response = Response::new(conn.clone(), &request);
            response.write("hello");
            let _ = response.send();
            Submission::Done(if response.wants_close() {
                Disposition::Close
            } else {
                Disposition::KeepAlive
            })
        }
    }

    /// Answers with whether the connection went through TLS.
    struct Scheme;

    impl RequestSink for Scheme {
        fn submit(&self, conn: &ConnectionHandle, request: Request) -> Submission {
            let mut response = Response::new(conn.clone(), &request);
            response.write(if conn.info().is_secure() { "secure" } else { "plain" });
            let _ = response.send();
            Submission::Done(Disposition::Close)
        }
    }

    fn start(options: ListenerOptions) -> (Listener, Arc<ConnectionStats>, watch::Sender<bool>) {
        start_with(options, Arc::new(Hello))
    }

    fn start_with(
        options: ListenerOptions,
        sink: Arc<dyn RequestSink>,
    ) -> (Listener, Arc<ConnectionStats>, watch::Sender<bool>) {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), options).unwrap();
        let stats = Arc::new(ConnectionStats::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        listener
            .start(sink, Arc::clone(&stats), shutdown_rx)
            .unwrap();
        (listener, stats, shutdown_tx)
    }

    /// A self-signed certificate for `localhost`, loaded the way a server
    /// configuration loads it.
    fn tls_acceptor(name: &str) -> (TlsAcceptor, CertificateDer<'static>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir: PathBuf = std::env::temp_dir().join(format!(
            "portico-listener-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        let acceptor = TlsConfig::new(&cert_path, &key_path).load_acceptor().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
        (acceptor, certified.cert.der().clone())
    }

    fn tls_connector(cert: CertificateDer<'static>) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert).unwrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    async fn read_to_end(stream: &mut TcpStream) -> String {
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
            .await
            .expect("server did not close")
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_accepts_and_serves() {
        let (listener, stats, _shutdown) = start(ListenerOptions::default());

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let text = read_to_end(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hello"));

        listener.stop(Duration::from_secs(1)).await;
        assert!(listener.drain_connections(Duration::from_secs(1)).await);
        assert_eq!(stats.snapshot().connections_accepted, 1);
        assert_eq!(stats.snapshot().requests_received, 1);
    }

    #[tokio::test]
    async fn test_filter_refuses_socket() {
        let options = ListenerOptions {
            filter: Some(Arc::new(|_addr: SocketAddr| false)),
            ..ListenerOptions::default()
        };
        let (listener, stats, _shutdown) = start(options);

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let _ = client.write_all(b"GET / HTTP/1.1\r\n\r\n").await;

        let mut buf = Vec::new();
        let result = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .expect("refused socket was not closed");
        // Either a clean EOF or a reset, but never a response
        if result.is_ok() {
            assert!(buf.is_empty());
        }
        assert_eq!(stats.snapshot().connections_accepted, 0);

        listener.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_refuses_new_connections() {
        let (listener, _stats, _shutdown) = start(ListenerOptions::default());
        let addr = listener.local_addr();

        listener.stop(Duration::from_secs(1)).await;

        assert!(TcpStream::connect(addr).await.is_err());
        assert_eq!(listener.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (listener, stats, _shutdown) = start(ListenerOptions::default());
        let (_tx, rx) = watch::channel(false);

        assert!(matches!(
            listener.start(Arc::new(Hello), stats, rx),
            Err(ListenerError::AlreadyStarted)
        ));
        listener.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_connection_shutdown_closes_idle_clients() {
        let (listener, _stats, shutdown) = start(ListenerOptions::default());

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut first = [0u8; 15];
        client.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"HTTP/1.1 200 OK");

        listener.stop(Duration::from_secs(1)).await;
        shutdown.send_replace(true);

        assert!(listener.drain_connections(Duration::from_secs(5)).await);
        let rest = read_to_end(&mut client).await;
        assert!(rest.ends_with("hello"));
    }

    #[tokio::test]
    async fn test_tls_handshake_failure_keeps_accepting() {
        let (acceptor, cert) = tls_acceptor("handshake");
        let options = ListenerOptions {
            tls: Some(acceptor),
            handshake_timeout: Duration::from_secs(2),
            ..ListenerOptions::default()
        };
        let (listener, stats, _shutdown) = start_with(options, Arc::new(Scheme));
        assert!(listener.is_secure());

        // Plaintext HTTP is not a ClientHello
        let mut plain = TcpStream::connect(listener.local_addr()).await.unwrap();
        plain
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), plain.read_to_end(&mut buf))
            .await
            .expect("plaintext client was not dropped");
        assert!(!String::from_utf8_lossy(&buf).contains("HTTP/1.1"));
        assert_eq!(stats.snapshot().connections_accepted, 0);

        let tcp = TcpStream::connect(listener.local_addr()).await.unwrap();
        let domain = ServerName::try_from("localhost").unwrap();
        let mut client = tls_connector(cert).connect(domain, tcp).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut out = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut out))
            .await
            .expect("server did not close");
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("secure"));
        assert_eq!(stats.snapshot().connections_accepted, 1);

        listener.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_socket_held_until_accepts_settle() {
        let (acceptor, _cert) = tls_acceptor("settle");
        let options = ListenerOptions {
            tls: Some(acceptor),
            handshake_timeout: Duration::from_secs(5),
            ..ListenerOptions::default()
        };
        let (listener, _stats, _shutdown) = start(options);
        let listener = Arc::new(listener);
        let addr = listener.local_addr();

        // Connects but never starts a handshake
        let _silent = TcpStream::connect(addr).await.unwrap();
        while listener.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stopping = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.stop(Duration::from_millis(500)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stopping.is_finished());
        // Still bound: the kernel queues the connection instead of refusing it
        assert!(TcpStream::connect(addr).await.is_ok());

        stopping.await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
