//! Connection Context
//!
//! One `ConnectionContext` drives one client connection from accept to
//! teardown.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Socket accepted (TLS handshake already done)
//!        │
//!        ▼
//! 2. start(): observers see "started", writer task spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────────────┐
//!    │  Read bytes into the fixed buffer     │◄─────┐
//!    │  (bounded by the idle timeout)        │      │
//!    └──────────────────┬───────────────────┘      │
//!                       ▼                          │
//!    ┌──────────────────────────────────────┐      │
//!    │  Parse; apply events in order;       │      │
//!    │  on Complete submit the request and  │      │
//!    │  wait for its disposition            │      │
//!    │  (repeat while whole requests remain)│      │
//!    └──────────────────┬───────────────────┘      │
//!                       ▼                          │
//!    ┌──────────────────────────────────────┐      │
//!    │  Compact: move unparsed tail to front │──────┘
//!    └──────────────────────────────────────┘
//!        │ peer closed / Connection: close / error / timeout
//!        ▼
//! 4. disconnect(): writer flushed and closed, observers see "disconnected"
//!        │
//!        ▼
//! 5. cleanup(): buffer, parser and request reset
//! ```
//!
//! Requests on one connection are handled strictly one after another, in
//! arrival order. Nothing escapes the context: protocol errors are answered
//! with a 400 (or 413) and end the connection; I/O errors end it silently.

use crate::connection::buffer::{ReadBuffer, DEFAULT_BUFFER_SIZE};
use crate::connection::error::{ConnectionError, DisconnectReason};
use crate::connection::handle::{write_loop, ConnectionHandle, ConnectionInfo, OUTBOUND_CAPACITY};
use crate::connection::stats::{ConnectionObserver, ConnectionStats};
use crate::http::Request;
use crate::protocol::{HttpParser, ParseEvent, ParseLimits, ParserState, RequestParser};
use bytes::Bytes;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Interim response sent when a client waits on `Expect: 100-continue`.
pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// How long teardown waits for queued writes to reach the peer.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What a connection does once a request has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepAlive,
    Close,
}

/// Outcome of handing a request over for processing.
#[derive(Debug)]
pub enum Submission {
    /// Handled (or rejected) on the spot
    Done(Disposition),
    /// Handled elsewhere; the disposition arrives when it is done
    Pending(oneshot::Receiver<Disposition>),
}

/// Where a connection publishes completed requests.
pub trait RequestSink: Send + Sync {
    fn submit(&self, conn: &ConnectionHandle, request: Request) -> Submission;
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Read buffer size; bounds the request line plus any single header line
    pub buffer_size: usize,
    /// Longest wait for the next bytes from the client; `None` waits forever
    pub idle_timeout: Option<Duration>,
    pub limits: ParseLimits,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: Some(Duration::from_secs(30)),
            limits: ParseLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

enum ReadOutcome {
    Read(usize),
    Failed(std::io::Error),
    TimedOut,
    Shutdown,
}

/// Drives a single client connection.
pub struct ConnectionContext<S> {
    reader: ReadHalf<S>,
    handle: ConnectionHandle,
    writer: Option<JoinHandle<()>>,
    buffer: ReadBuffer,
    parser: Box<dyn RequestParser>,
    /// The request being assembled from parser events
    request: Request,
    events: Vec<ParseEvent>,
    sink: Arc<dyn RequestSink>,
    stats: Arc<ConnectionStats>,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    idle_timeout: Option<Duration>,
    shutdown: Option<watch::Receiver<bool>>,
    started: bool,
    disconnected: bool,
}

impl<S> ConnectionContext<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Creates a context for `stream` and spawns its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        stream: S,
        info: ConnectionInfo,
        settings: &ConnectionSettings,
        sink: Arc<dyn RequestSink>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        let (reader, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handle = ConnectionHandle::new(info, tx);

        // A peer that reads nothing for the idle timeout is dropped
        let writer = tokio::spawn(write_loop(
            write_half,
            rx,
            handle.closed_flag(),
            Arc::clone(&stats),
            handle.remote_addr(),
            settings.idle_timeout,
        ));

        Self {
            reader,
            handle,
            writer: Some(writer),
            buffer: ReadBuffer::new(settings.buffer_size),
            parser: Box::new(HttpParser::with_limits(settings.limits)),
            request: Request::new(),
            events: Vec::with_capacity(16),
            sink,
            observers: vec![Arc::clone(&stats) as Arc<dyn ConnectionObserver>],
            stats,
            idle_timeout: settings.idle_timeout,
            shutdown: None,
            started: false,
            disconnected: false,
        }
    }

    /// Adds an observer for the started/disconnected notifications.
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Closes the connection, once idle, when `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Replaces the built-in HTTP/1.x parser.
    pub fn with_parser(mut self, parser: Box<dyn RequestParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Runs the connection to completion. Never fails: every error ends in
    /// a disconnect.
    pub async fn run(mut self) {
        self.start();
        let reason = self.read_loop().await;
        self.disconnect(reason).await;
        self.cleanup();
    }

    /// Raises the "started" notification.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        info!(
            client = %self.handle.remote_addr(),
            secure = self.handle.is_secure(),
            "Client connected"
        );
        for observer in &self.observers {
            observer.on_started(self.handle.info());
        }
    }

    /// The main read-parse-dispatch loop.
    async fn read_loop(&mut self) -> DisconnectReason {
        loop {
            if self.is_idle() && self.shutdown_requested() {
                return DisconnectReason::Shutdown;
            }
            if self.buffer.is_full() {
                let capacity = self.buffer.capacity();
                return self.fail(ConnectionError::RequestTooLarge { capacity }).await;
            }

            let n = match self.read_some().await {
                ReadOutcome::Read(n) => n,
                ReadOutcome::Failed(e) => return self.fail(ConnectionError::Io(e)).await,
                ReadOutcome::TimedOut => return DisconnectReason::Timeout,
                // A request in progress is finished first
                ReadOutcome::Shutdown if self.is_idle() => return DisconnectReason::Shutdown,
                ReadOutcome::Shutdown => continue,
            };

            if let Some(reason) = self.on_receive(n).await {
                return reason;
            }
        }
    }

    /// Reads into the spare part of the buffer, bounded by the idle timeout
    /// and interrupted by the shutdown signal.
    async fn read_some(&mut self) -> ReadOutcome {
        let idle_timeout = self.idle_timeout;
        let read = self.reader.read(self.buffer.spare_mut());
        let read = async move {
            match idle_timeout {
                Some(limit) => tokio::time::timeout(limit, read).await.ok(),
                None => Some(read.await),
            }
        };

        tokio::select! {
            result = read => match result {
                Some(Ok(n)) => ReadOutcome::Read(n),
                Some(Err(e)) => ReadOutcome::Failed(e),
                None => ReadOutcome::TimedOut,
            },
            _ = wait_for_shutdown(&mut self.shutdown) => ReadOutcome::Shutdown,
        }
    }

    /// Handles the result of one read of `n` bytes.
    async fn on_receive(&mut self, n: usize) -> Option<DisconnectReason> {
        if n == 0 {
            return Some(DisconnectReason::ConnectionReset);
        }

        self.buffer.advance(n);
        self.stats.bytes_read(n);
        trace!(
            client = %self.handle.remote_addr(),
            bytes = n,
            buffered = self.buffer.len(),
            "Read data"
        );

        match self.process_buffer().await {
            Ok(Flow::Continue) => None,
            Ok(Flow::Close) => Some(DisconnectReason::Closed),
            Err(e) => Some(self.fail(e).await),
        }
    }

    /// Parses everything parseable in the buffer, then compacts it.
    ///
    /// The parser completes at most one request per call; while it is back
    /// at a request line and bytes remain, it is invoked again so pipelined
    /// requests are handled without another read.
    async fn process_buffer(&mut self) -> Result<Flow, ConnectionError> {
        let mut offset = 0;

        let flow = loop {
            let consumed = self
                .parser
                .parse(&self.buffer.filled()[offset..], &mut self.events)?;
            offset += consumed;

            let flow = self.apply_events().await?;
            if flow == Flow::Close
                || self.parser.state() != ParserState::FirstLine
                || consumed == 0
                || offset >= self.buffer.len()
            {
                break flow;
            }
        };

        self.buffer.consume(offset);
        trace!(
            client = %self.handle.remote_addr(),
            consumed = offset,
            remaining = self.buffer.len(),
            "Parsed buffer"
        );
        Ok(flow)
    }

    async fn apply_events(&mut self) -> Result<Flow, ConnectionError> {
        let mut events = mem::take(&mut self.events);
        let mut flow = Flow::Continue;

        for event in events.drain(..) {
            if self.apply(event).await? == Flow::Close {
                flow = Flow::Close;
                break;
            }
        }

        self.events = events;
        Ok(flow)
    }

    async fn apply(&mut self, event: ParseEvent) -> Result<Flow, ConnectionError> {
        match event {
            ParseEvent::RequestLine {
                method,
                uri,
                version,
            } => {
                trace!(client = %self.handle.remote_addr(), method = %method, uri = %uri, "Request line");
                self.request.set_request_line(method, uri, version);
            }
            ParseEvent::Header { name, value } => self.request.headers_mut().append(name, value),
            ParseEvent::HeadersComplete => {
                self.request.finish_headers();

                // Must reach the client before it sends the body
                if self.request.expects_continue() {
                    trace!(client = %self.handle.remote_addr(), "Sending 100 Continue");
                    self.handle
                        .send_async(Bytes::from_static(CONTINUE_RESPONSE))
                        .await?;
                }
            }
            ParseEvent::Body(chunk) => self.request.append_body(&chunk)?,
            ParseEvent::Complete => return self.complete().await,
        }
        Ok(Flow::Continue)
    }

    /// Publishes the finished request and waits for it to be answered.
    async fn complete(&mut self) -> Result<Flow, ConnectionError> {
        let client = self.handle.remote_addr();
        self.request.set_remote(client, self.handle.is_secure());

        let request = mem::take(&mut self.request);
        self.stats.request_received();
        debug!(
            client = %client,
            method = %request.method(),
            uri = request.uri(),
            "Request received"
        );

        let disposition = match self.sink.submit(&self.handle, request) {
            Submission::Done(disposition) => disposition,
            Submission::Pending(rx) => rx.await.unwrap_or(Disposition::Close),
        };

        Ok(match disposition {
            Disposition::KeepAlive if !self.handle.is_closed() => Flow::Continue,
            _ => Flow::Close,
        })
    }

    /// Answers what can still be answered and picks the disconnect reason.
    async fn fail(&mut self, err: ConnectionError) -> DisconnectReason {
        let client = self.handle.remote_addr();

        match err.status() {
            Some(status) => {
                warn!(client = %client, error = %err, "Protocol error");
                let body = err.to_string();
                let version = self.request.version();
                if let Err(e) = self.handle.respond_async(version, status, &body).await {
                    debug!(client = %client, error = %e, "Could not send error response");
                }
            }
            None => debug!(client = %client, error = %err, "Connection error"),
        }

        err.disconnect_reason()
    }

    /// Tears the connection down.
    ///
    /// Idempotent: the writer is flushed and observers are notified only
    /// the first time.
    pub async fn disconnect(&mut self, reason: DisconnectReason) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;

        let client = self.handle.remote_addr();
        self.handle.close();

        if let Some(mut writer) = self.writer.take() {
            match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    error!(client = %client, "Writer task panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    debug!(client = %client, "Writer did not drain in time");
                    writer.abort();
                }
            }
        }

        match reason {
            DisconnectReason::Closed | DisconnectReason::Shutdown => {
                info!(client = %client, reason = %reason, "Client disconnected")
            }
            DisconnectReason::ConnectionReset => {
                debug!(client = %client, "Connection closed by client")
            }
            DisconnectReason::Timeout => debug!(client = %client, "Idle timeout"),
            _ => warn!(client = %client, reason = %reason, "Connection dropped"),
        }

        if self.started {
            for observer in &self.observers {
                observer.on_disconnected(self.handle.info(), reason);
            }
        }
    }

    /// Releases buffered state so nothing outlives the connection.
    fn cleanup(&mut self) {
        self.buffer.clear();
        self.events.clear();
        self.request.clear();
        self.parser.reset();
    }

    /// No partial request is buffered.
    fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.parser.state() == ParserState::FirstLine
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Resolves when the shutdown value changes; never without a receiver or
/// once the sender is gone.
async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        if rx.changed().await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}
