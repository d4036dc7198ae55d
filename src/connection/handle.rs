//! The write side of a connection.
//!
//! A connection's write half is owned by a writer task that drains a
//! bounded channel of [`Outbound`] frames. Everything that produces bytes
//! for the peer (the read loop, responses built on worker threads, the
//! admission queue) holds a cloned [`ConnectionHandle`] and never touches
//! the socket directly, so frames go out in the order they were sent.
//!
//! The channel holds at most [`OUTBOUND_CAPACITY`] frames. A producer
//! facing a peer that stops reading waits for room instead of buffering
//! without limit, and the writer gives up on a peer that accepts nothing
//! for the write timeout.

use crate::connection::error::ConnectionClosed;
use crate::connection::stats::ConnectionStats;
use crate::protocol::{StatusCode, Version};
use bytes::{BufMut, Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

/// Frames queued per connection before producers wait for the writer.
pub const OUTBOUND_CAPACITY: usize = 32;

/// Identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    id: u64,
    remote_addr: SocketAddr,
    secure: bool,
}

impl ConnectionInfo {
    pub fn new(id: u64, remote_addr: SocketAddr, secure: bool) -> Self {
        Self {
            id,
            remote_addr,
            secure,
        }
    }

    /// Server-unique connection number.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether the connection is TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

/// A frame for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Data(Bytes),
    /// Flush, close the write side and stop
    Shutdown,
}

/// Cloneable handle for writing to a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    info: Arc<ConnectionInfo>,
    tx: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(info: ConnectionInfo, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            info: Arc::new(info),
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle plus the receiving end of its channel, for driving a
    /// connection by hand.
    ///
    /// # Example
    /// ```
    /// use bytes::Bytes;
    /// use portico::connection::{ConnectionHandle, ConnectionInfo, Outbound};
    ///
    /// let info = ConnectionInfo::new(1, "127.0.0.1:40000".parse().unwrap(), false);
    /// let (handle, mut rx) = ConnectionHandle::pair(info);
    ///
    /// handle.send(Bytes::from_static(b"hello")).unwrap();
    /// assert_eq!(rx.try_recv().unwrap(), Outbound::Data(Bytes::from_static(b"hello")));
    /// ```
    pub fn pair(info: ConnectionInfo) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (Self::new(info, tx), rx)
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.info.remote_addr
    }

    pub fn is_secure(&self) -> bool {
        self.info.secure
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Queues bytes for the peer, blocking the calling thread while the
    /// outbound channel is full.
    ///
    /// For synchronous code on worker threads. Async code uses
    /// [`send_async`](Self::send_async); calling this from a runtime thread
    /// with a full channel panics.
    ///
    /// Fails once the connection has been closed or the writer has stopped.
    pub fn send(&self, bytes: Bytes) -> Result<(), ConnectionClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionClosed);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        match self.tx.try_send(Outbound::Data(bytes)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(ConnectionClosed),
            Err(TrySendError::Full(frame)) => {
                trace!(client = %self.info.remote_addr, "Outbound channel full, waiting");
                self.tx.blocking_send(frame).map_err(|_| ConnectionClosed)
            }
        }
    }

    /// Queues bytes for the peer, waiting asynchronously for room.
    pub async fn send_async(&self, bytes: Bytes) -> Result<(), ConnectionClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionClosed);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Outbound::Data(bytes))
            .await
            .map_err(|_| ConnectionClosed)
    }

    /// Writes a minimal complete response with `Connection: close`.
    ///
    /// Used for errors raised below the dispatcher, where no `Response`
    /// exists: last-resort 500s and rejections. Blocks like [`send`](Self::send).
    pub fn respond(
        &self,
        version: Version,
        status: StatusCode,
        body: &str,
    ) -> Result<(), ConnectionClosed> {
        self.send(close_response(version, status, body))
    }

    /// [`respond`](Self::respond) for the read loop: protocol errors and
    /// oversized requests.
    pub async fn respond_async(
        &self,
        version: Version,
        status: StatusCode,
        body: &str,
    ) -> Result<(), ConnectionClosed> {
        self.send_async(close_response(version, status, body)).await
    }

    /// Asks the writer to flush and close. Later sends fail.
    ///
    /// Returns false if the handle was already closed. Never blocks: with
    /// a full channel the shutdown frame is queued from a spawned task.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(TrySendError::Full(frame)) = self.tx.try_send(Outbound::Shutdown) {
            let tx = self.tx.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        let _ = tx.send(frame).await;
                    });
                }
                Err(_) => {
                    let _ = tx.blocking_send(frame);
                }
            }
        }
        true
    }

    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

fn close_response(version: Version, status: StatusCode, body: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(160 + body.len());
    out.put_slice(version.as_str().as_bytes());
    out.put_slice(format!(" {}\r\n", status).as_bytes());
    let date = httpdate::fmt_http_date(SystemTime::now());
    out.put_slice(format!("Date: {}\r\n", date).as_bytes());
    out.put_slice(b"Content-Type: text/plain; charset=utf-8\r\n");
    out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.put_slice(b"Connection: close\r\n\r\n");
    out.put_slice(body.as_bytes());
    out.freeze()
}

/// Drains `rx` into `writer` until a shutdown frame, a write error, or every
/// handle is dropped.
///
/// Frames already queued are coalesced into one flush. A write or flush
/// that does not finish within `write_timeout` ends the loop; the receiver
/// is dropped first so producers waiting for room fail instead of hanging.
pub(crate) async fn write_loop<W>(
    writer: W,
    mut rx: mpsc::Receiver<Outbound>,
    closed: Arc<AtomicBool>,
    stats: Arc<ConnectionStats>,
    client: SocketAddr,
    write_timeout: Option<Duration>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    'outer: while let Some(frame) = rx.recv().await {
        let mut next = Some(frame);
        while let Some(frame) = next.take() {
            match frame {
                Outbound::Data(bytes) => {
                    if let Err(e) = timed(write_timeout, writer.write_all(&bytes)).await {
                        debug!(client = %client, error = %e, "Write failed");
                        break 'outer;
                    }
                    stats.bytes_written(bytes.len());
                    trace!(client = %client, bytes = bytes.len(), "Queued write");
                }
                Outbound::Shutdown => {
                    drop(rx);
                    let _ = timed(write_timeout, writer.flush()).await;
                    let _ = timed(write_timeout, writer.shutdown()).await;
                    closed.store(true, Ordering::Release);
                    return;
                }
            }
            next = rx.try_recv().ok();
        }

        if let Err(e) = timed(write_timeout, writer.flush()).await {
            debug!(client = %client, error = %e, "Flush failed");
            break;
        }
    }

    drop(rx);
    closed.store(true, Ordering::Release);
    let _ = timed(write_timeout, writer.shutdown()).await;
}

async fn timed<F>(limit: Option<Duration>, io: F) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, io).await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer accepted no data",
            ))
        }),
        None => io.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn info() -> ConnectionInfo {
        ConnectionInfo::new(7, "192.168.1.5:5000".parse().unwrap(), false)
    }

    #[test]
    fn test_respond_writes_close_response() {
        let (handle, mut rx) = ConnectionHandle::pair(info());
        handle
            .respond(Version::Http11, StatusCode::BAD_REQUEST, "bad")
            .unwrap();

        let Outbound::Data(bytes) = rx.try_recv().unwrap() else {
            panic!("expected data frame");
        };
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nbad"));
    }

    #[test]
    fn test_send_after_close_fails() {
        let (handle, mut rx) = ConnectionHandle::pair(info());

        assert!(handle.close());
        assert!(!handle.close());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Shutdown);
        assert!(rx.try_recv().is_err());

        assert_eq!(handle.send(Bytes::from_static(b"x")), Err(ConnectionClosed));
        assert!(handle.is_closed());
    }

    #[test]
    fn test_send_after_receiver_dropped_fails() {
        let (handle, rx) = ConnectionHandle::pair(info());
        drop(rx);
        assert_eq!(handle.send(Bytes::from_static(b"x")), Err(ConnectionClosed));
    }

    #[tokio::test]
    async fn test_write_loop_preserves_order_and_closes() {
        let (client, server) = tokio::io::duplex(1024);
        let (handle, rx) = ConnectionHandle::pair(info());
        let stats = Arc::new(ConnectionStats::new());

        let writer = tokio::spawn(write_loop(
            server,
            rx,
            handle.closed_flag(),
            Arc::clone(&stats),
            handle.remote_addr(),
            None,
        ));

        handle.send(Bytes::from_static(b"one ")).unwrap();
        handle.send(Bytes::from_static(b"two ")).unwrap();
        handle.send(Bytes::from_static(b"three")).unwrap();
        handle.close();
        writer.await.unwrap();

        let mut received = String::new();
        let mut client = client;
        client.read_to_string(&mut received).await.unwrap();

        assert_eq!(received, "one two three");
        assert_eq!(stats.snapshot().bytes_written, 13);
    }

    #[tokio::test]
    async fn test_stalled_peer_blocks_sender() {
        let (client, server) = tokio::io::duplex(1024);
        let (handle, rx) = ConnectionHandle::pair(info());
        let writer = tokio::spawn(write_loop(
            server,
            rx,
            handle.closed_flag(),
            Arc::new(ConnectionStats::new()),
            handle.remote_addr(),
            None,
        ));

        let sent = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&sent);
        let producer = tokio::task::spawn_blocking(move || {
            let chunk = Bytes::from(vec![b'x'; 1024]);
            for _ in 0..1024 {
                if handle.send(chunk.clone()).is_err() {
                    return false;
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
            true
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Channel plus the writer's own buffer, nowhere near all 1 MiB
        let queued = sent.load(Ordering::SeqCst);
        assert!(queued <= OUTBOUND_CAPACITY + 32, "{} frames accepted", queued);
        assert!(!producer.is_finished());

        // Once the peer goes away the blocked producer is released
        drop(client);
        let finished = tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .expect("producer stayed blocked")
            .unwrap();
        assert!(!finished);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_timeout_drops_unresponsive_peer() {
        let (_client, server) = tokio::io::duplex(16);
        let (handle, rx) = ConnectionHandle::pair(info());
        let writer = tokio::spawn(write_loop(
            server,
            rx,
            handle.closed_flag(),
            Arc::new(ConnectionStats::new()),
            handle.remote_addr(),
            Some(Duration::from_millis(100)),
        ));

        handle.send_async(Bytes::from(vec![b'x'; 64 * 1024])).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer kept waiting on the peer")
            .unwrap();

        assert!(handle.is_closed());
        assert_eq!(
            handle.send_async(Bytes::from_static(b"x")).await,
            Err(ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_close_with_full_channel() {
        let (handle, mut rx) = ConnectionHandle::pair(info());
        for _ in 0..OUTBOUND_CAPACITY {
            handle.send_async(Bytes::from_static(b"x")).await.unwrap();
        }

        assert!(handle.close());
        for _ in 0..OUTBOUND_CAPACITY {
            assert!(matches!(rx.recv().await, Some(Outbound::Data(_))));
        }
        assert_eq!(rx.recv().await, Some(Outbound::Shutdown));
    }
}
