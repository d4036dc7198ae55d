//! Admission Control
//!
//! Caps how many requests are processed at once. Requests beyond the cap
//! wait in a bounded FIFO; once that is full too, clients get a 503.
//!
//! ## How it works
//!
//! ```text
//!  connection task                 coordinator task          blocking pool
//!  ───────────────                 ────────────────          ─────────────
//!  submit(request)
//!    ├─ slot free? ──────────────────────────────────────────► process()
//!    ├─ queue has room? ─► push ─► notify ─► pop while slots ─► process()
//!    └─ otherwise: ────────────────────────────────────────────► reject() (503)
//! ```
//!
//! The processing counter is an atomic; the FIFO lock is only held to push
//! or pop, never while a request runs. Processing and rejection are
//! synchronous user code that may block on a full connection channel, so
//! both run on Tokio's blocking pool.

use crate::connection::{ConnectionHandle, ConnectionStats, Disposition, RequestSink, Submission};
use crate::http::Request;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Synchronous request processing behind the admission queue.
pub trait RequestProcessor: Send + Sync + 'static {
    /// Handles a request and writes its response.
    fn process(&self, conn: &ConnectionHandle, request: Request) -> Disposition;

    /// Answers a request the server has no room for.
    fn reject(&self, conn: &ConnectionHandle, request: Request) -> Disposition;
}

/// Admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub max_concurrent_requests: usize,
    pub max_queue_size: usize,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 64,
            max_queue_size: 1024,
        }
    }
}

/// A request waiting for a processing slot.
struct QueueItem {
    conn: ConnectionHandle,
    request: Request,
    done: oneshot::Sender<Disposition>,
}

struct Shared {
    processor: Arc<dyn RequestProcessor>,
    settings: AdmissionSettings,
    processing: AtomicUsize,
    pending: Mutex<VecDeque<QueueItem>>,
    wakeup: Notify,
    stats: Arc<ConnectionStats>,
    stopped: AtomicBool,
}

impl Shared {
    /// Takes a processing slot if one is free.
    fn try_acquire(&self) -> bool {
        let max = self.settings.max_concurrent_requests;
        self.processing
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    /// Pops the oldest queued request, claiming a slot for it.
    fn next_item(&self) -> Option<QueueItem> {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() || !self.try_acquire() {
            return None;
        }
        pending.pop_front()
    }
}

/// Releases a processing slot and wakes the coordinator.
struct ProcessingGuard<'a>(&'a Shared);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.processing.fetch_sub(1, Ordering::AcqRel);
        self.0.wakeup.notify_one();
    }
}

/// Runs `item` on the blocking pool. The caller already holds its slot.
fn spawn_worker(shared: &Arc<Shared>, item: QueueItem) {
    let shared = Arc::clone(shared);
    tokio::task::spawn_blocking(move || {
        let _slot = ProcessingGuard(&shared);
        let QueueItem {
            conn,
            request,
            done,
        } = item;

        let disposition = shared.processor.process(&conn, request);
        // The connection may be gone already
        let _ = done.send(disposition);
    });
}

/// Answers `item` with the processor's rejection on the blocking pool.
///
/// Once the queue is stopping the connection is always closed.
fn spawn_reject(shared: &Arc<Shared>, item: QueueItem) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    tokio::task::spawn_blocking(move || {
        let QueueItem {
            conn,
            request,
            done,
        } = item;

        let mut disposition = shared.processor.reject(&conn, request);
        if shared.stopped.load(Ordering::Acquire) {
            disposition = Disposition::Close;
        }
        let _ = done.send(disposition);
    })
}

/// The admission queue.
///
/// Also the [`RequestSink`] every connection submits to.
pub struct AdmissionQueue {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl AdmissionQueue {
    /// Starts the queue and its coordinator task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        processor: Arc<dyn RequestProcessor>,
        settings: AdmissionSettings,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        let shared = Arc::new(Shared {
            processor,
            settings,
            processing: AtomicUsize::new(0),
            pending: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            stats,
            stopped: AtomicBool::new(false),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = tokio::spawn(coordinator_loop(Arc::clone(&shared), shutdown_rx));

        Self {
            shared,
            shutdown_tx,
            coordinator: Mutex::new(Some(coordinator)),
        }
    }

    pub fn settings(&self) -> AdmissionSettings {
        self.shared.settings
    }

    /// Requests being processed right now.
    pub fn processing(&self) -> usize {
        self.shared.processing.load(Ordering::Acquire)
    }

    /// Requests waiting for a slot.
    pub fn queued(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Whether a new request would have to wait.
    pub fn should_queue(&self) -> bool {
        self.processing() >= self.shared.settings.max_concurrent_requests
    }

    fn reject(&self, conn: &ConnectionHandle, request: Request) -> Submission {
        self.shared.stats.request_rejected();
        warn!(
            client = %conn.remote_addr(),
            uri = request.uri(),
            processing = self.processing(),
            "Server busy, rejecting request"
        );

        let (done, rx) = oneshot::channel();
        spawn_reject(
            &self.shared,
            QueueItem {
                conn: conn.clone(),
                request,
                done,
            },
        );
        Submission::Pending(rx)
    }

    /// Stops the coordinator and answers every queued request with a 503.
    ///
    /// Waits up to `grace` for the coordinator, then aborts it. Requests
    /// already being processed finish on their own.
    pub async fn stop(&self, grace: Duration) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        let coordinator = self.coordinator.lock().unwrap().take();
        if let Some(mut coordinator) = coordinator {
            if tokio::time::timeout(grace, &mut coordinator).await.is_err() {
                warn!("Admission coordinator did not stop in time, aborting it");
                coordinator.abort();
            }
        }

        let leftovers: Vec<QueueItem> = self.shared.pending.lock().unwrap().drain(..).collect();
        if !leftovers.is_empty() {
            info!(count = leftovers.len(), "Rejecting queued requests on shutdown");
        }
        let rejections: Vec<JoinHandle<()>> = leftovers
            .into_iter()
            .map(|item| {
                self.shared.stats.request_rejected();
                spawn_reject(&self.shared, item)
            })
            .collect();
        for rejection in rejections {
            if let Err(e) = rejection.await {
                warn!(error = %e, "Rejection task failed");
            }
        }
    }
}

impl RequestSink for AdmissionQueue {
    fn submit(&self, conn: &ConnectionHandle, request: Request) -> Submission {
        if self.shared.stopped.load(Ordering::Acquire) {
            return self.reject(conn, request);
        }

        let (done, rx) = oneshot::channel();

        if self.shared.try_acquire() {
            spawn_worker(
                &self.shared,
                QueueItem {
                    conn: conn.clone(),
                    request,
                    done,
                },
            );
            return Submission::Pending(rx);
        }

        let mut pending = self.shared.pending.lock().unwrap();
        if pending.len() >= self.shared.settings.max_queue_size {
            drop(pending);
            return self.reject(conn, request);
        }
        pending.push_back(QueueItem {
            conn: conn.clone(),
            request,
            done,
        });
        let depth = pending.len();
        drop(pending);

        self.shared.stats.request_queued();
        debug!(client = %conn.remote_addr(), depth, "Request queued");
        self.shared.wakeup.notify_one();
        Submission::Pending(rx)
    }
}

impl Drop for AdmissionQueue {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("settings", &self.shared.settings)
            .field("processing", &self.processing())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Hands queued requests to workers as slots free up.
async fn coordinator_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    debug!("Admission coordinator started");

    loop {
        while let Some(item) = shared.next_item() {
            spawn_worker(&shared, item);
        }

        tokio::select! {
            _ = shared.wakeup.notified() => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!("Admission coordinator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionInfo, Outbound, OUTBOUND_CAPACITY};
    use crate::protocol::StatusCode;
    use bytes::Bytes;
    use std::sync::Condvar;
    use tokio::sync::mpsc::Receiver;
    use tokio_test::{assert_pending, assert_ready};

    /// Holds every request until released, recording processing order.
    #[derive(Default)]
    struct GatedProcessor {
        open: Mutex<bool>,
        opened: Condvar,
        order: Mutex<Vec<String>>,
    }

    impl GatedProcessor {
        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }
    }

    impl RequestProcessor for GatedProcessor {
        fn process(&self, _conn: &ConnectionHandle, request: Request) -> Disposition {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
            drop(open);
            self.order.lock().unwrap().push(request.uri().to_string());
            Disposition::KeepAlive
        }

        fn reject(&self, conn: &ConnectionHandle, request: Request) -> Disposition {
            let _ = conn.respond(request.version(), StatusCode::SERVICE_UNAVAILABLE, "busy");
            Disposition::Close
        }
    }

    fn connection(id: u64) -> (ConnectionHandle, Receiver<Outbound>) {
        let info = ConnectionInfo::new(id, "127.0.0.1:44000".parse().unwrap(), false);
        ConnectionHandle::pair(info)
    }

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).build()
    }

    fn pending(submission: Submission) -> oneshot::Receiver<Disposition> {
        match submission {
            Submission::Pending(rx) => rx,
            Submission::Done(d) => panic!("expected pending submission, got {:?}", d),
        }
    }

    fn first_frame(rx: &mut Receiver<Outbound>) -> String {
        match rx.try_recv() {
            Ok(Outbound::Data(bytes)) => String::from_utf8(bytes.to_vec()).unwrap(),
            other => panic!("expected a data frame, got {:?}", other),
        }
    }

    fn queue(
        processor: &Arc<GatedProcessor>,
        max_concurrent_requests: usize,
        max_queue_size: usize,
    ) -> (AdmissionQueue, Arc<ConnectionStats>) {
        let stats = Arc::new(ConnectionStats::new());
        let queue = AdmissionQueue::start(
            Arc::clone(processor) as Arc<dyn RequestProcessor>,
            AdmissionSettings {
                max_concurrent_requests,
                max_queue_size,
            },
            Arc::clone(&stats),
        );
        (queue, stats)
    }

    #[tokio::test]
    async fn test_excess_request_is_queued_then_rejected() {
        let processor = Arc::new(GatedProcessor::default());
        let (queue, stats) = queue(&processor, 1, 1);
        let (conn_a, _rx_a) = connection(1);
        let (conn_b, _rx_b) = connection(2);
        let (conn_c, mut rx_c) = connection(3);

        assert!(!queue.should_queue());
        let done_a = pending(queue.submit(&conn_a, request("/a")));
        assert_eq!(queue.processing(), 1);
        assert!(queue.should_queue());

        let done_b = pending(queue.submit(&conn_b, request("/b")));
        assert_eq!(queue.queued(), 1);

        let done_c = pending(queue.submit(&conn_c, request("/c")));
        assert_eq!(done_c.await.unwrap(), Disposition::Close);
        assert!(first_frame(&mut rx_c).starts_with("HTTP/1.1 503 Service Unavailable\r\n"));

        let mut done_b = tokio_test::task::spawn(done_b);
        assert_pending!(done_b.poll());

        processor.release();
        assert_eq!(done_a.await.unwrap(), Disposition::KeepAlive);
        assert_eq!(done_b.await.unwrap(), Disposition::KeepAlive);

        assert_eq!(*processor.order.lock().unwrap(), vec!["/a", "/b"]);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_queued, 1);
        assert_eq!(snapshot.requests_rejected, 1);
        assert_eq!(queue.queued(), 0);
    }

    #[tokio::test]
    async fn test_queue_preserves_fifo_order() {
        let processor = Arc::new(GatedProcessor::default());
        let (queue, _) = queue(&processor, 1, 8);

        let mut receivers = Vec::new();
        let mut outbound = Vec::new();
        for i in 0..5 {
            let (conn, rx) = connection(i);
            outbound.push(rx);
            receivers.push(pending(queue.submit(&conn, request(&format!("/{}", i)))));
        }
        assert_eq!(queue.queued(), 4);

        processor.release();
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Disposition::KeepAlive);
        }
        assert_eq!(
            *processor.order.lock().unwrap(),
            vec!["/0", "/1", "/2", "/3", "/4"]
        );
    }

    #[tokio::test]
    async fn test_zero_queue_rejects_at_capacity() {
        let processor = Arc::new(GatedProcessor::default());
        let (queue, _) = queue(&processor, 1, 0);
        let (conn_a, _rx_a) = connection(1);
        let (conn_b, _rx_b) = connection(2);

        let done_a = pending(queue.submit(&conn_a, request("/a")));
        let done_b = pending(queue.submit(&conn_b, request("/b")));
        assert_eq!(done_b.await.unwrap(), Disposition::Close);
        assert_eq!(queue.queued(), 0);

        processor.release();
        assert_eq!(done_a.await.unwrap(), Disposition::KeepAlive);
    }

    #[tokio::test]
    async fn test_stop_rejects_waiting_requests() {
        let processor = Arc::new(GatedProcessor::default());
        let (queue, _) = queue(&processor, 1, 4);
        let (conn_a, _rx_a) = connection(1);
        let (conn_b, mut rx_b) = connection(2);

        let done_a = pending(queue.submit(&conn_a, request("/a")));
        let done_b = pending(queue.submit(&conn_b, request("/b")));

        queue.stop(Duration::from_secs(1)).await;

        let mut done_b = tokio_test::task::spawn(done_b);
        assert_eq!(assert_ready!(done_b.poll()).unwrap(), Disposition::Close);
        assert!(first_frame(&mut rx_b).starts_with("HTTP/1.1 503 "));

        let (conn_c, _rx_c) = connection(3);
        let done_c = pending(queue.submit(&conn_c, request("/c")));
        assert_eq!(done_c.await.unwrap(), Disposition::Close);

        // In-flight work still completes
        processor.release();
        assert_eq!(done_a.await.unwrap(), Disposition::KeepAlive);
        assert_eq!(*processor.order.lock().unwrap(), vec!["/a"]);
    }

    #[tokio::test]
    async fn test_rejection_waits_for_a_full_connection() {
        let processor = Arc::new(GatedProcessor::default());
        let (queue, _) = queue(&processor, 1, 0);
        let (conn_a, _rx_a) = connection(1);
        let (conn_b, mut rx_b) = connection(2);

        for _ in 0..OUTBOUND_CAPACITY {
            conn_b.send(Bytes::from_static(b"x")).unwrap();
        }

        let done_a = pending(queue.submit(&conn_a, request("/a")));
        let done_b = pending(queue.submit(&conn_b, request("/b")));

        let mut done_b = tokio_test::task::spawn(done_b);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_pending!(done_b.poll());

        for _ in 0..OUTBOUND_CAPACITY {
            assert!(matches!(rx_b.recv().await, Some(Outbound::Data(_))));
        }
        match rx_b.recv().await {
            Some(Outbound::Data(bytes)) => assert!(bytes.starts_with(b"HTTP/1.1 503 ")),
            other => panic!("expected the rejection, got {:?}", other),
        }
        assert_eq!(done_b.await.unwrap(), Disposition::Close);

        processor.release();
        assert_eq!(done_a.await.unwrap(), Disposition::KeepAlive);
    }
}
