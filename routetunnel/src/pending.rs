//! Per-tunnel correlation of relay requests with their responses.
//!
//! Every forwarded request owns a single-resolution slot. Whichever of
//! {response header, timeout, disconnect, upstream error} reaches the slot
//! first fulfills it; everything that arrives later is dropped. Once the
//! header has been delivered the slot turns into a body stream fed by
//! `relay-response-chunk` frames until `relay-response-end`.

use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use http::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    error::RelayError,
    transport::{CorrelationId, Frame, ResponseHead},
};

type Resolution = Result<RelayResponse, RelayError>;
type Chunk = Result<Bytes, RelayError>;

/// Body chunks buffered per request before the caller must catch up.
/// One extra slot is held back for the terminal error.
pub const BODY_BUFFER_CHUNKS: usize = 64;

enum Slot {
    Waiting(oneshot::Sender<Resolution>),
    Streaming(mpsc::Sender<Chunk>),
}

#[derive(Default)]
struct Slots {
    map: HashMap<CorrelationId, Slot>,
    /// Set by `fail_all`; later registrations fail immediately with it.
    closed: Option<RelayError>,
}

pub struct PendingTable {
    next_id: AtomicU64,
    slots: Mutex<Slots>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTable")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("pending", &self.len())
            .finish()
    }
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn starting_at(next_id: CorrelationId) -> Self {
        Self {
            next_id: AtomicU64::new(next_id),
            slots: Mutex::new(Slots::default()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of requests still awaiting a header or streaming a body.
    pub fn len(&self) -> usize {
        self.slots().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.slots().map.contains_key(&id)
    }

    /// Allocates the next correlation id and a slot waiting on it.
    ///
    /// Ids are drawn from a wrapping 64-bit counter; zero and ids still in
    /// use are skipped.
    pub fn register(self: &Arc<Self>) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots();
        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !slots.map.contains_key(&id) {
                break id;
            }
        };
        if let Some(reason) = slots.closed.clone() {
            let _ = tx.send(Err(reason));
        } else {
            slots.map.insert(id, Slot::Waiting(tx));
        }
        drop(slots);

        PendingResponse {
            id,
            rx,
            table: Arc::clone(self),
        }
    }

    /// Routes one `relay-response-*` or `error` frame to its slot.
    ///
    /// Returns `false` when no slot matched; the frame is then dropped,
    /// which is expected for requests that already timed out.
    pub fn resolve(self: &Arc<Self>, frame: Frame) -> bool {
        let id = frame.correlation_id();
        let matched = match frame {
            Frame::ResponseHeader(head) => self.deliver_head(head),
            Frame::ResponseChunk { correlation_id, data } => self.push_chunk(correlation_id, data),
            Frame::ResponseEnd {
                correlation_id,
                error,
            } => self.finish(correlation_id, error),
            Frame::Error {
                correlation_id,
                code,
                message,
            } => self.fail(
                correlation_id,
                RelayError::Upstream(format!("{code} {message}")),
            ),
            other => {
                debug!("Ignoring {} frame in pending table", other.kind().as_str());
                false
            }
        };
        if !matched {
            debug!("Dropping frame for unknown correlation id {}", id);
        }
        matched
    }

    fn deliver_head(self: &Arc<Self>, head: ResponseHead) -> bool {
        let id = head.correlation_id;
        let mut slots = self.slots();
        let waiter = match slots.map.remove(&id) {
            Some(Slot::Waiting(waiter)) => waiter,
            Some(streaming) => {
                debug!("Duplicate response header for correlation id {}", id);
                slots.map.insert(id, streaming);
                return false;
            }
            None => return false,
        };
        let (tx, rx) = mpsc::channel(BODY_BUFFER_CHUNKS + 1);
        slots.map.insert(id, Slot::Streaming(tx));
        drop(slots);

        let response = RelayResponse {
            correlation_id: id,
            status: head.status,
            headers: head.headers,
            body: ResponseBody {
                id,
                rx,
                table: Arc::clone(self),
            },
        };
        // On failure the returned response is dropped here, outside the lock,
        // and its body abandons the streaming slot.
        waiter.send(Ok(response)).is_ok()
    }

    fn push_chunk(&self, id: CorrelationId, data: Bytes) -> bool {
        let mut slots = self.slots();
        let tx = match slots.map.get(&id) {
            Some(Slot::Streaming(tx)) => tx,
            Some(Slot::Waiting(_)) => {
                debug!("Body chunk before header for correlation id {}", id);
                return false;
            }
            None => return false,
        };
        if tx.capacity() <= 1 {
            warn!("Response stream {} overflowed its buffer", id);
            if let Some(Slot::Streaming(tx)) = slots.map.remove(&id) {
                let _ = tx.try_send(Err(RelayError::BodyOverflow));
            }
            return true;
        }
        if tx.try_send(Ok(data)).is_err() {
            // Receiver is gone; the caller stopped reading.
            slots.map.remove(&id);
            return false;
        }
        true
    }

    fn finish(&self, id: CorrelationId, error: Option<String>) -> bool {
        let slot = self.slots().map.remove(&id);
        match slot {
            Some(Slot::Streaming(tx)) => {
                if let Some(message) = error {
                    let _ = tx.try_send(Err(RelayError::Upstream(message)));
                }
                true
            }
            Some(Slot::Waiting(waiter)) => {
                let message =
                    error.unwrap_or_else(|| "response ended before headers".to_string());
                let _ = waiter.send(Err(RelayError::Upstream(message)));
                true
            }
            None => false,
        }
    }

    fn fail(&self, id: CorrelationId, reason: RelayError) -> bool {
        let slot = self.slots().map.remove(&id);
        match slot {
            Some(slot) => {
                fail_slot(slot, reason);
                true
            }
            None => false,
        }
    }

    /// Fulfills a still-waiting slot with `TunnelTimeout`.
    ///
    /// A slot that already received its header is left alone.
    pub fn expire(&self, id: CorrelationId) -> bool {
        let mut slots = self.slots();
        if !matches!(slots.map.get(&id), Some(Slot::Waiting(_))) {
            return false;
        }
        let Some(Slot::Waiting(waiter)) = slots.map.remove(&id) else {
            return false;
        };
        drop(slots);
        waiter.send(Err(RelayError::TunnelTimeout)).is_ok()
    }

    /// Fails every outstanding slot with `reason` and refuses new ones.
    pub fn fail_all(&self, reason: RelayError) -> usize {
        let drained: Vec<Slot> = {
            let mut slots = self.slots();
            if slots.closed.is_none() {
                slots.closed = Some(reason.clone());
            }
            slots.map.drain().map(|(_, slot)| slot).collect()
        };
        let count = drained.len();
        for slot in drained {
            fail_slot(slot, reason.clone());
        }
        count
    }

    fn abandon_waiting(&self, id: CorrelationId) {
        let mut slots = self.slots();
        if matches!(slots.map.get(&id), Some(Slot::Waiting(_))) {
            slots.map.remove(&id);
            debug!("Abandoned pending request {}", id);
        }
    }

    fn abandon_stream(&self, id: CorrelationId) {
        let mut slots = self.slots();
        if matches!(slots.map.get(&id), Some(Slot::Streaming(_))) {
            slots.map.remove(&id);
            debug!("Abandoned response stream {}", id);
        }
    }
}

fn fail_slot(slot: Slot, reason: RelayError) {
    match slot {
        Slot::Waiting(waiter) => {
            let _ = waiter.send(Err(reason));
        }
        Slot::Streaming(tx) => {
            let _ = tx.try_send(Err(reason));
        }
    }
}

/// Waitable half of a registered slot.
///
/// Dropping it before resolution abandons the slot, so a late response is
/// dropped without effect.
#[derive(Debug)]
pub struct PendingResponse {
    id: CorrelationId,
    rx: oneshot::Receiver<Resolution>,
    table: Arc<PendingTable>,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }

    /// Waits for the first of {response, disconnect, timeout}.
    pub async fn wait(mut self, timeout: Duration) -> Result<RelayResponse, RelayError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Err(RelayError::TunnelDisconnected),
            Err(_) => {
                self.table.expire(self.id);
                // A resolution may have raced the timer; it wins if present.
                self.rx.try_recv().unwrap_or(Err(RelayError::TunnelTimeout))
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.abandon_waiting(self.id);
    }
}

#[derive(Debug)]
pub struct RelayResponse {
    pub correlation_id: CorrelationId,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

/// Lazy, finite, non-restartable sequence of body chunks.
///
/// Ends after `relay-response-end`; yields one `Err` first if the tunnel
/// client reported a failure or the tunnel went away mid-stream.
#[derive(Debug)]
pub struct ResponseBody {
    id: CorrelationId,
    rx: mpsc::Receiver<Chunk>,
    table: Arc<PendingTable>,
}

impl ResponseBody {
    /// Buffers the whole body. Mostly useful for small responses and tests.
    pub async fn into_bytes(mut self) -> Result<Bytes, RelayError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.table.abandon_stream(self.id);
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn head(id: CorrelationId, status: StatusCode) -> Frame {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        Frame::ResponseHeader(ResponseHead {
            correlation_id: id,
            status,
            headers,
        })
    }

    fn chunk(id: CorrelationId, data: &'static [u8]) -> Frame {
        Frame::ResponseChunk {
            correlation_id: id,
            data: Bytes::from_static(data),
        }
    }

    fn end(id: CorrelationId) -> Frame {
        Frame::ResponseEnd {
            correlation_id: id,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_streamed_response_resolves_waiter() {
        let table = PendingTable::new();
        let pending = table.register();
        let id = pending.correlation_id();
        assert_eq!(id, 1);

        assert!(table.resolve(head(id, StatusCode::OK)));
        assert!(table.resolve(chunk(id, b"{\"ok\":")));
        assert!(table.resolve(chunk(id, b"true}")));
        assert!(table.resolve(end(id)));
        assert!(table.is_empty());

        let response = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers["content-type"], "application/json");
        assert_eq!(response.body.into_bytes().await.unwrap(), "{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_is_dropped() {
        let table = PendingTable::new();
        let pending = table.register();
        let id = pending.correlation_id();

        assert!(!table.resolve(head(id + 100, StatusCode::OK)));
        assert!(!table.resolve(chunk(id + 100, b"x")));
        assert!(!table.resolve(end(id + 100)));
        assert!(table.contains(id));

        assert!(table.resolve(head(id, StatusCode::ACCEPTED)));
        assert!(table.resolve(end(id)));
        let response = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.status, StatusCode::ACCEPTED);
        assert!(response.body.into_bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_resolves_once_and_late_response_is_noop() {
        let table = PendingTable::new();
        let pending = table.register();
        let id = pending.correlation_id();

        match pending.wait(Duration::from_millis(20)).await {
            Err(RelayError::TunnelTimeout) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!table.contains(id));
        assert!(!table.resolve(head(id, StatusCode::OK)));
        assert!(!table.expire(id));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_response_before_timer_wins() {
        let table = PendingTable::new();
        let pending = table.register();
        let id = pending.correlation_id();
        assert!(table.resolve(head(id, StatusCode::OK)));

        // Header arrived; expiring now must not override it.
        assert!(!table.expire(id));
        let response = pending.wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_fail_all_fails_waiting_and_streaming() {
        let table = PendingTable::new();
        let waiting = table.register();
        let streaming = table.register();
        assert!(table.resolve(head(streaming.correlation_id(), StatusCode::OK)));
        assert!(table.resolve(chunk(streaming.correlation_id(), b"partial")));
        let response = streaming.wait(Duration::from_secs(1)).await.unwrap();

        assert_eq!(table.fail_all(RelayError::TunnelDisconnected), 2);
        assert!(table.is_empty());

        assert!(matches!(
            waiting.wait(Duration::from_secs(1)).await,
            Err(RelayError::TunnelDisconnected)
        ));
        let mut body = response.body;
        assert_eq!(body.next().await.unwrap().unwrap(), "partial");
        assert!(matches!(
            body.next().await,
            Some(Err(RelayError::TunnelDisconnected))
        ));
        assert!(body.next().await.is_none());

        let late = table.register();
        assert!(matches!(
            late.wait(Duration::from_secs(1)).await,
            Err(RelayError::TunnelDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_end_or_error_before_header_is_upstream_failure() {
        let table = PendingTable::new();
        let ended = table.register();
        let errored = table.register();

        assert!(table.resolve(Frame::ResponseEnd {
            correlation_id: ended.correlation_id(),
            error: Some("connection refused".to_string()),
        }));
        assert!(table.resolve(Frame::Error {
            correlation_id: errored.correlation_id(),
            code: 502,
            message: "local server down".to_string(),
        }));

        match ended.wait(Duration::from_secs(1)).await {
            Err(RelayError::Upstream(message)) => assert_eq!(message, "connection refused"),
            other => panic!("unexpected {other:?}"),
        }
        match errored.wait(Duration::from_secs(1)).await {
            Err(RelayError::Upstream(message)) => assert!(message.contains("local server down")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_end_with_error_after_header_fails_stream() {
        let table = PendingTable::new();
        let pending = table.register();
        let id = pending.correlation_id();
        table.resolve(head(id, StatusCode::OK));
        table.resolve(chunk(id, b"abc"));
        table.resolve(Frame::ResponseEnd {
            correlation_id: id,
            error: Some("reset".to_string()),
        });

        let response = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            response.body.into_bytes().await,
            Err(RelayError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_waiter_and_body_abandon_slot() {
        let table = PendingTable::new();
        let pending = table.register();
        let id = pending.correlation_id();
        drop(pending);
        assert!(!table.contains(id));
        assert!(!table.resolve(head(id, StatusCode::OK)));

        let pending = table.register();
        let id = pending.correlation_id();
        table.resolve(head(id, StatusCode::OK));
        let response = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert!(table.contains(id));
        drop(response);
        assert!(!table.contains(id));
        assert!(!table.resolve(chunk(id, b"late")));
    }

    #[tokio::test]
    async fn test_slow_reader_overflow_fails_stream() {
        let table = PendingTable::new();
        let pending = table.register();
        let id = pending.correlation_id();
        table.resolve(head(id, StatusCode::OK));
        let response = pending.wait(Duration::from_secs(1)).await.unwrap();

        for _ in 0..BODY_BUFFER_CHUNKS {
            assert!(table.resolve(chunk(id, b"x")));
        }
        assert!(table.contains(id));

        // Nobody has read yet; the next chunk overflows the buffer.
        assert!(table.resolve(chunk(id, b"x")));
        assert!(!table.contains(id));
        assert!(!table.resolve(chunk(id, b"late")));

        let mut body = response.body;
        for _ in 0..BODY_BUFFER_CHUNKS {
            assert_eq!(body.next().await.unwrap().unwrap(), "x");
        }
        assert!(matches!(body.next().await, Some(Err(RelayError::BodyOverflow))));
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_keeping_up_streams_past_buffer() {
        let table = PendingTable::new();
        let pending = table.register();
        let id = pending.correlation_id();
        table.resolve(head(id, StatusCode::OK));
        let mut body = pending.wait(Duration::from_secs(1)).await.unwrap().body;

        for _ in 0..(BODY_BUFFER_CHUNKS * 4) {
            assert!(table.resolve(chunk(id, b"y")));
            assert_eq!(body.next().await.unwrap().unwrap(), "y");
        }
        assert!(table.resolve(end(id)));
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_ids_wrap_and_skip_zero_and_live_ids() {
        let table = Arc::new(PendingTable::starting_at(u64::MAX));
        let first = table.register();
        assert_eq!(first.correlation_id(), u64::MAX);
        let second = table.register();
        assert_eq!(second.correlation_id(), 1);

        table.next_id.store(1, Ordering::Relaxed);
        let third = table.register();
        assert_eq!(third.correlation_id(), 2);
        assert_eq!(table.len(), 3);
    }
}
