//! Per-client session state.
//!
//! A [`Session`] buffers outbound messages and holds at most one poll
//! response open. Whenever both a buffered message and a held response
//! exist, the buffer is flushed into the response.

use core::{mem, time::Duration};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use serde_json::Value;
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::debug;

use crate::{message::OutboundMessage, reserved, session::SessionId};

/// How a held poll was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Messages for the response body, in emission order.
    Batch(Vec<OutboundMessage>),

    /// A newer poll for the same session took this one's place.
    Superseded,

    /// The session was removed while the poll was held.
    Closed,
}

/// Receiving half of a held poll.
pub type PollReceiver = oneshot::Receiver<Delivery>;

/// A held poll response, completed at most once.
#[derive(Debug)]
pub struct PendingResponse(oneshot::Sender<Delivery>);

impl PendingResponse {
    /// Create a held response and the receiver the transport awaits.
    #[must_use]
    pub fn channel() -> (Self, PollReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Whether the transport has stopped waiting (client went away).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    fn complete(self, delivery: Delivery) -> Result<(), Delivery> {
        self.0.send(delivery)
    }
}

/// Server-side record for one connected long-polling client.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    idle_timeout: Duration,
    state: Mutex<SessionState>,
}

#[derive(Debug)]
struct SessionState {
    buffer: Vec<OutboundMessage>,
    pending: Option<PendingResponse>,
    last_activity: Instant,
    idle_timer: Option<JoinHandle<()>>,
}

impl Session {
    /// Create a session with an empty buffer and no held response.
    #[must_use]
    pub fn new(id: SessionId, idle_timeout: Duration) -> Self {
        Self {
            id,
            idle_timeout,
            state: Mutex::new(SessionState {
                buffer: Vec::new(),
                pending: None,
                last_activity: Instant::now(),
                idle_timer: None,
            }),
        }
    }

    /// Create a session whose buffer already holds `["connect", greeting]`.
    pub(crate) fn greeted(id: SessionId, idle_timeout: Duration, greeting: Value) -> Self {
        let mut session = Self::new(id, idle_timeout);
        session
            .state
            .get_mut()
            .buffer
            .push(OutboundMessage::new(reserved::CONNECT, greeting));
        session
    }

    /// The session's id.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// How long a poll is held before `"timeout"` is pushed.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Hold `response` until there is something to deliver.
    ///
    /// Restarts the idle timer and flushes at once if messages are buffered.
    /// A response already being held is answered with [`Delivery::Superseded`].
    pub async fn wait(self: &Arc<Self>, response: PendingResponse) {
        let mut state = self.state.lock().await;
        state.last_activity = Instant::now();

        if let Some(stale) = state.pending.replace(response) {
            debug!(session_id = %self.id, "superseding held poll");
            let _ = stale.complete(Delivery::Superseded);
        }

        self.reset_idle_timer(&mut state);

        if !state.buffer.is_empty() {
            self.flush_locked(&mut state);
        }
    }

    /// Queue a message, delivering it immediately if a poll is held.
    pub async fn emit(&self, name: impl Into<String>, payload: Value) {
        let mut state = self.state.lock().await;
        state.buffer.push(OutboundMessage::new(name, payload));
        self.flush_locked(&mut state);
    }

    /// Answer the held poll with whatever is buffered, even nothing.
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state);
    }

    /// Refresh the last-activity timestamp.
    pub async fn touch(&self) {
        self.state.lock().await.last_activity = Instant::now();
    }

    /// When the client last polled.
    pub async fn last_activity(&self) -> Instant {
        self.state.lock().await.last_activity
    }

    /// Messages waiting for the next poll.
    pub async fn buffered(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.buffer.clone()
    }

    /// Whether a poll response is currently held.
    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.pending.is_some()
    }

    /// No live poll is held and the client has been quiet for `max_idle`.
    pub(crate) async fn is_stale(&self, max_idle: Duration) -> bool {
        let state = self.state.lock().await;
        state.pending.as_ref().is_none_or(PendingResponse::is_closed)
            && state.last_activity.elapsed() >= max_idle
    }

    /// Stop the idle timer and release any held poll.
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        if let Some(pending) = state.pending.take() {
            let _ = pending.complete(Delivery::Closed);
        }
    }

    fn flush_locked(&self, state: &mut SessionState) {
        let Some(pending) = state.pending.take() else {
            return;
        };

        let batch = mem::take(&mut state.buffer);
        let count = batch.len();

        match pending.complete(Delivery::Batch(batch)) {
            Ok(()) => debug!(session_id = %self.id, count, "flushed buffer"),
            Err(Delivery::Batch(batch)) => {
                // The poller hung up; keep the messages for its next poll.
                debug!(session_id = %self.id, count, "held poll abandoned, keeping buffer");
                state.buffer = batch;
            }
            Err(_) => {}
        }
    }

    fn reset_idle_timer(self: &Arc<Self>, state: &mut SessionState) {
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }

        let session: Weak<Self> = Arc::downgrade(self);
        let idle = self.idle_timeout;
        let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);

        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(session) = session.upgrade() {
                debug!(session_id = %session.id, idle_ms, "idle window elapsed");
                session.emit(reserved::TIMEOUT, Value::from(idle_ms)).await;
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::oneshot::error::TryRecvError;

    const IDLE: Duration = Duration::from_secs(30);

    fn session() -> Arc<Session> {
        Arc::new(Session::new(SessionId::from("B1"), IDLE))
    }

    fn batch(messages: &[(&str, Value)]) -> Delivery {
        Delivery::Batch(
            messages
                .iter()
                .map(|(name, payload)| OutboundMessage::new(*name, payload.clone()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn emit_without_held_poll_accumulates() {
        let session = session();
        session.emit("ping", json!("pong")).await;
        session.emit("bing", json!("bong")).await;

        assert_eq!(
            session.buffered().await,
            vec![
                OutboundMessage::new("ping", json!("pong")),
                OutboundMessage::new("bing", json!("bong")),
            ]
        );
    }

    #[tokio::test]
    async fn greeted_session_starts_with_connect() {
        let session = Session::greeted(SessionId::from("B1"), IDLE, json!({ "id": "B1" }));
        session.emit("ping", json!("pong")).await;

        assert_eq!(
            session.buffered().await,
            vec![
                OutboundMessage::new("connect", json!({ "id": "B1" })),
                OutboundMessage::new("ping", json!("pong")),
            ]
        );
    }

    #[tokio::test]
    async fn wait_flushes_buffer_immediately() {
        let session = session();
        session.emit("ping", json!("pong")).await;

        let (pending, mut rx) = PendingResponse::channel();
        session.wait(pending).await;

        assert_eq!(rx.try_recv().expect("flushed"), batch(&[("ping", json!("pong"))]));
        assert!(session.buffered().await.is_empty());
        assert!(!session.has_pending().await);
    }

    #[tokio::test]
    async fn wait_with_empty_buffer_holds() {
        let session = session();
        let (pending, mut rx) = PendingResponse::channel();
        session.wait(pending).await;

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(session.has_pending().await);

        session.emit("ping", json!("pong")).await;
        assert_eq!(rx.try_recv().expect("delivered"), batch(&[("ping", json!("pong"))]));
        assert!(!session.has_pending().await);
    }

    #[tokio::test]
    async fn buffered_messages_flush_together() {
        let session = session();
        session.emit("ping", json!("pong")).await;
        session.emit("bing", json!("bong")).await;

        let (pending, rx) = PendingResponse::channel();
        session.wait(pending).await;

        assert_eq!(
            rx.await.expect("flushed"),
            batch(&[("ping", json!("pong")), ("bing", json!("bong"))])
        );
    }

    #[tokio::test]
    async fn second_wait_supersedes_first() {
        let session = session();
        let (first, mut first_rx) = PendingResponse::channel();
        let (second, mut second_rx) = PendingResponse::channel();

        session.wait(first).await;
        session.wait(second).await;

        assert_eq!(first_rx.try_recv().expect("answered"), Delivery::Superseded);
        assert!(matches!(second_rx.try_recv(), Err(TryRecvError::Empty)));

        session.emit("ping", json!("pong")).await;
        assert_eq!(second_rx.try_recv().expect("delivered"), batch(&[("ping", json!("pong"))]));
    }

    #[tokio::test]
    async fn abandoned_poll_keeps_messages() {
        let session = session();
        let (pending, rx) = PendingResponse::channel();
        session.wait(pending).await;
        drop(rx);

        session.emit("ping", json!("pong")).await;

        assert_eq!(session.buffered().await, vec![OutboundMessage::new("ping", json!("pong"))]);
        assert!(!session.has_pending().await);

        let (pending, rx) = PendingResponse::channel();
        session.wait(pending).await;
        assert_eq!(rx.await.expect("flushed"), batch(&[("ping", json!("pong"))]));
    }

    #[tokio::test]
    async fn flush_answers_held_poll_with_empty_batch() {
        let session = session();
        let (pending, rx) = PendingResponse::channel();
        session.wait(pending).await;
        session.flush().await;

        assert_eq!(rx.await.expect("answered"), Delivery::Batch(Vec::new()));
    }

    #[tokio::test]
    async fn close_releases_held_poll() {
        let session = session();
        let (pending, rx) = PendingResponse::channel();
        session.wait(pending).await;
        session.close().await;

        assert_eq!(rx.await.expect("answered"), Delivery::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_pushes_timeout() {
        let session = session();
        let (pending, rx) = PendingResponse::channel();
        session.wait(pending).await;

        tokio::time::sleep(IDLE + Duration::from_millis(1)).await;

        assert_eq!(rx.await.expect("answered"), batch(&[("timeout", json!(30_000))]));
    }

    #[tokio::test(start_paused = true)]
    async fn repoll_restarts_idle_timer() {
        let session = session();
        let (first, _first_rx) = PendingResponse::channel();
        session.wait(first).await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        let (second, mut second_rx) = PendingResponse::channel();
        session.wait(second).await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(matches!(second_rx.try_recv(), Err(TryRecvError::Empty)));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(second_rx.try_recv().expect("answered"), batch(&[("timeout", json!(30_000))]));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_without_poll_only_buffers() {
        let session = session();
        let (pending, rx) = PendingResponse::channel();
        session.wait(pending).await;
        drop(rx);

        tokio::time::sleep(IDLE + Duration::from_millis(1)).await;

        assert_eq!(session.buffered().await, vec![OutboundMessage::new("timeout", json!(30_000))]);
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_requires_quiet_client_without_poll() {
        let session = session();
        let (pending, _rx) = PendingResponse::channel();
        session.wait(pending).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!session.is_stale(Duration::from_secs(5)).await, "poll is held");

        session.close().await;
        assert!(session.is_stale(Duration::from_secs(5)).await);
        assert!(!session.is_stale(Duration::from_secs(60)).await);
    }
}
