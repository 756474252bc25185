//! HTTP long-poll client.
//!
//! [`BeamsClient`] keeps one poll outstanding against the server, dispatches
//! every pushed `[name, payload]` tuple to local listeners, and sends
//! emissions as independent form POSTs. Emissions made before the server has
//! assigned a session id are queued and sent, in order, once `"connect"`
//! arrives.

mod emitter;
mod http_client;
mod poll_loop;
mod retry;

pub use emitter::{Callback, EventEmitter, ListenerId};
pub use http_client::{HttpClient, HttpResponse};
#[cfg(feature = "reqwest")]
pub use http_client::{ReqwestHttpClient, ReqwestHttpError};
pub use retry::RetryState;

use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_BASE_PATH, DEFAULT_RETRY_MAX_MS, DEFAULT_RETRY_MIN_MS,
    error::{ClientError, SendError},
    message::payload_to_form,
    reserved,
    session::SessionId,
};

use poll_loop::poll_loop;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Options for connecting to a server.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    /// Absolute URL of the long-poll endpoint.
    pub server_url: String,

    /// First retry delay after a failure.
    pub retry_min: Duration,

    /// Retry delay ceiling.
    pub retry_max: Duration,

    /// Retry delay multiplier per consecutive failure.
    pub backoff_factor: f64,

    /// Timeout for individual HTTP requests. Must exceed the server's idle window.
    pub request_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            server_url: format!("http://127.0.0.1:8080{DEFAULT_BASE_PATH}"),
            retry_min: Duration::from_millis(DEFAULT_RETRY_MIN_MS),
            retry_max: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// An emission waiting for (or being retried with) a session id.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Emission {
    name: String,
    data: String,
    n: u64,
}

#[derive(Debug, Default)]
struct ConnState {
    id: Option<SessionId>,
    n: u64,
    queue: Vec<Emission>,
}

struct ClientInner<H> {
    http: H,
    server_url: Url,
    events: EventEmitter,
    conn: Mutex<ConnState>,
    retry: Mutex<RetryState>,
    started: AtomicBool,
    awaiting_return: AtomicBool,
    cancel: CancellationToken,
}

impl<H: HttpClient> ClientInner<H> {
    fn lock_conn(&self) -> MutexGuard<'_, ConnState> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_retry(&self) -> MutexGuard<'_, RetryState> {
        self.retry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_id(&self) -> Option<SessionId> {
        self.lock_conn().id.clone()
    }

    /// The server URL, carrying `id` once it is known.
    fn endpoint(&self, id: Option<&SessionId>) -> Url {
        let mut url = self.server_url.clone();
        if let Some(id) = id {
            url.query_pairs_mut().append_pair("id", id.as_str());
        }
        url
    }

    fn emission_url(&self, emission: &Emission) -> Url {
        let mut url = self.server_url.clone();
        {
            let mut query = url.query_pairs_mut();
            if let Some(id) = self.session_id() {
                query.append_pair("id", id.as_str());
            }
            query
                .append_pair("m", &emission.name)
                .append_pair("n", &emission.n.to_string());
        }
        url
    }

    async fn send_once(&self, emission: &Emission) -> Result<(), SendError> {
        let url = self.emission_url(emission);
        let body = payload_to_form(&emission.data).into_bytes();

        let response = self
            .http
            .post(url.as_str(), &[("content-type", FORM_CONTENT_TYPE)], body)
            .await
            .map_err(|e| SendError::Request(e.to_string()))?;

        if response.is_ok() {
            Ok(())
        } else {
            Err(SendError::UnexpectedStatus(response.status))
        }
    }

    /// Send until the server answers 200 or the client is closed.
    ///
    /// Every attempt carries the same `n` and payload, so a flaky network can
    /// deliver an emission more than once. Failures grow the shared retry
    /// delay and a delivered emission resets it.
    async fn send_with_retry(&self, emission: Emission) {
        loop {
            match self.send_once(&emission).await {
                Ok(()) => {
                    self.lock_retry().reset();
                    debug!(name = %emission.name, n = emission.n, "emission sent");
                    return;
                }
                Err(e) => {
                    let delay = self.lock_retry().fail();
                    warn!(
                        name = %emission.name,
                        n = emission.n,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "emission failed, retrying"
                    );

                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Adopt the server-assigned id and release queued emissions in order.
    fn on_connect(self: &Arc<Self>, payload: &Value) {
        let Some(id) = payload.get("id").and_then(Value::as_str) else {
            warn!(%payload, "connect without a session id");
            return;
        };

        let queued = {
            let mut conn = self.lock_conn();
            conn.id = Some(SessionId::from(id));
            core::mem::take(&mut conn.queue)
        };

        info!(session_id = %id, queued = queued.len(), "connected");

        if queued.is_empty() {
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            for emission in queued {
                inner.send_with_retry(emission).await;
            }
        });
    }

    fn on_exit(self: &Arc<Self>) {
        if self.awaiting_return.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("server is exiting; will reload when it returns");
        let weak = Arc::downgrade(self);
        self.events.once(reserved::OK, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.awaiting_return.store(false, Ordering::SeqCst);
                inner.events.emit(reserved::RELOAD, &Value::Null);
            }
        });
    }
}

/// Client handle for a long-poll server.
///
/// Cheap to clone; every clone shares one connection. Dropping the last
/// handle stops the poll loop without sending `"unload"`.
pub struct BeamsClient<H: HttpClient> {
    inner: Arc<ClientInner<H>>,
    _stop_on_drop: Arc<DropGuard>,
}

impl<H: HttpClient> BeamsClient<H> {
    /// Create a client over `http`. Nothing is sent until [`Self::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] if `options.server_url` is not a
    /// valid absolute URL.
    pub fn new(http: H, options: &ConnectOptions) -> Result<Self, ClientError> {
        let server_url = Url::parse(&options.server_url)?;
        let retry = RetryState::new(options.retry_min, options.retry_max, options.backoff_factor);
        let cancel = CancellationToken::new();

        Ok(Self {
            _stop_on_drop: Arc::new(cancel.clone().drop_guard()),
            inner: Arc::new(ClientInner {
                http,
                server_url,
                events: EventEmitter::new(),
                conn: Mutex::new(ConnState::default()),
                retry: Mutex::new(retry),
                started: AtomicBool::new(false),
                awaiting_return: AtomicBool::new(false),
                cancel,
            }),
        })
    }

    /// Start polling.
    ///
    /// Registers the internal `"connect"`, `"refresh"`, and `"exit"`
    /// listeners and spawns the poll loop. Calling it again does nothing.
    pub fn connect(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.events.on(reserved::CONNECT, with_inner(&weak, |inner, payload| {
            inner.on_connect(payload);
        }));
        self.inner.events.on(reserved::REFRESH, with_inner(&weak, |inner, _| {
            inner.events.emit(reserved::RELOAD, &Value::Null);
        }));
        self.inner.events.on(reserved::EXIT, with_inner(&weak, |inner, _| {
            inner.on_exit();
        }));

        tokio::spawn(poll_loop(self.inner.clone()));
    }

    /// Send a named message to the server.
    ///
    /// Before a session id is known the emission is queued; afterwards it is
    /// sent at once on its own task and retried until it succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::EmptyName`] if `name` is empty, or
    /// [`ClientError::Encode`] if `payload` cannot be serialized.
    pub fn emit<T: Serialize + ?Sized>(&self, name: &str, payload: &T) -> Result<(), ClientError> {
        if name.is_empty() {
            return Err(ClientError::EmptyName);
        }
        let data = serde_json::to_string(payload)?;

        let emission = {
            let mut conn = self.inner.lock_conn();
            conn.n += 1;
            let emission = Emission {
                name: name.to_owned(),
                data,
                n: conn.n,
            };

            if conn.id.is_none() {
                debug!(name, n = emission.n, "queueing emission until connected");
                conn.queue.push(emission);
                return Ok(());
            }
            emission
        };

        debug!(name, n = emission.n, "emitting");
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.send_with_retry(emission).await });
        Ok(())
    }

    /// Forward a diagnostic to the server's log. `null` is not sent.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Encode`] if `payload` cannot be serialized.
    pub fn log<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), ClientError> {
        let value = serde_json::to_value(payload)?;
        if value.is_null() {
            return Ok(());
        }
        self.emit(reserved::LOG, &value)
    }

    /// Call `callback` every time the server pushes `name`.
    pub fn on<F>(&self, name: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.events.on(name, callback)
    }

    /// Call `callback` the next time the server pushes `name`.
    pub fn once<F>(&self, name: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.events.once(name, callback)
    }

    /// Remove a listener. Returns whether it was still registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_listener(id)
    }

    /// The local event emitter.
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.inner.events
    }

    /// The server-assigned session id, once connected.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session_id()
    }

    /// Emissions waiting for a session id.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.lock_conn().queue.len()
    }

    /// The delay the next retry would wait.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.inner.lock_retry().current()
    }

    /// Whether [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop polling, then tell the server this client is leaving.
    ///
    /// The `"unload"` emission is attempted once and never retried.
    pub async fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();

        let unload = {
            let mut conn = self.inner.lock_conn();
            conn.id.is_some().then(|| {
                conn.n += 1;
                Emission {
                    name: reserved::UNLOAD.to_owned(),
                    data: Value::Null.to_string(),
                    n: conn.n,
                }
            })
        };

        if let Some(unload) = unload {
            if let Err(e) = self.inner.send_once(&unload).await {
                debug!(error = %e, "unload not delivered");
            }
        }

        info!("client closed");
    }
}

#[cfg(feature = "reqwest")]
impl BeamsClient<ReqwestHttpClient> {
    /// Create a client backed by [`reqwest`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] if `options.server_url` is not a
    /// valid absolute URL, or [`ClientError::Http`] if the reqwest client
    /// cannot be built.
    pub fn with_reqwest(options: &ConnectOptions) -> Result<Self, ClientError> {
        Self::new(ReqwestHttpClient::new(options.request_timeout)?, options)
    }
}

impl<H: HttpClient> Clone for BeamsClient<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _stop_on_drop: self._stop_on_drop.clone(),
        }
    }
}

impl<H: HttpClient> fmt::Debug for BeamsClient<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeamsClient")
            .field("server_url", &self.inner.server_url.as_str())
            .field("session_id", &self.session_id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Wrap a listener so it only holds the client weakly.
fn with_inner<H, F>(weak: &Weak<ClientInner<H>>, f: F) -> impl Fn(&Value) + Send + Sync + 'static
where
    H: HttpClient,
    F: Fn(&Arc<ClientInner<H>>, &Value) + Send + Sync + 'static,
{
    let weak = weak.clone();
    move |payload: &Value| {
        if let Some(inner) = weak.upgrade() {
            f(&inner, payload);
        }
    }
}
