//! HTTP long-poll server.
//!
//! Serves `GET` (poll) and `POST` (emission) on one base path through an
//! [`axum`] router. The shared state is a [`MessageRouter`] owning the
//! [`SessionRegistry`].

mod dispatch;
mod handlers;
mod registry;
mod router;
mod session;

pub use dispatch::{Handler, HandlerTable, handler};
pub use handlers::router;
pub use registry::{IdSource, SessionRegistry};
pub use router::MessageRouter;
pub use session::{Delivery, PendingResponse, PollReceiver, Session};

use core::{future::Future, time::Duration};
use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{DEFAULT_BASE_PATH, DEFAULT_IDLE_TIMEOUT_MS, error::ServeError, reserved};

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Path both endpoints are served on.
    pub base_path: String,

    /// How long a poll is held before `"timeout"` is pushed into it.
    pub idle_timeout: Duration,

    /// Send `access-control-allow-origin: *` on every response.
    pub allow_any_origin: bool,

    /// Evict sessions quiet for this long. `None` keeps sessions until `"unload"`.
    pub session_ttl: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_BASE_PATH.to_owned(),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            allow_any_origin: false,
            session_ttl: None,
        }
    }
}

/// Builder for a [`MessageRouter`].
pub struct ServerBuilder {
    config: ServerConfig,
    handlers: HashMap<String, Vec<Handler>>,
    id_source: Option<IdSource>,
    log_sink: bool,
}

impl ServerBuilder {
    /// Create a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            handlers: HashMap::new(),
            id_source: None,
            log_sink: true,
        }
    }

    /// Start from an existing configuration.
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the path both endpoints are served on.
    #[must_use]
    pub fn base_path(mut self, path: impl Into<String>) -> Self {
        self.config.base_path = path.into();
        self
    }

    /// Set the idle window after which a held poll gets `"timeout"`.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Send `access-control-allow-origin: *` on every response.
    #[must_use]
    pub const fn allow_any_origin(mut self, allow: bool) -> Self {
        self.config.allow_any_origin = allow;
        self
    }

    /// Evict sessions that stay quiet for `ttl`.
    #[must_use]
    pub const fn session_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.config.session_ttl = ttl;
        self
    }

    /// Mint session ids from `source` instead of at random.
    #[must_use]
    pub fn id_source(mut self, source: IdSource) -> Self {
        self.id_source = Some(source);
        self
    }

    /// Do not write client `"log"` emissions to the server log.
    #[must_use]
    pub const fn without_log_sink(mut self) -> Self {
        self.log_sink = false;
        self
    }

    /// Append a handler for emissions named `name`.
    #[must_use]
    pub fn on<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Arc<Session>, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.entry(name.into()).or_default().push(handler(f));
        self
    }

    /// Make `f` the only handler for emissions named `name`.
    #[must_use]
    pub fn handle<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Arc<Session>, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(name.into(), vec![handler(f)]);
        self
    }

    /// Run `f` whenever a session is created.
    #[must_use]
    pub fn connect<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Value, Arc<Session>, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(reserved::CONNECT, f)
    }

    /// Build the shared router state.
    #[must_use]
    pub fn build(mut self) -> Arc<MessageRouter> {
        if self.log_sink {
            self.handlers
                .entry(reserved::LOG.to_owned())
                .or_default()
                .insert(0, handler(log_sink));
        }

        let handlers = Arc::new(HandlerTable::from_map(self.handlers));
        let registry = match self.id_source {
            Some(source) => {
                SessionRegistry::with_id_source(handlers.clone(), self.config.idle_timeout, source)
            }
            None => SessionRegistry::new(handlers.clone(), self.config.idle_timeout),
        };

        Arc::new(MessageRouter::new(
            Arc::new(registry),
            handlers,
            self.config,
        ))
    }

    /// Build and create the Axum router.
    pub fn into_router(self) -> axum::Router {
        router(self.build())
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("log_sink", &self.log_sink)
            .finish_non_exhaustive()
    }
}

async fn log_sink(payload: Value, session: Arc<Session>, n: u64) {
    info!(target: "beams::client", session_id = %session.id(), n, %payload, "client log");
}

/// Serve `server` on `listener` until `cancel` fires.
///
/// On cancellation every client is sent `"exit"` before in-flight requests
/// drain.
///
/// # Errors
///
/// Returns [`ServeError::Serve`] if the underlying server fails.
pub async fn serve(
    listener: TcpListener,
    server: Arc<MessageRouter>,
    cancel: CancellationToken,
) -> Result<(), ServeError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, path = %server.config().base_path, "long-poll server listening");
    }

    let sweeper = server.spawn_sweeper(cancel.child_token());
    let app = router(server.clone());

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            server.shutdown().await;
        })
        .await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    result.map_err(ServeError::Serve)
}

/// Bind `addr` and [`serve`] on it.
///
/// # Errors
///
/// Returns [`ServeError::Bind`] if the address cannot be bound.
pub async fn bind_and_serve(
    addr: std::net::SocketAddr,
    server: Arc<MessageRouter>,
    cancel: CancellationToken,
) -> Result<(), ServeError> {
    let listener = TcpListener::bind(addr).await.map_err(ServeError::Bind)?;
    serve(listener, server, cancel).await
}
