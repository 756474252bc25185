//! Inbound message routing and server-initiated broadcast.

use core::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ServerConfig,
    dispatch::{HandlerTable, handler},
    registry::SessionRegistry,
    session::{PendingResponse, PollReceiver, Session},
};
use crate::{reserved, session::SessionId};

/// Routes client emissions to handlers and server pushes to sessions.
///
/// One instance is owned by the process and shared with every request
/// handler as [`axum`] state.
#[derive(Debug)]
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    handlers: Arc<HandlerTable>,
    config: ServerConfig,
}

impl MessageRouter {
    /// Create a router over an existing registry and handler table.
    #[must_use]
    pub const fn new(
        registry: Arc<SessionRegistry>,
        handlers: Arc<HandlerTable>,
        config: ServerConfig,
    ) -> Self {
        Self {
            registry,
            handlers,
            config,
        }
    }

    /// The session registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The server configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Append a handler for emissions named `name`.
    pub async fn on<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Value, Arc<Session>, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.on(name, handler(f)).await;
    }

    /// Make `f` the only handler for emissions named `name`.
    pub async fn handle<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Value, Arc<Session>, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.replace(name, handler(f)).await;
    }

    /// Run `f` whenever a session is created.
    pub async fn connect<F, Fut>(&self, f: F)
    where
        F: Fn(Value, Arc<Session>, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(reserved::CONNECT, f).await;
    }

    /// Number of handlers registered for `name`.
    pub async fn handler_count(&self, name: &str) -> usize {
        self.handlers.count(name).await
    }

    /// Push a message to every session.
    pub async fn emit(&self, name: &str, payload: Value) {
        debug!(name, "broadcasting");
        self.registry
            .for_each(|session| {
                let payload = payload.clone();
                async move { session.emit(name, payload).await }
            })
            .await;
    }

    /// Handle a poll: find or create the session and hold a response on it.
    ///
    /// The returned receiver completes when the session has something to
    /// deliver.
    pub async fn poll(&self, id: Option<&SessionId>) -> PollReceiver {
        let session = self.registry.get_or_create(id).await;
        let (pending, rx) = PendingResponse::channel();
        session.wait(pending).await;
        rx
    }

    /// Handle a client emission.
    ///
    /// Emissions for an absent or unknown session are dropped; sessions are
    /// only created by polling. An `"unload"` emission removes the session
    /// once its handlers have run. Returns whether a session was found.
    pub async fn receive(
        &self,
        id: Option<&SessionId>,
        name: &str,
        n: u64,
        payload: Value,
    ) -> bool {
        let session = match id {
            Some(id) => self.registry.get(id).await,
            None => None,
        };

        let Some(session) = session else {
            warn!(session_id = ?id, name, n, "emission for unknown session dropped");
            return false;
        };

        let ran = self.handlers.dispatch(name, payload, &session, n).await;
        debug!(session_id = %session.id(), name, n, handlers = ran, "received emission");

        if name == reserved::UNLOAD {
            self.registry.remove(session.id()).await;
        }

        true
    }

    /// Tell every client the server is going away.
    pub async fn shutdown(&self) {
        let sessions = self.registry.len().await;
        info!(sessions, "notifying clients of shutdown");
        self.emit(reserved::EXIT, Value::Null).await;
    }

    /// Start the periodic staleness sweep, if a session TTL is configured.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let ttl = self.config.session_ttl?;
        let router = self.clone();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = router.registry.remove_stale(ttl).await;
                        if !removed.is_empty() {
                            info!(count = removed.len(), "evicted stale sessions");
                        }
                    }
                    () = cancel.cancelled() => {
                        debug!("stopping session sweep");
                        break;
                    }
                }
            }
        }))
    }
}
