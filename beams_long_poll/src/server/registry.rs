//! Server-wide session registry.

use core::{fmt, future::Future, time::Duration};
use std::{collections::HashMap, sync::Arc};

use async_lock::RwLock;
use serde_json::json;
use tracing::{debug, info};

use super::{dispatch::HandlerTable, session::Session};
use crate::{reserved, session::SessionId};

/// Source of fresh session ids.
pub type IdSource = Arc<dyn Fn() -> SessionId + Send + Sync>;

/// Map from session id to [`Session`].
///
/// The map lock only guards membership; each session guards its own state.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    handlers: Arc<HandlerTable>,
    idle_timeout: Duration,
    id_source: IdSource,
}

impl SessionRegistry {
    /// Create an empty registry minting random ids.
    #[must_use]
    pub fn new(handlers: Arc<HandlerTable>, idle_timeout: Duration) -> Self {
        Self::with_id_source(handlers, idle_timeout, Arc::new(SessionId::random))
    }

    /// Create an empty registry minting ids from `id_source`.
    #[must_use]
    pub fn with_id_source(
        handlers: Arc<HandlerTable>,
        idle_timeout: Duration,
        id_source: IdSource,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            handlers,
            idle_timeout,
            id_source,
        }
    }

    /// Register a new session under an unused id.
    ///
    /// The session's first buffered message is `["connect", {"id": …}]`,
    /// after which every `"connect"` handler runs. The greeting is buffered
    /// before the session is visible to broadcasts.
    pub async fn create_session(&self) -> Arc<Session> {
        let (session, greeting) = {
            let mut sessions = self.sessions.write().await;
            let id = loop {
                let candidate = (self.id_source)();
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
                debug!(session_id = %candidate, "session id collision, regenerating");
            };

            let greeting = json!({ "id": id.as_str() });
            let session = Arc::new(Session::greeted(
                id.clone(),
                self.idle_timeout,
                greeting.clone(),
            ));
            sessions.insert(id, session.clone());
            (session, greeting)
        };

        info!(session_id = %session.id(), "created session");

        self.handlers
            .dispatch(reserved::CONNECT, greeting, &session, 0)
            .await;

        session
    }

    /// Look up `id`, or create a fresh session if it is absent or unknown.
    ///
    /// An unknown id is never adopted; the server always assigns ids.
    pub async fn get_or_create(&self, id: Option<&SessionId>) -> Arc<Session> {
        if let Some(id) = id {
            if let Some(session) = self.get(id).await {
                session.touch().await;
                return session;
            }
            debug!(session_id = %id, "unknown session id, allocating a new session");
        }

        self.create_session().await
    }

    /// Look up a session.
    pub async fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Whether `id` is registered.
    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Remove a session, releasing any poll it holds.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(id);
        if let Some(session) = &removed {
            session.close().await;
            info!(session_id = %id, "removed session");
        }
        removed
    }

    /// Remove sessions that hold no live poll and have been quiet for `max_idle`.
    pub async fn remove_stale(&self, max_idle: Duration) -> Vec<SessionId> {
        let mut sessions = self.sessions.write().await;

        let mut stale = Vec::new();
        for (id, session) in sessions.iter() {
            if session.is_stale(max_idle).await {
                stale.push(id.clone());
            }
        }

        for id in &stale {
            if let Some(session) = sessions.remove(id) {
                session.close().await;
                debug!(session_id = %id, "removed stale session");
            }
        }

        stale
    }

    /// Snapshot of every live session.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Run `f` on every live session.
    ///
    /// Iterates a snapshot, so `f` may create or remove sessions.
    pub async fn for_each<F, Fut>(&self, mut f: F)
    where
        F: FnMut(Arc<Session>) -> Fut,
        Fut: Future<Output = ()>,
    {
        for session in self.sessions().await {
            f(session).await;
        }
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether there are no live sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}
