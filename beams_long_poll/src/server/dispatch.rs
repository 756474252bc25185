//! Named message handlers.

use core::{fmt, future::Future};
use std::{collections::HashMap, sync::Arc};

use async_lock::RwLock;
use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;

use super::session::Session;

/// A server-side handler for a named message.
///
/// Called with the decoded payload, the sending session, and the
/// emission's sequence number (`0` for server-originated events such as
/// `"connect"`).
pub type Handler = Arc<dyn Fn(Value, Arc<Session>, u64) -> BoxFuture<'static, ()> + Send + Sync>;

/// Box an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Value, Arc<Session>, u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload, session, n| f(payload, session, n).boxed())
}

/// Ordered handler lists keyed by message name.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl HandlerTable {
    /// Create a table from handlers collected up front.
    #[must_use]
    pub fn from_map(handlers: HashMap<String, Vec<Handler>>) -> Self {
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Append a handler for `name`.
    pub async fn on(&self, name: impl Into<String>, handler: Handler) {
        self.handlers
            .write()
            .await
            .entry(name.into())
            .or_default()
            .push(handler);
    }

    /// Make `handler` the only handler for `name`.
    pub async fn replace(&self, name: impl Into<String>, handler: Handler) {
        self.handlers.write().await.insert(name.into(), vec![handler]);
    }

    /// Number of handlers registered for `name`.
    pub async fn count(&self, name: &str) -> usize {
        self.handlers.read().await.get(name).map_or(0, Vec::len)
    }

    /// Invoke every handler for `name` in registration order.
    ///
    /// The table is not locked while handlers run, so handlers may register
    /// further handlers. Returns how many handlers ran.
    pub async fn dispatch(&self, name: &str, payload: Value, session: &Arc<Session>, n: u64) -> usize {
        let handlers = self
            .handlers
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default();

        for handler in &handlers {
            handler(payload.clone(), session.clone(), n).await;
        }

        handlers.len()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use core::time::Duration;
    use serde_json::json;
    use std::sync::Mutex;

    fn session() -> Arc<Session> {
        Arc::new(Session::new(SessionId::from("B1"), Duration::from_secs(30)))
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Handler {
        let log = log.clone();
        handler(move |payload, _session, n| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{tag}:{payload}:{n}"));
            }
        })
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let table = HandlerTable::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        table.on("snap", recorder(&log, "a")).await;
        table.on("snap", recorder(&log, "b")).await;

        let ran = table.dispatch("snap", json!("crackle!"), &session(), 3).await;

        assert_eq!(ran, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:\"crackle!\":3", "b:\"crackle!\":3"]);
    }

    #[tokio::test]
    async fn replace_keeps_a_single_handler() {
        let table = HandlerTable::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        table.on("snap", recorder(&log, "a")).await;
        table.on("snap", recorder(&log, "b")).await;
        table.replace("snap", recorder(&log, "c")).await;

        assert_eq!(table.count("snap").await, 1);
        table.dispatch("snap", json!(1), &session(), 1).await;
        assert_eq!(*log.lock().unwrap(), vec!["c:1:1"]);
    }

    #[tokio::test]
    async fn unknown_name_runs_nothing() {
        let table = HandlerTable::default();
        assert_eq!(table.dispatch("nobody", Value::Null, &session(), 0).await, 0);
    }
}
