//! # Beams HTTP Long Poll
//!
//! Bidirectional, ordered messaging between many short-lived clients and one
//! server over plain request/response HTTP.
//!
//! ```text
//! ┌──────────┐                                  ┌──────────┐
//! │  Client  │                                  │  Server  │
//! └────┬─────┘                                  └────┬─────┘
//!      │  GET /beam                                  │
//!      │ ──────────────────────────────────────────► │  new session
//!      │  200 [["connect",{"id":"…"}]]               │
//!      │ ◄────────────────────────────────────────── │
//!      │                                             │
//!      │  GET /beam?id=…                             │
//!      │ ──────────────────────────────────────────► │
//!      │            ... (held until emit) ...        │
//!      │  200 [["name",payload], …]                  │
//!      │ ◄────────────────────────────────────────── │
//!      │                                             │
//!      │  POST /beam?id=…&m=name&n=1   d=<json>      │
//!      │ ──────────────────────────────────────────► │  handlers
//!      │  200 {"received":true}                      │
//!      │ ◄────────────────────────────────────────── │
//! ```
//!
//! ## Features
//!
//! - `client`: the client connection state machine over any [`client::HttpClient`]
//! - `reqwest`: an [`client::HttpClient`] backed by [`reqwest`]
//! - `server`: session registry, message router, and an [`axum`] router

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
pub mod message;
pub mod session;

#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default path the GET and POST endpoints are served on.
pub const DEFAULT_BASE_PATH: &str = "/beam";

/// Default idle window before a held poll is answered with `"timeout"` (30 seconds).
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Default first retry delay (1 second).
pub const DEFAULT_RETRY_MIN_MS: u64 = 1_000;

/// Default retry delay ceiling (1 minute).
pub const DEFAULT_RETRY_MAX_MS: u64 = 60_000;

/// Default retry delay multiplier.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Reserved message names.
pub mod reserved {
    /// First message pushed to a new session, carrying `{"id": …}`.
    pub const CONNECT: &str = "connect";

    /// Sent by a client that is going away; the server removes its session.
    pub const UNLOAD: &str = "unload";

    /// Client diagnostics forwarded to the server's log sink.
    pub const LOG: &str = "log";

    /// Pushed by the server when a poll has been held for the idle window.
    pub const TIMEOUT: &str = "timeout";

    /// Pushed by the server to ask clients to reload.
    pub const REFRESH: &str = "refresh";

    /// Pushed by the server when it is shutting down.
    pub const EXIT: &str = "exit";

    /// Local client event: a poll succeeded.
    pub const OK: &str = "ok";

    /// Local client event: a poll failed.
    pub const FAIL: &str = "fail";

    /// Local client event: the server asked for a reload, or came back after `"exit"`.
    pub const RELOAD: &str = "reload";
}
