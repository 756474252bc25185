//! Error types for the long-poll transport.

use thiserror::Error;

/// Problem while configuring a client or emitting a message.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server URL could not be parsed.
    #[error("invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The payload could not be serialized as JSON.
    #[error("payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The HTTP client could not be built.
    #[cfg(feature = "reqwest")]
    #[error("HTTP client setup failed: {0}")]
    Http(#[from] crate::client::ReqwestHttpError),

    /// Emissions need a non-empty message name.
    #[error("message name must not be empty")]
    EmptyName,
}

/// A single emission attempt failed.
///
/// Emissions are retried on either variant.
#[derive(Debug, Error)]
pub enum SendError {
    /// HTTP request failed.
    #[error("HTTP request error: {0}")]
    Request(String),

    /// Server answered with something other than 200.
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
}

/// A single poll attempt failed.
#[derive(Debug, Error)]
pub enum PollError {
    /// HTTP request failed.
    #[error("HTTP request error: {0}")]
    Request(String),

    /// Server answered with something other than 200.
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),

    /// The response body was not a JSON array of `[name, payload]` tuples.
    #[error("batch decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors while running the HTTP server.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Could not bind the listening socket.
    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),

    /// The server loop failed.
    #[error("server error: {0}")]
    Serve(std::io::Error),
}
