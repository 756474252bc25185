//! Long-poll client command.

use std::time::Duration;

use anyhow::Result;
use beams_long_poll::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_RETRY_MAX_MS, DEFAULT_RETRY_MIN_MS,
    client::{BeamsClient, ConnectOptions},
    message::decode_payload,
    reserved,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Arguments for the connect command.
#[derive(Debug, clap::Args)]
pub(crate) struct ClientArgs {
    /// Server endpoint URL
    #[arg(env = "BEAMS_URL", default_value = "http://127.0.0.1:8080/beam")]
    pub(crate) url: String,

    /// Message names to print when the server pushes them
    #[arg(short, long, value_name = "NAME")]
    pub(crate) listen: Vec<String>,

    /// Messages to send, as NAME=JSON (non-JSON is sent as a string)
    #[arg(short, long, value_name = "NAME=JSON", value_parser = parse_emission)]
    pub(crate) emit: Vec<(String, Value)>,

    /// First retry delay in milliseconds
    #[arg(long, env = "BEAMS_RETRY_MIN_MS", default_value_t = DEFAULT_RETRY_MIN_MS)]
    pub(crate) retry_min_ms: u64,

    /// Retry delay ceiling in milliseconds
    #[arg(long, env = "BEAMS_RETRY_MAX_MS", default_value_t = DEFAULT_RETRY_MAX_MS)]
    pub(crate) retry_max_ms: u64,

    /// Retry delay multiplier per consecutive failure
    #[arg(long, env = "BEAMS_BACKOFF_FACTOR", default_value_t = DEFAULT_BACKOFF_FACTOR)]
    pub(crate) backoff_factor: f64,
}

/// Connect, print pushes, send emissions, and stay until `token` is cancelled.
pub(crate) async fn run(args: ClientArgs, token: CancellationToken) -> Result<()> {
    let options = ConnectOptions {
        server_url: args.url,
        retry_min: Duration::from_millis(args.retry_min_ms),
        retry_max: Duration::from_millis(args.retry_max_ms),
        backoff_factor: args.backoff_factor,
        ..ConnectOptions::default()
    };
    let client = BeamsClient::with_reqwest(&options)?;

    for name in args.listen {
        let label = name.clone();
        client.on(name, move |payload| info!(name = %label, %payload, "received"));
    }
    client.on(reserved::CONNECT, |payload| info!(%payload, "connected"));
    client.on(reserved::RELOAD, |_| warn!("server asked clients to reload"));

    for (name, payload) in &args.emit {
        client.emit(name, payload)?;
    }

    client.connect();
    token.cancelled().await;
    client.close().await;
    Ok(())
}

fn parse_emission(raw: &str) -> Result<(String, Value), String> {
    let (name, payload) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=JSON, got {raw:?}"))?;
    if name.is_empty() {
        return Err(format!("missing message name in {raw:?}"));
    }
    Ok((name.to_owned(), decode_payload(payload)))
}
