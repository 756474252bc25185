//! Long-poll server command.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, ensure};
use beams_long_poll::{
    DEFAULT_BASE_PATH, DEFAULT_IDLE_TIMEOUT_MS,
    server::{ServerBuilder, Session, bind_and_serve},
};
use tokio_util::sync::CancellationToken;

/// Arguments for the server command.
#[derive(Debug, clap::Args)]
pub(crate) struct ServerArgs {
    /// Socket address to bind to
    #[arg(short, long, env = "BEAMS_ADDR", default_value = "127.0.0.1:8080")]
    pub(crate) addr: SocketAddr,

    /// Path the poll and emission endpoints are served on
    #[arg(short, long, env = "BEAMS_PATH", default_value = DEFAULT_BASE_PATH)]
    pub(crate) path: String,

    /// Idle window in milliseconds before a held poll is answered with "timeout"
    #[arg(long, env = "BEAMS_IDLE_TIMEOUT_MS", default_value_t = DEFAULT_IDLE_TIMEOUT_MS)]
    pub(crate) idle_timeout_ms: u64,

    /// Send `access-control-allow-origin: *` on every response
    #[arg(long, env = "BEAMS_ALLOW_ANY_ORIGIN")]
    pub(crate) allow_any_origin: bool,

    /// Evict sessions quiet for this many seconds (off when unset)
    #[arg(long, env = "BEAMS_SESSION_TTL_SECS")]
    pub(crate) session_ttl_secs: Option<u64>,

    /// Answer every "ping" with a "pong" carrying the same payload
    #[arg(long)]
    pub(crate) echo: bool,

    /// Do not write client "log" emissions to the server log
    #[arg(long)]
    pub(crate) quiet_client_logs: bool,
}

/// Run the long-poll server until `token` is cancelled.
pub(crate) async fn run(args: ServerArgs, token: CancellationToken) -> Result<()> {
    ensure!(args.path.starts_with('/'), "path must start with '/': {}", args.path);

    let mut builder = ServerBuilder::new()
        .base_path(args.path)
        .idle_timeout(Duration::from_millis(args.idle_timeout_ms))
        .allow_any_origin(args.allow_any_origin)
        .session_ttl(args.session_ttl_secs.map(Duration::from_secs));

    if args.quiet_client_logs {
        builder = builder.without_log_sink();
    }

    if args.echo {
        builder = builder.on("ping", |payload, session: Arc<Session>, _n| async move {
            session.emit("pong", payload).await;
        });
    }

    bind_and_serve(args.addr, builder.build(), token).await?;
    tracing::info!("server stopped");
    Ok(())
}
