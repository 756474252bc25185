//! `beams`: run a long-poll server or connect to one.

mod client;
mod server;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let token = CancellationToken::new();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let token = token.clone();
        let hits = hits.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_ok() {
                    match hits.fetch_add(1, Ordering::Relaxed) {
                        0 => {
                            eprintln!("Ctrl+C: shutting down… (press again to force)");
                            token.cancel();
                        }
                        _ => {
                            eprintln!("Force exiting.");
                            std::process::exit(130);
                        }
                    }
                }
            }
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let t = token.clone();
        tokio::spawn(async move {
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                eprintln!("SIGTERM: shutting down…");
                t.cancel();
            }
        });
    }

    let args = Arguments::parse();
    tracing::debug!(version = beams_long_poll::VERSION, "starting");

    match args.command {
        Command::Serve(args) => server::run(args, token).await,
        Command::Connect(args) => client::run(args, token).await,
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Long-poll messaging over plain HTTP")]
struct Arguments {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the long-poll server
    Serve(server::ServerArgs),

    /// Connect to a server, print pushed messages, and send emissions
    Connect(client::ClientArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let args = Arguments::try_parse_from(["beams", "serve"]).expect("parse");
        let Command::Serve(args) = args.command else {
            panic!("expected serve");
        };
        assert_eq!(args.addr.to_string(), "127.0.0.1:8080");
        assert_eq!(args.path, "/beam");
        assert_eq!(args.idle_timeout_ms, 30_000);
        assert_eq!(args.session_ttl_secs, None);
    }

    #[test]
    fn connect_collects_listens_and_emissions() {
        let args = Arguments::try_parse_from([
            "beams",
            "connect",
            "http://localhost:9000/beam",
            "--listen",
            "pong",
            "--emit",
            r#"ping={"a":1}"#,
            "--emit",
            "note=plain",
        ])
        .expect("parse");
        let Command::Connect(args) = args.command else {
            panic!("expected connect");
        };
        assert_eq!(args.url, "http://localhost:9000/beam");
        assert_eq!(args.listen, vec!["pong"]);
        assert_eq!(
            args.emit,
            vec![
                ("ping".to_owned(), serde_json::json!({ "a": 1 })),
                ("note".to_owned(), serde_json::json!("plain")),
            ]
        );
    }
}
