//! Proxy server: discover the target, connect once, serve channels until shutdown.

use std::net::SocketAddr;

use crdp_mux::transport::websocket;
use crdp_mux::{DiscoveryConfig, Multiplexor, discover};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::routes::routes;

pub const USAGE: &str = "\
Usage: crdp-proxy [--target <url>] [--host <host>] [--port <port>]

Options:
  --target <url>   DevTools endpoint, http(s):// or ws(s):// [default: http://127.0.0.1:9222]
  --host <host>    Address to listen on [default: 127.0.0.1]
  --port <port>    Port to listen on [default: 9223]
  -h, --help       Print this help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upstream debugging endpoint.
    pub target: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9223,
            target: "http://127.0.0.1:9222".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parse command-line flags. `Ok(None)` means help was requested.
    pub fn from_args(args: &[String]) -> Result<Option<Self>, String> {
        let mut config = Self::default();

        let mut i = 1; // skip argv[0]
        while i < args.len() {
            match args[i].as_str() {
                "--host" => {
                    i += 1;
                    config.host = args.get(i).ok_or("--host requires a value")?.clone();
                }
                "--port" => {
                    i += 1;
                    let value = args.get(i).ok_or("--port requires a value")?;
                    config.port = value
                        .parse()
                        .map_err(|_| format!("invalid port: {value}"))?;
                }
                "--target" => {
                    i += 1;
                    config.target = args.get(i).ok_or("--target requires a value")?.clone();
                }
                "--help" | "-h" => return Ok(None),
                arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
                arg => return Err(format!("unexpected argument: {arg}")),
            }
            i += 1;
        }

        Ok(Some(config))
    }
}

/// Connect to the target and serve until a signal arrives or the upstream closes.
///
/// A protocol violation on the upstream connection is returned as an error.
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let ws_url = discover(&config.target, &DiscoveryConfig::default()).await?;
    let (connection, events) = websocket::connect(&ws_url).await?;
    let mux = Multiplexor::new(connection);

    let (done_tx, done_rx) = watch::channel(false);
    let upstream = {
        let mux = mux.clone();
        tokio::spawn(async move {
            let result = mux.run(events).await;
            let _ = done_tx.send(true);
            result
        })
    };

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Starting crdp-proxy on {}", listener.local_addr()?);

    serve_on(listener, mux, shutdown_signal(done_rx)).await?;
    info!("Server shutdown complete");

    if upstream.is_finished() {
        upstream.await??;
    } else {
        upstream.abort();
    }
    Ok(())
}

/// Serve the routes for `mux` on an already-bound listener.
pub async fn serve_on<F>(listener: TcpListener, mux: Multiplexor, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, routes(mux))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Wait for SIGINT, SIGTERM, or the upstream connection to end.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the tokio
/// runtime is misconfigured. That should fail fast at startup.
async fn shutdown_signal(mut upstream_done: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let upstream = async {
        while !*upstream_done.borrow() {
            if upstream_done.changed().await.is_err() {
                return;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = upstream => {
            info!("Upstream connection ended, shutting down...");
        }
    }
}
