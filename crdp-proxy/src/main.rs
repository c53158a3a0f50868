use std::process;

use crdp_proxy::ServerConfig;
use crdp_proxy::server::USAGE;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Logging setup.
///
/// `RUST_LOG` wins when set; otherwise `CRDP_LOG` picks the level for the workspace
/// crates. `LOG_FORMAT=json` switches to JSON lines. Everything goes to stderr.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("CRDP_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "crdp_proxy={level},crdp_mux={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config = match ServerConfig::from_args(&args) {
        Ok(Some(config)) => config,
        Ok(None) => {
            println!("{USAGE}");
            return;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = crdp_proxy::serve(config).await {
        tracing::error!(error = %e, "crdp-proxy failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
