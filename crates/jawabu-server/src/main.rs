//! jawabu server - streaming answer pipeline over SSE.

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use jawabu_core::AppConfig;
use state::AppState;

#[derive(Debug, Parser)]
#[command(
    name = "jawabu-server",
    about = "HTTP API server for the jawabu answer pipeline",
    version = env!("CARGO_PKG_VERSION")
)]
struct ServerArgs {
    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindConfig {
    host: String,
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jawabu_server=info,jawabu_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting jawabu server");

    let config = AppConfig::from_env();
    if config.app_insights_connection.is_some() {
        info!("Application Insights connection configured");
    }
    info!(
        org_config_dir = %config.org_config_dir.display(),
        audio_cache_dir = %config.audio_cache_dir.display(),
        dynamodb_table = %config.dynamodb_table,
        "Configuration loaded"
    );

    let state = AppState::new(config)?;
    let app = api::create_router(state);

    let bind = resolve_bind_config(args);
    let addr = format!("{}:{}", bind.host, bind.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    info!("Server ready. Press Ctrl+C to stop.");
    server.await?;

    Ok(())
}

fn resolve_bind_config(args: ServerArgs) -> BindConfig {
    BindConfig {
        host: args.host.unwrap_or_else(host_from_env_or_default),
        port: args.port.unwrap_or_else(port_from_env_or_default),
    }
}

fn host_from_env_or_default() -> String {
    match std::env::var("JAWABU_HOST") {
        Ok(raw) => {
            let host = raw.trim();
            if host.is_empty() {
                warn!("Empty JAWABU_HOST, falling back to 0.0.0.0");
                "0.0.0.0".to_string()
            } else {
                host.to_string()
            }
        }
        Err(_) => "0.0.0.0".to_string(),
    }
}

fn port_from_env_or_default() -> u16 {
    match std::env::var("JAWABU_PORT") {
        Ok(raw) => match raw.trim().parse::<u16>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid JAWABU_PORT='{}', falling back to 8080", raw);
                8080
            }
        },
        Err(_) => 8080,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
