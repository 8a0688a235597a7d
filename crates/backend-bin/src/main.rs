use anyhow::Context;
use clap::Parser;
use huddle_backend::{config::Settings, ws_router, AppState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Huddle signaling server
#[derive(Debug, Parser)]
#[command(name = "huddle-backend", version, about)]
struct Cli {
    /// Path to a TOML config file (HUDDLE_* env vars override it)
    #[arg(long, short)]
    config: Option<String>,

    /// Override the bind address from config
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("loading config from {path}"))?,
        None => Settings::load().context("loading config")?,
    };
    if let Some(bind) = cli.bind {
        settings.bind_addr = bind;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let addr = settings.bind_addr;
    let state = Arc::new(AppState::new(settings));
    let app = ws_router::create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "huddle signaling server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
