use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use gust::config::Config;
use gust::dispatch::registry::Registry;
use gust::mode::ModeStore;
use gust::server::{self, AppState, CHAT_COMPLETIONS_PATH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env from the binary's directory first, then fall back to the CWD search.
    let exe_env = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
        .filter(|path| path.exists());
    match exe_env {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing::info!("gust starting");

    let config = Config::load()?;
    tracing::info!(
        mode = %config.mode.mode,
        providers = config.providers.len(),
        stream_policy = ?config.fallback.stream_policy,
        first_delta_timeout_secs = config.fallback.first_delta_timeout.as_secs(),
        stall_timeout_secs = config.fallback.stall_timeout.as_secs(),
        "config loaded"
    );

    let registry = Arc::new(Registry::new(config.providers)?);
    for entry in registry.providers() {
        tracing::info!(provider = %entry.name, models = ?entry.models, "provider registered");
    }
    let modes = Arc::new(ModeStore::new(config.mode, config.lists));
    let shutdown = CancellationToken::new();
    let state = AppState::new(registry, modes, config.fallback, shutdown.clone());

    let listener = TcpListener::bind(config.listen).await?;
    tracing::info!("listening on http://{}{}", listener.local_addr()?, CHAT_COMPLETIONS_PATH);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            return;
        }
        tracing::info!("shutdown requested");
        shutdown.cancel();
    });

    server::serve(listener, state).await?;

    tracing::info!("gust shutting down");
    Ok(())
}
