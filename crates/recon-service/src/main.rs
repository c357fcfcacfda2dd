use anyhow::{Context, Result};
use inference_client::{HttpInferenceClient, InferenceClient};
use recon_service::{
  config::{IdentityStoreType, ReconConfig},
  pg_store::PgIdentityStore,
  routes,
  state::AppState,
  store::{IdentityStore, MemoryIdentityStore},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

const DEFAULT_SESSION_ID: &str = "default";

#[tokio::main]
async fn main() -> Result<()> {
  let _log_guard = telemetry::init_with_service("recon-service");

  let config = ReconConfig::from_env()?;

  let store: Arc<dyn IdentityStore> = match config.store_type {
    IdentityStoreType::Memory => {
      info!("using in-memory identity store");
      Arc::new(MemoryIdentityStore::new())
    }
    IdentityStoreType::Postgres => {
      let database_url = config
        .database_url
        .as_ref()
        .context("DATABASE_URL required for Postgres")?;
      info!("using PostgreSQL identity store");
      Arc::new(PgIdentityStore::new(database_url).await?)
    }
  };

  let client: Arc<dyn InferenceClient> = Arc::new(HttpInferenceClient::new(
    config.inference_base_url.clone(),
    config.retry,
  )?);

  let state = AppState::new(config.clone(), client, store);

  if config.auto_start_polling {
    state
      .start_session(DEFAULT_SESSION_ID.to_string(), None, None)
      .await;
  }

  let app = routes::router(state.clone());
  let listener = TcpListener::bind(config.bind_addr).await?;

  info!(
    addr = %config.bind_addr,
    node_id = %config.node_id,
    inference = %config.inference_base_url,
    auto_start = config.auto_start_polling,
    "recon-service listening"
  );

  axum::serve(listener, app.into_make_service())
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  state.sessions().shutdown().await;
  info!("polling sessions stopped");

  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    let _ = tokio::signal::ctrl_c().await;
  };

  #[cfg(unix)]
  let terminate = async {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
      let _ = sigterm.recv().await;
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
      _ = ctrl_c => {},
      _ = terminate => {},
  }

  info!("shutdown signal received");
}
