use crate::aggregator::{
  AggregatorConfig, DEFAULT_CONFIDENCE_WINDOW, DEFAULT_DETECTION_HISTORY_LIMIT, DEFAULT_FPS_WINDOW,
  DEFAULT_PEOPLE_WINDOW,
};
use crate::reconciler::ReconcilerLimits;
use anyhow::{Context, Result};
use common::identities::{DEFAULT_CONFIDENCE_HISTORY_LIMIT, DEFAULT_UNKNOWN_IDENTITY_LIMIT};
use common::validation::{validate_http_url, validate_range, MAX_TUNABLE};
use inference_client::retry::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS};
use inference_client::RetryPolicy;
use reqwest::Url;
use std::{env, net::SocketAddr, time::Duration};

#[derive(Clone, Debug, PartialEq)]
pub enum IdentityStoreType {
  Memory,
  Postgres,
}

impl IdentityStoreType {
  pub fn parse(value: &str) -> Self {
    match value.trim().to_lowercase().as_str() {
      "postgres" | "postgresql" => IdentityStoreType::Postgres,
      _ => IdentityStoreType::Memory,
    }
  }
}

#[derive(Clone, Debug)]
pub struct ReconConfig {
  pub bind_addr: SocketAddr,
  pub inference_base_url: Url,
  pub poll_interval: Duration,
  pub fetch_timeout: Duration,
  pub status_timeout: Duration,
  pub retry: RetryPolicy,
  pub limits: ReconcilerLimits,
  pub aggregator: AggregatorConfig,
  pub store_type: IdentityStoreType,
  pub database_url: Option<String>,
  pub auto_start_polling: bool,
  pub node_id: String,
}

impl ReconConfig {
  pub fn from_env() -> Result<Self> {
    let bind = env::var("RECON_SERVICE_ADDR").unwrap_or_else(|_| "0.0.0.0:8091".to_string());
    let bind_addr: SocketAddr = bind.parse().context("invalid RECON_SERVICE_ADDR")?;

    let inference =
      env::var("INFERENCE_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string());
    validate_http_url(&inference, "INFERENCE_API_URL")?;
    let inference_base_url = Url::parse(&inference).context("invalid INFERENCE_API_URL")?;

    let store_type =
      IdentityStoreType::parse(&env::var("IDENTITY_STORE_TYPE").unwrap_or_default());
    let database_url = if store_type == IdentityStoreType::Postgres {
      Some(env::var("DATABASE_URL").context("DATABASE_URL required for Postgres store")?)
    } else {
      env::var("DATABASE_URL").ok()
    };

    let auto_start_polling = env::var("AUTO_START_POLLING")
      .ok()
      .and_then(|v| v.parse::<bool>().ok())
      .unwrap_or(false);

    let node_id = env::var("NODE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

    let limits = ReconcilerLimits {
      history_limit: env_usize("CONFIDENCE_HISTORY_LIMIT", DEFAULT_CONFIDENCE_HISTORY_LIMIT),
      unknown_limit: env_usize("UNKNOWN_IDENTITY_LIMIT", DEFAULT_UNKNOWN_IDENTITY_LIMIT),
    };
    let aggregator = AggregatorConfig {
      fps_window: env_usize("FPS_WINDOW", DEFAULT_FPS_WINDOW),
      people_window: env_usize("PEOPLE_WINDOW", DEFAULT_PEOPLE_WINDOW),
      confidence_window: env_usize("CONFIDENCE_WINDOW", DEFAULT_CONFIDENCE_WINDOW),
      history_limit: env_usize("DETECTION_HISTORY_LIMIT", DEFAULT_DETECTION_HISTORY_LIMIT),
    };
    for (value, name) in [
      (limits.history_limit, "CONFIDENCE_HISTORY_LIMIT"),
      (limits.unknown_limit, "UNKNOWN_IDENTITY_LIMIT"),
      (aggregator.fps_window, "FPS_WINDOW"),
      (aggregator.people_window, "PEOPLE_WINDOW"),
      (aggregator.confidence_window, "CONFIDENCE_WINDOW"),
      (aggregator.history_limit, "DETECTION_HISTORY_LIMIT"),
    ] {
      validate_range(value, 1, MAX_TUNABLE, name)?;
    }

    Ok(Self {
      bind_addr,
      inference_base_url,
      poll_interval: Duration::from_millis(env_u64("POLL_INTERVAL_MS", 5000).max(100)),
      fetch_timeout: Duration::from_millis(env_u64("FETCH_TIMEOUT_MS", 10_000).max(1)),
      status_timeout: Duration::from_millis(env_u64("STATUS_TIMEOUT_MS", 5000).max(1)),
      retry: RetryPolicy::new(
        env_u64("RETRY_ATTEMPTS", DEFAULT_MAX_ATTEMPTS as u64).min(u32::MAX as u64) as u32,
        Duration::from_millis(env_u64("RETRY_BASE_DELAY_MS", DEFAULT_BASE_DELAY_MS)),
      ),
      limits,
      aggregator,
      store_type,
      database_url,
      auto_start_polling,
      node_id,
    })
  }

  /// Embedding uploads carry several images, so they get twice the fetch deadline.
  pub fn embedding_timeout(&self) -> Duration {
    self.fetch_timeout.saturating_mul(2)
  }
}

fn env_u64(name: &str, default: u64) -> u64 {
  env::var(name)
    .ok()
    .and_then(|v| v.trim().parse::<u64>().ok())
    .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
  env::var(name)
    .ok()
    .and_then(|v| v.trim().parse::<usize>().ok())
    .filter(|v| *v > 0)
    .unwrap_or(default)
}
