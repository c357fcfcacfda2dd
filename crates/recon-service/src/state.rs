use crate::{
  config::ReconConfig,
  reconciler::IdentityReconciler,
  session::{SessionConfig, SessionRegistry},
  store::IdentityStore,
};
use inference_client::InferenceClient;
use reqwest::Url;
use std::{sync::Arc, time::Duration};

#[derive(Clone)]
pub struct AppState {
  inner: Arc<AppStateInner>,
}

struct AppStateInner {
  config: ReconConfig,
  client: Arc<dyn InferenceClient>,
  store: Arc<dyn IdentityStore>,
  reconciler: Arc<IdentityReconciler>,
  sessions: SessionRegistry,
}

impl AppState {
  pub fn new(
    config: ReconConfig,
    client: Arc<dyn InferenceClient>,
    store: Arc<dyn IdentityStore>,
  ) -> Self {
    let reconciler = Arc::new(IdentityReconciler::new(store.clone(), config.limits));
    let inner = AppStateInner {
      config,
      client,
      store,
      reconciler,
      sessions: SessionRegistry::new(),
    };
    Self {
      inner: Arc::new(inner),
    }
  }

  pub fn config(&self) -> &ReconConfig {
    &self.inner.config
  }

  pub fn node_id(&self) -> &str {
    &self.inner.config.node_id
  }

  pub fn client(&self) -> Arc<dyn InferenceClient> {
    self.inner.client.clone()
  }

  pub fn store(&self) -> Arc<dyn IdentityStore> {
    self.inner.store.clone()
  }

  pub fn reconciler(&self) -> Arc<IdentityReconciler> {
    self.inner.reconciler.clone()
  }

  pub fn sessions(&self) -> &SessionRegistry {
    &self.inner.sessions
  }

  /// Start (or restart) a polling session, falling back to the configured
  /// endpoint and interval.
  pub async fn start_session(
    &self,
    session_id: String,
    endpoint: Option<Url>,
    interval: Option<Duration>,
  ) -> String {
    let config = &self.inner.config;
    let session = SessionConfig {
      session_id,
      endpoint: endpoint.unwrap_or_else(|| config.inference_base_url.clone()),
      interval: interval.unwrap_or(config.poll_interval),
      fetch_timeout: config.fetch_timeout,
      aggregator: config.aggregator,
    };
    self
      .inner
      .sessions
      .start(session, self.client(), self.reconciler())
      .await
  }
}
