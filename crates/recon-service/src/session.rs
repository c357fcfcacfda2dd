//! Polling sessions: one periodic fetch → classify → reconcile → aggregate loop
//! per session, stoppable at any point through a cancellation token.

use crate::aggregator::{AggregatorConfig, PresentationAggregator, PresentationView};
use crate::classifier::classify;
use crate::reconciler::{IdentityReconciler, ReconcileSummary};
use chrono::{DateTime, Utc};
use common::frames::{Detection, DetectionFrame};
use inference_client::{
  fetch_with_retry, EndpointTracker, FetchEvent, InferenceClient, InferenceError,
};
use reqwest::Url;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use telemetry::metrics::{ACTIVE_SESSIONS, POLL_CYCLES};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
  Idle,
  Fetching,
  RetryWait,
  Classifying,
  Reconciling,
  Aggregating,
  Failed,
}

/// Connection indicator shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
  /// No cycle has completed yet
  NoData,
  Connected,
  /// Was connected before, the latest cycle failed
  ConnectionLost,
  /// Never connected and failing
  Unreachable,
  /// The endpoint answered but the answer was unusable
  Malformed,
}

impl ConnectionStatus {
  pub fn after_failure(self, err: &InferenceError) -> Self {
    if err.is_malformed() {
      return ConnectionStatus::Malformed;
    }
    match self {
      ConnectionStatus::NoData | ConnectionStatus::Unreachable => ConnectionStatus::Unreachable,
      ConnectionStatus::Connected
      | ConnectionStatus::ConnectionLost
      | ConnectionStatus::Malformed => ConnectionStatus::ConnectionLost,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
  pub session_id: String,
  pub endpoint: String,
  pub interval_ms: u64,
  pub cycle_state: CycleState,
  pub connection: ConnectionStatus,
  pub last_attempt: Option<DateTime<Utc>>,
  pub last_success: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
  pub cycles_completed: u64,
  pub cycles_failed: u64,
  /// Fetches that went to a different endpoint than the one before
  pub endpoint_changes: u64,
  pub last_summary: Option<ReconcileSummary>,
  pub stopped: bool,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
  pub session_id: String,
  pub endpoint: Url,
  pub interval: Duration,
  pub fetch_timeout: Duration,
  pub aggregator: AggregatorConfig,
}

struct SessionShared {
  status: StdRwLock<SessionStatus>,
  aggregator: RwLock<PresentationAggregator>,
}

impl SessionShared {
  fn update(&self, f: impl FnOnce(&mut SessionStatus)) {
    let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut status);
  }

  fn set_state(&self, state: CycleState) {
    self.update(|s| s.cycle_state = state);
  }

  fn snapshot(&self) -> SessionStatus {
    self
      .status
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

pub struct PollingSession {
  id: String,
  endpoint: Url,
  token: CancellationToken,
  shared: Arc<SessionShared>,
  handle: JoinHandle<()>,
}

impl PollingSession {
  /// Start polling immediately. The first cycle runs right away, later ones
  /// on every `interval` tick; ticks that fire while a cycle is still running
  /// are skipped. `endpoints` carries the endpoint of a session this one
  /// replaces, if any.
  pub fn spawn(
    config: SessionConfig,
    client: Arc<dyn InferenceClient>,
    reconciler: Arc<IdentityReconciler>,
    endpoints: EndpointTracker,
  ) -> Self {
    let shared = Arc::new(SessionShared {
      status: StdRwLock::new(SessionStatus {
        session_id: config.session_id.clone(),
        endpoint: config.endpoint.to_string(),
        interval_ms: config.interval.as_millis() as u64,
        cycle_state: CycleState::Idle,
        connection: ConnectionStatus::NoData,
        last_attempt: None,
        last_success: None,
        last_error: None,
        cycles_completed: 0,
        cycles_failed: 0,
        endpoint_changes: 0,
        last_summary: None,
        stopped: false,
      }),
      aggregator: RwLock::new(PresentationAggregator::new(config.aggregator)),
    });
    let token = CancellationToken::new();
    let id = config.session_id.clone();
    let endpoint = config.endpoint.clone();

    let worker = SessionWorker {
      config,
      client,
      reconciler,
      shared: shared.clone(),
      token: token.clone(),
      endpoints,
    };
    ACTIVE_SESSIONS.inc();
    let handle = tokio::spawn(worker.run());

    Self {
      id,
      endpoint,
      token,
      shared,
      handle,
    }
  }

  pub fn status(&self) -> SessionStatus {
    self.shared.snapshot()
  }

  pub async fn view(&self) -> PresentationView {
    self.shared.aggregator.read().await.view()
  }

  /// Cancel and wait for the loop to exit. Any in-flight fetch is dropped.
  pub async fn stop(self) -> SessionStatus {
    self.token.cancel();
    if let Err(err) = self.handle.await {
      warn!(session = %self.id, error = %err, "polling task ended abnormally");
    }
    self.shared.snapshot()
  }
}

struct SessionWorker {
  config: SessionConfig,
  client: Arc<dyn InferenceClient>,
  reconciler: Arc<IdentityReconciler>,
  shared: Arc<SessionShared>,
  token: CancellationToken,
  endpoints: EndpointTracker,
}

impl SessionWorker {
  async fn run(mut self) {
    info!(
      session = %self.config.session_id,
      endpoint = %self.config.endpoint,
      interval_ms = self.config.interval.as_millis() as u64,
      "polling session started"
    );

    let mut ticker = tokio::time::interval(self.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        biased;
        _ = self.token.cancelled() => break,
        _ = ticker.tick() => {}
      }
      if self.run_cycle().await.is_break() {
        break;
      }
    }

    self.shared.update(|s| {
      s.cycle_state = CycleState::Idle;
      s.stopped = true;
    });
    ACTIVE_SESSIONS.dec();
    info!(session = %self.config.session_id, "polling session stopped");
  }

  async fn run_cycle(&mut self) -> ControlFlow<()> {
    let started = Utc::now();
    self.shared.update(|s| {
      s.cycle_state = CycleState::Fetching;
      s.last_attempt = Some(started);
    });

    let token = self.token.clone();
    let fetched = tokio::select! {
      biased;
      _ = token.cancelled() => return ControlFlow::Break(()),
      result = self.fetch() => result,
    };

    let frame = match fetched {
      Ok(frame) => frame,
      Err(err) => {
        self.record_failure(&err);
        return ControlFlow::Continue(());
      }
    };

    // A cancel that raced with the end of the fetch still wins.
    if self.token.is_cancelled() {
      return ControlFlow::Break(());
    }

    self.shared.set_state(CycleState::Classifying);
    let classification = classify(&frame);

    self.shared.set_state(CycleState::Reconciling);
    let summary = self
      .reconciler
      .reconcile_classified(&classification, frame.timestamp, &self.token)
      .await;
    if summary.failed > 0 {
      warn!(
        session = %self.config.session_id,
        failed = summary.failed,
        succeeded = summary.succeeded,
        "some detections could not be reconciled"
      );
    }

    self.shared.set_state(CycleState::Aggregating);
    let detections: Vec<Detection> = classification.detections().cloned().collect();
    {
      let mut aggregator = self.shared.aggregator.write().await;
      aggregator.record_frame(&frame, &classification);
      aggregator.record_detection_history(&detections, frame.timestamp);
    }

    POLL_CYCLES.with_label_values(&["success"]).inc();
    debug!(
      session = %self.config.session_id,
      people = frame.people_count,
      detections = classification.len(),
      "polling cycle completed"
    );
    self.shared.update(|s| {
      s.cycle_state = CycleState::Idle;
      s.connection = ConnectionStatus::Connected;
      s.last_success = Some(frame.timestamp);
      s.last_error = None;
      s.cycles_completed += 1;
      s.last_summary = Some(summary);
    });

    if self.token.is_cancelled() {
      ControlFlow::Break(())
    } else {
      ControlFlow::Continue(())
    }
  }

  async fn fetch(&mut self) -> Result<DetectionFrame, InferenceError> {
    let endpoint = &self.config.endpoint;
    if self.endpoints.note(endpoint) {
      info!(session = %self.config.session_id, endpoint = %endpoint, "inference endpoint changed");
      self.shared.update(|s| s.endpoint_changes += 1);
    }

    let shared = self.shared.as_ref();
    let session = self.config.session_id.as_str();
    let policy = self.client.retry_policy();

    fetch_with_retry(
      self.client.as_ref(),
      endpoint,
      self.config.fetch_timeout,
      &policy,
      |event| match event {
        FetchEvent::Attempt(_) => shared.set_state(CycleState::Fetching),
        FetchEvent::Retry(event) => {
          shared.set_state(CycleState::RetryWait);
          warn!(
            session,
            attempt = event.attempt + 1,
            max_attempts = event.max_attempts,
            delay_ms = event.delay.as_millis() as u64,
            error = %event.error,
            "fetch failed, retrying"
          );
        }
      },
    )
    .await
  }

  /// The session stays `Failed` until the next cycle starts.
  fn record_failure(&self, err: &InferenceError) {
    POLL_CYCLES.with_label_values(&["failed"]).inc();
    self.shared.update(|s| {
      s.cycle_state = CycleState::Failed;
      s.connection = s.connection.after_failure(err);
      s.last_error = Some(err.to_string());
      s.cycles_failed += 1;
    });
    warn!(
      session = %self.config.session_id,
      error = %err,
      "polling cycle failed"
    );
  }
}

/// Running sessions keyed by id. Starting a session under an existing id
/// replaces (and cancels) the old one.
#[derive(Default)]
pub struct SessionRegistry {
  sessions: RwLock<HashMap<String, PollingSession>>,
}

impl SessionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn start(
    &self,
    config: SessionConfig,
    client: Arc<dyn InferenceClient>,
    reconciler: Arc<IdentityReconciler>,
  ) -> String {
    let id = config.session_id.clone();
    let previous_endpoint = self
      .sessions
      .read()
      .await
      .get(&id)
      .map(|s| s.endpoint.clone());
    let session = PollingSession::spawn(
      config,
      client,
      reconciler,
      EndpointTracker::starting_at(previous_endpoint),
    );
    let previous = {
      let mut sessions = self.sessions.write().await;
      sessions.insert(id.clone(), session)
    };
    if let Some(previous) = previous {
      info!(session = %id, "replacing running polling session");
      previous.stop().await;
    }
    id
  }

  pub async fn stop(&self, id: &str) -> Option<SessionStatus> {
    let session = self.sessions.write().await.remove(id)?;
    Some(session.stop().await)
  }

  pub async fn status(&self, id: &str) -> Option<SessionStatus> {
    self.sessions.read().await.get(id).map(PollingSession::status)
  }

  pub async fn view(&self, id: &str) -> Option<(SessionStatus, PresentationView)> {
    let sessions = self.sessions.read().await;
    let session = sessions.get(id)?;
    Some((session.status(), session.view().await))
  }

  pub async fn list(&self) -> Vec<SessionStatus> {
    let sessions = self.sessions.read().await;
    let mut out: Vec<SessionStatus> = sessions.values().map(PollingSession::status).collect();
    out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    out
  }

  pub async fn shutdown(&self) {
    let drained: Vec<PollingSession> = {
      let mut sessions = self.sessions.write().await;
      sessions.drain().map(|(_, s)| s).collect()
    };
    for session in drained {
      session.stop().await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::reconciler::ReconcilerLimits;
  use crate::store::{IdentityStore, MemoryIdentityStore};
  use async_trait::async_trait;
  use common::identities::KnownIdentity;
  use inference_client::{ApiStatus, EmbeddingImage, EmbeddingResult, RetryPolicy};
  use serde_json::json;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Mutex;

  /// Serves scripted single-attempt results, then `fallback` forever.
  struct ScriptedInference {
    base: Url,
    delay: Duration,
    script: Mutex<VecDeque<Result<DetectionFrame, InferenceError>>>,
    fallback: Result<DetectionFrame, InferenceError>,
    calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
  }

  impl ScriptedInference {
    fn new(
      delay: Duration,
      script: Vec<Result<DetectionFrame, InferenceError>>,
      fallback: Result<DetectionFrame, InferenceError>,
    ) -> Arc<Self> {
      Arc::new(Self {
        base: Url::parse("http://edge.test:8000").unwrap(),
        delay,
        script: Mutex::new(script.into()),
        fallback,
        calls: AtomicU32::new(0),
        in_flight: AtomicU32::new(0),
        max_in_flight: AtomicU32::new(0),
      })
    }
  }

  #[async_trait]
  impl InferenceClient for ScriptedInference {
    fn base_url(&self) -> &Url {
      &self.base
    }

    fn retry_policy(&self) -> RetryPolicy {
      RetryPolicy::new(3, Duration::from_millis(100))
    }

    async fn fetch_once(
      &self,
      _endpoint: &Url,
      _timeout: Duration,
    ) -> Result<DetectionFrame, InferenceError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.max_in_flight.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(self.delay).await;
      self.in_flight.fetch_sub(1, Ordering::SeqCst);
      let next = self.script.lock().unwrap().pop_front();
      next.unwrap_or_else(|| self.fallback.clone())
    }

    async fn api_status(&self, _timeout: Duration) -> ApiStatus {
      ApiStatus::error("not scripted")
    }

    async fn calculate_average_embedding(
      &self,
      _username: &str,
      _images: Vec<EmbeddingImage>,
      _timeout: Duration,
    ) -> Result<EmbeddingResult, InferenceError> {
      Err(InferenceError::Rejected("not scripted".into()))
    }
  }

  fn alice_frame() -> DetectionFrame {
    DetectionFrame::from_metadata(
      &json!({
        "fps": 24.3,
        "people_count": 1,
        "bboxes": [{"name": "alice", "similarity": 0.91, "bbox": [10, 10, 50, 50]}]
      }),
      Utc::now(),
    )
    .unwrap()
  }

  async fn reconciler() -> (Arc<IdentityReconciler>, Arc<MemoryIdentityStore>) {
    let store = Arc::new(MemoryIdentityStore::new());
    store.create_known(&KnownIdentity::new("alice")).await.unwrap();
    let reconciler = Arc::new(IdentityReconciler::new(
      store.clone(),
      ReconcilerLimits::default(),
    ));
    (reconciler, store)
  }

  fn spawn(
    config: SessionConfig,
    client: Arc<ScriptedInference>,
    reconciler: Arc<IdentityReconciler>,
  ) -> PollingSession {
    PollingSession::spawn(config, client, reconciler, EndpointTracker::default())
  }

  fn config(interval_ms: u64) -> SessionConfig {
    config_for("cam-1", "http://edge.test:8000", interval_ms)
  }

  fn config_for(session_id: &str, endpoint: &str, interval_ms: u64) -> SessionConfig {
    SessionConfig {
      session_id: session_id.into(),
      endpoint: Url::parse(endpoint).unwrap(),
      interval: Duration::from_millis(interval_ms),
      fetch_timeout: Duration::from_secs(1),
      aggregator: AggregatorConfig::default(),
    }
  }

  #[test]
  fn connection_status_transitions() {
    let network = InferenceError::Network("refused".into());
    let malformed = InferenceError::MalformedData("bad json".into());
    assert_eq!(
      ConnectionStatus::NoData.after_failure(&network),
      ConnectionStatus::Unreachable
    );
    assert_eq!(
      ConnectionStatus::Connected.after_failure(&network),
      ConnectionStatus::ConnectionLost
    );
    assert_eq!(
      ConnectionStatus::Connected.after_failure(&malformed),
      ConnectionStatus::Malformed
    );
    assert_eq!(
      ConnectionStatus::NoData.after_failure(&InferenceError::HttpStatus { code: 404 }),
      ConnectionStatus::Malformed
    );
  }

  #[tokio::test(start_paused = true)]
  async fn successful_cycles_reconcile_and_aggregate() {
    let client = ScriptedInference::new(Duration::from_millis(10), vec![], Ok(alice_frame()));
    let (reconciler, store) = reconciler().await;
    let session = spawn(config(1000), client.clone(), reconciler);

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let status = session.status();
    assert_eq!(status.connection, ConnectionStatus::Connected);
    assert_eq!(status.cycles_completed, 3);
    assert_eq!(status.last_summary.as_ref().unwrap().succeeded, 1);

    let view = session.view().await;
    assert_eq!(view.fps.len(), 3);
    assert_eq!(view.history.len(), 3);
    assert_eq!(view.snapshot.unwrap().names, vec!["alice"]);

    let alice = store.find_by_username("alice").await.unwrap().unwrap();
    assert_eq!(alice.confidence_history.len(), 3);

    let stopped = session.stop().await;
    assert!(stopped.stopped);
  }

  #[tokio::test(start_paused = true)]
  async fn status_distinguishes_lost_from_unreachable() {
    let refused = Err(InferenceError::Network("connection refused".into()));

    let never = ScriptedInference::new(Duration::ZERO, vec![], refused.clone());
    let (reconciler, _) = reconciler().await;
    let session = spawn(config(1000), never, reconciler.clone());
    assert_eq!(session.status().connection, ConnectionStatus::NoData);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = session.status();
    assert_eq!(status.connection, ConnectionStatus::Unreachable);
    assert_eq!(status.cycle_state, CycleState::Failed);
    assert_eq!(status.cycles_failed, 1);
    assert!(status.last_error.is_some());
    session.stop().await;

    let dropped = ScriptedInference::new(Duration::ZERO, vec![Ok(alice_frame())], refused);
    let session = spawn(config(1000), dropped, reconciler);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = session.status();
    assert_eq!(status.connection, ConnectionStatus::ConnectionLost);
    assert_eq!(status.cycles_completed, 1);
    assert_eq!(status.cycles_failed, 1);
    session.stop().await;
  }

  #[tokio::test(start_paused = true)]
  async fn malformed_response_is_reported_without_retry() {
    let client = ScriptedInference::new(
      Duration::ZERO,
      vec![],
      Err(InferenceError::MalformedData("bboxes must be an array".into())),
    );
    let (reconciler, _) = reconciler().await;
    let session = spawn(config(1000), client.clone(), reconciler);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(session.status().connection, ConnectionStatus::Malformed);
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    session.stop().await;
  }

  #[tokio::test(start_paused = true)]
  async fn slow_fetches_never_overlap() {
    let client = ScriptedInference::new(Duration::from_millis(2500), vec![], Ok(alice_frame()));
    let (reconciler, _) = reconciler().await;
    let session = spawn(config(1000), client.clone(), reconciler);

    tokio::time::sleep(Duration::from_millis(9_000)).await;
    session.stop().await;

    assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);
    // Each cycle takes 2.5s and late ticks are skipped rather than queued.
    assert!(client.calls.load(Ordering::SeqCst) <= 4);
  }

  #[tokio::test(start_paused = true)]
  async fn cancel_during_fetch_prevents_reconcile() {
    let client = ScriptedInference::new(Duration::from_millis(1000), vec![], Ok(alice_frame()));
    let (reconciler, store) = reconciler().await;
    let session = spawn(config(5000), client.clone(), reconciler);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.status().cycle_state, CycleState::Fetching);
    let status = session.stop().await;

    tokio::time::sleep(Duration::from_millis(10_000)).await;
    assert!(status.stopped);
    assert_eq!(status.cycles_completed, 0);
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    let alice = store.find_by_username("alice").await.unwrap().unwrap();
    assert!(alice.confidence_history.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn registry_replaces_sessions_with_same_id() {
    let client = ScriptedInference::new(Duration::ZERO, vec![], Ok(alice_frame()));
    let (reconciler, _) = reconciler().await;
    let registry = SessionRegistry::new();

    registry
      .start(config(1000), client.clone(), reconciler.clone())
      .await;
    registry.start(config(2000), client, reconciler).await;

    let list = registry.list().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].interval_ms, 2000);

    let stopped = registry.stop("cam-1").await.unwrap();
    assert!(stopped.stopped);
    assert_eq!(stopped.endpoint_changes, 0);
    assert!(registry.status("cam-1").await.is_none());
    assert!(registry.stop("cam-1").await.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn failed_state_lasts_until_next_cycle() {
    let client = ScriptedInference::new(
      Duration::ZERO,
      vec![Err(InferenceError::HttpStatus { code: 404 })],
      Ok(alice_frame()),
    );
    let (reconciler, _) = reconciler().await;
    let session = spawn(config(1000), client, reconciler);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.status().cycle_state, CycleState::Failed);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let status = session.status();
    assert_eq!(status.cycle_state, CycleState::Idle);
    assert_eq!(status.cycles_completed, 1);
    session.stop().await;
  }

  #[tokio::test(start_paused = true)]
  async fn sessions_sharing_a_client_track_their_own_endpoint() {
    let client = ScriptedInference::new(Duration::from_millis(5), vec![], Ok(alice_frame()));
    let (reconciler, _) = reconciler().await;
    let registry = SessionRegistry::new();

    registry
      .start(
        config_for("cam-1", "http://edge-a.test:8000", 1000),
        client.clone(),
        reconciler.clone(),
      )
      .await;
    registry
      .start(
        config_for("cam-2", "http://edge-b.test:8000", 1000),
        client.clone(),
        reconciler,
      )
      .await;
    tokio::time::sleep(Duration::from_millis(4500)).await;

    for status in registry.list().await {
      assert!(status.cycles_completed >= 4);
      assert_eq!(status.endpoint_changes, 0, "{}", status.session_id);
    }
    registry.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn replacing_a_session_on_a_new_endpoint_is_reported_once() {
    let client = ScriptedInference::new(Duration::ZERO, vec![], Ok(alice_frame()));
    let (reconciler, _) = reconciler().await;
    let registry = SessionRegistry::new();

    registry
      .start(
        config_for("cam-1", "http://edge-a.test:8000", 1000),
        client.clone(),
        reconciler.clone(),
      )
      .await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    registry
      .start(
        config_for("cam-1", "http://edge-b.test:8000", 1000),
        client,
        reconciler,
      )
      .await;
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let status = registry.status("cam-1").await.unwrap();
    assert_eq!(status.endpoint, "http://edge-b.test:8000/");
    assert!(status.cycles_completed >= 2);
    assert_eq!(status.endpoint_changes, 1);
    registry.shutdown().await;
  }
}
