//! Counter accounting across a full polling cycle. Kept in its own test binary
//! because the counters are process-wide.

use anyhow::Result;
use axum::{routing::get, Json, Router};
use inference_client::{HttpInferenceClient, InferenceClient, RetryPolicy};
use recon_service::{
    aggregator::AggregatorConfig,
    config::{IdentityStoreType, ReconConfig},
    reconciler::ReconcilerLimits,
    state::AppState,
    store::{IdentityStore, MemoryIdentityStore},
};
use reqwest::Url;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use telemetry::metrics::SKIPPED_DETECTIONS;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_malformed_detection_is_counted_once_per_cycle() -> Result<()> {
    telemetry::init();
    let router = Router::new().route(
        "/metadata",
        get(|| async {
            Json(json!({
                "fps": 12.0,
                "people_count": 2,
                "bboxes": [
                    {"name": "carol", "similarity": 0.77},
                    {"bogus": true}
                ]
            }))
        }),
    );
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let base = Url::parse(&format!("http://{}", listener.local_addr()?))?;
    let server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .await
            .expect("edge server failed");
    });

    let config = ReconConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        inference_base_url: base.clone(),
        // Long enough that only the immediate first cycle runs.
        poll_interval: Duration::from_secs(60),
        fetch_timeout: Duration::from_millis(500),
        status_timeout: Duration::from_millis(500),
        retry: RetryPolicy::no_retry(),
        limits: ReconcilerLimits::default(),
        aggregator: AggregatorConfig::default(),
        store_type: IdentityStoreType::Memory,
        database_url: None,
        auto_start_polling: false,
        node_id: "metrics-node".into(),
    };
    let store = Arc::new(MemoryIdentityStore::new());
    store
        .create_known(&common::identities::KnownIdentity::new("carol"))
        .await?;
    let client: Arc<dyn InferenceClient> = Arc::new(HttpInferenceClient::new(base, config.retry)?);
    let state = AppState::new(config, client, store.clone());

    let before = SKIPPED_DETECTIONS.get();
    state.start_session("lobby".into(), None, None).await;

    let mut completed = None;
    for _ in 0..60 {
        if let Some(status) = state.sessions().status("lobby").await {
            if status.cycles_completed >= 1 {
                completed = Some(status);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let status = state.sessions().stop("lobby").await.expect("session");
    let completed = completed.expect("first cycle never completed");

    assert_eq!(status.cycles_completed, 1);
    assert_eq!(completed.last_summary.as_ref().map(|s| s.skipped), Some(1));
    assert_eq!(SKIPPED_DETECTIONS.get() - before, 1);

    let carol = store.find_by_username("carol").await?.expect("carol");
    assert_eq!(carol.confidence_history.len(), 1);

    server.abort();
    Ok(())
}
