use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Inference Client Metrics ====
    pub static ref INFERENCE_FETCH_ATTEMPTS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "facewatch_inference_fetch_attempts_total",
                "Single fetch attempts against the inference endpoint",
            ),
            &["result"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref INFERENCE_FETCH_LATENCY: Histogram = {
        let metric = Histogram::with_opts(
            HistogramOpts::new(
                "facewatch_inference_fetch_seconds",
                "Round trip time of successful metadata fetches",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Polling Session Metrics ====
    pub static ref POLL_CYCLES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("facewatch_poll_cycles_total", "Completed polling cycles"),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref ACTIVE_SESSIONS: IntGauge = {
        let metric = IntGauge::new(
            "facewatch_active_polling_sessions",
            "Number of running polling sessions",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Reconciliation Metrics ====
    pub static ref RECONCILED_DETECTIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "facewatch_reconciled_detections_total",
                "Detections applied to identity records",
            ),
            &["kind", "status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref SKIPPED_DETECTIONS: IntCounter = {
        let metric = IntCounter::new(
            "facewatch_skipped_detections_total",
            "Malformed detections dropped during classification",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref UNREGISTERED_DETECTIONS: IntCounter = {
        let metric = IntCounter::new(
            "facewatch_unregistered_detections_total",
            "Known-name detections without a provisioned identity",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref UNKNOWN_EVICTIONS: IntCounter = {
        let metric = IntCounter::new(
            "facewatch_unknown_identity_evictions_total",
            "Unknown identity records evicted by the count cap",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Encode the registry in the Prometheus text exposition format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_gauge_accessible() {
        ACTIVE_SESSIONS.set(3);
        assert_eq!(ACTIVE_SESSIONS.get(), 3);
    }

    #[test]
    fn test_reconcile_counters_accessible() {
        let before = RECONCILED_DETECTIONS
            .with_label_values(&["known", "success"])
            .get();
        RECONCILED_DETECTIONS
            .with_label_values(&["known", "success"])
            .inc();
        assert_eq!(
            RECONCILED_DETECTIONS
                .with_label_values(&["known", "success"])
                .get(),
            before + 1
        );
    }

    #[test]
    fn test_encode_metrics_succeeds() {
        POLL_CYCLES.with_label_values(&["success"]).inc();
        let encoded = encode_metrics().expect("metrics should encode");
        assert!(encoded.contains("facewatch_poll_cycles_total"));
    }
}
