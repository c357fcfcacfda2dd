use crate::error::InferenceError;
use crate::retry::{RetryEvent, RetryPolicy};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use common::frames::DetectionFrame;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::multipart::{Form, Part};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use telemetry::metrics::{INFERENCE_FETCH_ATTEMPTS, INFERENCE_FETCH_LATENCY};
use tracing::{debug, info, instrument, warn};

const STATUS_ATTEMPTS: u32 = 2;
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Result of a successful [`InferenceClient::fetch_frame`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedFrame {
    pub frame: DetectionFrame,
    /// The endpoint differs from the one used by the previous fetch
    pub endpoint_changed: bool,
}

/// Remembers the endpoint a caller last fetched from. Each polling loop owns
/// one, so callers sharing a client never see each other's endpoints.
#[derive(Debug, Clone, Default)]
pub struct EndpointTracker {
    last: Option<Url>,
}

impl EndpointTracker {
    /// A tracker that treats `endpoint` as already used.
    pub fn starting_at(endpoint: Option<Url>) -> Self {
        Self { last: endpoint }
    }

    /// Record `endpoint`. Returns true when it replaces a different,
    /// previously used endpoint.
    pub fn note(&mut self, endpoint: &Url) -> bool {
        let changed = self.last.as_ref().is_some_and(|prev| prev != endpoint);
        self.last = Some(endpoint.clone());
        changed
    }
}

/// Progress reported by [`fetch_with_retry`].
#[derive(Debug)]
pub enum FetchEvent<'a> {
    /// Attempt `n` (0-based) is about to start
    Attempt(u32),
    /// An attempt failed and the backoff sleep is about to start
    Retry(RetryEvent<'a>),
}

/// Body of `GET /status`. Status check failures are reported with `status == "error"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl ApiStatus {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
            details: Map::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == "error"
    }
}

/// One image uploaded for embedding enrolment.
#[derive(Debug, Clone)]
pub struct EmbeddingImage {
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Number of images the service used for the average
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    fn base_url(&self) -> &Url;

    fn retry_policy(&self) -> RetryPolicy;

    /// Single bounded attempt against `{endpoint}/metadata`.
    async fn fetch_once(
        &self,
        endpoint: &Url,
        timeout: Duration,
    ) -> Result<DetectionFrame, InferenceError>;

    async fn api_status(&self, timeout: Duration) -> ApiStatus;

    async fn calculate_average_embedding(
        &self,
        username: &str,
        images: Vec<EmbeddingImage>,
        timeout: Duration,
    ) -> Result<EmbeddingResult, InferenceError>;

    fn video_feed_url(&self) -> Result<Url, InferenceError> {
        endpoint_url(self.base_url(), "video_feed")
    }

    /// Fetch one frame with the client's retry policy. Each attempt is bounded
    /// by `timeout`; once the attempts are spent the last error is returned and
    /// no partial frame is produced.
    async fn fetch_frame(
        &self,
        tracker: &mut EndpointTracker,
        endpoint: &Url,
        timeout: Duration,
    ) -> Result<FetchedFrame, InferenceError> {
        let endpoint_changed = tracker.note(endpoint);
        if endpoint_changed {
            info!(endpoint = %endpoint, "inference endpoint changed");
        }
        let policy = self.retry_policy();
        let frame = fetch_with_retry(self, endpoint, timeout, &policy, |event| {
            if let FetchEvent::Retry(event) = event {
                warn!(
                    attempt = event.attempt + 1,
                    max_attempts = event.max_attempts,
                    delay_ms = event.delay.as_millis() as u64,
                    error = %event.error,
                    "metadata fetch failed, retrying"
                );
            }
        })
        .await?;
        Ok(FetchedFrame {
            frame,
            endpoint_changed,
        })
    }
}

/// Drive `fetch_once` under `policy`. `observer` is told when each attempt
/// starts and about every retry before the backoff sleep starts.
pub async fn fetch_with_retry<C, O>(
    client: &C,
    endpoint: &Url,
    timeout: Duration,
    policy: &RetryPolicy,
    observer: O,
) -> Result<DetectionFrame, InferenceError>
where
    C: InferenceClient + ?Sized,
    O: FnMut(FetchEvent<'_>) + Send,
{
    let observer = Mutex::new(observer);
    policy
        .run(
            |attempt| {
                notify(&observer, FetchEvent::Attempt(attempt));
                client.fetch_once(endpoint, timeout)
            },
            |event| notify(&observer, FetchEvent::Retry(event)),
        )
        .await
}

fn notify<O: FnMut(FetchEvent<'_>)>(observer: &Mutex<O>, event: FetchEvent<'_>) {
    let mut observer = observer.lock().unwrap_or_else(PoisonError::into_inner);
    (*observer)(event);
}

/// Join `path` onto `base`, treating `base` as a directory even without a
/// trailing slash so `http://edge:8000/api` + `metadata` keeps the `api` segment.
pub fn endpoint_url(base: &Url, path: &str) -> Result<Url, InferenceError> {
    let mut dir = base.clone();
    if !dir.path().ends_with('/') {
        let with_slash = format!("{}/", dir.path());
        dir.set_path(&with_slash);
    }
    dir.join(path)
        .map_err(|err| InferenceError::InvalidEndpoint(format!("{base}: {err}")))
}

pub struct HttpInferenceClient {
    base: Url,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpInferenceClient {
    pub fn new(base: Url, policy: RetryPolicy) -> Result<Self> {
        if !matches!(base.scheme(), "http" | "https") {
            anyhow::bail!("inference endpoint must be http or https: {base}");
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .context("failed to build inference http client")?;
        Ok(Self {
            base,
            client,
            policy,
        })
    }

    async fn get_status_once(&self, timeout: Duration) -> Result<ApiStatus, InferenceError> {
        let url = endpoint_url(&self.base, "status")?;
        let request = async {
            let resp = self
                .client
                .get(url)
                .header(ACCEPT, "application/json")
                .send()
                .await
                .map_err(|err| InferenceError::from_reqwest(err, timeout))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(InferenceError::HttpStatus {
                    code: status.as_u16(),
                });
            }
            let body = resp
                .bytes()
                .await
                .map_err(|err| InferenceError::from_reqwest(err, timeout))?;
            serde_json::from_slice::<ApiStatus>(&body)
                .map_err(|err| InferenceError::MalformedData(err.to_string()))
        };
        tokio::time::timeout(timeout, request)
            .await
            .unwrap_or(Err(InferenceError::Timeout(timeout)))
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    fn base_url(&self) -> &Url {
        &self.base
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    #[instrument(skip_all, fields(endpoint = %endpoint, timeout_ms = timeout.as_millis() as u64))]
    async fn fetch_once(
        &self,
        endpoint: &Url,
        timeout: Duration,
    ) -> Result<DetectionFrame, InferenceError> {
        let url = endpoint_url(endpoint, "metadata")?;
        let started = Instant::now();

        let request = async {
            let resp = self
                .client
                .get(url)
                .header(ACCEPT, "application/json")
                .header(CACHE_CONTROL, "no-cache")
                .send()
                .await
                .map_err(|err| InferenceError::from_reqwest(err, timeout))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(InferenceError::HttpStatus {
                    code: status.as_u16(),
                });
            }
            let body = resp
                .bytes()
                .await
                .map_err(|err| InferenceError::from_reqwest(err, timeout))?;
            let value: Value = serde_json::from_slice(&body)
                .map_err(|err| InferenceError::MalformedData(err.to_string()))?;
            DetectionFrame::from_metadata(&value, Utc::now())
                .map_err(|err| InferenceError::MalformedData(err.message().to_string()))
        };

        let result = tokio::time::timeout(timeout, request)
            .await
            .unwrap_or(Err(InferenceError::Timeout(timeout)));

        match &result {
            Ok(frame) => {
                INFERENCE_FETCH_ATTEMPTS.with_label_values(&["ok"]).inc();
                INFERENCE_FETCH_LATENCY.observe(started.elapsed().as_secs_f64());
                debug!(
                    detections = frame.detections.len(),
                    people = frame.people_count,
                    "metadata fetched"
                );
            }
            Err(err) => {
                INFERENCE_FETCH_ATTEMPTS
                    .with_label_values(&[err.kind()])
                    .inc();
                debug!(error = %err, "metadata fetch attempt failed");
            }
        }
        result
    }

    #[instrument(skip_all)]
    async fn api_status(&self, timeout: Duration) -> ApiStatus {
        let policy = RetryPolicy::new(STATUS_ATTEMPTS, STATUS_RETRY_DELAY);
        let result = policy
            .run(
                |_| self.get_status_once(timeout),
                |event| debug!(error = %event.error, "status check failed, retrying"),
            )
            .await;
        match result {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "inference status check failed");
                ApiStatus::error(err.to_string())
            }
        }
    }

    #[instrument(skip_all, fields(username = username, images = images.len()))]
    async fn calculate_average_embedding(
        &self,
        username: &str,
        images: Vec<EmbeddingImage>,
        timeout: Duration,
    ) -> Result<EmbeddingResult, InferenceError> {
        let url = endpoint_url(&self.base, "calculate_average_embedding")?;

        let mut form = Form::new().text("username", username.to_string());
        for image in images {
            let part = Part::bytes(image.data)
                .file_name(image.file_name)
                .mime_str(&image.content_type)
                .map_err(|err| {
                    InferenceError::Rejected(format!(
                        "invalid content type {}: {err}",
                        image.content_type
                    ))
                })?;
            form = form.part("files", part);
        }

        let request = async {
            let resp = self
                .client
                .post(url)
                .multipart(form)
                .send()
                .await
                .map_err(|err| InferenceError::from_reqwest(err, timeout))?;
            let status = resp.status();
            let body = resp
                .bytes()
                .await
                .map_err(|err| InferenceError::from_reqwest(err, timeout))?;
            let parsed = serde_json::from_slice::<EmbeddingResult>(&body);
            if !status.is_success() {
                // The service reports rejections with a JSON body and a 4xx code.
                if let Ok(result) = parsed {
                    if result.status == "error" {
                        return Err(InferenceError::Rejected(
                            result.message.unwrap_or_else(|| "embedding rejected".into()),
                        ));
                    }
                }
                return Err(InferenceError::HttpStatus {
                    code: status.as_u16(),
                });
            }
            parsed.map_err(|err| InferenceError::MalformedData(err.to_string()))
        };

        let result = tokio::time::timeout(timeout, request)
            .await
            .unwrap_or(Err(InferenceError::Timeout(timeout)))?;

        if result.status == "error" {
            return Err(InferenceError::Rejected(
                result
                    .message
                    .unwrap_or_else(|| "embedding rejected".into()),
            ));
        }
        if result.embedding.is_empty() {
            return Err(InferenceError::MalformedData(
                "embedding response carried no vector".into(),
            ));
        }
        info!(dimensions = result.embedding.len(), "average embedding computed");
        Ok(result)
    }
}
