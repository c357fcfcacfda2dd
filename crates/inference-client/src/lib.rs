//! Client for the edge face-recognition inference service.
//!
//! The service exposes `/metadata` (latest detections), `/status`,
//! `/video_feed` (MJPEG) and `/calculate_average_embedding`. Every request is
//! bounded by a deadline, and metadata fetches are retried with exponential
//! backoff according to a [`RetryPolicy`].

pub mod client;
pub mod error;
pub mod retry;

pub use client::{
    fetch_with_retry, ApiStatus, EmbeddingImage, EmbeddingResult, EndpointTracker, FetchEvent,
    FetchedFrame, HttpInferenceClient, InferenceClient,
};
pub use error::InferenceError;
pub use retry::{RetryEvent, RetryPolicy};
