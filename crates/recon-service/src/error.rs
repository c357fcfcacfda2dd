use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use inference_client::InferenceError;
use serde::Serialize;
use std::fmt::{self, Display};

#[derive(Debug)]
pub struct ApiError {
  status: StatusCode,
  message: String,
}

impl ApiError {
  pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
    Self {
      status,
      message: message.into(),
    }
  }

  pub fn bad_request(message: impl Into<String>) -> Self {
    Self::new(StatusCode::BAD_REQUEST, message)
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::new(StatusCode::NOT_FOUND, message)
  }

  pub fn conflict(message: impl Into<String>) -> Self {
    Self::new(StatusCode::CONFLICT, message)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let body = Json(ErrorBody {
      error: self.message,
    });
    (self.status, body).into_response()
  }
}

impl Display for ApiError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({})", self.message, self.status)
  }
}

impl std::error::Error for ApiError {}

impl From<anyhow::Error> for ApiError {
  fn from(value: anyhow::Error) -> Self {
    Self::internal(format!("{value:#}"))
  }
}

impl From<InferenceError> for ApiError {
  fn from(value: InferenceError) -> Self {
    let status = match &value {
      InferenceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
      InferenceError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
      InferenceError::InvalidEndpoint(_) => StatusCode::INTERNAL_SERVER_ERROR,
      _ => StatusCode::BAD_GATEWAY,
    };
    Self::new(status, value.to_string())
  }
}

#[derive(Serialize)]
struct ErrorBody {
  error: String,
}
