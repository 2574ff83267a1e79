//! HTTP error mapping
//!
//! Every handler returns `Result<HttpResponse, ApiError>`; the error is
//! rendered in the same `ApiResponse` envelope as successful responses.

use crate::api::ApiResponse;
use actix_web::error::BlockingError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use automentor_core::AgentError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Worker pool unavailable: {0}")]
    Blocking(#[from] BlockingError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Agent(err) => match err {
                AgentError::Validation(_) => StatusCode::BAD_REQUEST,
                AgentError::CapabilityTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                AgentError::Generation(_) | AgentError::Embedding(_) | AgentError::Tool { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                AgentError::InvalidState(_) => StatusCode::CONFLICT,
                AgentError::IncompleteGoal { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                AgentError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Blocking(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("[API] {}", self);
        } else {
            log::debug!("[API] {}", self);
        }
        HttpResponse::build(status).json(ApiResponse::<()>::error(&self.to_string()))
    }
}
