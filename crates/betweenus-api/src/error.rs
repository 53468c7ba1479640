use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use betweenus_db::StoreError;
use betweenus_types::PaginationError;
use betweenus_types::api::ErrorResponse;

use crate::saga::SagaError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Invalid pagination parameters")]
    Pagination(#[from] PaginationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to create chat room")]
    Saga {
        error: SagaError,
        rollback_errors: Vec<StoreError>,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn saga(error: SagaError, rollback_errors: Vec<StoreError>) -> Self {
        Self::Saga {
            error,
            rollback_errors,
        }
    }

    pub fn join(e: tokio::task::JoinError) -> Self {
        error!("spawn_blocking join error: {}", e);
        Self::Internal(e.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Pagination(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(e) => store_status(e),
            Self::Saga { error, .. } => match error {
                SagaError::Validation(_) => StatusCode::BAD_REQUEST,
                SagaError::UserNotFound(_) | SagaError::NotFriends(..) => StatusCode::NOT_FOUND,
                SagaError::Store(_) | SagaError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            Self::Pagination(e) => Some(e.to_string()),
            Self::Saga { error, .. } => Some(error.to_string()),
            _ => None,
        }
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let details = self.details();
        if status.is_server_error() {
            error!("{} ({})", self, details.as_deref().unwrap_or("no details"));
        } else {
            warn!("{}", self);
        }

        let rollback_errors = match &self {
            Self::Saga {
                rollback_errors, ..
            } => rollback_errors.iter().map(ToString::to_string).collect(),
            _ => Vec::new(),
        };
        let body = ErrorResponse {
            message: self.to_string(),
            code: status.as_u16(),
            details,
            rollback_errors,
        };
        (status, Json(body)).into_response()
    }
}
