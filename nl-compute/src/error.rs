use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use uuid::Uuid;

use crate::{file_guard::FileGuardError, wire::ErrorResponse};

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("project {0} not found")]
    ProjectNotFound(Uuid),
    #[error("node {0} not found")]
    NodeNotFound(Uuid),
    #[error("file not found")]
    FileNotFound,
    #[error("node {0} already exists")]
    NodeAlreadyExists(Uuid),
    #[error("emulator type {0} is not enabled on this compute")]
    UnsupportedEmulatorType(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("project storage failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ComputeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ComputeError::ProjectNotFound(_)
            | ComputeError::NodeNotFound(_)
            | ComputeError::FileNotFound => StatusCode::NOT_FOUND,
            ComputeError::NodeAlreadyExists(_) => StatusCode::CONFLICT,
            ComputeError::UnsupportedEmulatorType(_) | ComputeError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ComputeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ComputeError::ProjectNotFound(_)
            | ComputeError::NodeNotFound(_)
            | ComputeError::FileNotFound => "not_found",
            ComputeError::NodeAlreadyExists(_) => "already_exists",
            ComputeError::UnsupportedEmulatorType(_) => "unsupported_emulator_type",
            ComputeError::InvalidRequest(_) => "invalid_request",
            ComputeError::Io(_) => "internal",
        }
    }
}

impl From<FileGuardError> for ComputeError {
    fn from(err: FileGuardError) -> Self {
        match err {
            FileGuardError::NotFound => ComputeError::FileNotFound,
            FileGuardError::Io(err) => ComputeError::Io(err),
        }
    }
}

impl IntoResponse for ComputeError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(ErrorResponse {
                kind: self.kind().to_string(),
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
