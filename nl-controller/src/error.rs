use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use compute::{ErrorResponse, FileGuardError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Every failure the controller reports. Anything below the controller
/// boundary returns one of these; the HTTP layer turns it into
/// `{"kind": ..., "error": ...}` with [`ControllerError::status_code`].
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no free {class} port left on {host}")]
    ResourceExhausted { host: String, class: String },

    #[error("compute {compute_id} cannot host {emulator} nodes")]
    UnsupportedEmulatorType {
        compute_id: String,
        emulator: String,
    },

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("project {0} is closed")]
    ProjectClosed(String),

    #[error("compute {compute_id} is unreachable: {message}")]
    ComputeUnreachable { compute_id: String, message: String },

    #[error("compute {compute_id} rejected the request with status {status}: {body}")]
    ComputeRejected {
        compute_id: String,
        status: u16,
        body: String,
    },

    #[error("node creation failed on compute with status {status}: {body}")]
    RemoteCreateFailed { status: u16, body: String },

    #[error("node update failed on compute with status {status}: {body}")]
    RemoteUpdateFailed { status: u16, body: String },

    #[error("node deletion failed on compute with status {status}: {body}")]
    RemoteDeleteFailed { status: u16, body: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControllerError::InvalidConfiguration(_) | ControllerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ControllerError::InvalidRequest(_) | ControllerError::UnsupportedEmulatorType { .. } => {
                StatusCode::BAD_REQUEST
            }
            ControllerError::ResourceExhausted { .. }
            | ControllerError::AlreadyExists(_)
            | ControllerError::ProjectClosed(_) => StatusCode::CONFLICT,
            ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
            ControllerError::ComputeUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ControllerError::ComputeRejected { .. }
            | ControllerError::RemoteCreateFailed { .. }
            | ControllerError::RemoteUpdateFailed { .. }
            | ControllerError::RemoteDeleteFailed { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::InvalidConfiguration(_) => "invalid_configuration",
            ControllerError::InvalidRequest(_) => "invalid_request",
            ControllerError::ResourceExhausted { .. } => "resource_exhausted",
            ControllerError::UnsupportedEmulatorType { .. } => "unsupported_emulator_type",
            ControllerError::AlreadyExists(_) => "already_exists",
            ControllerError::NotFound(_) => "not_found",
            ControllerError::ProjectClosed(_) => "project_closed",
            ControllerError::ComputeUnreachable { .. } => "compute_unreachable",
            ControllerError::ComputeRejected { .. }
            | ControllerError::RemoteCreateFailed { .. }
            | ControllerError::RemoteUpdateFailed { .. }
            | ControllerError::RemoteDeleteFailed { .. } => "compute_rejected",
            ControllerError::Internal(_) => "internal",
        }
    }

    pub(crate) fn not_found(what: impl std::fmt::Display) -> Self {
        ControllerError::NotFound(what.to_string())
    }
}

impl From<FileGuardError> for ControllerError {
    fn from(err: FileGuardError) -> Self {
        match err {
            FileGuardError::NotFound => ControllerError::NotFound("file".to_string()),
            FileGuardError::Io(err) => ControllerError::Internal(format!("project file i/o: {err}")),
        }
    }
}

impl IntoResponse for ControllerError {
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
