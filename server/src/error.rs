use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::mbtiles::StoreError;

/// Errors surfaced to HTTP clients. Per-tile failures inside running jobs
/// never reach this type; they only bump job counters.
#[derive(Debug, Error)]
pub enum TileServerError {
    #[error("unknown chart provider")]
    UnknownProvider,

    #[error("tile not found")]
    TileAbsent,

    #[error("failed to fetch tile from remote provider")]
    RemoteFetchFailure,

    #[error("invalid area: {0}")]
    InvalidArea(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("job is running; stop it before removing")]
    JobBusy,

    #[error("unknown job or action")]
    UnknownJobAction,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TileServerError {
    fn status(&self) -> StatusCode {
        match self {
            TileServerError::UnknownProvider | TileServerError::TileAbsent => {
                StatusCode::NOT_FOUND
            }
            TileServerError::RemoteFetchFailure => StatusCode::BAD_GATEWAY,
            TileServerError::InvalidArea(_) | TileServerError::InvalidParameters(_) => {
                StatusCode::BAD_REQUEST
            }
            TileServerError::JobBusy => StatusCode::CONFLICT,
            TileServerError::UnknownJobAction => StatusCode::NOT_FOUND,
            TileServerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TileServerError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
