use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rpod_orchestrator::{ErrorKind, SessionError};
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
    Session(SessionError),
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::ResourceExhausted => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Configuration
        | ErrorKind::MissingHostPath
        | ErrorKind::NameCollision
        | ErrorKind::Backend
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorKind::InvalidInput, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Internal, msg),
            ApiError::Session(err) => (status_for(err.kind()), err.kind(), err.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(%status, kind = kind.as_str(), "{message}");
        }

        (
            status,
            Json(json!({ "ok": false, "error": message, "kind": kind })),
        )
            .into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError::Session(err)
    }
}

impl From<rpod_provider::BackendError> for ApiError {
    fn from(err: rpod_provider::BackendError) -> Self {
        ApiError::Session(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (SessionError::NotFound("bob".into()), StatusCode::NOT_FOUND),
            (SessionError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (
                SessionError::ResourceExhausted("full".into()),
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (
                SessionError::BackendUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SessionError::Configuration("bad yaml".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                SessionError::MissingHostPath(PathBuf::from("/opt/x")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }
}
