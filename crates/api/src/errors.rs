use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use pixgate_store::StoreError;

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound => json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "not found"),
        StoreError::InvalidCursor => {
            json_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "invalid cursor")
        }
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "CONFLICT", msg),
        StoreError::Storage(msg) => {
            tracing::error!(error = %msg, "repository failure");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "internal error",
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
