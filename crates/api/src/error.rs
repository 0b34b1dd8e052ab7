//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::DomainError;
use event_store::EventStoreError;
use projections::QueryError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client.
    BadRequest(String),
    /// Command ingestion error.
    Domain(DomainError),
    /// Read-side query error.
    Query(QueryError),
    /// Event store read error.
    Store(EventStoreError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Domain(err) => domain_error_to_response(err),
            ApiError::Query(err) => query_error_to_response(err),
            ApiError::Store(err) => {
                tracing::error!(error = %err, "event store read failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn domain_error_to_response(err: DomainError) -> (StatusCode, String) {
    match &err {
        DomainError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        DomainError::StoreWrite(_) => {
            tracing::error!(error = %err, "command could not be stored");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn query_error_to_response(err: QueryError) -> (StatusCode, String) {
    match &err {
        QueryError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        QueryError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        QueryError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, err.to_string()),
        QueryError::StoreRead(_) => {
            tracing::error!(error = %err, "read model query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::Domain(err)
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        ApiError::Query(err)
    }
}

impl From<EventStoreError> for ApiError {
    fn from(err: EventStoreError) -> Self {
        ApiError::Store(err)
    }
}
