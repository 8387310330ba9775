use crate::{
    auth::AuthUser,
    errors::{ApiError, ServiceError},
    ApiResponse,
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;
use validator::Validate;

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse::success(data))).into_response()
}

/// Success envelope carrying only a message.
pub fn message_response(message: impl Into<String>) -> Response {
    let mut body = ApiResponse::<()>::success(());
    body.data = None;
    body.message = Some(message.into());
    (StatusCode::OK, Json(body)).into_response()
}

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ApiError> {
    input
        .validate()
        .map_err(|e| ApiError::ValidationError(format!("Validation failed: {}", e)))
}

/// Map service errors to API errors
pub fn map_service_error(err: ServiceError) -> ApiError {
    ApiError::ServiceError(err)
}

/// Rejects callers that are neither `user_id` nor an admin.
pub fn ensure_can_access(user: &AuthUser, user_id: Uuid) -> Result<(), ApiError> {
    if user.can_access_user(user_id) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("Not authorized to access these records".to_string()).into())
    }
}
