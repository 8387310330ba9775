use crate::handlers::common::{
    created_response, map_service_error, message_response, success_response, validate_input,
};
use crate::{
    auth::AuthUser,
    errors::{ApiError, ServiceError},
    services::coupons::{CartLineRef, CouponInput, CouponPatch, CouponSummary},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

/// Checkout-time validation. The caller applies authentication.
pub fn coupon_validation_routes() -> Router<AppState> {
    Router::new().route("/validate", axum::routing::post(validate_coupon))
}

/// Coupon administration. The caller applies the admin role.
pub fn coupon_admin_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_coupons).post(create_coupon))
        .route("/:id", patch(update_coupon).delete(delete_coupon))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidateCouponRequest {
    pub code: String,
    pub cart_amount: Decimal,
    #[serde(default)]
    pub cart_items: Vec<CartLineRef>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponCheck {
    pub valid: bool,
    pub coupon: CouponSummary,
    pub discount_amount: Decimal,
}

/// Body returned when a coupon is refused.
#[derive(Debug, Serialize, ToSchema)]
pub struct CouponRefusal {
    pub success: bool,
    pub valid: bool,
    pub error: String,
    /// Stable reason code, e.g. `expired`
    pub reason: String,
}

/// Validate a coupon against the caller's cart
#[utoipa::path(
    post,
    path = "/api/v1/coupons/validate",
    request_body = ValidateCouponRequest,
    responses(
        (status = 200, description = "Coupon applies", body = CouponCheck),
        (status = 400, description = "Coupon refused", body = CouponRefusal)
    ),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn validate_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ValidateCouponRequest>,
) -> Result<Response, ApiError> {
    let result = state
        .services
        .coupons
        .validate(
            &payload.code,
            user.user_id,
            payload.cart_amount,
            &payload.cart_items,
        )
        .await;

    match result {
        Ok(validation) => Ok(success_response(CouponCheck {
            valid: true,
            coupon: validation.coupon,
            discount_amount: validation.discount_amount,
        })),
        Err(ServiceError::CouponRejected(rejection)) => {
            info!(user_id = %user.user_id, reason = rejection.code(), "coupon refused");
            let body = CouponRefusal {
                success: false,
                valid: false,
                error: rejection.to_string(),
                reason: rejection.code().to_string(),
            };
            Ok((StatusCode::BAD_REQUEST, Json(body)).into_response())
        }
        Err(other) => Err(map_service_error(other)),
    }
}

/// List all coupons
#[utoipa::path(
    get,
    path = "/api/v1/coupons",
    responses((status = 200, description = "All coupons", body = [crate::entities::coupon::Model])),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn list_coupons(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let coupons = state
        .services
        .coupons
        .list_coupons()
        .await
        .map_err(map_service_error)?;
    Ok(success_response(coupons))
}

/// Create a coupon
#[utoipa::path(
    post,
    path = "/api/v1/coupons",
    request_body = CouponInput,
    responses(
        (status = 201, description = "Coupon created", body = crate::entities::coupon::Model),
        (status = 400, description = "Invalid coupon", body = crate::errors::ErrorResponse),
        (status = 409, description = "Code already exists", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn create_coupon(
    State(state): State<AppState>,
    Json(payload): Json<CouponInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let coupon = state
        .services
        .coupons
        .create_coupon(payload)
        .await
        .map_err(map_service_error)?;
    Ok(created_response(coupon))
}

/// Update coupon terms or usage settings
#[utoipa::path(
    patch,
    path = "/api/v1/coupons/{id}",
    params(("id" = Uuid, Path, description = "Coupon id")),
    request_body = CouponPatch,
    responses(
        (status = 200, description = "Coupon updated", body = crate::entities::coupon::Model),
        (status = 404, description = "Coupon not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn update_coupon(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CouponPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let coupon = state
        .services
        .coupons
        .update_coupon(id, payload)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(coupon))
}

/// Delete a coupon
#[utoipa::path(
    delete,
    path = "/api/v1/coupons/{id}",
    params(("id" = Uuid, Path, description = "Coupon id")),
    responses(
        (status = 200, description = "Coupon deleted"),
        (status = 404, description = "Coupon not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn delete_coupon(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .services
        .coupons
        .delete_coupon(id)
        .await
        .map_err(map_service_error)?;
    Ok(message_response("Coupon deleted"))
}
