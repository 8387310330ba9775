use crate::handlers::common::{
    created_response, ensure_can_access, map_service_error, success_response,
};
use crate::{
    auth::AuthUser,
    entities::order::OrderStatus,
    errors::{ApiError, ServiceError},
    services::orders::{CreateOrderInput, OrderListQuery},
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Customer order endpoints. The caller applies authentication.
pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order))
        .route("/:id", get(get_order))
        .route("/user-orders/:user_id", get(list_user_orders))
}

/// Back-office order endpoints. The caller applies the admin role.
pub fn order_admin_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders))
        .route("/update-status/:id", put(update_order_status))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    /// processing, designed, delivered or cancelled
    pub status: String,
}

/// Record a checkout
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderInput,
    responses(
        (status = 201, description = "Order created", body = crate::entities::order::Model),
        (status = 400, description = "Inconsistent totals or refused coupon", body = crate::errors::ErrorResponse),
        (status = 409, description = "An order already exists for the payment intent", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateOrderInput>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .orders
        .create_order(user.user_id, payload)
        .await
        .map_err(map_service_error)?;
    Ok(created_response(order))
}

/// Get an order by id
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order", body = crate::entities::order::Model),
        (status = 403, description = "Order belongs to another user", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .orders
        .get_order(id)
        .await
        .map_err(map_service_error)?;
    ensure_can_access(&user, order.user_id)?;
    Ok(success_response(order))
}

/// List one user's orders, newest first
#[utoipa::path(
    get,
    path = "/api/v1/orders/user-orders/{user_id}",
    params(("user_id" = Uuid, Path, description = "Customer id")),
    responses(
        (status = 200, description = "Orders", body = [crate::entities::order::Model]),
        (status = 403, description = "Not the caller's orders", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn list_user_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_can_access(&user, user_id)?;
    let orders = state
        .services
        .orders
        .list_user_orders(user_id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(orders))
}

/// List all orders with filtering and pagination
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(OrderListQuery),
    responses(
        (status = 200, description = "Page of orders", body = crate::services::orders::OrderPage),
        (status = 400, description = "Unknown status filter", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrderListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state
        .services
        .orders
        .list_orders(query)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(page))
}

/// Move an order to a new fulfillment status
#[utoipa::path(
    put,
    path = "/api/v1/orders/update-status/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Order updated", body = crate::entities::order::Model),
        (status = 400, description = "Unknown status or transition not allowed", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order changed concurrently", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateOrderStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = OrderStatus::from_str(payload.status.trim().to_lowercase().as_str()).map_err(
        |_| ServiceError::ValidationError(format!("Unknown order status {}", payload.status)),
    )?;
    let order = state
        .services
        .orders
        .update_order_status(id, status)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(order))
}
