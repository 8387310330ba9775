use crate::handlers::common::{
    created_response, map_service_error, message_response, success_response, validate_input,
};
use crate::{errors::ApiError, services::catalog::ProductInput, AppState};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, put},
    Router,
};
use uuid::Uuid;

/// Storefront catalog, no authentication.
pub fn product_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_products))
        .route("/:id", get(get_product))
}

/// Catalog administration. The caller applies the admin role.
pub fn product_admin_routes() -> Router<AppState> {
    Router::new()
        .route("/", axum::routing::post(create_product))
        .route("/all", get(list_all_products))
        .route("/:id", put(update_product).delete(delete_product))
}

/// List active products
#[utoipa::path(
    get,
    path = "/api/v1/products",
    responses((status = 200, description = "Active products, newest first", body = [crate::entities::product::Model])),
    tag = "Products"
)]
pub async fn list_products(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let products = state
        .services
        .catalog
        .list_active()
        .await
        .map_err(map_service_error)?;
    Ok(success_response(products))
}

/// List every product regardless of status
#[utoipa::path(
    get,
    path = "/api/v1/products/all",
    responses((status = 200, description = "All products", body = [crate::entities::product::Model])),
    security(("bearer_auth" = [])),
    tag = "Products"
)]
pub async fn list_all_products(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let products = state
        .services
        .catalog
        .list_all()
        .await
        .map_err(map_service_error)?;
    Ok(success_response(products))
}

/// Get a product by id
#[utoipa::path(
    get,
    path = "/api/v1/products/{id}",
    params(("id" = Uuid, Path, description = "Product id")),
    responses(
        (status = 200, description = "Product", body = crate::entities::product::Model),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Products"
)]
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let product = state
        .services
        .catalog
        .get_product(id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(product))
}

/// Create a product
#[utoipa::path(
    post,
    path = "/api/v1/products",
    request_body = ProductInput,
    responses(
        (status = 201, description = "Product created", body = crate::entities::product::Model),
        (status = 400, description = "Invalid product", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Products"
)]
pub async fn create_product(
    State(state): State<AppState>,
    Json(payload): Json<ProductInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let product = state
        .services
        .catalog
        .create_product(payload)
        .await
        .map_err(map_service_error)?;
    Ok(created_response(product))
}

/// Replace a product's details
#[utoipa::path(
    put,
    path = "/api/v1/products/{id}",
    params(("id" = Uuid, Path, description = "Product id")),
    request_body = ProductInput,
    responses(
        (status = 200, description = "Product updated", body = crate::entities::product::Model),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Products"
)]
pub async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ProductInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let product = state
        .services
        .catalog
        .update_product(id, payload)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(product))
}

/// Delete a product; cart lines holding it are dropped
#[utoipa::path(
    delete,
    path = "/api/v1/products/{id}",
    params(("id" = Uuid, Path, description = "Product id")),
    responses(
        (status = 200, description = "Product deleted"),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Products"
)]
pub async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .services
        .catalog
        .delete_product(id)
        .await
        .map_err(map_service_error)?;
    Ok(message_response("Product deleted"))
}
