use crate::handlers::common::{map_service_error, success_response};
use crate::{
    auth::AuthUser,
    entities::cart_item::{AttachedFile, ClientInfo},
    errors::ApiError,
    services::{cart::AddToCartInput, uploads::FileStore},
    AppState,
};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    response::IntoResponse,
    routing::{delete, get},
    Router,
};
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

/// Attachment types accepted on cart lines.
const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/zip",
    "application/x-zip-compressed",
];

/// Most attachments accepted in one request.
const MAX_FILES: usize = 10;

/// Creates the router for cart endpoints. The caller applies authentication.
pub fn cart_routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart).post(add_to_cart).delete(clear_cart))
        .route("/:product_id", delete(remove_cart_item))
        .layer(DefaultBodyLimit::max(
            max_upload_bytes.saturating_mul(MAX_FILES) + 64 * 1024,
        ))
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError::BadRequest {
        message: message.into(),
        error_code: None,
    }
}

struct PendingFile {
    name: String,
    contents: Bytes,
}

/// Add a product line, with optional attachments
#[utoipa::path(
    post,
    path = "/api/v1/cart",
    request_body(content_type = "multipart/form-data", description = "productId, quantity, clientInfo (JSON string) and files"),
    responses(
        (status = 200, description = "Item added", body = crate::services::cart::CartView),
        (status = 400, description = "Invalid input", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Product already in cart", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn add_to_cart(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut product_id: Option<Uuid> = None;
    let mut quantity = 1;
    let mut client_info = ClientInfo::default();
    let mut pending: Vec<PendingFile> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "productId" => {
                let raw = field.text().await.map_err(|e| bad_request(e.to_string()))?;
                product_id = Some(
                    Uuid::parse_str(raw.trim())
                        .map_err(|_| bad_request("Invalid product ID format"))?,
                );
            }
            "quantity" => {
                let raw = field.text().await.map_err(|e| bad_request(e.to_string()))?;
                quantity = raw
                    .trim()
                    .parse()
                    .map_err(|_| bad_request("quantity must be a whole number"))?;
            }
            "clientInfo" => {
                let raw = field.text().await.map_err(|e| bad_request(e.to_string()))?;
                if !raw.trim().is_empty() {
                    client_info = serde_json::from_str(&raw)
                        .map_err(|_| bad_request("Invalid client information format"))?;
                }
            }
            "files" => {
                if pending.len() == MAX_FILES {
                    return Err(bad_request(format!("At most {} files are allowed", MAX_FILES)));
                }
                let content_type = field.content_type().unwrap_or_default().to_string();
                if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
                    return Err(bad_request(
                        "Invalid file type. Only JPEG, PNG, PDF, Word, and ZIP files are allowed.",
                    ));
                }
                let file_name = field.file_name().unwrap_or_default().to_string();
                let contents = field.bytes().await.map_err(|e| bad_request(e.to_string()))?;
                pending.push(PendingFile {
                    name: file_name,
                    contents,
                });
            }
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    let product_id = product_id.ok_or_else(|| bad_request("productId is required"))?;

    // Attachments supplied by the client in clientInfo are not trusted.
    client_info.files.clear();
    let store = &state.services.files;
    let mut files = Vec::with_capacity(pending.len());
    for file in pending {
        match store.store(&file.name, file.contents).await {
            Ok(stored) => files.push(stored),
            Err(e) => {
                discard_files(store.as_ref(), &files).await;
                return Err(map_service_error(e));
            }
        }
    }

    let result = state
        .services
        .cart
        .add_item(
            user.user_id,
            AddToCartInput {
                product_id,
                quantity,
                client_info,
            },
            files.clone(),
        )
        .await;

    match result {
        Ok(cart) => Ok(success_response(cart)),
        Err(e) => {
            discard_files(store.as_ref(), &files).await;
            Err(map_service_error(e))
        }
    }
}

/// Removes attachments written for a request that did not produce a cart line.
async fn discard_files(store: &dyn FileStore, files: &[AttachedFile]) {
    for file in files {
        if let Err(e) = store.remove(file).await {
            warn!(url = %file.url, error = %e, "failed to remove orphaned attachment");
        }
    }
}

/// Get the caller's cart
#[utoipa::path(
    get,
    path = "/api/v1/cart",
    responses((status = 200, description = "Current cart", body = crate::services::cart::CartView)),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .get(user.user_id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(cart))
}

/// Remove one product line
#[utoipa::path(
    delete,
    path = "/api/v1/cart/{product_id}",
    params(("product_id" = Uuid, Path, description = "Product to remove")),
    responses(
        (status = 200, description = "Updated cart", body = crate::services::cart::CartView),
        (status = 404, description = "Cart not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn remove_cart_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .remove_item(user.user_id, product_id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(cart))
}

/// Remove every line
#[utoipa::path(
    delete,
    path = "/api/v1/cart",
    responses((status = 200, description = "Emptied cart", body = crate::services::cart::CartView)),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn clear_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .clear(user.user_id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(cart))
}
