use crate::handlers::common::{map_service_error, success_response};
use crate::{
    auth::AuthUser,
    errors::ApiError,
    services::payments::{CreatePaymentIntentRequest, SIGNATURE_HEADER},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use bytes::Bytes;

/// Intent endpoints. The caller applies authentication.
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/create-payment-intent", post(create_payment_intent))
        .route("/:id", get(get_payment_intent))
}

/// Provider callbacks. Never behind auth; the signature is the credential.
pub fn payment_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook", post(payment_webhook))
}

/// Create a payment intent for the checkout amount
#[utoipa::path(
    post,
    path = "/api/v1/payment/create-payment-intent",
    request_body = CreatePaymentIntentRequest,
    responses(
        (status = 200, description = "Intent created", body = crate::services::payments::PaymentIntentCreated),
        (status = 400, description = "Invalid amount or currency", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider unavailable", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn create_payment_intent(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreatePaymentIntentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state
        .services
        .payments
        .create_payment_intent(user.user_id, payload)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(created))
}

/// Fetch a payment intent
#[utoipa::path(
    get,
    path = "/api/v1/payment/{id}",
    params(("id" = String, Path, description = "Payment intent id")),
    responses(
        (status = 200, description = "Intent", body = crate::services::payments::PaymentIntent),
        (status = 403, description = "Intent belongs to another user", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown intent", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn get_payment_intent(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let intent = state
        .services
        .payments
        .retrieve(&id, user.user_id, user.is_admin())
        .await
        .map_err(map_service_error)?;
    Ok(success_response(intent))
}

/// Payment provider webhook
///
/// The body is read raw so the signature is checked against the exact bytes sent.
#[utoipa::path(
    post,
    path = "/api/v1/payment/webhook",
    request_body(content = String, content_type = "application/json"),
    params(("stripe-signature" = String, Header, description = "t=<unix>,v1=<hex hmac>")),
    responses(
        (status = 200, description = "Event accepted", body = crate::services::payments::WebhookAck),
        (status = 400, description = "Missing or invalid signature", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let ack = state
        .services
        .payments
        .handle_webhook(&body, signature)
        .await
        .map_err(map_service_error)?;
    Ok(Json(ack))
}
