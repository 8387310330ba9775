use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Artify API",
        version = "1.0.0",
        description = r#"
# Artify Storefront API

Backend for custom artwork orders: product catalog, per-user carts with file attachments,
discount coupons, an order ledger and Stripe payments.

## Authentication

Customer and admin endpoints take a JWT bearer token:

```
Authorization: Bearer <your-jwt-token>
```

Admin endpoints additionally require the `admin` role. The payment webhook is authenticated by
its `stripe-signature` header instead.

## Responses

Successful responses are wrapped as `{success, data, message, errors, meta}`. Errors use:

```json
{
  "error": "Bad Request",
  "code": "validation_error",
  "message": "Validation error: quantity must be at least 1",
  "request_id": "req-abc123xyz",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Products", description = "Catalog endpoints"),
        (name = "Cart", description = "Per-user cart endpoints"),
        (name = "Coupons", description = "Coupon validation and administration"),
        (name = "Orders", description = "Order ledger endpoints"),
        (name = "Payments", description = "Payment intents and provider webhooks")
    ),
    paths(
        // Products
        crate::handlers::products::list_products,
        crate::handlers::products::list_all_products,
        crate::handlers::products::get_product,
        crate::handlers::products::create_product,
        crate::handlers::products::update_product,
        crate::handlers::products::delete_product,

        // Cart
        crate::handlers::cart::get_cart,
        crate::handlers::cart::add_to_cart,
        crate::handlers::cart::remove_cart_item,
        crate::handlers::cart::clear_cart,

        // Coupons
        crate::handlers::coupons::validate_coupon,
        crate::handlers::coupons::list_coupons,
        crate::handlers::coupons::create_coupon,
        crate::handlers::coupons::update_coupon,
        crate::handlers::coupons::delete_coupon,

        // Orders
        crate::handlers::orders::create_order,
        crate::handlers::orders::get_order,
        crate::handlers::orders::list_user_orders,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::update_order_status,

        // Payments
        crate::handlers::payments::create_payment_intent,
        crate::handlers::payments::get_payment_intent,
        crate::handlers::payments::payment_webhook,
    ),
    components(
        schemas(
            crate::entities::product::Model,
            crate::entities::coupon::Model,
            crate::entities::order::Model,
            crate::services::catalog::ProductInput,
            crate::services::cart::CartView,
            crate::services::cart::CartLineView,
            crate::services::coupons::CouponInput,
            crate::services::coupons::CouponPatch,
            crate::services::coupons::CartLineRef,
            crate::handlers::coupons::ValidateCouponRequest,
            crate::handlers::coupons::CouponCheck,
            crate::handlers::coupons::CouponRefusal,
            crate::services::orders::CreateOrderInput,
            crate::services::orders::OrderPage,
            crate::handlers::orders::UpdateOrderStatusRequest,
            crate::services::payments::CreatePaymentIntentRequest,
            crate::services::payments::PaymentIntentCreated,
            crate::services::payments::PaymentIntent,
            crate::services::payments::WebhookAck,
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
