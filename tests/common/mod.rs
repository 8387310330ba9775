#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use artify_api::{
    auth::{AuthConfig, AuthService, ADMIN_ROLE},
    config::AppConfig,
    db,
    entities::{coupon, product},
    errors::ServiceError,
    events::{self, EventSender},
    handlers::{AppServices, Integrations},
    services::{
        catalog::ProductInput,
        coupons::CouponInput,
        notifications::{EmailMessage, EmailTransport, NotificationError},
        payments::{sign_payload, CreateIntentRequest, PaymentGateway, PaymentIntent},
        uploads::LocalFileStore,
    },
    AppState,
};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use fake::{faker::internet::en::SafeEmail, Fake};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_integration_secret";
pub const ADMIN_EMAIL: &str = "admin@artify.test";
const JWT_SECRET: &str =
    "integration_signing_key_7d1e0b9c4a3f28e6_5b0c9d8e7f6a5b4c3d2e1f0a9b8c7d6e";
const MULTIPART_BOUNDARY: &str = "artify-test-boundary";

/// Payment gateway that keeps intents in memory.
#[derive(Default)]
pub struct FakeGateway {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    counter: AtomicU64,
}

impl FakeGateway {
    pub fn requests(&self) -> Vec<PaymentIntent> {
        self.intents.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<PaymentIntent, ServiceError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("pi_fake_{n}");
        let intent = PaymentIntent {
            id: id.clone(),
            client_secret: Some(format!("{id}_secret")),
            amount: request.amount_minor,
            currency: request.currency.clone(),
            status: "requires_payment_method".to_string(),
            metadata: request.metadata.clone(),
        };
        self.intents.lock().unwrap().insert(id, intent.clone());
        Ok(intent)
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        self.intents
            .lock()
            .unwrap()
            .get(intent_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("Payment intent {intent_id} not found")))
    }
}

/// Email transport that records every message it is asked to send.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<EmailMessage>>,
}

#[async_trait]
impl EmailTransport for RecordingTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

pub struct TestUser {
    pub id: Uuid,
    pub token: String,
}

/// Application wired to an in-memory SQLite database and in-memory integrations.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub mail: Arc<RecordingTransport>,
    pub upload_dir: tempfile::TempDir,
    pub customer: TestUser,
    pub admin: TestUser,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let upload_dir = tempfile::tempdir().expect("temp upload dir");

        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        cfg.admin_email = Some(ADMIN_EMAIL.to_string());
        cfg.upload_dir = upload_dir.path().to_string_lossy().into_owned();
        cfg.cors_allow_any_origin = true;
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(FakeGateway::default());
        let mail = Arc::new(RecordingTransport::default());
        let integrations = Integrations {
            gateway: gateway.clone(),
            email: mail.clone(),
            files: Arc::new(LocalFileStore::new(upload_dir.path(), cfg.max_upload_bytes)),
        };
        let services = AppServices::new(db_arc.clone(), event_sender, &cfg, integrations);

        let auth = Arc::new(AuthService::new(AuthConfig::from_app_config(&cfg)));
        let customer = Self::mint_user(&auth, vec!["customer".to_string()]);
        let admin = Self::mint_user(&auth, vec![ADMIN_ROLE.to_string()]);

        let state = AppState {
            db: db_arc,
            config: cfg,
            services,
            auth,
        };
        let router = artify_api::build_router(state.clone());

        Self {
            router,
            state,
            gateway,
            mail,
            upload_dir,
            customer,
            admin,
            _event_task: event_task,
        }
    }

    fn mint_user(auth: &AuthService, roles: Vec<String>) -> TestUser {
        let id = Uuid::new_v4();
        let email: String = SafeEmail().fake();
        let token = auth
            .issue_token(id, Some(email), roles)
            .expect("issue test token");
        TestUser { id, token }
    }

    /// A further customer with their own token.
    pub fn new_customer(&self) -> TestUser {
        Self::mint_user(&self.state.auth, vec!["customer".to_string()])
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, body)
    }

    /// JSON request with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize json body"))
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).expect("build request")).await
    }

    pub async fn as_customer(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        self.request(method, uri, body, Some(&self.customer.token))
            .await
    }

    pub async fn as_admin(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        self.request(method, uri, body, Some(&self.admin.token)).await
    }

    /// `POST /api/v1/cart` as multipart form data.
    pub async fn add_to_cart(
        &self,
        token: &str,
        product_id: Uuid,
        quantity: i32,
        client_info: Option<&str>,
        files: &[(&str, &str, &[u8])],
    ) -> (StatusCode, Value) {
        let mut text_parts = vec![
            ("productId", product_id.to_string()),
            ("quantity", quantity.to_string()),
        ];
        if let Some(info) = client_info {
            text_parts.push(("clientInfo", info.to_string()));
        }
        let body = multipart_body(&text_parts, files);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/cart")
            .header("authorization", format!("Bearer {}", token))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(Body::from(body))
            .expect("build multipart request");
        self.send(request).await
    }

    /// Delivers a webhook signed with the configured secret.
    pub async fn deliver_webhook(&self, event: &Value) -> (StatusCode, Value) {
        let payload = serde_json::to_vec(event).expect("serialize event");
        let timestamp = Utc::now().timestamp();
        let signature = sign_payload(WEBHOOK_SECRET, timestamp, &payload).expect("sign payload");
        self.deliver_raw_webhook(payload, &format!("t={},v1={}", timestamp, signature))
            .await
    }

    pub async fn deliver_raw_webhook(
        &self,
        payload: Vec<u8>,
        signature_header: &str,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payment/webhook")
            .header("content-type", "application/json")
            .header("stripe-signature", signature_header)
            .body(Body::from(payload))
            .expect("build webhook request");
        self.send(request).await
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, category: &str) -> product::Model {
        self.state
            .services
            .catalog
            .create_product(ProductInput {
                name: name.to_string(),
                description: format!("{name} artwork"),
                price,
                original_price: None,
                category: category.to_string(),
                subcategory: None,
                images: vec![format!("/images/{}.png", name.to_lowercase().replace(' ', "-"))],
                delivery_time: Some("3-5 days".to_string()),
                status: Some(product::ProductStatus::Active),
            })
            .await
            .expect("seed product")
    }

    /// Active coupon valid from yesterday for thirty days.
    pub fn coupon_input(code: &str, kind: coupon::DiscountType, value: Decimal) -> CouponInput {
        CouponInput {
            code: code.to_string(),
            description: format!("{code} promotion"),
            discount_type: kind,
            discount_value: value,
            min_order_amount: Decimal::ZERO,
            max_discount_amount: None,
            start_date: Utc::now() - ChronoDuration::days(1),
            end_date: Utc::now() + ChronoDuration::days(30),
            max_uses: None,
            user_specific: false,
            allowed_users: vec![],
            products: vec![],
            categories: vec![],
            is_active: true,
        }
    }

    pub async fn seed_coupon(&self, input: CouponInput) -> coupon::Model {
        self.state
            .services
            .coupons
            .create_coupon(input)
            .await
            .expect("seed coupon")
    }

    /// Creates an intent through the API and returns its id.
    pub async fn create_intent(&self, token: &str, amount: &str) -> String {
        let (status, body) = self
            .request(
                Method::POST,
                "/api/v1/payment/create-payment-intent",
                Some(json!({
                    "amount": amount,
                    "metadata": {
                        "customer_name": "Asha Rao",
                        "address": "12 MG Road",
                        "city": "Bengaluru",
                        "state": "KA",
                        "zipCode": "560001",
                        "country": "IN"
                    }
                })),
                Some(token),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "create intent failed: {body}");
        body["data"]["paymentIntentId"]
            .as_str()
            .expect("intent id")
            .to_string()
    }

    /// Waits for queued email and returns everything sent so far.
    pub async fn sent_mail(&self) -> Vec<EmailMessage> {
        self.state.services.notifier.drain().await;
        self.mail.sent.lock().unwrap().clone()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

fn multipart_body(text_parts: &[(&str, String)], files: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in text_parts {
        body.extend_from_slice(
            format!(
                "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    for (file_name, content_type, contents) in files {
        body.extend_from_slice(
            format!(
                "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(contents);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

/// Reads a decimal that may be serialized as a string or a number.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("expected a decimal, got {other}"),
    }
}

/// Checkout payload for `POST /api/v1/orders`.
pub fn order_payload(
    intent_id: &str,
    lines: &[(Uuid, &str, i32, &str)],
    gst: &str,
    coupon: Option<(&str, &str)>,
) -> Value {
    let items: Vec<Value> = lines
        .iter()
        .map(|(product_id, name, quantity, price)| {
            json!({
                "productId": product_id,
                "name": name,
                "quantity": quantity,
                "price": price,
                "clientInfo": {"name": "Asha", "phone": "9999999999"}
            })
        })
        .collect();
    let subtotal: Decimal = lines
        .iter()
        .map(|(_, _, q, p)| Decimal::from_str(p).unwrap() * Decimal::from(*q))
        .sum();
    let gst_amount = Decimal::from_str(gst).unwrap();
    let discount = coupon
        .map(|(_, d)| Decimal::from_str(d).unwrap())
        .unwrap_or(Decimal::ZERO);

    let mut body = json!({
        "items": items,
        "subtotal": subtotal.to_string(),
        "gst": gst,
        "discount": discount.to_string(),
        "total": (subtotal + gst_amount - discount).to_string(),
        "paymentIntentId": intent_id,
        "billingDetails": {
            "firstName": "Asha",
            "lastName": "Rao",
            "email": "Asha.Rao@Example.com",
            "phone": "9999999999",
            "address": "12 MG Road",
            "city": "Bengaluru",
            "state": "KA",
            "zipCode": "560001",
            "country": "IN"
        }
    });
    if let Some((code, discount)) = coupon {
        body["coupon"] = json!({"code": code, "discount": discount});
    }
    body
}

/// Stripe-shaped event for a payment intent.
pub fn intent_event(event_id: &str, event_type: &str, intent_id: &str) -> Value {
    json!({
        "id": event_id,
        "type": event_type,
        "data": {"object": {"id": intent_id, "object": "payment_intent"}}
    })
}

pub fn refund_event(event_id: &str, intent_id: &str, full: bool) -> Value {
    json!({
        "id": event_id,
        "type": "charge.refunded",
        "data": {"object": {
            "id": format!("ch_{event_id}"),
            "object": "charge",
            "payment_intent": intent_id,
            "refunded": full
        }}
    })
}
