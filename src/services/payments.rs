use crate::{
    config::AppConfig,
    entities::order::PaymentStatus,
    errors::ServiceError,
    services::orders::{OrderService, Reconciliation},
};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Payment intent as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: Option<String>,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Provider wire format; only the fields the service reads.
#[derive(Debug, Deserialize)]
struct StripeIntent {
    id: String,
    client_secret: Option<String>,
    amount: i64,
    currency: String,
    status: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl From<StripeIntent> for PaymentIntent {
    fn from(s: StripeIntent) -> Self {
        Self {
            id: s.id,
            client_secret: s.client_secret,
            amount: s.amount,
            currency: s.currency,
            status: s.status,
            metadata: s.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IntentShipping {
    pub name: String,
    pub line1: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIntentRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub metadata: BTreeMap<String, String>,
    pub shipping: IntentShipping,
}

/// External payment provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<PaymentIntent, ServiceError>;
    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError>;
}

/// Stripe REST client: form-encoded requests authenticated with the secret key.
#[derive(Debug, Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    api_base: String,
    secret_key: Option<String>,
}

impl StripeGateway {
    pub fn new(
        api_base: impl Into<String>,
        secret_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.filter(|k| !k.trim().is_empty()),
        })
    }

    pub fn from_app_config(cfg: &AppConfig) -> Result<Self, ServiceError> {
        Self::new(
            cfg.stripe_api_base.clone(),
            cfg.stripe_secret_key.clone(),
            cfg.payment_timeout(),
        )
    }

    fn secret_key(&self) -> Result<&str, ServiceError> {
        self.secret_key
            .as_deref()
            .ok_or_else(|| {
                ServiceError::InternalError("Stripe secret key is not configured".into())
            })
    }

    async fn parse(response: reqwest::Response) -> Result<PaymentIntent, ServiceError> {
        let status = response.status();
        if status.is_success() {
            let intent: StripeIntent = response.json().await.map_err(|e| {
                ServiceError::ExternalServiceError(format!("Stripe response: {}", e))
            })?;
            return Ok(intent.into());
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<StripeErrorBody>(&body)
            .map(|b| {
                format!(
                    "{}: {}",
                    b.error.kind.unwrap_or_else(|| "api_error".into()),
                    b.error.message.unwrap_or_default()
                )
            })
            .unwrap_or(body);

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ServiceError::NotFound("Payment intent not found".to_string()));
        }
        Err(ServiceError::ExternalServiceError(format!(
            "Stripe returned {}: {}",
            status, detail
        )))
    }
}

fn intent_form(request: &CreateIntentRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("amount".to_string(), request.amount_minor.to_string()),
        ("currency".to_string(), request.currency.clone()),
        ("payment_method_types[]".to_string(), "card".to_string()),
        ("description".to_string(), "Digital artwork purchase".to_string()),
        ("statement_descriptor".to_string(), "ARTIFY".to_string()),
        ("statement_descriptor_suffix".to_string(), "ART".to_string()),
        ("shipping[name]".to_string(), request.shipping.name.clone()),
        ("shipping[address][line1]".to_string(), request.shipping.line1.clone()),
        ("shipping[address][city]".to_string(), request.shipping.city.clone()),
        ("shipping[address][state]".to_string(), request.shipping.state.clone()),
        (
            "shipping[address][postal_code]".to_string(),
            request.shipping.postal_code.clone(),
        ),
        ("shipping[address][country]".to_string(), request.shipping.country.clone()),
    ];
    form.extend(
        request
            .metadata
            .iter()
            .map(|(k, v)| (format!("metadata[{}]", k), v.clone())),
    );
    form
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(
        skip(self, request),
        fields(amount = request.amount_minor, currency = %request.currency)
    )]
    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<PaymentIntent, ServiceError> {
        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.api_base))
            .bearer_auth(self.secret_key()?)
            .form(&intent_form(request))
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("Stripe request: {}", e)))?;
        Self::parse(response).await
    }

    #[instrument(skip(self))]
    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        let well_formed = !intent_id.is_empty()
            && intent_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !well_formed {
            return Err(ServiceError::ValidationError(
                "Invalid payment intent id".to_string(),
            ));
        }
        let response = self
            .client
            .get(format!("{}/v1/payment_intents/{}", self.api_base, intent_id))
            .bearer_auth(self.secret_key()?)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("Stripe request: {}", e)))?;
        Self::parse(response).await
    }
}

/// Computes the `v1` signature for `payload` signed at `timestamp`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("HMAC key: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks `Stripe-Signature: t=<unix>,v1=<hex>[,v1=<hex>...]` headers.
#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Verifies the signature against `now` (unix seconds) and parses the event.
    pub fn verify(
        &self,
        payload: &[u8],
        header: &str,
        now: i64,
    ) -> Result<WebhookEvent, ServiceError> {
        let reject = |msg: &str| ServiceError::WebhookSignature(msg.to_string());

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value.to_string()),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or_else(|| reject("missing or malformed timestamp"))?;
        if signatures.is_empty() {
            return Err(reject("no v1 signature"));
        }
        if now.abs_diff(timestamp) > self.tolerance.as_secs() {
            return Err(reject("timestamp outside tolerance"));
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("HMAC key: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        let matched = signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });
        if !matched {
            return Err(reject("signature mismatch"));
        }

        serde_json::from_slice(payload).map_err(|e| {
            ServiceError::WebhookSignature(format!("payload is not a valid event: {}", e))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    /// Maps the event to the intent it concerns and the payment status it implies.
    /// `None` for event types the ledger does not track.
    pub fn payment_outcome(&self) -> Option<(String, PaymentStatus)> {
        let object = &self.data.object;
        match self.event_type.as_str() {
            "payment_intent.succeeded" => {
                Some((object.get("id")?.as_str()?.to_string(), PaymentStatus::Succeeded))
            }
            "payment_intent.payment_failed" => {
                Some((object.get("id")?.as_str()?.to_string(), PaymentStatus::Failed))
            }
            "charge.refunded" => {
                // Partial refunds leave the payment in place.
                if !object.get("refunded")?.as_bool()? {
                    return None;
                }
                Some((
                    object.get("payment_intent")?.as_str()?.to_string(),
                    PaymentStatus::Refunded,
                ))
            }
            _ => None,
        }
    }
}

/// Body of `POST /payment/create-payment-intent`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntentRequest {
    /// Amount in major currency units
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    /// Customer and address fields: customer_name, address, city, state, zipCode, country
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentCreated {
    pub client_secret: Option<String>,
    pub payment_intent_id: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
}

/// Converts a major-unit amount to minor units, rejecting non-positive or fractional-cent values.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "amount must be greater than zero".to_string(),
        ));
    }
    let minor = amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .ok_or_else(|| ServiceError::ValidationError("amount is too large".to_string()))?;
    if minor.fract() != Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "amount has more than two decimal places".to_string(),
        ));
    }
    minor
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError("amount is too large".to_string()))
}

fn metadata_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Payment intents and webhook intake.
#[derive(Clone)]
pub struct PaymentService {
    gateway: Arc<dyn PaymentGateway>,
    verifier: Option<WebhookVerifier>,
    orders: OrderService,
    default_currency: String,
}

impl PaymentService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        verifier: Option<WebhookVerifier>,
        orders: OrderService,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            verifier,
            orders,
            default_currency: default_currency.into(),
        }
    }

    #[instrument(skip(self, request), fields(amount = %request.amount))]
    pub async fn create_payment_intent(
        &self,
        user_id: Uuid,
        request: CreatePaymentIntentRequest,
    ) -> Result<PaymentIntentCreated, ServiceError> {
        let amount_minor = to_minor_units(request.amount)?;
        let currency = request
            .currency
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.default_currency.clone());
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ServiceError::ValidationError(format!(
                "Unsupported currency {}",
                currency
            )));
        }

        let mut metadata: BTreeMap<String, String> = request
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), metadata_string(v)))
            .collect();
        metadata.insert("user_id".to_string(), user_id.to_string());

        let field = |key: &str| metadata.get(key).cloned().unwrap_or_default();
        let shipping = IntentShipping {
            name: field("customer_name"),
            line1: field("address"),
            city: field("city"),
            state: field("state"),
            postal_code: field("zipCode"),
            country: Some(field("country"))
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "IN".to_string()),
        };

        let intent = self
            .gateway
            .create_intent(&CreateIntentRequest {
                amount_minor,
                currency,
                metadata,
                shipping,
            })
            .await?;

        info!(payment_intent_id = %intent.id, %user_id, amount_minor, "payment intent created");
        Ok(PaymentIntentCreated {
            client_secret: intent.client_secret,
            payment_intent_id: intent.id,
        })
    }

    /// Fetches an intent. Intents created for another user are hidden unless `is_admin`.
    pub async fn retrieve(
        &self,
        intent_id: &str,
        user_id: Uuid,
        is_admin: bool,
    ) -> Result<PaymentIntent, ServiceError> {
        let intent = self.gateway.retrieve_intent(intent_id).await?;
        let owner = intent.metadata.get("user_id").map(String::as_str);
        if !is_admin && owner.is_some_and(|o| o != user_id.to_string()) {
            return Err(ServiceError::Forbidden(
                "Payment intent belongs to another user".to_string(),
            ));
        }
        Ok(intent)
    }

    /// Verifies and applies a provider webhook. Nothing is written unless the
    /// signature checks out; unknown event types are acknowledged untouched.
    #[instrument(skip(self, payload, signature), fields(size = payload.len()))]
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookAck, ServiceError> {
        let verifier = self.verifier.as_ref().ok_or_else(|| {
            ServiceError::WebhookSignature("webhook secret is not configured".to_string())
        })?;
        let signature = signature
            .ok_or_else(|| ServiceError::WebhookSignature("missing signature header".to_string()))?;

        let event = verifier.verify(payload, signature, chrono::Utc::now().timestamp())?;

        let Some((intent_id, outcome)) = event.payment_outcome() else {
            info!(event_id = %event.id, event_type = %event.event_type, "webhook event ignored");
            return Ok(WebhookAck { received: true });
        };

        let result = self
            .orders
            .reconcile_payment_event(&intent_id, outcome, &event.id)
            .await?;
        match &result {
            Reconciliation::Ignored(order) => warn!(
                event_id = %event.id,
                order_id = %order.id,
                "webhook event did not apply"
            ),
            other => info!(
                event_id = %event.id,
                payment_intent_id = %intent_id,
                result = other.label(),
                "webhook event processed"
            ),
        }
        Ok(WebhookAck { received: true })
    }
}
