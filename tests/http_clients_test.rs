use std::collections::BTreeMap;
use std::time::Duration;

use artify_api::{
    errors::ServiceError,
    services::{
        notifications::{EmailMessage, EmailTransport, HttpEmailTransport, NotificationError},
        payments::{CreateIntentRequest, IntentShipping, PaymentGateway, StripeGateway},
    },
};
use assert_matches::assert_matches;
use serde_json::json;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway(server: &MockServer) -> StripeGateway {
    StripeGateway::new(server.uri(), Some("sk_test_x".into()), Duration::from_secs(5)).unwrap()
}

fn intent_request() -> CreateIntentRequest {
    let mut metadata = BTreeMap::new();
    metadata.insert("user_id".to_string(), "user-1".to_string());
    metadata.insert("customer_name".to_string(), "Asha Rao".to_string());
    CreateIntentRequest {
        amount_minor: 110_000,
        currency: "inr".to_string(),
        metadata,
        shipping: IntentShipping {
            name: "Asha Rao".into(),
            line1: "12 MG Road".into(),
            city: "Bengaluru".into(),
            state: "KA".into(),
            postal_code: "560001".into(),
            country: "IN".into(),
        },
    }
}

#[tokio::test]
async fn create_intent_posts_form_with_secret_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .and(header("authorization", "Bearer sk_test_x"))
        .and(body_string_contains("amount=110000"))
        .and(body_string_contains("currency=inr"))
        .and(body_string_contains("metadata%5Buser_id%5D=user-1"))
        .and(body_string_contains("shipping%5Baddress%5D%5Bpostal_code%5D=560001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pi_123",
            "object": "payment_intent",
            "client_secret": "pi_123_secret_abc",
            "amount": 110000,
            "currency": "inr",
            "status": "requires_payment_method",
            "metadata": {"user_id": "user-1"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let intent = gateway(&server).create_intent(&intent_request()).await.unwrap();

    assert_eq!(intent.id, "pi_123");
    assert_eq!(intent.client_secret.as_deref(), Some("pi_123_secret_abc"));
    assert_eq!(intent.amount, 110_000);
    assert_eq!(intent.metadata.get("user_id").map(String::as_str), Some("user-1"));
}

#[tokio::test]
async fn provider_errors_are_mapped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "error": {"type": "card_error", "message": "Your card was declined."}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/payment_intents/pi_gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"type": "invalid_request_error", "message": "No such payment_intent"}
        })))
        .mount(&server)
        .await;

    let gateway = gateway(&server);

    let err = gateway.create_intent(&intent_request()).await.unwrap_err();
    assert_matches!(&err, ServiceError::ExternalServiceError(msg) if msg.contains("card_error"));

    assert_matches!(
        gateway.retrieve_intent("pi_gone").await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn retrieve_rejects_malformed_ids_without_calling_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    assert_matches!(
        gateway(&server).retrieve_intent("pi_1/../../v1/charges").await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn missing_secret_key_is_a_configuration_error() {
    let server = MockServer::start().await;
    let gateway = StripeGateway::new(server.uri(), None, Duration::from_secs(5)).unwrap();

    assert_matches!(
        gateway.create_intent(&intent_request()).await,
        Err(ServiceError::InternalError(_))
    );
}

fn message() -> EmailMessage {
    EmailMessage {
        from: "orders@artify.test".into(),
        to: "asha@example.com".into(),
        subject: "Your Artify Order #3F9A2B".into(),
        html: "<p>Thanks</p>".into(),
    }
}

#[tokio::test]
async fn email_transport_posts_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/emails"))
        .and(header("authorization", "Bearer mail_key"))
        .and(body_partial_json(json!({
            "to": "asha@example.com",
            "subject": "Your Artify Order #3F9A2B"
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpEmailTransport::new(
        format!("{}/emails", server.uri()),
        Some("mail_key".into()),
        Duration::from_secs(5),
    )
    .unwrap();

    transport.send(&message()).await.unwrap();
}

#[tokio::test]
async fn email_rejections_report_retryability() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad address"))
        .mount(&server)
        .await;

    let busy = HttpEmailTransport::new(format!("{}/busy", server.uri()), None, Duration::from_secs(5))
        .unwrap();
    let err = busy.send(&message()).await.unwrap_err();
    assert_matches!(err, NotificationError::Rejected { status: 503, .. });
    assert!(err.is_retryable());

    let bad = HttpEmailTransport::new(format!("{}/bad", server.uri()), None, Duration::from_secs(5))
        .unwrap();
    let err = bad.send(&message()).await.unwrap_err();
    assert_matches!(err, NotificationError::Rejected { status: 422, .. });
    assert!(!err.is_retryable());
}
