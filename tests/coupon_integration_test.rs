mod common;

use artify_api::entities::coupon::DiscountType;
use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::{decimal, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;

#[tokio::test]
async fn percentage_coupon_is_capped() {
    let app = TestApp::new().await;
    let mut input = TestApp::coupon_input("ART10", DiscountType::Percentage, dec!(10));
    input.max_discount_amount = Some(dec!(80));
    app.seed_coupon(input).await;

    let (status, body) = app
        .as_customer(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({"code": "art10", "cartAmount": 1000})),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["valid"], true);
    assert_eq!(decimal(&body["data"]["discountAmount"]), dec!(80));
    assert_eq!(body["data"]["coupon"]["code"], "ART10");
}

#[tokio::test]
async fn validation_does_not_consume_the_coupon() {
    let app = TestApp::new().await;
    let mut input = TestApp::coupon_input("TWICE15", DiscountType::Percentage, dec!(15));
    input.max_uses = Some(1);
    app.seed_coupon(input).await;

    let request = json!({"code": "TWICE15", "cartAmount": "1234.50"});
    let (status, first) = app
        .as_customer(Method::POST, "/api/v1/coupons/validate", Some(request.clone()))
        .await;
    assert_eq!(status, StatusCode::OK, "{first}");
    let (status, second) = app
        .as_customer(Method::POST, "/api/v1/coupons/validate", Some(request))
        .await;
    assert_eq!(status, StatusCode::OK, "{second}");

    assert_eq!(decimal(&first["data"]["discountAmount"]), dec!(185.18));
    assert_eq!(
        decimal(&first["data"]["discountAmount"]),
        decimal(&second["data"]["discountAmount"])
    );

    let (_, coupons) = app.as_admin(Method::GET, "/api/v1/coupons", None).await;
    assert_eq!(coupons["data"][0]["currentUses"], 0);
}

#[tokio::test]
async fn huge_cart_amounts_are_handled() {
    let app = TestApp::new().await;
    let mut input = TestApp::coupon_input("HALFCAP", DiscountType::Percentage, dec!(50));
    input.max_discount_amount = Some(dec!(80));
    app.seed_coupon(input).await;

    let (status, body) = app
        .as_customer(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({"code": "HALFCAP", "cartAmount": "79228162514264337593543950335"})),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(decimal(&body["data"]["discountAmount"]), dec!(80));
}

#[tokio::test]
async fn fixed_coupon_never_exceeds_cart() {
    let app = TestApp::new().await;
    app.seed_coupon(TestApp::coupon_input("FLAT500", DiscountType::Fixed, dec!(500)))
        .await;

    let (status, body) = app
        .as_customer(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({"code": "FLAT500", "cartAmount": "320.00"})),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(decimal(&body["data"]["discountAmount"]), dec!(320));
}

#[tokio::test]
async fn refusals_carry_a_reason() {
    let app = TestApp::new().await;

    let mut expired = TestApp::coupon_input("OLDNEWS", DiscountType::Fixed, dec!(50));
    expired.start_date = Utc::now() - Duration::days(30);
    expired.end_date = Utc::now() - Duration::days(1);
    app.seed_coupon(expired).await;

    let mut minimum = TestApp::coupon_input("BIGSPEND", DiscountType::Fixed, dec!(50));
    minimum.min_order_amount = dec!(2000);
    app.seed_coupon(minimum).await;

    let cases = [
        ("OLDNEWS", "expired"),
        ("BIGSPEND", "below_minimum"),
        ("NOSUCHCODE", "invalid"),
    ];
    for (code, reason) in cases {
        let (status, body) = app
            .as_customer(
                Method::POST,
                "/api/v1/coupons/validate",
                Some(json!({"code": code, "cartAmount": 1000})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{code}");
        assert_eq!(body["success"], false);
        assert_eq!(body["valid"], false);
        assert_eq!(body["reason"], reason, "{code}: {body}");
    }

    let (_, body) = app
        .as_customer(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({"code": "BIGSPEND", "cartAmount": 1000})),
        )
        .await;
    assert_eq!(
        body["error"],
        "Minimum order amount of ₹2000 required for this coupon"
    );
}

#[tokio::test]
async fn user_specific_and_product_restricted_coupons() {
    let app = TestApp::new().await;
    let portrait = app.seed_product("Portrait", dec!(700), "portraits").await;
    let sketch = app.seed_product("Sketch", dec!(200), "sketches").await;

    let mut vip = TestApp::coupon_input("VIPONLY", DiscountType::Fixed, dec!(100));
    vip.user_specific = true;
    vip.allowed_users = vec![app.customer.id];
    app.seed_coupon(vip).await;

    let mut portraits = TestApp::coupon_input("PORTRAITS", DiscountType::Percentage, dec!(20));
    portraits.categories = vec!["portraits".to_string()];
    app.seed_coupon(portraits).await;

    let (status, _) = app
        .as_customer(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({"code": "VIPONLY", "cartAmount": 900})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let stranger = app.new_customer();
    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({"code": "VIPONLY", "cartAmount": 900})),
            Some(&stranger.token),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "not_allowed_for_user");

    // Categories are looked up from the catalog when the client omits them.
    let (status, body) = app
        .as_customer(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({
                "code": "PORTRAITS",
                "cartAmount": 700,
                "cartItems": [{"productId": portrait.id}]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(decimal(&body["data"]["discountAmount"]), dec!(140));

    let (status, body) = app
        .as_customer(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({
                "code": "PORTRAITS",
                "cartAmount": 200,
                "cartItems": [{"productId": sketch.id}]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "not_applicable");
}

#[tokio::test]
async fn validation_requires_a_token() {
    let app = TestApp::new().await;
    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({"code": "ANY", "cartAmount": 10})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

fn coupon_body(code: &str) -> serde_json::Value {
    json!({
        "code": code,
        "description": "Festive sale",
        "discountType": "percentage",
        "discountValue": 15,
        "maxDiscountAmount": 300,
        "startDate": (Utc::now() - Duration::days(1)).to_rfc3339(),
        "endDate": (Utc::now() + Duration::days(10)).to_rfc3339(),
        "maxUses": 50
    })
}

#[tokio::test]
async fn admin_manages_coupons() {
    let app = TestApp::new().await;

    let (status, created) = app
        .as_admin(Method::POST, "/api/v1/coupons", Some(coupon_body("diwali15")))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["data"]["code"], "DIWALI15");
    assert_eq!(created["data"]["currentUses"], 0);
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .as_admin(Method::POST, "/api/v1/coupons", Some(coupon_body("DIWALI15")))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");

    let (status, patched) = app
        .as_admin(
            Method::PATCH,
            &format!("/api/v1/coupons/{id}"),
            Some(json!({"maxDiscountAmount": null, "maxUses": null, "discountValue": 20})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{patched}");
    assert!(patched["data"]["maxDiscountAmount"].is_null());
    assert!(patched["data"]["maxUses"].is_null());
    assert_eq!(decimal(&patched["data"]["discountValue"]), dec!(20));
    assert_eq!(patched["data"]["description"], "Festive sale");

    let (status, listed) = app.as_admin(Method::GET, "/api/v1/coupons", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);

    let (status, body) = app
        .as_admin(Method::DELETE, &format!("/api/v1/coupons/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Coupon deleted");

    let (status, _) = app
        .as_admin(Method::DELETE, &format!("/api/v1/coupons/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_coupon_terms_are_rejected() {
    let app = TestApp::new().await;

    let mut body = coupon_body("TOOMUCH");
    body["discountValue"] = json!(150);
    let (status, _) = app.as_admin(Method::POST, "/api/v1/coupons", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut body = coupon_body("BACKWARDS");
    body["endDate"] = json!((Utc::now() - Duration::days(5)).to_rfc3339());
    let (status, _) = app.as_admin(Method::POST, "/api/v1/coupons", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn customers_cannot_administer_coupons() {
    let app = TestApp::new().await;

    let (status, _) = app
        .as_customer(Method::POST, "/api/v1/coupons", Some(coupon_body("SNEAKY")))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.as_customer(Method::GET, "/api/v1/coupons", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
