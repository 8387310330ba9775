mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use common::{decimal, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use tower::ServiceExt;

#[tokio::test]
async fn health_and_status_respond() {
    let app = TestApp::new().await;

    let (status, body) = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["checks"]["database"], "healthy");

    let (status, body) = app.request(Method::GET, "/api/v1/status", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["service"], "artify-api");
}

#[tokio::test]
async fn request_id_is_echoed() {
    let app = TestApp::new().await;
    let router = artify_api::build_router(app.state.clone());

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/v1/status")
                .header("x-request-id", "smoke-req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "smoke-req-42"
    );
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request(Method::GET, "/api-docs/openapi.json", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["title"], "Artify API");
    assert!(body["paths"]["/api/v1/cart"].is_object());
}

#[tokio::test]
async fn catalog_hides_drafts_from_shoppers() {
    let app = TestApp::new().await;
    app.seed_product("Live Piece", dec!(300), "portraits").await;

    let (status, created) = app
        .as_admin(
            Method::POST,
            "/api/v1/products",
            Some(json!({
                "name": "Work In Progress",
                "description": "Not ready",
                "price": "450",
                "category": "portraits",
                "images": []
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["data"]["status"], "draft");
    let draft_id = created["data"]["id"].as_str().unwrap().to_string();

    let (status, listed) = app.request(Method::GET, "/api/v1/products", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<_> = listed["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["Live Piece".to_string()]);

    let (_, all) = app.as_admin(Method::GET, "/api/v1/products/all", None).await;
    assert_eq!(all["data"].as_array().unwrap().len(), 2);

    let (status, _) = app
        .add_to_cart(&app.customer.token, draft_id.parse().unwrap(), 1, None, &[])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, updated) = app
        .as_admin(
            Method::PUT,
            &format!("/api/v1/products/{draft_id}"),
            Some(json!({
                "name": "Finished Piece",
                "description": "Ready now",
                "price": "475.50",
                "category": "portraits",
                "images": ["/images/finished.png"],
                "status": "active"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{updated}");
    assert_eq!(decimal(&updated["data"]["price"]), dec!(475.50));

    let (_, listed) = app.request(Method::GET, "/api/v1/products", None, None).await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn admin_routes_need_the_admin_role() {
    let app = TestApp::new().await;
    let body = json!({
        "name": "Sneaky",
        "description": "x",
        "price": "1",
        "category": "misc",
        "images": []
    });

    let (status, _) = app
        .as_customer(Method::POST, "/api/v1/products", Some(body.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .request(Method::POST, "/api/v1/products", Some(body), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .request(Method::GET, "/api/v1/cart", None, Some("not-a-jwt"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_product_is_not_found() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request(
            Method::GET,
            &format!("/api/v1/products/{}", uuid::Uuid::new_v4()),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}
