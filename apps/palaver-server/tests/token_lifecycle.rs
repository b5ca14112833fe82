use std::{path::PathBuf, time::Duration};

use axum::{body::Body, http::Request, http::StatusCode};
use palaver_server::{build_router, AppConfig};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower::ServiceExt;
use ulid::Ulid;

#[derive(Debug, serde::Deserialize)]
struct TokenPair {
    access_token: String,
    refresh_token: String,
}

fn upload_root() -> PathBuf {
    std::env::temp_dir().join(format!("palaver-test-uploads-{}", Ulid::new()))
}

fn test_app() -> axum::Router {
    build_router(&AppConfig {
        max_body_bytes: 1024 * 64,
        request_timeout: Duration::from_secs(2),
        rate_limit_requests_per_minute: 200,
        auth_route_requests_per_minute: 200,
        upload_root: upload_root(),
        ..AppConfig::default()
    })
    .expect("router should build")
}

async fn parse_json_body<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    serde_json::from_slice(&body).expect("response body should be valid json")
}

async fn register(app: &axum::Router, username: &str, ip: &str) -> axum::response::Response {
    let request = Request::builder()
        .method("POST")
        .uri("/user/register")
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(
            json!({
                "username": username,
                "email": format!("{username}@example.com"),
                "password": "super-secure-password"
            })
            .to_string(),
        ))
        .expect("register request should build");
    app.clone()
        .oneshot(request)
        .await
        .expect("register request should execute")
}

async fn register_with_email(
    app: &axum::Router,
    username: &str,
    email: &str,
    ip: &str,
) -> axum::response::Response {
    let request = Request::builder()
        .method("POST")
        .uri("/user/register")
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(
            json!({
                "username": username,
                "email": email,
                "password": "super-secure-password"
            })
            .to_string(),
        ))
        .expect("register request should build");
    app.clone()
        .oneshot(request)
        .await
        .expect("register request should execute")
}

async fn login(app: &axum::Router, username: &str, ip: &str) -> TokenPair {
    let request = Request::builder()
        .method("POST")
        .uri("/user/login")
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(
            json!({"username": username, "password": "super-secure-password"}).to_string(),
        ))
        .expect("login request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("login request should execute");
    assert_eq!(response.status(), StatusCode::OK);
    parse_json_body(response).await
}

async fn refresh_with(app: &axum::Router, refresh_token: &str, ip: &str) -> axum::response::Response {
    let request = Request::builder()
        .method("POST")
        .uri("/user/refresh")
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(json!({"refresh_token": refresh_token}).to_string()))
        .expect("refresh request should build");
    app.clone()
        .oneshot(request)
        .await
        .expect("refresh request should execute")
}

async fn get_me(app: &axum::Router, access_token: &str, ip: &str) -> axum::response::Response {
    let request = Request::builder()
        .method("GET")
        .uri("/user/me")
        .header("authorization", format!("Bearer {access_token}"))
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .expect("me request should build");
    app.clone()
        .oneshot(request)
        .await
        .expect("me request should execute")
}

#[tokio::test]
async fn register_login_me_and_duplicate_registration() {
    let app = test_app();
    let ip = "203.0.113.20";

    let created = register(&app, "alice_1", ip).await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let created_body: Value = parse_json_body(created).await;
    assert_eq!(created_body["username"], "alice_1");
    assert_eq!(created_body["email"], "alice_1@example.com");
    assert!(created_body["user_id"].as_str().is_some());

    let duplicate = register(&app, "alice_1", ip).await;
    assert_eq!(duplicate.status(), StatusCode::BAD_REQUEST);

    let tokens = login(&app, "alice_1", ip).await;
    let me = get_me(&app, &tokens.access_token, ip).await;
    assert_eq!(me.status(), StatusCode::OK);
    let me_body: Value = parse_json_body(me).await;
    assert_eq!(me_body["user"]["username"], "alice_1");
    assert!(me_body["profile"].is_null());
}

#[tokio::test]
async fn a_taken_email_is_rejected_like_a_taken_username() {
    let app = test_app();
    let ip = "203.0.113.27";

    let first = register_with_email(&app, "erin_5", "shared_5@example.com", ip).await;
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = register_with_email(&app, "frank_6", "shared_5@example.com", ip).await;
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    let body: Value = parse_json_body(second).await;
    assert_eq!(body["error"], "invalid_request");

    // A fresh email under the rejected username still works.
    let retry = register_with_email(&app, "frank_6", "frank_6@example.com", ip).await;
    assert_eq!(retry.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn refresh_rotates_the_pair_and_invalidates_the_old_refresh_token() {
    let app = test_app();
    let ip = "203.0.113.21";
    assert_eq!(register(&app, "bob_2", ip).await.status(), StatusCode::CREATED);
    let tokens = login(&app, "bob_2", ip).await;

    let rotated_response = refresh_with(&app, &tokens.refresh_token, ip).await;
    assert_eq!(rotated_response.status(), StatusCode::OK);
    let rotated: TokenPair = parse_json_body(rotated_response).await;
    assert_ne!(rotated.refresh_token, tokens.refresh_token);
    assert_ne!(rotated.access_token, tokens.access_token);

    let replay = refresh_with(&app, &tokens.refresh_token, ip).await;
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    let replay_body: Value = parse_json_body(replay).await;
    assert_eq!(replay_body["error"], "refresh_not_found");

    let still_valid = refresh_with(&app, &rotated.refresh_token, ip).await;
    assert_eq!(still_valid.status(), StatusCode::OK);
}

#[tokio::test]
async fn a_second_login_displaces_the_previous_refresh_token() {
    let app = test_app();
    let ip = "203.0.113.22";
    assert_eq!(register(&app, "carol_3", ip).await.status(), StatusCode::CREATED);

    let first = login(&app, "carol_3", ip).await;
    let second = login(&app, "carol_3", ip).await;

    let stale = refresh_with(&app, &first.refresh_token, ip).await;
    assert_eq!(stale.status(), StatusCode::BAD_REQUEST);

    let current = refresh_with(&app, &second.refresh_token, ip).await;
    assert_eq!(current.status(), StatusCode::OK);
}

#[tokio::test]
async fn logout_kills_refresh_but_access_survives_until_expiry() {
    let app = test_app();
    let ip = "203.0.113.23";
    assert_eq!(register(&app, "dave_4", ip).await.status(), StatusCode::CREATED);
    let tokens = login(&app, "dave_4", ip).await;

    let logout = Request::builder()
        .method("GET")
        .uri("/user/logout")
        .header("authorization", format!("Bearer {}", tokens.access_token))
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .expect("logout request should build");
    let logout_response = app
        .clone()
        .oneshot(logout)
        .await
        .expect("logout request should execute");
    assert_eq!(logout_response.status(), StatusCode::OK);
    let logout_body: Value = parse_json_body(logout_response).await;
    assert_eq!(logout_body["logged_out"], true);

    let refresh_after_logout = refresh_with(&app, &tokens.refresh_token, ip).await;
    assert_eq!(refresh_after_logout.status(), StatusCode::BAD_REQUEST);
    let refresh_body: Value = parse_json_body(refresh_after_logout).await;
    assert_eq!(refresh_body["error"], "refresh_not_found");

    // Access tokens are verified statelessly, so the outstanding one keeps
    // working until its five minute expiry.
    let me_after_logout = get_me(&app, &tokens.access_token, ip).await;
    assert_eq!(me_after_logout.status(), StatusCode::OK);
}

#[tokio::test]
async fn logout_without_a_bearer_token_is_rejected() {
    let app = test_app();
    let request = Request::builder()
        .method("GET")
        .uri("/user/logout")
        .header("x-forwarded-for", "203.0.113.24")
        .body(Body::empty())
        .expect("logout request should build");
    let response = app
        .oneshot(request)
        .await
        .expect("logout request should execute");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_errors_do_not_enumerate_accounts() {
    let app = test_app();
    let ip = "203.0.113.25";

    let unknown = Request::builder()
        .method("POST")
        .uri("/user/login")
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(
            json!({"username":"does_not_exist","password":"super-secure-password"}).to_string(),
        ))
        .expect("login request should build");
    let unknown_response = app
        .clone()
        .oneshot(unknown)
        .await
        .expect("login request should execute");
    assert_eq!(unknown_response.status(), StatusCode::UNAUTHORIZED);
    let unknown_body = axum::body::to_bytes(unknown_response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");

    let wrong_password = Request::builder()
        .method("POST")
        .uri("/user/login")
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(
            json!({"username":"does_not_exist","password":"wrong-password-here"}).to_string(),
        ))
        .expect("login request should build");
    let wrong_password_response = app
        .clone()
        .oneshot(wrong_password)
        .await
        .expect("login request should execute");
    assert_eq!(wrong_password_response.status(), StatusCode::UNAUTHORIZED);
    let wrong_password_body = axum::body::to_bytes(wrong_password_response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");

    assert_eq!(unknown_body, wrong_password_body);
}

#[tokio::test]
async fn garbage_refresh_tokens_report_refresh_not_found() {
    let app = test_app();
    let response = refresh_with(&app, "not-a-real-token", "203.0.113.26").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = parse_json_body(response).await;
    assert_eq!(body["error"], "refresh_not_found");
}
