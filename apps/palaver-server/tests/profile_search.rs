use std::{path::PathBuf, time::Duration};

use axum::{body::Body, http::Request, http::StatusCode};
use palaver_server::{build_router, AppConfig};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower::ServiceExt;
use ulid::Ulid;

const IP: &str = "203.0.113.40";

#[derive(Debug, serde::Deserialize)]
struct TokenPair {
    access_token: String,
}

fn upload_root() -> PathBuf {
    std::env::temp_dir().join(format!("palaver-test-uploads-{}", Ulid::new()))
}

fn test_app() -> axum::Router {
    build_router(&AppConfig {
        max_body_bytes: 1024 * 64,
        request_timeout: Duration::from_secs(2),
        rate_limit_requests_per_minute: 400,
        auth_route_requests_per_minute: 400,
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

async fn register_and_login(app: &axum::Router, username: &str) -> (String, TokenPair) {
    let register = Request::builder()
        .method("POST")
        .uri("/user/register")
        .header("content-type", "application/json")
        .header("x-forwarded-for", IP)
        .body(Body::from(
            json!({
                "username": username,
                "email": format!("{username}@example.com"),
                "password": "super-secure-password"
            })
            .to_string(),
        ))
        .expect("register request should build");
    let register_response = app
        .clone()
        .oneshot(register)
        .await
        .expect("register request should execute");
    assert_eq!(register_response.status(), StatusCode::CREATED);
    let registered: Value = parse_json_body(register_response).await;
    let user_id = registered["user_id"]
        .as_str()
        .expect("user id should exist")
        .to_owned();

    let login = Request::builder()
        .method("POST")
        .uri("/user/login")
        .header("content-type", "application/json")
        .header("x-forwarded-for", IP)
        .body(Body::from(
            json!({"username": username, "password": "super-secure-password"}).to_string(),
        ))
        .expect("login request should build");
    let login_response = app
        .clone()
        .oneshot(login)
        .await
        .expect("login request should execute");
    assert_eq!(login_response.status(), StatusCode::OK);
    (user_id, parse_json_body(login_response).await)
}

async fn create_profile(
    app: &axum::Router,
    tokens: &TokenPair,
    first_name: &str,
    last_name: &str,
    caption: &str,
) -> Value {
    let request = Request::builder()
        .method("POST")
        .uri("/user/profile")
        .header("authorization", format!("Bearer {}", tokens.access_token))
        .header("content-type", "application/json")
        .header("x-forwarded-for", IP)
        .body(Body::from(
            json!({"first_name": first_name, "last_name": last_name, "caption": caption})
                .to_string(),
        ))
        .expect("create profile request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("create profile request should execute");
    assert_eq!(response.status(), StatusCode::CREATED);
    parse_json_body(response).await
}

async fn search_profiles(app: &axum::Router, tokens: &TokenPair, query: &str) -> Value {
    let request = Request::builder()
        .method("GET")
        .uri(format!("/user/profile{query}"))
        .header("authorization", format!("Bearer {}", tokens.access_token))
        .header("x-forwarded-for", IP)
        .body(Body::empty())
        .expect("search request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("search request should execute");
    assert_eq!(response.status(), StatusCode::OK);
    parse_json_body(response).await
}

fn result_usernames(body: &Value) -> Vec<String> {
    body["results"]
        .as_array()
        .expect("results should be an array")
        .iter()
        .map(|profile| {
            profile["username"]
                .as_str()
                .expect("username should exist")
                .to_owned()
        })
        .collect()
}

async fn toggle_favorite(app: &axum::Router, tokens: &TokenPair, favorite_id: &str) -> Value {
    let request = Request::builder()
        .method("POST")
        .uri("/user/update-favorite")
        .header("authorization", format!("Bearer {}", tokens.access_token))
        .header("content-type", "application/json")
        .header("x-forwarded-for", IP)
        .body(Body::from(json!({"favorite_id": favorite_id}).to_string()))
        .expect("toggle request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("toggle request should execute");
    assert_eq!(response.status(), StatusCode::OK);
    parse_json_body(response).await
}

struct SearchFixture {
    app: axum::Router,
    searcher: TokenPair,
    adefemi_id: String,
    adekunle_id: String,
}

async fn search_fixture() -> SearchFixture {
    let app = test_app();

    let (_, searcher) = register_and_login(&app, "finder_1").await;
    create_profile(&app, &searcher, "Adela", "Finder", "me").await;

    let (adefemi_id, adefemi) = register_and_login(&app, "adefemi1").await;
    create_profile(&app, &adefemi, "Adefemi", "Oseni", "builder").await;

    let (_, wale) = register_and_login(&app, "wale9").await;
    create_profile(&app, &wale, "Wale", "Joshua", "artist").await;

    let (adekunle_id, adekunle) = register_and_login(&app, "tunde7").await;
    create_profile(&app, &adekunle, "Adekunle", "Balogun", "writer").await;

    SearchFixture {
        app,
        searcher,
        adefemi_id,
        adekunle_id,
    }
}

#[tokio::test]
async fn substring_search_matches_across_fields_and_excludes_self() {
    let fixture = search_fixture().await;
    let body = search_profiles(&fixture.app, &fixture.searcher, "?search=ade").await;

    let usernames = result_usernames(&body);
    assert_eq!(usernames.len(), 2, "expected exactly two matches: {usernames:?}");
    assert!(usernames.contains(&String::from("adefemi1")));
    assert!(usernames.contains(&String::from("tunde7")));
    // The searcher's own "Adela" profile matches the term but never appears.
    assert!(!usernames.contains(&String::from("finder_1")));
}

#[tokio::test]
async fn every_unquoted_term_must_match_and_quoted_phrases_match_verbatim() {
    let fixture = search_fixture().await;

    let both_terms = search_profiles(&fixture.app, &fixture.searcher, "?search=adefemi%20oseni").await;
    assert_eq!(result_usernames(&both_terms), vec![String::from("adefemi1")]);

    // Quoted, the whole phrase must appear inside one field, which no
    // single field satisfies.
    let quoted =
        search_profiles(&fixture.app, &fixture.searcher, "?search=%22adefemi%20oseni%22").await;
    assert!(result_usernames(&quoted).is_empty());
}

#[tokio::test]
async fn favorites_rank_ahead_of_the_rest_of_the_results() {
    let fixture = search_fixture().await;

    let before = search_profiles(&fixture.app, &fixture.searcher, "?search=ade").await;
    let before_names = result_usernames(&before);
    assert_eq!(before_names.len(), 2);

    let toggled = toggle_favorite(&fixture.app, &fixture.searcher, &fixture.adekunle_id).await;
    assert_eq!(toggled["status"], "added");

    let after = search_profiles(&fixture.app, &fixture.searcher, "?search=ade").await;
    let after_names = result_usernames(&after);
    assert_eq!(after_names[0], "tunde7", "favorited profile should sort first");
    assert_eq!(
        after["results"][0]["favorite"], 1,
        "favorite annotation should reflect the requester's set"
    );
    assert_eq!(after["results"][1]["favorite"], 0);

    let _ = fixture.adefemi_id;
}

#[tokio::test]
async fn page_is_stripped_from_filters_and_unknown_keys_are_rejected() {
    let fixture = search_fixture().await;

    let paged = search_profiles(&fixture.app, &fixture.searcher, "?search=ade&page=1").await;
    assert_eq!(result_usernames(&paged).len(), 2);

    let beyond = search_profiles(&fixture.app, &fixture.searcher, "?search=ade&page=2").await;
    assert!(result_usernames(&beyond).is_empty());

    let request = Request::builder()
        .method("GET")
        .uri("/user/profile?is_superuser=false")
        .header(
            "authorization",
            format!("Bearer {}", fixture.searcher.access_token),
        )
        .header("x-forwarded-for", IP)
        .body(Body::empty())
        .expect("search request should build");
    let response = fixture
        .app
        .clone()
        .oneshot(request)
        .await
        .expect("search request should execute");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn exact_filters_use_equality_on_allow_listed_fields() {
    let fixture = search_fixture().await;

    let exact = search_profiles(&fixture.app, &fixture.searcher, "?first_name=Adefemi").await;
    assert_eq!(result_usernames(&exact), vec![String::from("adefemi1")]);

    // Exact match, not a substring.
    let partial = search_profiles(&fixture.app, &fixture.searcher, "?first_name=Ade").await;
    assert!(result_usernames(&partial).is_empty());
}

#[tokio::test]
async fn toggle_and_check_favorite_round_trip() {
    let fixture = search_fixture().await;

    let check_uri = format!("/user/check-favorite/{}", fixture.adefemi_id);
    let check = |app: axum::Router, token: String, uri: String| async move {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .header("x-forwarded-for", IP)
            .body(Body::empty())
            .expect("check request should build");
        let response = app
            .oneshot(request)
            .await
            .expect("check request should execute");
        assert_eq!(response.status(), StatusCode::OK);
        parse_json_body::<Value>(response).await
    };

    let initial = check(
        fixture.app.clone(),
        fixture.searcher.access_token.clone(),
        check_uri.clone(),
    )
    .await;
    assert_eq!(initial["favorite"], false);

    let added = toggle_favorite(&fixture.app, &fixture.searcher, &fixture.adefemi_id).await;
    assert_eq!(added["status"], "added");
    let after_add = check(
        fixture.app.clone(),
        fixture.searcher.access_token.clone(),
        check_uri.clone(),
    )
    .await;
    assert_eq!(after_add["favorite"], true);

    let removed = toggle_favorite(&fixture.app, &fixture.searcher, &fixture.adefemi_id).await;
    assert_eq!(removed["status"], "removed");
    let after_remove = check(
        fixture.app.clone(),
        fixture.searcher.access_token.clone(),
        check_uri,
    )
    .await;
    assert_eq!(after_remove["favorite"], false);
}

#[tokio::test]
async fn profile_update_is_owner_only_and_delete_removes_it() {
    let fixture = search_fixture().await;

    let body = search_profiles(&fixture.app, &fixture.searcher, "?search=adefemi").await;
    let profile_id = body["results"][0]["profile_id"]
        .as_str()
        .expect("profile id should exist")
        .to_owned();

    // The searcher does not own this profile.
    let intruder_patch = Request::builder()
        .method("PATCH")
        .uri(format!("/user/profile/{profile_id}"))
        .header(
            "authorization",
            format!("Bearer {}", fixture.searcher.access_token),
        )
        .header("content-type", "application/json")
        .header("x-forwarded-for", IP)
        .body(Body::from(json!({"caption": "hijacked"}).to_string()))
        .expect("patch request should build");
    let intruder_response = fixture
        .app
        .clone()
        .oneshot(intruder_patch)
        .await
        .expect("patch request should execute");
    assert_eq!(intruder_response.status(), StatusCode::FORBIDDEN);

    let (_, owner) = {
        let login = Request::builder()
            .method("POST")
            .uri("/user/login")
            .header("content-type", "application/json")
            .header("x-forwarded-for", IP)
            .body(Body::from(
                json!({"username": "adefemi1", "password": "super-secure-password"}).to_string(),
            ))
            .expect("login request should build");
        let response = fixture
            .app
            .clone()
            .oneshot(login)
            .await
            .expect("login request should execute");
        assert_eq!(response.status(), StatusCode::OK);
        (String::new(), parse_json_body::<TokenPair>(response).await)
    };

    let owner_patch = Request::builder()
        .method("PATCH")
        .uri(format!("/user/profile/{profile_id}"))
        .header("authorization", format!("Bearer {}", owner.access_token))
        .header("content-type", "application/json")
        .header("x-forwarded-for", IP)
        .body(Body::from(json!({"caption": "shipping"}).to_string()))
        .expect("patch request should build");
    let owner_response = fixture
        .app
        .clone()
        .oneshot(owner_patch)
        .await
        .expect("patch request should execute");
    assert_eq!(owner_response.status(), StatusCode::OK);
    let updated: Value = parse_json_body(owner_response).await;
    assert_eq!(updated["caption"], "shipping");

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/user/profile/{profile_id}"))
        .header("authorization", format!("Bearer {}", owner.access_token))
        .header("x-forwarded-for", IP)
        .body(Body::empty())
        .expect("delete request should build");
    let delete_response = fixture
        .app
        .clone()
        .oneshot(delete)
        .await
        .expect("delete request should execute");
    assert_eq!(delete_response.status(), StatusCode::NO_CONTENT);

    let fetch = Request::builder()
        .method("GET")
        .uri(format!("/user/profile/{profile_id}"))
        .header(
            "authorization",
            format!("Bearer {}", fixture.searcher.access_token),
        )
        .header("x-forwarded-for", IP)
        .body(Body::empty())
        .expect("get request should build");
    let fetch_response = fixture
        .app
        .clone()
        .oneshot(fetch)
        .await
        .expect("get request should execute");
    assert_eq!(fetch_response.status(), StatusCode::NOT_FOUND);
}
