use std::net::SocketAddr;

use axum::{
    extract::{connect_info::ConnectInfo, Extension, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use sqlx::Row;

use palaver_core::{Email, Username};

use crate::server::{
    auth::{
        authenticate, enforce_auth_route_rate_limit, find_username_by_user_id, hash_password,
        issue_credential_pair, now_unix, resolve_client_ip, validate_password, verify_token,
    },
    core::{AppState, ACCESS_TOKEN_TTL_SECS},
    db::ensure_db_schema,
    errors::ApiFailure,
    handlers::profiles::find_profile_view_for_user,
    token_repository::{TokenPersistence, TokenRepository},
    types::{
        LoginRequest, LogoutResponse, MeResponse, RefreshRequest, RegisterRequest,
        TokenPairResponse, UserSummary,
    },
};

const MAX_REFRESH_TOKEN_CHARS: usize = 1024;

pub(crate) async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserSummary>), ApiFailure> {
    ensure_db_schema(&state).await?;
    let client_ip = resolve_client_ip(&headers, connect_info.as_ref().map(|value| value.0 .0.ip()));
    enforce_auth_route_rate_limit(&state, client_ip, "register").await?;

    let username = Username::try_from(payload.username).map_err(|_| ApiFailure::InvalidRequest)?;
    let email = Email::try_from(payload.email).map_err(|_| ApiFailure::InvalidRequest)?;
    validate_password(&payload.password)?;
    let password_hash = hash_password(&payload.password).map_err(|_| ApiFailure::Internal)?;

    let now = now_unix();
    let repository = TokenRepository::from_state(&state);
    let user_id = repository
        .create_user_if_missing(&username, &email, &password_hash, now)
        .await?;
    let Some(user_id) = user_id else {
        tracing::info!(event = "auth.register", outcome = "identifier_taken");
        return Err(ApiFailure::InvalidRequest);
    };

    tracing::info!(event = "auth.register", outcome = "created", user_id = %user_id);

    Ok((
        StatusCode::CREATED,
        Json(UserSummary {
            user_id: user_id.to_string(),
            username: username.as_str().to_owned(),
            email: email.as_str().to_owned(),
            last_seen_unix: now,
            created_at_unix: now,
        }),
    ))
}

pub(crate) async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenPairResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let client_ip = resolve_client_ip(&headers, connect_info.as_ref().map(|value| value.0 .0.ip()));
    enforce_auth_route_rate_limit(&state, client_ip, "login").await?;

    let username = Username::try_from(payload.username).map_err(|_| ApiFailure::Unauthorized)?;
    validate_password(&payload.password).map_err(|_| ApiFailure::Unauthorized)?;
    let now = now_unix();
    let repository = TokenRepository::from_state(&state);
    let user_id = repository
        .verify_credentials(
            &username,
            &payload.password,
            &state.dummy_password_hash,
            now,
        )
        .await?;
    let Some(user_id) = user_id else {
        tracing::warn!(event = "auth.login", outcome = "invalid_credentials");
        return Err(ApiFailure::Unauthorized);
    };

    let issued = issue_credential_pair(&state, user_id, username.as_str())
        .map_err(|_| ApiFailure::Internal)?;
    repository
        .store_credential_pair(user_id, &issued.access_token, issued.refresh_hash, now)
        .await?;

    tracing::info!(event = "auth.login", outcome = "success", user_id = %user_id);

    Ok(Json(TokenPairResponse {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        expires_in_secs: ACCESS_TOKEN_TTL_SECS,
    }))
}

/// Rotates the caller's credential pair. A refresh token that fails
/// signature or expiry checks, or that no stored pair matches (because a
/// later login or logout replaced it), reports `refresh_not_found`.
pub(crate) async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<TokenPairResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let client_ip = resolve_client_ip(&headers, connect_info.as_ref().map(|value| value.0 .0.ip()));
    enforce_auth_route_rate_limit(&state, client_ip, "refresh").await?;

    if payload.refresh_token.is_empty() || payload.refresh_token.len() > MAX_REFRESH_TOKEN_CHARS {
        tracing::warn!(event = "auth.refresh", outcome = "invalid_token_format");
        return Err(ApiFailure::RefreshNotFound);
    }
    if verify_token(&state, &payload.refresh_token).is_err() {
        tracing::warn!(event = "auth.refresh", outcome = "invalid_token");
        return Err(ApiFailure::RefreshNotFound);
    }

    let now = now_unix();
    let repository = TokenRepository::from_state(&state);
    let user_id = repository
        .find_user_by_refresh_token(&payload.refresh_token, now)
        .await?
        .ok_or_else(|| {
            tracing::warn!(event = "auth.refresh", outcome = "no_matching_pair");
            ApiFailure::RefreshNotFound
        })?;
    let username = find_username_by_user_id(&state, user_id)
        .await
        .ok_or(ApiFailure::RefreshNotFound)?;

    let issued =
        issue_credential_pair(&state, user_id, &username).map_err(|_| ApiFailure::Internal)?;
    repository
        .store_credential_pair(user_id, &issued.access_token, issued.refresh_hash, now)
        .await?;

    tracing::info!(event = "auth.refresh", outcome = "success", user_id = %user_id);

    Ok(Json(TokenPairResponse {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        expires_in_secs: ACCESS_TOKEN_TTL_SECS,
    }))
}

/// Drops the caller's stored credential pair. The presented access token
/// stays valid until its own expiry since verification is stateless; only
/// the refresh side dies here.
pub(crate) async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LogoutResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let repository = TokenRepository::from_state(&state);
    repository.revoke_credential_pair(auth.user_id).await?;

    tracing::info!(event = "auth.logout", outcome = "success", user_id = %auth.user_id);
    Ok(Json(LogoutResponse { logged_out: true }))
}

pub(crate) async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let user = if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT username, email, last_seen_unix, created_at_unix
             FROM users WHERE user_id = $1",
        )
        .bind(auth.user_id.to_string())
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?
        .ok_or(ApiFailure::Unauthorized)?;
        UserSummary {
            user_id: auth.user_id.to_string(),
            username: row.try_get("username").map_err(|_| ApiFailure::Internal)?,
            email: row.try_get("email").map_err(|_| ApiFailure::Internal)?,
            last_seen_unix: row
                .try_get("last_seen_unix")
                .map_err(|_| ApiFailure::Internal)?,
            created_at_unix: row
                .try_get("created_at_unix")
                .map_err(|_| ApiFailure::Internal)?,
        }
    } else {
        let users = state.users.read().await;
        let user = users.get(&auth.username).ok_or(ApiFailure::Unauthorized)?;
        UserSummary {
            user_id: auth.user_id.to_string(),
            username: user.username.as_str().to_owned(),
            email: user.email.clone(),
            last_seen_unix: user.last_seen_unix,
            created_at_unix: user.created_at_unix,
        }
    };

    let profile = find_profile_view_for_user(&state, auth.user_id, auth.user_id).await?;

    Ok(Json(MeResponse { user, profile }))
}
