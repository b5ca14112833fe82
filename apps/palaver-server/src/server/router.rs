use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use axum::{
    extract::ConnectInfo,
    extract::DefaultBodyLimit,
    http::{request::Request, HeaderName, StatusCode},
    routing::{get, patch, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    errors::GovernorError, governor::GovernorConfigBuilder, key_extractor::KeyExtractor,
    GovernorLayer,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    auth::resolve_client_ip,
    core::{AppConfig, AppState, MAX_NOTIFY_TIMEOUT_SECS},
    handlers::{
        auth::{login, logout, me, refresh, register},
        favorites::{check_favorite, toggle_favorite},
        media::{download_file, upload_file},
        messages::{
            bulk_mark_read, create_message, delete_message, list_messages, update_message,
        },
        profiles::{create_profile, delete_profile, get_profile, list_profiles, update_profile},
    },
    types::{health, metrics},
};

#[derive(Clone)]
struct ForwardedClientIpKeyExtractor;

impl KeyExtractor for ForwardedClientIpKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        let peer_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|value| value.0.ip())
            .or_else(|| req.extensions().get::<SocketAddr>().map(SocketAddr::ip));
        let resolved = resolve_client_ip(req.headers(), peer_ip);
        Ok(resolved.ip().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
    }
}

/// Build the axum router with global security middleware.
///
/// # Errors
/// Returns an error if configured limits are invalid.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    if config.rate_limit_requests_per_minute == 0 {
        return Err(anyhow!(
            "global rate limit must be at least 1 request per minute"
        ));
    }
    if config.auth_route_requests_per_minute == 0 {
        return Err(anyhow!(
            "auth route rate limit must be at least 1 request per minute"
        ));
    }
    if config.page_size == 0 {
        return Err(anyhow!("page size must be at least 1 result"));
    }
    if config.max_upload_bytes == 0 {
        return Err(anyhow!("max upload bytes must be at least 1 byte"));
    }
    if config.notify_timeout.is_zero()
        || config.notify_timeout > Duration::from_secs(MAX_NOTIFY_TIMEOUT_SECS)
    {
        return Err(anyhow!(
            "notify timeout must be between 1 and {MAX_NOTIFY_TIMEOUT_SECS} seconds"
        ));
    }

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(ForwardedClientIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let app_state = AppState::new(config)?;
    let request_id_header = HeaderName::from_static("x-request-id");
    let governor_layer = GovernorLayer::new(governor_config);

    let routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/user/register", post(register))
        .route("/user/login", post(login))
        .route("/user/refresh", post(refresh))
        .route("/user/logout", get(logout))
        .route("/user/me", get(me))
        .route("/user/profile", get(list_profiles).post(create_profile))
        .route(
            "/user/profile/{profile_id}",
            get(get_profile).patch(update_profile).delete(delete_profile),
        )
        .route("/user/update-favorite", post(toggle_favorite))
        .route("/user/check-favorite/{favorite_id}", get(check_favorite))
        .route("/message/file-download/{file_id}", get(download_file))
        .route(
            "/message/message",
            get(list_messages).post(create_message),
        )
        .route(
            "/message/message/{message_id}",
            patch(update_message).delete(delete_message),
        )
        .route("/message/read-messages", post(bulk_mark_read));

    let upload_route = Router::new()
        .route("/message/file-upload", post(upload_file))
        .layer(DefaultBodyLimit::disable());

    Ok(routes
        .merge(upload_route)
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(governor_layer),
        ))
}
