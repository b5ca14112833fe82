use std::{
    net::IpAddr,
    sync::atomic::Ordering,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::anyhow;
use argon2::{
    password_hash::rand_core::{OsRng, RngCore},
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use pasetors::{
    claims::{Claims, ClaimsValidationRules},
    local,
    token::UntrustedToken,
    version4::V4,
    Local,
};
use sha2::{Digest, Sha256};
use sqlx::Row;

use palaver_core::UserId;

use super::{
    core::{
        AppState, AuthContext, ACCESS_TOKEN_TTL_SECS, RATE_LIMIT_SWEEP_INTERVAL_SECS,
        REFRESH_NONCE_CHARS, REFRESH_TOKEN_TTL_SECS,
    },
    errors::ApiFailure,
};

const MAX_X_FORWARDED_FOR_HEADER_CHARS: usize = 512;
const MAX_X_FORWARDED_FOR_ENTRY_CHARS: usize = 64;
const UNKNOWN_CLIENT_IP: &str = "unknown";
const RATE_LIMIT_WINDOW_SECS: i64 = 60;
const TOKEN_NONCE_CHARSET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientIpSource {
    Peer,
    Forwarded,
}

impl ClientIpSource {
    #[must_use]
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Peer => "peer",
            Self::Forwarded => "forwarded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClientIp {
    ip: Option<IpAddr>,
    source: ClientIpSource,
}

impl ClientIp {
    #[must_use]
    pub(crate) fn ip(self) -> Option<IpAddr> {
        self.ip
    }

    #[must_use]
    pub(crate) fn source(self) -> ClientIpSource {
        self.source
    }

    #[must_use]
    pub(crate) fn normalized(self) -> String {
        self.ip
            .map_or_else(|| String::from(UNKNOWN_CLIENT_IP), |ip| ip.to_string())
    }

    pub(crate) fn peer(ip: Option<IpAddr>) -> Self {
        Self {
            ip,
            source: ClientIpSource::Peer,
        }
    }

    fn forwarded(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            source: ClientIpSource::Forwarded,
        }
    }
}

pub(crate) fn validate_password(value: &str) -> Result<(), ApiFailure> {
    let len = value.len();
    if (8..=128).contains(&len) {
        Ok(())
    } else {
        Err(ApiFailure::InvalidRequest)
    }
}

pub(crate) fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hash failed: {e}"))?
        .to_string();
    Ok(hash)
}

pub(crate) fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied_password.as_bytes(), &parsed)
        .is_ok()
}

/// Generates a random token string of exactly `length` characters drawn from
/// the uppercase/digit charset.
pub(crate) fn random_token_string(length: usize) -> String {
    let mut bytes = vec![0_u8; length];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .into_iter()
        .map(|byte| char::from(TOKEN_NONCE_CHARSET[usize::from(byte) % TOKEN_NONCE_CHARSET.len()]))
        .collect()
}

pub(crate) struct IssuedTokens {
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
    pub(crate) refresh_hash: [u8; 32],
}

/// Mints a fresh access/refresh pair for `user_id`.
///
/// The access token carries the account id and a five minute expiry. The
/// refresh token carries only a random nonce and a one year expiry; its
/// mapping to an account lives solely in the stored credential pair, so
/// rotation and logout revoke it immediately.
pub(crate) fn issue_credential_pair(
    state: &AppState,
    user_id: UserId,
    username: &str,
) -> anyhow::Result<IssuedTokens> {
    let ttl = u64::try_from(ACCESS_TOKEN_TTL_SECS).map_err(|e| anyhow!("access ttl: {e}"))?;
    let mut claims = Claims::new_expires_in(&Duration::from_secs(ttl))
        .map_err(|e| anyhow!("claims init failed: {e}"))?;
    claims
        .subject(&user_id.to_string())
        .map_err(|e| anyhow!("claim sub failed: {e}"))?;
    claims
        .add_additional("username", username)
        .map_err(|e| anyhow!("claim username failed: {e}"))?;
    let access_token = local::encrypt(&state.token_key, &claims, None, None)
        .map_err(|e| anyhow!("access token mint failed: {e}"))?;

    let refresh_ttl =
        u64::try_from(REFRESH_TOKEN_TTL_SECS).map_err(|e| anyhow!("refresh ttl: {e}"))?;
    let mut refresh_claims = Claims::new_expires_in(&Duration::from_secs(refresh_ttl))
        .map_err(|e| anyhow!("refresh claims init failed: {e}"))?;
    let nonce = random_token_string(REFRESH_NONCE_CHARS);
    refresh_claims
        .add_additional("nonce", nonce)
        .map_err(|e| anyhow!("claim nonce failed: {e}"))?;
    let mut entropy = [0_u8; 32];
    OsRng.fill_bytes(&mut entropy);
    refresh_claims
        .add_additional("entropy", URL_SAFE_NO_PAD.encode(entropy))
        .map_err(|e| anyhow!("claim entropy failed: {e}"))?;
    let refresh_token = local::encrypt(&state.token_key, &refresh_claims, None, None)
        .map_err(|e| anyhow!("refresh token mint failed: {e}"))?;
    let refresh_hash = hash_refresh_token(&refresh_token);

    Ok(IssuedTokens {
        access_token,
        refresh_token,
        refresh_hash,
    })
}

pub(crate) fn verify_token(state: &AppState, token: &str) -> anyhow::Result<Claims> {
    let untrusted = UntrustedToken::<Local, V4>::try_from(token).map_err(|e| anyhow!("{e}"))?;
    let validation_rules = ClaimsValidationRules::new();
    let trusted = local::decrypt(&state.token_key, &untrusted, &validation_rules, None, None)
        .map_err(|e| anyhow!("token decrypt failed: {e}"))?;
    trusted
        .payload_claims()
        .cloned()
        .ok_or_else(|| anyhow!("token claims missing"))
}

/// Strict gate: every mutating route goes through here. Resolves the bearer
/// token to an account and stamps the account's online marker before the
/// handler runs.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, ApiFailure> {
    let access_token = bearer_token(headers).ok_or(ApiFailure::Unauthorized)?;
    resolve_token_identity(state, access_token)
        .await
        .ok_or(ApiFailure::Unauthorized)
}

async fn resolve_token_identity(state: &AppState, access_token: &str) -> Option<AuthContext> {
    let claims = verify_token(state, access_token).ok()?;
    let subject = claims
        .get_claim("sub")
        .and_then(serde_json::Value::as_str)?
        .to_owned();
    let user_id = UserId::try_from(subject.clone()).ok()?;
    let username = touch_account(state, &subject).await?;
    Some(AuthContext { user_id, username })
}

/// Stamps the online marker on the account and returns its username, or
/// `None` when the account is gone or deactivated.
async fn touch_account(state: &AppState, user_id: &str) -> Option<String> {
    let now = now_unix();
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "UPDATE users SET last_seen_unix = $2
             WHERE user_id = $1 AND is_active
             RETURNING username",
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(pool)
        .await
        .ok()?;
        return row.and_then(|value| value.try_get("username").ok());
    }

    let username = state.user_ids.read().await.get(user_id).cloned()?;
    let mut users = state.users.write().await;
    let user = users.get_mut(&username)?;
    if !user.is_active {
        return None;
    }
    user.last_seen_unix = now;
    Some(username)
}

pub(crate) async fn find_username_by_user_id(state: &AppState, user_id: UserId) -> Option<String> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query("SELECT username FROM users WHERE user_id = $1")
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await
            .ok()?;
        return row.and_then(|value| value.try_get("username").ok());
    }
    state
        .user_ids
        .read()
        .await
        .get(&user_id.to_string())
        .cloned()
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

pub(crate) fn hash_refresh_token(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

pub(crate) fn now_unix() -> i64 {
    let now = SystemTime::now();
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

async fn maybe_sweep_rate_limit_state(state: &AppState, now: i64) {
    let last = state.rate_limit_last_sweep_unix.load(Ordering::Relaxed);
    if now.saturating_sub(last) < RATE_LIMIT_SWEEP_INTERVAL_SECS {
        return;
    }
    if state
        .rate_limit_last_sweep_unix
        .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    let mut hits = state.auth_route_hits.write().await;
    hits.retain(|_, route_hits| {
        route_hits.retain(|timestamp| now.saturating_sub(*timestamp) < RATE_LIMIT_WINDOW_SECS);
        !route_hits.is_empty()
    });
}

pub(crate) async fn enforce_auth_route_rate_limit(
    state: &AppState,
    client_ip: ClientIp,
    route: &str,
) -> Result<(), ApiFailure> {
    let ip = client_ip.normalized();
    let key = format!("{route}:{ip}");
    let now = now_unix();
    maybe_sweep_rate_limit_state(state, now).await;

    let mut hits = state.auth_route_hits.write().await;
    let route_hits = hits.entry(key).or_default();
    route_hits.retain(|timestamp| now.saturating_sub(*timestamp) < RATE_LIMIT_WINDOW_SECS);
    let max_hits =
        usize::try_from(state.runtime.auth_route_requests_per_minute).unwrap_or(usize::MAX);
    if route_hits.len() >= max_hits {
        tracing::warn!(
            event = "auth.rate_limit",
            route = %route,
            client_ip = %ip,
            client_ip_source = client_ip.source().as_str()
        );
        return Err(ApiFailure::RateLimited);
    }
    route_hits.push(now);
    Ok(())
}

pub(crate) fn resolve_client_ip(headers: &HeaderMap, peer_ip: Option<IpAddr>) -> ClientIp {
    if let Some(forwarded_ip) = parse_forwarded_ip(headers) {
        return ClientIp::forwarded(forwarded_ip);
    }
    ClientIp::peer(peer_ip)
}

fn parse_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .filter(|value| value.len() <= MAX_X_FORWARDED_FOR_HEADER_CHARS)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_X_FORWARDED_FOR_ENTRY_CHARS)
        .and_then(|value| value.parse::<IpAddr>().ok())
}
