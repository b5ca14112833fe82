use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};

use palaver_core::UserId;

use crate::server::{
    auth::{authenticate, find_username_by_user_id, now_unix},
    core::AppState,
    db::ensure_db_schema,
    errors::ApiFailure,
    types::{CheckFavoriteResponse, ToggleFavoriteRequest, ToggleFavoriteResponse},
};

pub(crate) async fn is_favorite(
    state: &AppState,
    owner_id: UserId,
    target_id: UserId,
) -> Result<bool, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT 1 FROM favorites WHERE owner_user_id = $1 AND favorite_user_id = $2",
        )
        .bind(owner_id.to_string())
        .bind(target_id.to_string())
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return Ok(row.is_some());
    }

    let favorites = state.favorites.read().await;
    Ok(favorites
        .get(&owner_id.to_string())
        .is_some_and(|set| set.contains(&target_id.to_string())))
}

/// Flips the favorite edge from the caller to `favorite_id`. Responds with
/// whether the edge was added or removed so clients can update in place.
pub(crate) async fn toggle_favorite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ToggleFavoriteRequest>,
) -> Result<Json<ToggleFavoriteResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let target_id =
        UserId::try_from(payload.favorite_id).map_err(|_| ApiFailure::InvalidRequest)?;
    if target_id == auth.user_id {
        return Err(ApiFailure::InvalidRequest);
    }
    if find_username_by_user_id(&state, target_id).await.is_none() {
        return Err(ApiFailure::NotFound);
    }

    let added = if let Some(pool) = &state.db_pool {
        let removed = sqlx::query(
            "DELETE FROM favorites WHERE owner_user_id = $1 AND favorite_user_id = $2",
        )
        .bind(auth.user_id.to_string())
        .bind(target_id.to_string())
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        if removed.rows_affected() > 0 {
            false
        } else {
            sqlx::query(
                "INSERT INTO favorites (owner_user_id, favorite_user_id, created_at_unix)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (owner_user_id, favorite_user_id) DO NOTHING",
            )
            .bind(auth.user_id.to_string())
            .bind(target_id.to_string())
            .bind(now_unix())
            .execute(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
            true
        }
    } else {
        let mut favorites = state.favorites.write().await;
        let set = favorites.entry(auth.user_id.to_string()).or_default();
        if set.remove(&target_id.to_string()) {
            false
        } else {
            set.insert(target_id.to_string());
            true
        }
    };

    let status = if added { "added" } else { "removed" };
    tracing::info!(event = "favorites.toggle", outcome = status, user_id = %auth.user_id, favorite_id = %target_id);
    Ok(Json(ToggleFavoriteResponse { status }))
}

pub(crate) async fn check_favorite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(favorite_id): Path<String>,
) -> Result<Json<CheckFavoriteResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let target_id = UserId::try_from(favorite_id).map_err(|_| ApiFailure::InvalidRequest)?;
    if find_username_by_user_id(&state, target_id).await.is_none() {
        return Err(ApiFailure::NotFound);
    }

    let favorite = is_favorite(&state, auth.user_id, target_id).await?;
    Ok(Json(CheckFavoriteResponse { favorite }))
}
