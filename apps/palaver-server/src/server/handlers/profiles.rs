use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use sqlx::Row;
use ulid::Ulid;

use palaver_core::{validate_profile_field, UserId};

use crate::server::{
    auth::{authenticate, now_unix},
    core::{
        AppState, ProfileRecord, MAX_PROFILE_ABOUT_CHARS, MAX_PROFILE_FIELD_CHARS,
    },
    db::ensure_db_schema,
    errors::ApiFailure,
    handlers::favorites::is_favorite,
    handlers::media::{ensure_upload_owned, load_file_view, load_file_views},
    search::{
        build_profile_search_sql, candidate_matches_exact, candidate_matches_terms, page_bounds,
        parse_profile_search, SearchCandidate,
    },
    types::{CreateProfileRequest, ProfileListResponse, ProfileView, UpdateProfileRequest},
};

fn validate_required_field(value: &str) -> Result<(), ApiFailure> {
    if value.trim().is_empty() {
        return Err(ApiFailure::InvalidRequest);
    }
    validate_profile_field(value, MAX_PROFILE_FIELD_CHARS).map_err(|_| ApiFailure::InvalidRequest)
}

fn validate_optional_field(value: &str, max_chars: usize) -> Result<(), ApiFailure> {
    validate_profile_field(value, max_chars).map_err(|_| ApiFailure::InvalidRequest)
}

async fn profile_view(
    state: &AppState,
    record: &ProfileRecord,
    username: String,
    requester_id: UserId,
) -> Result<ProfileView, ApiFailure> {
    let favorite = if record.user_id == requester_id {
        0
    } else {
        i64::from(is_favorite(state, requester_id, record.user_id).await?)
    };
    let profile_picture = match &record.picture_file_id {
        Some(file_id) => load_file_view(state, file_id).await?,
        None => None,
    };

    Ok(ProfileView {
        profile_id: record.profile_id.clone(),
        user_id: record.user_id.to_string(),
        username,
        first_name: record.first_name.clone(),
        last_name: record.last_name.clone(),
        caption: record.caption.clone(),
        about: record.about.clone(),
        profile_picture,
        favorite,
        created_at_unix: record.created_at_unix,
        updated_at_unix: record.updated_at_unix,
    })
}

pub(crate) async fn find_profile_record_by_user(
    state: &AppState,
    user_id: UserId,
) -> Result<Option<(ProfileRecord, String)>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT p.profile_id, p.user_id, u.username, p.first_name, p.last_name, p.caption,
                    p.about, p.picture_file_id, p.created_at_unix, p.updated_at_unix
             FROM profiles p JOIN users u ON u.user_id = p.user_id
             WHERE p.user_id = $1",
        )
        .bind(user_id.to_string())
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        let Some(row) = row else {
            return Ok(None);
        };
        return Ok(Some(profile_row_to_record(&row)?));
    }

    let profiles = state.profiles.read().await;
    let Some(record) = profiles.get(&user_id.to_string()).cloned() else {
        return Ok(None);
    };
    drop(profiles);
    let username = state
        .user_ids
        .read()
        .await
        .get(&user_id.to_string())
        .cloned()
        .ok_or(ApiFailure::Internal)?;
    Ok(Some((record, username)))
}

async fn find_profile_record_by_id(
    state: &AppState,
    profile_id: &str,
) -> Result<Option<(ProfileRecord, String)>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT p.profile_id, p.user_id, u.username, p.first_name, p.last_name, p.caption,
                    p.about, p.picture_file_id, p.created_at_unix, p.updated_at_unix
             FROM profiles p JOIN users u ON u.user_id = p.user_id
             WHERE p.profile_id = $1",
        )
        .bind(profile_id)
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        let Some(row) = row else {
            return Ok(None);
        };
        return Ok(Some(profile_row_to_record(&row)?));
    }

    let profiles = state.profiles.read().await;
    let Some(record) = profiles
        .values()
        .find(|record| record.profile_id == profile_id)
        .cloned()
    else {
        return Ok(None);
    };
    drop(profiles);
    let username = state
        .user_ids
        .read()
        .await
        .get(&record.user_id.to_string())
        .cloned()
        .ok_or(ApiFailure::Internal)?;
    Ok(Some((record, username)))
}

fn profile_row_to_record(row: &sqlx::postgres::PgRow) -> Result<(ProfileRecord, String), ApiFailure> {
    let user_id_text: String = row.try_get("user_id").map_err(|_| ApiFailure::Internal)?;
    let user_id = UserId::try_from(user_id_text).map_err(|_| ApiFailure::Internal)?;
    let username: String = row.try_get("username").map_err(|_| ApiFailure::Internal)?;
    let record = ProfileRecord {
        profile_id: row.try_get("profile_id").map_err(|_| ApiFailure::Internal)?,
        user_id,
        first_name: row.try_get("first_name").map_err(|_| ApiFailure::Internal)?,
        last_name: row.try_get("last_name").map_err(|_| ApiFailure::Internal)?,
        caption: row.try_get("caption").map_err(|_| ApiFailure::Internal)?,
        about: row.try_get("about").map_err(|_| ApiFailure::Internal)?,
        picture_file_id: row
            .try_get("picture_file_id")
            .map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
        updated_at_unix: row
            .try_get("updated_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    };
    Ok((record, username))
}

pub(crate) async fn find_profile_view_for_user(
    state: &AppState,
    owner_id: UserId,
    requester_id: UserId,
) -> Result<Option<ProfileView>, ApiFailure> {
    let Some((record, username)) = find_profile_record_by_user(state, owner_id).await? else {
        return Ok(None);
    };
    Ok(Some(profile_view(state, &record, username, requester_id).await?))
}

pub(crate) async fn create_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateProfileRequest>,
) -> Result<(StatusCode, Json<ProfileView>), ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    validate_required_field(&payload.first_name)?;
    validate_required_field(&payload.last_name)?;
    let caption = payload.caption.unwrap_or_default();
    validate_optional_field(&caption, MAX_PROFILE_FIELD_CHARS)?;
    let about = payload.about.unwrap_or_default();
    validate_optional_field(&about, MAX_PROFILE_ABOUT_CHARS)?;
    if let Some(file_id) = &payload.profile_picture_id {
        ensure_upload_owned(&state, file_id, auth.user_id).await?;
    }

    if find_profile_record_by_user(&state, auth.user_id)
        .await?
        .is_some()
    {
        tracing::info!(event = "profiles.create", outcome = "already_exists", user_id = %auth.user_id);
        return Err(ApiFailure::InvalidRequest);
    }

    let now = now_unix();
    let record = ProfileRecord {
        profile_id: Ulid::new().to_string(),
        user_id: auth.user_id,
        first_name: payload.first_name,
        last_name: payload.last_name,
        caption,
        about,
        picture_file_id: payload.profile_picture_id,
        created_at_unix: now,
        updated_at_unix: now,
    };

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "INSERT INTO profiles
                 (profile_id, user_id, first_name, last_name, caption, about, picture_file_id,
                  created_at_unix, updated_at_unix)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&record.profile_id)
        .bind(record.user_id.to_string())
        .bind(&record.first_name)
        .bind(&record.last_name)
        .bind(&record.caption)
        .bind(&record.about)
        .bind(&record.picture_file_id)
        .bind(record.created_at_unix)
        .bind(record.updated_at_unix)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::InvalidRequest)?;
    } else {
        state
            .profiles
            .write()
            .await
            .insert(auth.user_id.to_string(), record.clone());
    }

    tracing::info!(event = "profiles.create", outcome = "created", profile_id = %record.profile_id, user_id = %auth.user_id);
    let view = profile_view(&state, &record, auth.username, auth.user_id).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn list_profiles(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ProfileListResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;
    let search = parse_profile_search(&params)?;
    let (offset, limit) = page_bounds(search.page, state.runtime.page_size);

    if let Some(pool) = &state.db_pool {
        let (sql, text_params) = build_profile_search_sql(&search);
        let mut query = sqlx::query(&sql).bind(auth.user_id.to_string());
        for param in &text_params {
            query = query.bind(param);
        }
        query = query
            .bind(i64::try_from(limit).map_err(|_| ApiFailure::Internal)?)
            .bind(i64::try_from(offset).map_err(|_| ApiFailure::Internal)?);
        let rows = query
            .fetch_all(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;

        let picture_ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<Option<String>, _>("picture_file_id").ok())
            .flatten()
            .collect();
        let pictures = load_file_views(&state, &picture_ids).await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let (record, username) = profile_row_to_record(&row)?;
            let favorite_rank: i32 = row
                .try_get("favorite_rank")
                .map_err(|_| ApiFailure::Internal)?;
            let profile_picture = record
                .picture_file_id
                .as_ref()
                .and_then(|file_id| pictures.get(file_id).cloned());
            results.push(ProfileView {
                profile_id: record.profile_id,
                user_id: record.user_id.to_string(),
                username,
                first_name: record.first_name,
                last_name: record.last_name,
                caption: record.caption,
                about: record.about,
                profile_picture,
                favorite: i64::from(favorite_rank),
                created_at_unix: record.created_at_unix,
                updated_at_unix: record.updated_at_unix,
            });
        }
        return Ok(Json(ProfileListResponse {
            page: search.page,
            results,
        }));
    }

    let favorites = state.favorites.read().await;
    let requester_favorites = favorites
        .get(&auth.user_id.to_string())
        .cloned()
        .unwrap_or_default();
    drop(favorites);

    let users = state.users.read().await;
    let profiles = state.profiles.read().await;
    let mut matched: Vec<(i64, ProfileRecord, String)> = Vec::new();
    for record in profiles.values() {
        if record.user_id == auth.user_id {
            continue;
        }
        let Some(user) = users.values().find(|user| user.id == record.user_id) else {
            continue;
        };
        if !user.is_active || user.is_superuser {
            continue;
        }
        let username = user.username.as_str().to_owned();
        let email = user.email.clone();
        let candidate = SearchCandidate {
            username: &username,
            email: &email,
            first_name: &record.first_name,
            last_name: &record.last_name,
            caption: &record.caption,
        };
        if !candidate_matches_terms(&candidate, &search.terms)
            || !candidate_matches_exact(&candidate, &search.exact)
        {
            continue;
        }
        let rank = i64::from(requester_favorites.contains(&record.user_id.to_string()));
        matched.push((rank, record.clone(), username));
    }
    drop(profiles);
    drop(users);

    matched.sort_by(|(rank_a, record_a, _), (rank_b, record_b, _)| {
        rank_b
            .cmp(rank_a)
            .then_with(|| record_a.profile_id.cmp(&record_b.profile_id))
    });

    let mut results = Vec::new();
    for (rank, record, username) in matched.into_iter().skip(offset).take(limit) {
        let profile_picture = match &record.picture_file_id {
            Some(file_id) => load_file_view(&state, file_id).await?,
            None => None,
        };
        results.push(ProfileView {
            profile_id: record.profile_id,
            user_id: record.user_id.to_string(),
            username,
            first_name: record.first_name,
            last_name: record.last_name,
            caption: record.caption,
            about: record.about,
            profile_picture,
            favorite: rank,
            created_at_unix: record.created_at_unix,
            updated_at_unix: record.updated_at_unix,
        });
    }

    Ok(Json(ProfileListResponse {
        page: search.page,
        results,
    }))
}

pub(crate) async fn get_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(profile_id): Path<String>,
) -> Result<Json<ProfileView>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let (record, username) = find_profile_record_by_id(&state, &profile_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    let view = profile_view(&state, &record, username, auth.user_id).await?;
    Ok(Json(view))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(profile_id): Path<String>,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<ProfileView>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let (mut record, username) = find_profile_record_by_id(&state, &profile_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.user_id != auth.user_id {
        tracing::warn!(event = "profiles.update", outcome = "not_owner", profile_id = %profile_id, user_id = %auth.user_id);
        return Err(ApiFailure::Forbidden);
    }

    if let Some(first_name) = payload.first_name {
        validate_required_field(&first_name)?;
        record.first_name = first_name;
    }
    if let Some(last_name) = payload.last_name {
        validate_required_field(&last_name)?;
        record.last_name = last_name;
    }
    if let Some(caption) = payload.caption {
        validate_optional_field(&caption, MAX_PROFILE_FIELD_CHARS)?;
        record.caption = caption;
    }
    if let Some(about) = payload.about {
        validate_optional_field(&about, MAX_PROFILE_ABOUT_CHARS)?;
        record.about = about;
    }
    if let Some(file_id) = payload.profile_picture_id {
        ensure_upload_owned(&state, &file_id, auth.user_id).await?;
        record.picture_file_id = Some(file_id);
    }
    record.updated_at_unix = now_unix();

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "UPDATE profiles
             SET first_name = $2, last_name = $3, caption = $4, about = $5,
                 picture_file_id = $6, updated_at_unix = $7
             WHERE profile_id = $1",
        )
        .bind(&record.profile_id)
        .bind(&record.first_name)
        .bind(&record.last_name)
        .bind(&record.caption)
        .bind(&record.about)
        .bind(&record.picture_file_id)
        .bind(record.updated_at_unix)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
    } else {
        state
            .profiles
            .write()
            .await
            .insert(record.user_id.to_string(), record.clone());
    }

    tracing::info!(event = "profiles.update", outcome = "updated", profile_id = %profile_id, user_id = %auth.user_id);
    let view = profile_view(&state, &record, username, auth.user_id).await?;
    Ok(Json(view))
}

pub(crate) async fn delete_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(profile_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let (record, _) = find_profile_record_by_id(&state, &profile_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.user_id != auth.user_id {
        tracing::warn!(event = "profiles.delete", outcome = "not_owner", profile_id = %profile_id, user_id = %auth.user_id);
        return Err(ApiFailure::Forbidden);
    }

    if let Some(pool) = &state.db_pool {
        sqlx::query("DELETE FROM profiles WHERE profile_id = $1")
            .bind(&profile_id)
            .execute(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
    } else {
        state
            .profiles
            .write()
            .await
            .remove(&record.user_id.to_string());
    }

    tracing::info!(event = "profiles.delete", outcome = "deleted", profile_id = %profile_id, user_id = %auth.user_id);
    Ok(StatusCode::NO_CONTENT)
}
