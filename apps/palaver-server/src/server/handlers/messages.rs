use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use sqlx::Row;
use ulid::Ulid;

use palaver_core::UserId;

use crate::server::{
    auth::{authenticate, find_username_by_user_id, now_unix},
    core::{
        AppState, AttachmentRecord, MessageRecord, MAX_ATTACHMENTS_PER_MESSAGE, MAX_BULK_READ_IDS,
        MAX_MESSAGE_BODY_CHARS,
    },
    db::ensure_db_schema,
    errors::ApiFailure,
    handlers::media::{ensure_upload_owned, load_file_views},
    notify::forward_message_event,
    search::page_bounds,
    types::{
        AttachmentInput, AttachmentView, BulkMarkReadRequest, BulkMarkReadResponse,
        CreateMessageRequest, MessageListQuery, MessageListResponse, MessageView, PartyView,
        UpdateMessageRequest,
    },
};

fn validate_message_body(value: &str) -> Result<(), ApiFailure> {
    if value.chars().count() > MAX_MESSAGE_BODY_CHARS {
        return Err(ApiFailure::InvalidRequest);
    }
    if value
        .chars()
        .any(|ch| ch.is_control() && ch != '\n' && ch != '\t' && ch != '\r')
    {
        return Err(ApiFailure::InvalidRequest);
    }
    Ok(())
}

fn normalize_body(raw: Option<String>) -> Result<Option<String>, ApiFailure> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    validate_message_body(&raw)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(trimmed.to_owned()))
}

async fn validate_attachment_inputs(
    state: &AppState,
    owner_id: UserId,
    inputs: &[AttachmentInput],
) -> Result<(), ApiFailure> {
    if inputs.len() > MAX_ATTACHMENTS_PER_MESSAGE {
        return Err(ApiFailure::InvalidRequest);
    }
    let mut seen = HashSet::with_capacity(inputs.len());
    for input in inputs {
        if !seen.insert(input.file_id.as_str()) {
            return Err(ApiFailure::InvalidRequest);
        }
        if let Some(caption) = &input.caption {
            validate_message_body(caption)?;
        }
        ensure_upload_owned(state, &input.file_id, owner_id).await?;
    }
    Ok(())
}

async fn load_party_views(
    state: &AppState,
    user_ids: &[UserId],
) -> Result<HashMap<String, PartyView>, ApiFailure> {
    if user_ids.is_empty() {
        return Ok(HashMap::new());
    }

    if let Some(pool) = &state.db_pool {
        let id_texts: Vec<String> = user_ids.iter().map(ToString::to_string).collect();
        let rows = sqlx::query(
            "SELECT u.user_id, u.username,
                    COALESCE(p.first_name, '') AS first_name,
                    COALESCE(p.last_name, '') AS last_name
             FROM users u
             LEFT JOIN profiles p ON p.user_id = u.user_id
             WHERE u.user_id = ANY($1)",
        )
        .bind(&id_texts)
        .fetch_all(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;

        let mut parties = HashMap::with_capacity(rows.len());
        for row in rows {
            let user_id: String = row.try_get("user_id").map_err(|_| ApiFailure::Internal)?;
            parties.insert(
                user_id.clone(),
                PartyView {
                    user_id,
                    username: row.try_get("username").map_err(|_| ApiFailure::Internal)?,
                    first_name: row.try_get("first_name").map_err(|_| ApiFailure::Internal)?,
                    last_name: row.try_get("last_name").map_err(|_| ApiFailure::Internal)?,
                },
            );
        }
        return Ok(parties);
    }

    let user_ids_map = state.user_ids.read().await;
    let profiles = state.profiles.read().await;
    let mut parties = HashMap::with_capacity(user_ids.len());
    for user_id in user_ids {
        let id_text = user_id.to_string();
        let Some(username) = user_ids_map.get(&id_text).cloned() else {
            continue;
        };
        let (first_name, last_name) = profiles
            .get(&id_text)
            .map(|profile| (profile.first_name.clone(), profile.last_name.clone()))
            .unwrap_or_default();
        parties.insert(
            id_text.clone(),
            PartyView {
                user_id: id_text,
                username,
                first_name,
                last_name,
            },
        );
    }
    Ok(parties)
}

async fn load_attachment_views(
    state: &AppState,
    message_ids: &[String],
) -> Result<HashMap<String, Vec<AttachmentView>>, ApiFailure> {
    if message_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut records: Vec<AttachmentRecord> = if let Some(pool) = &state.db_pool {
        let rows = sqlx::query(
            "SELECT attachment_id, message_id, file_id, caption, created_at_unix
             FROM message_attachments
             WHERE message_id = ANY($1)",
        )
        .bind(message_ids)
        .fetch_all(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(AttachmentRecord {
                attachment_id: row
                    .try_get("attachment_id")
                    .map_err(|_| ApiFailure::Internal)?,
                message_id: row.try_get("message_id").map_err(|_| ApiFailure::Internal)?,
                file_id: row.try_get("file_id").map_err(|_| ApiFailure::Internal)?,
                caption: row.try_get("caption").map_err(|_| ApiFailure::Internal)?,
                created_at_unix: row
                    .try_get("created_at_unix")
                    .map_err(|_| ApiFailure::Internal)?,
            });
        }
        records
    } else {
        let wanted: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        state
            .attachments
            .read()
            .await
            .values()
            .filter(|record| wanted.contains(record.message_id.as_str()))
            .cloned()
            .collect()
    };
    records.sort_by(|a, b| a.attachment_id.cmp(&b.attachment_id));

    let file_ids: Vec<String> = records.iter().map(|record| record.file_id.clone()).collect();
    let files = load_file_views(state, &file_ids).await?;

    let mut views: HashMap<String, Vec<AttachmentView>> = HashMap::new();
    for record in records {
        let file = files
            .get(&record.file_id)
            .cloned()
            .ok_or(ApiFailure::Internal)?;
        views.entry(record.message_id).or_default().push(AttachmentView {
            attachment_id: record.attachment_id,
            file,
            caption: record.caption,
            created_at_unix: record.created_at_unix,
        });
    }
    Ok(views)
}

async fn build_message_views(
    state: &AppState,
    records: Vec<MessageRecord>,
) -> Result<Vec<MessageView>, ApiFailure> {
    let mut party_ids: Vec<UserId> = Vec::new();
    let mut seen = HashSet::new();
    for record in &records {
        for user_id in [record.sender_id, record.receiver_id] {
            if seen.insert(user_id) {
                party_ids.push(user_id);
            }
        }
    }
    let parties = load_party_views(state, &party_ids).await?;

    let message_ids: Vec<String> = records
        .iter()
        .map(|record| record.message_id.clone())
        .collect();
    let mut attachments = load_attachment_views(state, &message_ids).await?;

    let mut views = Vec::with_capacity(records.len());
    for record in records {
        let sender = parties
            .get(&record.sender_id.to_string())
            .cloned()
            .ok_or(ApiFailure::Internal)?;
        let receiver = parties
            .get(&record.receiver_id.to_string())
            .cloned()
            .ok_or(ApiFailure::Internal)?;
        views.push(MessageView {
            message_id: record.message_id.clone(),
            sender,
            receiver,
            body: record.body,
            is_read: record.is_read,
            attachments: attachments.remove(&record.message_id).unwrap_or_default(),
            created_at_unix: record.created_at_unix,
            updated_at_unix: record.updated_at_unix,
        });
    }
    Ok(views)
}

async fn build_message_view(
    state: &AppState,
    record: MessageRecord,
) -> Result<MessageView, ApiFailure> {
    let mut views = build_message_views(state, vec![record]).await?;
    views.pop().ok_or(ApiFailure::Internal)
}

async fn find_message(
    state: &AppState,
    message_id: &str,
) -> Result<Option<MessageRecord>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT message_id, sender_id, receiver_id, body, is_read, created_at_unix,
                    updated_at_unix
             FROM messages WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        let Some(row) = row else {
            return Ok(None);
        };
        return Ok(Some(message_row_to_record(&row)?));
    }

    Ok(state.messages.read().await.get(message_id).cloned())
}

async fn message_has_attachments(
    state: &AppState,
    message_id: &str,
) -> Result<bool, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query("SELECT 1 FROM message_attachments WHERE message_id = $1 LIMIT 1")
            .bind(message_id)
            .fetch_optional(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        return Ok(row.is_some());
    }

    Ok(state
        .attachments
        .read()
        .await
        .values()
        .any(|attachment| attachment.message_id == message_id))
}

fn message_row_to_record(row: &sqlx::postgres::PgRow) -> Result<MessageRecord, ApiFailure> {
    let sender_id_text: String = row.try_get("sender_id").map_err(|_| ApiFailure::Internal)?;
    let receiver_id_text: String = row.try_get("receiver_id").map_err(|_| ApiFailure::Internal)?;
    Ok(MessageRecord {
        message_id: row.try_get("message_id").map_err(|_| ApiFailure::Internal)?,
        sender_id: UserId::try_from(sender_id_text).map_err(|_| ApiFailure::Internal)?,
        receiver_id: UserId::try_from(receiver_id_text).map_err(|_| ApiFailure::Internal)?,
        body: row.try_get("body").map_err(|_| ApiFailure::Internal)?,
        is_read: row.try_get("is_read").map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
        updated_at_unix: row
            .try_get("updated_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

/// Creates a direct message. The caller must be the declared sender; a
/// mismatched `sender_id` is rejected outright rather than silently
/// rewritten.
#[allow(clippy::too_many_lines)]
pub(crate) async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<MessageView>), ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let sender_id = UserId::try_from(payload.sender_id).map_err(|_| ApiFailure::InvalidRequest)?;
    if sender_id != auth.user_id {
        tracing::warn!(event = "messages.create", outcome = "sender_mismatch", user_id = %auth.user_id);
        return Err(ApiFailure::Forbidden);
    }
    let receiver_id =
        UserId::try_from(payload.receiver_id).map_err(|_| ApiFailure::InvalidRequest)?;
    if receiver_id == sender_id {
        return Err(ApiFailure::InvalidRequest);
    }
    if find_username_by_user_id(&state, receiver_id).await.is_none() {
        return Err(ApiFailure::NotFound);
    }

    let body = normalize_body(payload.body)?;
    let attachment_inputs = payload.attachments.unwrap_or_default();
    if body.is_none() && attachment_inputs.is_empty() {
        return Err(ApiFailure::InvalidRequest);
    }
    validate_attachment_inputs(&state, auth.user_id, &attachment_inputs).await?;

    let now = now_unix();
    let record = MessageRecord {
        message_id: Ulid::new().to_string(),
        sender_id,
        receiver_id,
        body,
        is_read: false,
        created_at_unix: now,
        updated_at_unix: now,
    };
    let attachment_records: Vec<AttachmentRecord> = attachment_inputs
        .into_iter()
        .map(|input| AttachmentRecord {
            attachment_id: Ulid::new().to_string(),
            message_id: record.message_id.clone(),
            file_id: input.file_id,
            caption: input.caption,
            created_at_unix: now,
        })
        .collect();

    if let Some(pool) = &state.db_pool {
        let mut tx = pool.begin().await.map_err(|_| ApiFailure::Internal)?;
        sqlx::query(
            "INSERT INTO messages
                 (message_id, sender_id, receiver_id, body, is_read, created_at_unix,
                  updated_at_unix)
             VALUES ($1, $2, $3, $4, FALSE, $5, $5)",
        )
        .bind(&record.message_id)
        .bind(record.sender_id.to_string())
        .bind(record.receiver_id.to_string())
        .bind(&record.body)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        for attachment in &attachment_records {
            sqlx::query(
                "INSERT INTO message_attachments
                     (attachment_id, message_id, file_id, caption, created_at_unix)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&attachment.attachment_id)
            .bind(&attachment.message_id)
            .bind(&attachment.file_id)
            .bind(&attachment.caption)
            .bind(attachment.created_at_unix)
            .execute(&mut *tx)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        }
        tx.commit().await.map_err(|_| ApiFailure::Internal)?;
    } else {
        state
            .messages
            .write()
            .await
            .insert(record.message_id.clone(), record.clone());
        let mut attachments = state.attachments.write().await;
        for attachment in &attachment_records {
            attachments.insert(attachment.attachment_id.clone(), attachment.clone());
        }
    }

    tracing::info!(event = "messages.create", outcome = "created", message_id = %record.message_id, sender_id = %sender_id, receiver_id = %receiver_id);
    let view = build_message_view(&state, record).await?;
    forward_message_event(&state, "message.created", view.clone());
    Ok((StatusCode::CREATED, Json(view)))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MessageListQuery>,
) -> Result<Json<MessageListResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let page = query.page.unwrap_or(1);
    if page < 1 {
        return Err(ApiFailure::InvalidRequest);
    }
    let (offset, limit) = page_bounds(page, state.runtime.page_size);
    let other_party = query
        .user_id
        .map(|raw| UserId::try_from(raw).map_err(|_| ApiFailure::InvalidRequest))
        .transpose()?;

    let records: Vec<MessageRecord> = if let Some(pool) = &state.db_pool {
        let rows = if let Some(other) = other_party {
            sqlx::query(
                "SELECT message_id, sender_id, receiver_id, body, is_read, created_at_unix,
                        updated_at_unix
                 FROM messages
                 WHERE (sender_id = $1 AND receiver_id = $2)
                    OR (sender_id = $2 AND receiver_id = $1)
                 ORDER BY created_at_unix DESC, message_id DESC
                 LIMIT $3 OFFSET $4",
            )
            .bind(auth.user_id.to_string())
            .bind(other.to_string())
            .bind(i64::try_from(limit).map_err(|_| ApiFailure::Internal)?)
            .bind(i64::try_from(offset).map_err(|_| ApiFailure::Internal)?)
            .fetch_all(pool)
            .await
        } else {
            sqlx::query(
                "SELECT message_id, sender_id, receiver_id, body, is_read, created_at_unix,
                        updated_at_unix
                 FROM messages
                 WHERE sender_id = $1 OR receiver_id = $1
                 ORDER BY created_at_unix DESC, message_id DESC
                 LIMIT $2 OFFSET $3",
            )
            .bind(auth.user_id.to_string())
            .bind(i64::try_from(limit).map_err(|_| ApiFailure::Internal)?)
            .bind(i64::try_from(offset).map_err(|_| ApiFailure::Internal)?)
            .fetch_all(pool)
            .await
        }
        .map_err(|_| ApiFailure::Internal)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(message_row_to_record(&row)?);
        }
        records
    } else {
        let messages = state.messages.read().await;
        let mut records: Vec<MessageRecord> = messages
            .values()
            .filter(|record| {
                let involves_caller =
                    record.sender_id == auth.user_id || record.receiver_id == auth.user_id;
                let in_conversation = other_party.is_none_or(|other| {
                    (record.sender_id == auth.user_id && record.receiver_id == other)
                        || (record.sender_id == other && record.receiver_id == auth.user_id)
                });
                involves_caller && in_conversation
            })
            .cloned()
            .collect();
        drop(messages);
        records.sort_by(|a, b| {
            b.created_at_unix
                .cmp(&a.created_at_unix)
                .then_with(|| b.message_id.cmp(&a.message_id))
        });
        records.into_iter().skip(offset).take(limit).collect()
    };

    let results = build_message_views(&state, records).await?;
    Ok(Json(MessageListResponse { page, results }))
}

/// Edits a message. Only the sender may edit, and an `attachments` list in
/// the payload replaces the stored set wholesale.
#[allow(clippy::too_many_lines)]
pub(crate) async fn update_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
    Json(payload): Json<UpdateMessageRequest>,
) -> Result<Json<MessageView>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let mut record = find_message(&state, &message_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.sender_id != auth.user_id {
        tracing::warn!(event = "messages.update", outcome = "not_sender", message_id = %message_id, user_id = %auth.user_id);
        return Err(ApiFailure::Forbidden);
    }

    if let Some(raw_body) = payload.body {
        record.body = normalize_body(Some(raw_body))?;
    }
    let replacement = payload.attachments;
    if let Some(inputs) = &replacement {
        validate_attachment_inputs(&state, auth.user_id, inputs).await?;
    }

    // An edit may not leave the message with neither a body nor attachments.
    let keeps_attachments = match &replacement {
        Some(inputs) => !inputs.is_empty(),
        None => message_has_attachments(&state, &record.message_id).await?,
    };
    if record.body.is_none() && !keeps_attachments {
        tracing::warn!(event = "messages.update", outcome = "emptied", message_id = %message_id, user_id = %auth.user_id);
        return Err(ApiFailure::InvalidRequest);
    }
    record.updated_at_unix = now_unix();

    let replacement_records: Option<Vec<AttachmentRecord>> = replacement.map(|inputs| {
        inputs
            .into_iter()
            .map(|input| AttachmentRecord {
                attachment_id: Ulid::new().to_string(),
                message_id: record.message_id.clone(),
                file_id: input.file_id,
                caption: input.caption,
                created_at_unix: record.updated_at_unix,
            })
            .collect()
    });

    if let Some(pool) = &state.db_pool {
        let mut tx = pool.begin().await.map_err(|_| ApiFailure::Internal)?;
        sqlx::query("UPDATE messages SET body = $2, updated_at_unix = $3 WHERE message_id = $1")
            .bind(&record.message_id)
            .bind(&record.body)
            .bind(record.updated_at_unix)
            .execute(&mut *tx)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        if let Some(attachments) = &replacement_records {
            sqlx::query("DELETE FROM message_attachments WHERE message_id = $1")
                .bind(&record.message_id)
                .execute(&mut *tx)
                .await
                .map_err(|_| ApiFailure::Internal)?;
            for attachment in attachments {
                sqlx::query(
                    "INSERT INTO message_attachments
                         (attachment_id, message_id, file_id, caption, created_at_unix)
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&attachment.attachment_id)
                .bind(&attachment.message_id)
                .bind(&attachment.file_id)
                .bind(&attachment.caption)
                .bind(attachment.created_at_unix)
                .execute(&mut *tx)
                .await
                .map_err(|_| ApiFailure::Internal)?;
            }
        }
        tx.commit().await.map_err(|_| ApiFailure::Internal)?;
    } else {
        state
            .messages
            .write()
            .await
            .insert(record.message_id.clone(), record.clone());
        if let Some(replacements) = &replacement_records {
            let mut attachments = state.attachments.write().await;
            attachments.retain(|_, existing| existing.message_id != record.message_id);
            for attachment in replacements {
                attachments.insert(attachment.attachment_id.clone(), attachment.clone());
            }
        }
    }

    tracing::info!(event = "messages.update", outcome = "updated", message_id = %message_id, user_id = %auth.user_id);
    let view = build_message_view(&state, record).await?;
    forward_message_event(&state, "message.updated", view.clone());
    Ok(Json(view))
}

pub(crate) async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let record = find_message(&state, &message_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.sender_id != auth.user_id {
        tracing::warn!(event = "messages.delete", outcome = "not_sender", message_id = %message_id, user_id = %auth.user_id);
        return Err(ApiFailure::Forbidden);
    }

    if let Some(pool) = &state.db_pool {
        sqlx::query("DELETE FROM messages WHERE message_id = $1")
            .bind(&message_id)
            .execute(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
    } else {
        state.messages.write().await.remove(&message_id);
        state
            .attachments
            .write()
            .await
            .retain(|_, attachment| attachment.message_id != message_id);
    }

    tracing::info!(event = "messages.delete", outcome = "deleted", message_id = %message_id, user_id = %auth.user_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Marks a batch of messages read. Only messages the caller received are
/// touched; ids pointing at other people's mail are ignored rather than
/// erroring, so clients can submit mixed batches safely.
pub(crate) async fn bulk_mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BulkMarkReadRequest>,
) -> Result<Json<BulkMarkReadResponse>, ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    if payload.message_ids.is_empty() || payload.message_ids.len() > MAX_BULK_READ_IDS {
        return Err(ApiFailure::InvalidRequest);
    }

    let updated = if let Some(pool) = &state.db_pool {
        let outcome = sqlx::query(
            "UPDATE messages SET is_read = TRUE
             WHERE message_id = ANY($1) AND receiver_id = $2 AND NOT is_read",
        )
        .bind(&payload.message_ids)
        .bind(auth.user_id.to_string())
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        usize::try_from(outcome.rows_affected()).map_err(|_| ApiFailure::Internal)?
    } else {
        let mut messages = state.messages.write().await;
        let mut updated = 0_usize;
        for message_id in &payload.message_ids {
            if let Some(record) = messages.get_mut(message_id) {
                if record.receiver_id == auth.user_id && !record.is_read {
                    record.is_read = true;
                    updated += 1;
                }
            }
        }
        updated
    };

    tracing::info!(event = "messages.bulk_read", user_id = %auth.user_id, updated);
    Ok(Json(BulkMarkReadResponse { updated }))
}
