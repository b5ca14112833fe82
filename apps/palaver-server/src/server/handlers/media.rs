use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE},
        HeaderMap, HeaderName, HeaderValue, StatusCode,
    },
    response::Response,
    Json,
};
use futures_util::StreamExt;
use object_store::{path::Path as ObjectPath, ObjectStoreExt};
use sha2::{Digest, Sha256};
use ulid::Ulid;

use palaver_core::UserId;

use crate::server::{
    auth::{authenticate, now_unix},
    core::{AppState, UploadRecord, MAX_MIME_SNIFF_BYTES},
    db::ensure_db_schema,
    errors::ApiFailure,
    types::{FileView, UploadQuery},
};

const MAX_FILENAME_CHARS: usize = 255;
const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

fn validate_upload_filename(raw: String) -> Result<String, ApiFailure> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_FILENAME_CHARS {
        return Err(ApiFailure::InvalidRequest);
    }
    if trimmed.contains(['/', '\\', '\0']) || trimmed == "." || trimmed == ".." {
        return Err(ApiFailure::InvalidRequest);
    }
    Ok(trimmed.to_owned())
}

fn file_view_from_record(record: &UploadRecord) -> FileView {
    FileView {
        file_id: record.file_id.clone(),
        filename: record.filename.clone(),
        mime_type: record.mime_type.clone(),
        size_bytes: record.size_bytes,
        sha256_hex: record.sha256_hex.clone(),
        created_at_unix: record.created_at_unix,
    }
}

pub(crate) async fn find_upload(
    state: &AppState,
    file_id: &str,
) -> Result<Option<UploadRecord>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT file_id, owner_id, filename, mime_type, size_bytes, sha256_hex, object_key,
                    created_at_unix
             FROM uploads WHERE file_id = $1",
        )
        .bind(file_id)
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        let Some(row) = row else {
            return Ok(None);
        };
        return Ok(Some(upload_row_to_record(&row)?));
    }

    Ok(state.uploads.read().await.get(file_id).cloned())
}

fn upload_row_to_record(row: &sqlx::postgres::PgRow) -> Result<UploadRecord, ApiFailure> {
    use sqlx::Row as _;

    let owner_id_text: String = row.try_get("owner_id").map_err(|_| ApiFailure::Internal)?;
    let owner_id = UserId::try_from(owner_id_text).map_err(|_| ApiFailure::Internal)?;
    let size_bytes: i64 = row.try_get("size_bytes").map_err(|_| ApiFailure::Internal)?;
    Ok(UploadRecord {
        file_id: row.try_get("file_id").map_err(|_| ApiFailure::Internal)?,
        owner_id,
        filename: row.try_get("filename").map_err(|_| ApiFailure::Internal)?,
        mime_type: row.try_get("mime_type").map_err(|_| ApiFailure::Internal)?,
        size_bytes: u64::try_from(size_bytes).map_err(|_| ApiFailure::Internal)?,
        sha256_hex: row.try_get("sha256_hex").map_err(|_| ApiFailure::Internal)?,
        object_key: row.try_get("object_key").map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

pub(crate) async fn load_file_view(
    state: &AppState,
    file_id: &str,
) -> Result<Option<FileView>, ApiFailure> {
    Ok(find_upload(state, file_id)
        .await?
        .as_ref()
        .map(file_view_from_record))
}

pub(crate) async fn load_file_views(
    state: &AppState,
    file_ids: &[String],
) -> Result<HashMap<String, FileView>, ApiFailure> {
    if file_ids.is_empty() {
        return Ok(HashMap::new());
    }

    if let Some(pool) = &state.db_pool {
        let rows = sqlx::query(
            "SELECT file_id, owner_id, filename, mime_type, size_bytes, sha256_hex, object_key,
                    created_at_unix
             FROM uploads WHERE file_id = ANY($1)",
        )
        .bind(file_ids)
        .fetch_all(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        let mut views = HashMap::with_capacity(rows.len());
        for row in rows {
            let record = upload_row_to_record(&row)?;
            views.insert(record.file_id.clone(), file_view_from_record(&record));
        }
        return Ok(views);
    }

    let uploads = state.uploads.read().await;
    Ok(file_ids
        .iter()
        .filter_map(|file_id| {
            uploads
                .get(file_id)
                .map(|record| (file_id.clone(), file_view_from_record(record)))
        })
        .collect())
}

/// Rejects file references the caller does not own. Attachments and profile
/// pictures may only point at the caller's own uploads.
pub(crate) async fn ensure_upload_owned(
    state: &AppState,
    file_id: &str,
    owner_id: UserId,
) -> Result<(), ApiFailure> {
    let record = find_upload(state, file_id)
        .await?
        .ok_or(ApiFailure::InvalidRequest)?;
    if record.owner_id != owner_id {
        return Err(ApiFailure::InvalidRequest);
    }
    Ok(())
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> Result<(StatusCode, Json<FileView>), ApiFailure> {
    ensure_db_schema(&state).await?;
    let auth = authenticate(&state, &headers).await?;

    let declared_content_type = if let Some(content_type) = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        Some(
            content_type
                .parse::<mime::Mime>()
                .map_err(|_| ApiFailure::InvalidRequest)?,
        )
    } else {
        None
    };
    let filename =
        validate_upload_filename(query.filename.unwrap_or_else(|| String::from("upload.bin")))?;

    let file_id = Ulid::new().to_string();
    let object_key = format!("uploads/{file_id}");
    let object_path = ObjectPath::from(object_key.clone());
    let mut upload = state
        .upload_store
        .put_multipart(&object_path)
        .await
        .map_err(|_| ApiFailure::Internal)?;
    let mut stream = body.into_data_stream();
    let mut sniff_buffer = Vec::new();
    let mut hasher = Sha256::new();
    let mut total_size: u64 = 0;
    let max_upload_bytes =
        u64::try_from(state.runtime.max_upload_bytes).map_err(|_| ApiFailure::Internal)?;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(_) => {
                let _ = upload.abort().await;
                return Err(ApiFailure::InvalidRequest);
            }
        };
        if chunk.is_empty() {
            continue;
        }
        let chunk_len = u64::try_from(chunk.len()).map_err(|_| ApiFailure::InvalidRequest)?;
        total_size = total_size
            .checked_add(chunk_len)
            .ok_or(ApiFailure::PayloadTooLarge)?;
        if total_size > max_upload_bytes {
            let _ = upload.abort().await;
            return Err(ApiFailure::PayloadTooLarge);
        }

        if sniff_buffer.len() < MAX_MIME_SNIFF_BYTES {
            let remaining = MAX_MIME_SNIFF_BYTES - sniff_buffer.len();
            let copy_len = remaining.min(chunk.len());
            sniff_buffer.extend_from_slice(&chunk[..copy_len]);
        }
        hasher.update(chunk.as_ref());
        if upload.put_part(chunk.into()).await.is_err() {
            let _ = upload.abort().await;
            return Err(ApiFailure::Internal);
        }
    }

    if total_size == 0 {
        let _ = upload.abort().await;
        return Err(ApiFailure::InvalidRequest);
    }

    // Trust the sniffed type over the declared one; fall back to the
    // declared essence for formats the sniffer does not know.
    let mime_type = match infer::get(&sniff_buffer) {
        Some(sniffed) => {
            let sniffed_mime = sniffed.mime_type();
            if let Some(declared) = declared_content_type.as_ref() {
                if declared.essence_str() != sniffed_mime {
                    let _ = upload.abort().await;
                    return Err(ApiFailure::InvalidRequest);
                }
            }
            String::from(sniffed_mime)
        }
        None => declared_content_type
            .as_ref()
            .map_or_else(|| String::from(FALLBACK_MIME_TYPE), |declared| {
                declared.essence_str().to_owned()
            }),
    };
    upload.complete().await.map_err(|_| ApiFailure::Internal)?;

    let sha256_hex = {
        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{byte:02x}"));
        }
        out
    };

    let record = UploadRecord {
        file_id: file_id.clone(),
        owner_id: auth.user_id,
        filename,
        mime_type,
        size_bytes: total_size,
        sha256_hex,
        object_key: object_key.clone(),
        created_at_unix: now_unix(),
    };

    if let Some(pool) = &state.db_pool {
        let persist_result = sqlx::query(
            "INSERT INTO uploads
                 (file_id, owner_id, filename, mime_type, size_bytes, sha256_hex, object_key,
                  created_at_unix)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&record.file_id)
        .bind(record.owner_id.to_string())
        .bind(&record.filename)
        .bind(&record.mime_type)
        .bind(i64::try_from(record.size_bytes).map_err(|_| ApiFailure::InvalidRequest)?)
        .bind(&record.sha256_hex)
        .bind(&record.object_key)
        .bind(record.created_at_unix)
        .execute(pool)
        .await;
        if let Err(error) = persist_result {
            tracing::error!(
                event = "uploads.persist_failed",
                file_id = %file_id,
                user_id = %auth.user_id,
                error = %error
            );
            let _ = state.upload_store.delete(&object_path).await;
            return Err(ApiFailure::Internal);
        }
    } else {
        state
            .uploads
            .write()
            .await
            .insert(file_id.clone(), record.clone());
    }

    tracing::info!(event = "uploads.stored", file_id = %file_id, user_id = %auth.user_id, size_bytes = record.size_bytes);
    Ok((StatusCode::CREATED, Json(file_view_from_record(&record))))
}

pub(crate) async fn download_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(file_id): Path<String>,
) -> Result<Response, ApiFailure> {
    ensure_db_schema(&state).await?;
    let _auth = authenticate(&state, &headers).await?;

    let record = find_upload(&state, &file_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    let object_path = ObjectPath::from(record.object_key.clone());
    let get_result = state
        .upload_store
        .get(&object_path)
        .await
        .map_err(|_| ApiFailure::NotFound)?;
    let payload = get_result
        .bytes()
        .await
        .map_err(|_| ApiFailure::Internal)?;

    let mut response = Response::new(payload.into());
    let content_type =
        HeaderValue::from_str(&record.mime_type).map_err(|_| ApiFailure::Internal)?;
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    let content_len =
        HeaderValue::from_str(&record.size_bytes.to_string()).map_err(|_| ApiFailure::Internal)?;
    response.headers_mut().insert(CONTENT_LENGTH, content_len);
    response.headers_mut().insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("private, no-store"),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::validate_upload_filename;

    #[test]
    fn filename_validation_rejects_traversal_and_separators() {
        assert!(validate_upload_filename(String::from("photo.png")).is_ok());
        assert!(validate_upload_filename(String::from("  spaced.gif  ")).is_ok());
        assert!(validate_upload_filename(String::from("..")).is_err());
        assert!(validate_upload_filename(String::from("a/b.png")).is_err());
        assert!(validate_upload_filename(String::from("a\\b.png")).is_err());
        assert!(validate_upload_filename(String::new()).is_err());
        assert!(validate_upload_filename("x".repeat(300)).is_err());
    }
}
