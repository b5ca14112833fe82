use super::{core::AppState, errors::ApiFailure};

const CREATE_CREDENTIAL_PAIRS_REFRESH_HASH_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_credential_pairs_refresh_hash_unique
                    ON credential_pairs(refresh_token_hash)";
const CREATE_PROFILES_USER_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_profiles_user_unique
                    ON profiles(user_id)";
const CREATE_MESSAGES_SENDER_CREATED_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_sender_created
                    ON messages(sender_id, created_at_unix DESC)";
const CREATE_MESSAGES_RECEIVER_CREATED_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_receiver_created
                    ON messages(receiver_id, created_at_unix DESC)";
const CREATE_MESSAGE_ATTACHMENTS_MESSAGE_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_message_attachments_message
                    ON message_attachments(message_id)";

#[allow(clippy::too_many_lines)]
pub(crate) async fn ensure_db_schema(state: &AppState) -> Result<(), ApiFailure> {
    const SCHEMA_INIT_LOCK_ID: i64 = 0x5041_4c41_5645_5221;
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };

    state
        .db_init
        .get_or_try_init(|| async move {
            let mut tx = pool.begin().await?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(SCHEMA_INIT_LOCK_ID)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS users (
                    user_id TEXT PRIMARY KEY,
                    username TEXT UNIQUE NOT NULL,
                    email TEXT UNIQUE NOT NULL,
                    password_hash TEXT NOT NULL,
                    is_staff BOOLEAN NOT NULL DEFAULT FALSE,
                    is_superuser BOOLEAN NOT NULL DEFAULT FALSE,
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    last_seen_unix BIGINT NOT NULL DEFAULT 0,
                    created_at_unix BIGINT NOT NULL,
                    failed_logins SMALLINT NOT NULL DEFAULT 0,
                    locked_until_unix BIGINT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS credential_pairs (
                    user_id TEXT PRIMARY KEY REFERENCES users(user_id) ON DELETE CASCADE,
                    access_token TEXT NOT NULL,
                    refresh_token_hash BYTEA NOT NULL,
                    refresh_expires_at_unix BIGINT NOT NULL,
                    issued_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS uploads (
                    file_id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    filename TEXT NOT NULL,
                    mime_type TEXT NOT NULL,
                    size_bytes BIGINT NOT NULL,
                    sha256_hex TEXT NOT NULL,
                    object_key TEXT NOT NULL UNIQUE,
                    created_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS profiles (
                    profile_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    first_name TEXT NOT NULL DEFAULT '',
                    last_name TEXT NOT NULL DEFAULT '',
                    caption TEXT NOT NULL DEFAULT '',
                    about TEXT NOT NULL DEFAULT '',
                    picture_file_id TEXT NULL REFERENCES uploads(file_id) ON DELETE SET NULL,
                    created_at_unix BIGINT NOT NULL,
                    updated_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS favorites (
                    owner_user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    favorite_user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    created_at_unix BIGINT NOT NULL,
                    CHECK (owner_user_id <> favorite_user_id),
                    PRIMARY KEY(owner_user_id, favorite_user_id)
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT PRIMARY KEY,
                    sender_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    receiver_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    body TEXT NULL,
                    is_read BOOLEAN NOT NULL DEFAULT FALSE,
                    created_at_unix BIGINT NOT NULL,
                    updated_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS message_attachments (
                    attachment_id TEXT PRIMARY KEY,
                    message_id TEXT NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
                    file_id TEXT NOT NULL REFERENCES uploads(file_id) ON DELETE CASCADE,
                    caption TEXT NULL,
                    created_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(CREATE_CREDENTIAL_PAIRS_REFRESH_HASH_INDEX_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_PROFILES_USER_INDEX_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_MESSAGES_SENDER_CREATED_INDEX_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_MESSAGES_RECEIVER_CREATED_INDEX_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_MESSAGE_ATTACHMENTS_MESSAGE_INDEX_SQL)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|e| {
            tracing::error!(event = "db.init", error = %e);
            ApiFailure::Internal
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        ensure_db_schema, CREATE_CREDENTIAL_PAIRS_REFRESH_HASH_INDEX_SQL,
        CREATE_MESSAGES_RECEIVER_CREATED_INDEX_SQL, CREATE_MESSAGES_SENDER_CREATED_INDEX_SQL,
        CREATE_MESSAGE_ATTACHMENTS_MESSAGE_INDEX_SQL, CREATE_PROFILES_USER_INDEX_SQL,
    };
    use crate::server::core::{AppConfig, AppState};

    #[tokio::test]
    async fn schema_init_is_noop_and_idempotent_without_database_pool() {
        let state = AppState::new(&AppConfig::default()).expect("app state should initialize");
        ensure_db_schema(&state)
            .await
            .expect("schema init without database should succeed");
        ensure_db_schema(&state)
            .await
            .expect("schema init should be idempotent");
    }

    #[test]
    fn schema_statements_define_required_indexes() {
        assert!(CREATE_CREDENTIAL_PAIRS_REFRESH_HASH_INDEX_SQL
            .contains("idx_credential_pairs_refresh_hash_unique"));
        assert!(CREATE_PROFILES_USER_INDEX_SQL.contains("idx_profiles_user_unique"));
        assert!(CREATE_MESSAGES_SENDER_CREATED_INDEX_SQL.contains("idx_messages_sender_created"));
        assert!(
            CREATE_MESSAGES_RECEIVER_CREATED_INDEX_SQL.contains("idx_messages_receiver_created")
        );
        assert!(CREATE_MESSAGE_ATTACHMENTS_MESSAGE_INDEX_SQL
            .contains("idx_message_attachments_message"));
    }
}
