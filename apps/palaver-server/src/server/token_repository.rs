use sqlx::{PgPool, Row};

use palaver_core::{Email, UserId, Username};

use crate::server::{
    auth::{hash_refresh_token, now_unix, verify_password},
    core::{
        AppState, CredentialPairRecord, UserRecord, LOGIN_LOCK_SECS, LOGIN_LOCK_THRESHOLD,
        REFRESH_TOKEN_TTL_SECS,
    },
    errors::ApiFailure,
};

/// Persistence seam for accounts and their single credential pair. An
/// account holds at most one access/refresh pair at a time; storing a new
/// pair atomically drops whatever pair the account held before.
pub(crate) trait TokenPersistence {
    async fn create_user_if_missing(
        &self,
        username: &Username,
        email: &Email,
        password_hash: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure>;

    async fn verify_credentials(
        &self,
        username: &Username,
        password: &str,
        dummy_password_hash: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure>;

    async fn store_credential_pair(
        &self,
        user_id: UserId,
        access_token: &str,
        refresh_hash: [u8; 32],
        now_unix: i64,
    ) -> Result<(), ApiFailure>;

    async fn find_user_by_refresh_token(
        &self,
        refresh_token: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure>;

    async fn revoke_credential_pair(&self, user_id: UserId) -> Result<(), ApiFailure>;
}

pub(crate) struct PostgresTokenRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> PostgresTokenRepository<'a> {
    pub(crate) fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }
}

impl TokenPersistence for PostgresTokenRepository<'_> {
    async fn create_user_if_missing(
        &self,
        username: &Username,
        email: &Email,
        password_hash: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        let user_id = UserId::new();
        let insert_result = sqlx::query(
            "INSERT INTO users
                 (user_id, username, email, password_hash, is_staff, is_superuser, is_active,
                  last_seen_unix, created_at_unix, failed_logins, locked_until_unix)
             VALUES ($1, $2, $3, $4, FALSE, FALSE, TRUE, $5, $5, 0, NULL)
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id.to_string())
        .bind(username.as_str())
        .bind(email.as_str())
        .bind(password_hash)
        .bind(now_unix)
        .execute(self.pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        if insert_result.rows_affected() > 0 {
            Ok(Some(user_id))
        } else {
            Ok(None)
        }
    }

    async fn verify_credentials(
        &self,
        username: &Username,
        password: &str,
        dummy_password_hash: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        let row = sqlx::query(
            "SELECT user_id, password_hash, failed_logins, locked_until_unix
             FROM users WHERE username = $1 AND is_active",
        )
        .bind(username.as_str())
        .fetch_optional(self.pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;

        let Some(row) = row else {
            // Burn the same hashing cost for unknown accounts so the
            // response time does not reveal whether the username exists.
            let _ = verify_password(dummy_password_hash, password);
            return Ok(None);
        };

        let user_id_text: String = row.try_get("user_id").map_err(|_| ApiFailure::Internal)?;
        let user_id = UserId::try_from(user_id_text).map_err(|_| ApiFailure::Internal)?;
        let stored_password_hash: String = row
            .try_get("password_hash")
            .map_err(|_| ApiFailure::Internal)?;
        let failed_logins: i16 = row
            .try_get("failed_logins")
            .map_err(|_| ApiFailure::Internal)?;
        let locked_until_unix: Option<i64> = row
            .try_get("locked_until_unix")
            .map_err(|_| ApiFailure::Internal)?;

        if locked_until_unix.is_some_and(|lock_until| lock_until > now_unix) {
            return Ok(None);
        }

        if verify_password(&stored_password_hash, password) {
            sqlx::query(
                "UPDATE users SET failed_logins = 0, locked_until_unix = NULL WHERE user_id = $1",
            )
            .bind(user_id.to_string())
            .execute(self.pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
            return Ok(Some(user_id));
        }

        let mut updated_failed = i32::from(failed_logins) + 1;
        let mut lock_until = None;
        if updated_failed >= i32::from(LOGIN_LOCK_THRESHOLD) {
            updated_failed = 0;
            lock_until = Some(now_unix + LOGIN_LOCK_SECS);
        }
        sqlx::query(
            "UPDATE users SET failed_logins = $2, locked_until_unix = $3 WHERE user_id = $1",
        )
        .bind(user_id.to_string())
        .bind(i16::try_from(updated_failed).unwrap_or(i16::MAX))
        .bind(lock_until)
        .execute(self.pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        Ok(None)
    }

    async fn store_credential_pair(
        &self,
        user_id: UserId,
        access_token: &str,
        refresh_hash: [u8; 32],
        now_unix: i64,
    ) -> Result<(), ApiFailure> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| ApiFailure::Internal)?;
        sqlx::query("DELETE FROM credential_pairs WHERE user_id = $1")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        sqlx::query(
            "INSERT INTO credential_pairs
                 (user_id, access_token, refresh_token_hash, refresh_expires_at_unix, issued_at_unix)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(user_id.to_string())
        .bind(access_token)
        .bind(refresh_hash.as_slice())
        .bind(refresh_expires_at_unix(now_unix))
        .bind(now_unix)
        .execute(&mut *tx)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        tx.commit().await.map_err(|_| ApiFailure::Internal)?;
        Ok(())
    }

    async fn find_user_by_refresh_token(
        &self,
        refresh_token: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        let presented_hash = hash_refresh_token(refresh_token);
        let row = sqlx::query(
            "SELECT user_id FROM credential_pairs
             WHERE refresh_token_hash = $1 AND refresh_expires_at_unix > $2",
        )
        .bind(presented_hash.as_slice())
        .bind(now_unix)
        .fetch_optional(self.pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let user_id_text: String = row.try_get("user_id").map_err(|_| ApiFailure::Internal)?;
        let user_id = UserId::try_from(user_id_text).map_err(|_| ApiFailure::Internal)?;
        Ok(Some(user_id))
    }

    async fn revoke_credential_pair(&self, user_id: UserId) -> Result<(), ApiFailure> {
        sqlx::query("DELETE FROM credential_pairs WHERE user_id = $1")
            .bind(user_id.to_string())
            .execute(self.pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        Ok(())
    }
}

pub(crate) struct InMemoryTokenRepository<'a> {
    state: &'a AppState,
}

impl<'a> InMemoryTokenRepository<'a> {
    pub(crate) fn new(state: &'a AppState) -> Self {
        Self { state }
    }
}

impl TokenPersistence for InMemoryTokenRepository<'_> {
    async fn create_user_if_missing(
        &self,
        username: &Username,
        email: &Email,
        password_hash: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        let mut users = self.state.users.write().await;
        if users.contains_key(username.as_str())
            || users.values().any(|user| user.email == email.as_str())
        {
            return Ok(None);
        }

        let user_id = UserId::new();
        users.insert(
            username.as_str().to_owned(),
            UserRecord {
                id: user_id,
                username: username.clone(),
                email: email.as_str().to_owned(),
                password_hash: password_hash.to_owned(),
                is_staff: false,
                is_superuser: false,
                is_active: true,
                last_seen_unix: now_unix,
                created_at_unix: now_unix,
                failed_logins: 0,
                locked_until_unix: None,
            },
        );
        drop(users);

        self.state
            .user_ids
            .write()
            .await
            .insert(user_id.to_string(), username.as_str().to_owned());
        Ok(Some(user_id))
    }

    async fn verify_credentials(
        &self,
        username: &Username,
        password: &str,
        dummy_password_hash: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        let mut users = self.state.users.write().await;
        let mut user_id = None;

        if let Some(user) = users.get_mut(username.as_str()).filter(|user| user.is_active) {
            if user
                .locked_until_unix
                .is_some_and(|lock_until| lock_until > now_unix)
            {
                return Ok(None);
            }

            if verify_password(&user.password_hash, password) {
                user.failed_logins = 0;
                user.locked_until_unix = None;
                user_id = Some(user.id);
            } else {
                user.failed_logins = user.failed_logins.saturating_add(1);
                if user.failed_logins >= LOGIN_LOCK_THRESHOLD {
                    user.locked_until_unix = Some(now_unix + LOGIN_LOCK_SECS);
                    user.failed_logins = 0;
                }
            }
        } else {
            let _ = verify_password(dummy_password_hash, password);
        }
        drop(users);

        Ok(user_id)
    }

    async fn store_credential_pair(
        &self,
        user_id: UserId,
        access_token: &str,
        refresh_hash: [u8; 32],
        now_unix: i64,
    ) -> Result<(), ApiFailure> {
        self.state.credential_pairs.write().await.insert(
            user_id.to_string(),
            CredentialPairRecord {
                user_id,
                access_token: access_token.to_owned(),
                refresh_token_hash: refresh_hash,
                refresh_expires_at_unix: refresh_expires_at_unix(now_unix),
                issued_at_unix: now_unix,
            },
        );
        Ok(())
    }

    async fn find_user_by_refresh_token(
        &self,
        refresh_token: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        let presented_hash = hash_refresh_token(refresh_token);
        let pairs = self.state.credential_pairs.read().await;
        let user_id = pairs
            .values()
            .find(|pair| {
                pair.refresh_token_hash == presented_hash
                    && pair.refresh_expires_at_unix > now_unix
            })
            .map(|pair| pair.user_id);
        drop(pairs);
        Ok(user_id)
    }

    async fn revoke_credential_pair(&self, user_id: UserId) -> Result<(), ApiFailure> {
        self.state
            .credential_pairs
            .write()
            .await
            .remove(&user_id.to_string());
        Ok(())
    }
}

pub(crate) enum TokenRepository<'a> {
    Postgres(PostgresTokenRepository<'a>),
    InMemory(InMemoryTokenRepository<'a>),
}

impl TokenRepository<'_> {
    pub(crate) fn from_state(state: &AppState) -> TokenRepository<'_> {
        if let Some(pool) = &state.db_pool {
            TokenRepository::Postgres(PostgresTokenRepository::new(pool))
        } else {
            TokenRepository::InMemory(InMemoryTokenRepository::new(state))
        }
    }
}

impl TokenPersistence for TokenRepository<'_> {
    async fn create_user_if_missing(
        &self,
        username: &Username,
        email: &Email,
        password_hash: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        match self {
            Self::Postgres(repo) => {
                repo.create_user_if_missing(username, email, password_hash, now_unix)
                    .await
            }
            Self::InMemory(repo) => {
                repo.create_user_if_missing(username, email, password_hash, now_unix)
                    .await
            }
        }
    }

    async fn verify_credentials(
        &self,
        username: &Username,
        password: &str,
        dummy_password_hash: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        match self {
            Self::Postgres(repo) => {
                repo.verify_credentials(username, password, dummy_password_hash, now_unix)
                    .await
            }
            Self::InMemory(repo) => {
                repo.verify_credentials(username, password, dummy_password_hash, now_unix)
                    .await
            }
        }
    }

    async fn store_credential_pair(
        &self,
        user_id: UserId,
        access_token: &str,
        refresh_hash: [u8; 32],
        now_unix: i64,
    ) -> Result<(), ApiFailure> {
        match self {
            Self::Postgres(repo) => {
                repo.store_credential_pair(user_id, access_token, refresh_hash, now_unix)
                    .await
            }
            Self::InMemory(repo) => {
                repo.store_credential_pair(user_id, access_token, refresh_hash, now_unix)
                    .await
            }
        }
    }

    async fn find_user_by_refresh_token(
        &self,
        refresh_token: &str,
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.find_user_by_refresh_token(refresh_token, now_unix).await,
            Self::InMemory(repo) => repo.find_user_by_refresh_token(refresh_token, now_unix).await,
        }
    }

    async fn revoke_credential_pair(&self, user_id: UserId) -> Result<(), ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.revoke_credential_pair(user_id).await,
            Self::InMemory(repo) => repo.revoke_credential_pair(user_id).await,
        }
    }
}

pub(crate) fn refresh_expires_at_unix(now_unix: i64) -> i64 {
    now_unix.saturating_add(REFRESH_TOKEN_TTL_SECS)
}

#[cfg(test)]
mod tests {
    use palaver_core::{Email, UserId, Username};

    use super::{refresh_expires_at_unix, InMemoryTokenRepository, TokenPersistence};
    use crate::server::{
        auth::{hash_password, hash_refresh_token, now_unix},
        core::{AppConfig, AppState, REFRESH_TOKEN_TTL_SECS},
    };

    fn username(value: &str) -> Username {
        Username::try_from(value.to_owned()).expect("valid username")
    }

    fn email(value: &str) -> Email {
        Email::try_from(value.to_owned()).expect("valid email")
    }

    #[test]
    fn refresh_expiry_is_one_year_out() {
        assert_eq!(refresh_expires_at_unix(100), 100 + REFRESH_TOKEN_TTL_SECS);
    }

    #[tokio::test]
    async fn storing_a_pair_replaces_the_previous_one() {
        let state = AppState::new(&AppConfig::default()).expect("state should initialize");
        let repo = InMemoryTokenRepository::new(&state);
        let user_id = UserId::new();
        let now = now_unix();

        let first_hash = hash_refresh_token("refresh-one");
        repo.store_credential_pair(user_id, "access-one", first_hash, now)
            .await
            .expect("first pair stores");
        let second_hash = hash_refresh_token("refresh-two");
        repo.store_credential_pair(user_id, "access-two", second_hash, now)
            .await
            .expect("second pair stores");

        assert_eq!(
            repo.find_user_by_refresh_token("refresh-two", now)
                .await
                .expect("lookup succeeds"),
            Some(user_id)
        );
        assert_eq!(
            repo.find_user_by_refresh_token("refresh-one", now)
                .await
                .expect("lookup succeeds"),
            None,
            "rotated-out refresh token must stop resolving"
        );
    }

    #[tokio::test]
    async fn expired_refresh_tokens_do_not_resolve() {
        let state = AppState::new(&AppConfig::default()).expect("state should initialize");
        let repo = InMemoryTokenRepository::new(&state);
        let user_id = UserId::new();
        let now = now_unix();

        repo.store_credential_pair(user_id, "access", hash_refresh_token("refresh"), now)
            .await
            .expect("pair stores");

        let beyond_expiry = refresh_expires_at_unix(now) + 1;
        assert_eq!(
            repo.find_user_by_refresh_token("refresh", beyond_expiry)
                .await
                .expect("lookup succeeds"),
            None
        );
    }

    #[tokio::test]
    async fn failed_logins_lock_the_account() {
        let state = AppState::new(&AppConfig::default()).expect("state should initialize");
        let repo = InMemoryTokenRepository::new(&state);
        let now = now_unix();
        let password_hash = hash_password("correct horse battery").expect("hash succeeds");
        let user = username("wallace");
        repo.create_user_if_missing(&user, &email("wallace@example.com"), &password_hash, now)
            .await
            .expect("user creation succeeds")
            .expect("user should be new");

        for _ in 0..5 {
            let outcome = repo
                .verify_credentials(&user, "wrong password", &state.dummy_password_hash, now)
                .await
                .expect("verification runs");
            assert_eq!(outcome, None);
        }

        let locked_outcome = repo
            .verify_credentials(&user, "correct horse battery", &state.dummy_password_hash, now)
            .await
            .expect("verification runs");
        assert_eq!(locked_outcome, None, "lockout must reject the right password");

        let after_lock = now + 31;
        let unlocked_outcome = repo
            .verify_credentials(
                &user,
                "correct horse battery",
                &state.dummy_password_hash,
                after_lock,
            )
            .await
            .expect("verification runs");
        assert!(unlocked_outcome.is_some(), "lock should expire after 30s");
    }
}
