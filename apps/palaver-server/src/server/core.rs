use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{atomic::AtomicI64, Arc, Mutex, OnceLock},
    time::Duration,
};

use anyhow::anyhow;
use argon2::password_hash::rand_core::{OsRng, RngCore};
use object_store::local::LocalFileSystem;
use pasetors::{keys::SymmetricKey, version4::V4};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::{OnceCell, RwLock};

use palaver_core::{UserId, Username};

use crate::server::auth::hash_password;

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 1_048_576;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 60;
pub const DEFAULT_AUTH_ROUTE_REQUESTS_PER_MINUTE: u32 = 20;
pub const ACCESS_TOKEN_TTL_SECS: i64 = 5 * 60;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 365 * 24 * 60 * 60;
pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
pub const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 3;
pub const MAX_NOTIFY_TIMEOUT_SECS: u64 = 10;
pub(crate) const REFRESH_NONCE_CHARS: usize = 10;
pub(crate) const LOGIN_LOCK_THRESHOLD: u8 = 5;
pub(crate) const LOGIN_LOCK_SECS: i64 = 30;
pub(crate) const RATE_LIMIT_SWEEP_INTERVAL_SECS: i64 = 60;
pub(crate) const MAX_MIME_SNIFF_BYTES: usize = 8192;
pub(crate) const MAX_ATTACHMENTS_PER_MESSAGE: usize = 10;
pub(crate) const MAX_BULK_READ_IDS: usize = 100;
pub(crate) const MAX_PROFILE_FIELD_CHARS: usize = 150;
pub(crate) const MAX_PROFILE_ABOUT_CHARS: usize = 4000;
pub(crate) const MAX_MESSAGE_BODY_CHARS: usize = 4000;
pub(crate) const METRICS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub(crate) static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: Mutex<HashMap<&'static str, u64>>,
    pub(crate) rate_limit_hits: Mutex<HashMap<(&'static str, &'static str), u64>>,
    pub(crate) notify_failures: Mutex<HashMap<&'static str, u64>>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub auth_route_requests_per_minute: u32,
    pub page_size: usize,
    pub max_upload_bytes: usize,
    pub upload_root: PathBuf,
    pub notify_url: Option<String>,
    pub notify_timeout: Duration,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            auth_route_requests_per_minute: DEFAULT_AUTH_ROUTE_REQUESTS_PER_MINUTE,
            page_size: DEFAULT_PAGE_SIZE,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            upload_root: PathBuf::from("./data/uploads"),
            notify_url: None,
            notify_timeout: Duration::from_secs(DEFAULT_NOTIFY_TIMEOUT_SECS),
            database_url: None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) auth_route_requests_per_minute: u32,
    pub(crate) page_size: usize,
    pub(crate) max_upload_bytes: usize,
    pub(crate) notify: Option<Arc<NotifyConfig>>,
}

#[derive(Clone)]
pub(crate) struct NotifyConfig {
    pub(crate) url: String,
    pub(crate) timeout: Duration,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) db_pool: Option<PgPool>,
    pub(crate) db_init: Arc<OnceCell<()>>,
    pub(crate) users: Arc<RwLock<HashMap<String, UserRecord>>>,
    pub(crate) user_ids: Arc<RwLock<HashMap<String, String>>>,
    pub(crate) credential_pairs: Arc<RwLock<HashMap<String, CredentialPairRecord>>>,
    pub(crate) profiles: Arc<RwLock<HashMap<String, ProfileRecord>>>,
    pub(crate) favorites: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    pub(crate) uploads: Arc<RwLock<HashMap<String, UploadRecord>>>,
    pub(crate) messages: Arc<RwLock<HashMap<String, MessageRecord>>>,
    pub(crate) attachments: Arc<RwLock<HashMap<String, AttachmentRecord>>>,
    pub(crate) token_key: Arc<SymmetricKey<V4>>,
    pub(crate) dummy_password_hash: Arc<String>,
    pub(crate) http_client: reqwest::Client,
    pub(crate) auth_route_hits: Arc<RwLock<HashMap<String, Vec<i64>>>>,
    pub(crate) rate_limit_last_sweep_unix: Arc<AtomicI64>,
    pub(crate) upload_store: Arc<LocalFileSystem>,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let mut key_bytes = [0_u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let token_key = SymmetricKey::<V4>::from(&key_bytes)
            .map_err(|e| anyhow!("token key init failed: {e}"))?;
        let dummy_password_hash = hash_password("palaver-dummy-password")?;
        let db_pool = if let Some(database_url) = &config.database_url {
            Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect_lazy(database_url)
                    .map_err(|e| anyhow!("postgres pool init failed: {e}"))?,
            )
        } else {
            None
        };

        std::fs::create_dir_all(&config.upload_root)
            .map_err(|e| anyhow!("upload root init failed: {e}"))?;
        let upload_store = LocalFileSystem::new_with_prefix(&config.upload_root)
            .map_err(|e| anyhow!("upload store init failed: {e}"))?;

        let notify = match &config.notify_url {
            Some(url) => {
                let url = url.trim();
                if url.is_empty() {
                    return Err(anyhow!("notify url cannot be empty when set"));
                }
                Some(Arc::new(NotifyConfig {
                    url: url.to_owned(),
                    timeout: config.notify_timeout,
                }))
            }
            None => None,
        };

        Ok(Self {
            db_pool,
            db_init: Arc::new(OnceCell::new()),
            users: Arc::new(RwLock::new(HashMap::new())),
            user_ids: Arc::new(RwLock::new(HashMap::new())),
            credential_pairs: Arc::new(RwLock::new(HashMap::new())),
            profiles: Arc::new(RwLock::new(HashMap::new())),
            favorites: Arc::new(RwLock::new(HashMap::new())),
            uploads: Arc::new(RwLock::new(HashMap::new())),
            messages: Arc::new(RwLock::new(HashMap::new())),
            attachments: Arc::new(RwLock::new(HashMap::new())),
            token_key: Arc::new(token_key),
            dummy_password_hash: Arc::new(dummy_password_hash),
            http_client: reqwest::Client::new(),
            auth_route_hits: Arc::new(RwLock::new(HashMap::new())),
            rate_limit_last_sweep_unix: Arc::new(AtomicI64::new(0)),
            upload_store: Arc::new(upload_store),
            runtime: Arc::new(RuntimeConfig {
                auth_route_requests_per_minute: config.auth_route_requests_per_minute,
                page_size: config.page_size,
                max_upload_bytes: config.max_upload_bytes,
                notify,
            }),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct UserRecord {
    pub(crate) id: UserId,
    pub(crate) username: Username,
    pub(crate) email: String,
    pub(crate) password_hash: String,
    pub(crate) is_staff: bool,
    pub(crate) is_superuser: bool,
    pub(crate) is_active: bool,
    pub(crate) last_seen_unix: i64,
    pub(crate) created_at_unix: i64,
    pub(crate) failed_logins: u8,
    pub(crate) locked_until_unix: Option<i64>,
}

#[derive(Debug, Clone)]
pub(crate) struct CredentialPairRecord {
    pub(crate) user_id: UserId,
    pub(crate) access_token: String,
    pub(crate) refresh_token_hash: [u8; 32],
    pub(crate) refresh_expires_at_unix: i64,
    pub(crate) issued_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct ProfileRecord {
    pub(crate) profile_id: String,
    pub(crate) user_id: UserId,
    pub(crate) first_name: String,
    pub(crate) last_name: String,
    pub(crate) caption: String,
    pub(crate) about: String,
    pub(crate) picture_file_id: Option<String>,
    pub(crate) created_at_unix: i64,
    pub(crate) updated_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct UploadRecord {
    pub(crate) file_id: String,
    pub(crate) owner_id: UserId,
    pub(crate) filename: String,
    pub(crate) mime_type: String,
    pub(crate) size_bytes: u64,
    pub(crate) sha256_hex: String,
    pub(crate) object_key: String,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct MessageRecord {
    pub(crate) message_id: String,
    pub(crate) sender_id: UserId,
    pub(crate) receiver_id: UserId,
    pub(crate) body: Option<String>,
    pub(crate) is_read: bool,
    pub(crate) created_at_unix: i64,
    pub(crate) updated_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct AttachmentRecord {
    pub(crate) attachment_id: String,
    pub(crate) message_id: String,
    pub(crate) file_id: String,
    pub(crate) caption: Option<String>,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct AuthContext {
    pub(crate) user_id: UserId,
    pub(crate) username: String,
}
