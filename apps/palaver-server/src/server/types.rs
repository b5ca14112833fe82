use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{core::METRICS_TEXT_CONTENT_TYPE, metrics::render_metrics};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn metrics() -> Response {
    (
        [(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)],
        render_metrics(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    pub(crate) error: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RegisterRequest {
    pub(crate) username: String,
    pub(crate) email: String,
    pub(crate) password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoginRequest {
    pub(crate) username: String,
    pub(crate) password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RefreshRequest {
    pub(crate) refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TokenPairResponse {
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
    pub(crate) expires_in_secs: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct UserSummary {
    pub(crate) user_id: String,
    pub(crate) username: String,
    pub(crate) email: String,
    pub(crate) last_seen_unix: i64,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct MeResponse {
    pub(crate) user: UserSummary,
    pub(crate) profile: Option<ProfileView>,
}

#[derive(Debug, Serialize)]
pub(crate) struct LogoutResponse {
    pub(crate) logged_out: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateProfileRequest {
    pub(crate) first_name: String,
    pub(crate) last_name: String,
    pub(crate) caption: Option<String>,
    pub(crate) about: Option<String>,
    pub(crate) profile_picture_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpdateProfileRequest {
    pub(crate) first_name: Option<String>,
    pub(crate) last_name: Option<String>,
    pub(crate) caption: Option<String>,
    pub(crate) about: Option<String>,
    pub(crate) profile_picture_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct FileView {
    pub(crate) file_id: String,
    pub(crate) filename: String,
    pub(crate) mime_type: String,
    pub(crate) size_bytes: u64,
    pub(crate) sha256_hex: String,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ProfileView {
    pub(crate) profile_id: String,
    pub(crate) user_id: String,
    pub(crate) username: String,
    pub(crate) first_name: String,
    pub(crate) last_name: String,
    pub(crate) caption: String,
    pub(crate) about: String,
    pub(crate) profile_picture: Option<FileView>,
    /// 1 when the requesting user has marked this profile's owner as a
    /// favorite, otherwise 0. Listing order sorts on this before profile id.
    pub(crate) favorite: i64,
    pub(crate) created_at_unix: i64,
    pub(crate) updated_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ProfileListResponse {
    pub(crate) page: usize,
    pub(crate) results: Vec<ProfileView>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ToggleFavoriteRequest {
    pub(crate) favorite_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ToggleFavoriteResponse {
    pub(crate) status: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct CheckFavoriteResponse {
    pub(crate) favorite: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AttachmentInput {
    pub(crate) file_id: String,
    pub(crate) caption: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateMessageRequest {
    pub(crate) sender_id: String,
    pub(crate) receiver_id: String,
    pub(crate) body: Option<String>,
    pub(crate) attachments: Option<Vec<AttachmentInput>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpdateMessageRequest {
    pub(crate) body: Option<String>,
    /// When present, the stored attachment set is replaced wholesale with
    /// this list. Absent means leave attachments untouched.
    pub(crate) attachments: Option<Vec<AttachmentInput>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BulkMarkReadRequest {
    pub(crate) message_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct BulkMarkReadResponse {
    pub(crate) updated: usize,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct PartyView {
    pub(crate) user_id: String,
    pub(crate) username: String,
    pub(crate) first_name: String,
    pub(crate) last_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct AttachmentView {
    pub(crate) attachment_id: String,
    pub(crate) file: FileView,
    pub(crate) caption: Option<String>,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct MessageView {
    pub(crate) message_id: String,
    pub(crate) sender: PartyView,
    pub(crate) receiver: PartyView,
    pub(crate) body: Option<String>,
    pub(crate) is_read: bool,
    pub(crate) attachments: Vec<AttachmentView>,
    pub(crate) created_at_unix: i64,
    pub(crate) updated_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct MessageListResponse {
    pub(crate) page: usize,
    pub(crate) results: Vec<MessageView>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MessageListQuery {
    /// Narrows the listing to the conversation between the caller and this
    /// user. Without it the caller sees every message they sent or received.
    pub(crate) user_id: Option<String>,
    pub(crate) page: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UploadQuery {
    pub(crate) filename: Option<String>,
}
