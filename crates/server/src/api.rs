//! Slack routes used by the group messaging page.
//!
//! - `GET  /api/slack/messages`  newest-first page of a channel
//! - `POST /api/slack/send-message`  post through the bot identity
//! - `POST /api/slack/upload-file`  multipart file upload with a comment
//! - `POST /api/slack/update-message`  edit a bot-posted message
//! - `POST /api/slack/delete-message`  delete a bot-posted message
//! - `POST /api/slack/update-cache`  best-effort warm of the message cache

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use caucus_core::domain::message::{
    ChannelId, ChannelMessage, MemberRef, SlackTimestamp, SlackUserId,
};
use caucus_core::errors::{ApplicationError, DomainError, InterfaceError};
use caucus_core::signature;
use caucus_core::sync::PageSizes;
use caucus_db::repositories::{CachedMessages, GroupChannelRepository, MessageCacheRepository};
use caucus_slack::synchronizer::enrich;
use caucus_slack::web::{FileUpload, MutationError};
use caucus_slack::{SlackApi, SlackApiError};

#[derive(Clone)]
pub struct ApiState {
    slack: Arc<dyn SlackApi>,
    cache: Arc<dyn MessageCacheRepository>,
    groups: Arc<dyn GroupChannelRepository>,
    bot_user_id: Option<SlackUserId>,
    pages: PageSizes,
}

impl ApiState {
    pub fn new(
        slack: Arc<dyn SlackApi>,
        cache: Arc<dyn MessageCacheRepository>,
        groups: Arc<dyn GroupChannelRepository>,
        bot_user_id: Option<SlackUserId>,
        pages: PageSizes,
    ) -> Self {
        Self { slack, cache, groups, bot_user_id, pages }
    }
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(rename = "channelId")]
    pub channel_id: String,
    pub limit: Option<usize>,
    pub before: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<ChannelMessage>,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub channel: String,
    pub text: String,
    pub author: Option<MemberRef>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub ok: bool,
    pub ts: SlackTimestamp,
}

/// Fields of the multipart upload form. `author` is a JSON-encoded
/// [`MemberRef`].
#[derive(Debug, Default)]
pub struct UploadFileForm {
    pub channel: String,
    pub file_name: String,
    pub content: Vec<u8>,
    pub title: Option<String>,
    pub initial_comment: Option<String>,
    pub author: Option<MemberRef>,
}

#[derive(Debug, Serialize)]
pub struct UploadFileResponse {
    pub ok: bool,
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMessageRequest {
    pub channel: String,
    pub ts: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessageRequest {
    pub channel: String,
    pub ts: String,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCacheRequest {
    pub channel: String,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
}

type ApiFailure = (StatusCode, Json<ApiError>);

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/slack/messages", get(list_messages))
        .route("/api/slack/send-message", post(send_message))
        .route(
            "/api/slack/upload-file",
            post(upload_file).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/slack/update-message", post(update_message))
        .route("/api/slack/delete-message", post(delete_message))
        .route("/api/slack/update-cache", post(update_cache))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_messages(
    State(state): State<ApiState>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, ApiFailure> {
    let correlation_id = correlation_id();
    let limit = query.limit.unwrap_or(state.pages.full);
    if limit != state.pages.short && limit != state.pages.full {
        return Err(bad_request(
            format!("limit must be {} or {}", state.pages.short, state.pages.full),
            &correlation_id,
        ));
    }
    let channel = required_channel(&query.channel_id, &correlation_id)?;
    let before = query.before.filter(|value| !value.trim().is_empty()).map(SlackTimestamp::new);

    let page = state
        .slack
        .conversations_history(&channel, limit, before.as_ref())
        .await
        .map_err(|error| slack_failure(error, &correlation_id))?;

    let mut messages = page.messages;
    let members = channel_members(&state, &channel, &correlation_id).await;
    enrich(&mut messages, &members);

    // the cache holds the newest page only
    if before.is_none() {
        store_cache(&state, &channel, &messages, &correlation_id).await;
    }

    Ok(Json(MessagesResponse { messages, has_more: page.has_more }))
}

async fn send_message(
    State(state): State<ApiState>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiFailure> {
    let correlation_id = correlation_id();
    let channel = required_channel(&body.channel, &correlation_id)?;
    let text = body.text.trim();
    if text.is_empty() {
        return Err(application_failure(DomainError::EmptyMessage.into(), &correlation_id));
    }

    let ts = state
        .slack
        .post_message(&channel, text, body.author.as_ref())
        .await
        .map_err(|error| slack_failure(error, &correlation_id))?;

    info!(
        event_name = "api.message.sent",
        correlation_id = %correlation_id,
        channel_id = %channel,
        ts = %ts,
        "posted message through bot identity"
    );
    Ok(Json(SendMessageResponse { ok: true, ts }))
}

async fn upload_file(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> Result<Json<UploadFileResponse>, ApiFailure> {
    let correlation_id = correlation_id();
    let form = read_upload_form(multipart, &correlation_id).await?;
    let channel = required_channel(&form.channel, &correlation_id)?;
    if form.file_name.trim().is_empty() {
        return Err(bad_request("missing 'file' field in multipart form".to_owned(), &correlation_id));
    }

    let comment = form.initial_comment.as_deref().map(str::trim).unwrap_or_default();
    let initial_comment = match form.author.as_ref() {
        Some(author) if comment.is_empty() => Some(signature::signature_line(author)),
        Some(author) => Some(signature::sign(comment, author)),
        None => (!comment.is_empty()).then(|| comment.to_owned()),
    };
    let size = form.content.len();

    let file_id = state
        .slack
        .upload_file(FileUpload {
            channel: channel.clone(),
            file_name: form.file_name.trim().to_owned(),
            content: form.content,
            title: form.title.filter(|title| !title.trim().is_empty()),
            initial_comment,
        })
        .await
        .map_err(|error| slack_failure(error, &correlation_id))?;

    info!(
        event_name = "api.file.uploaded",
        correlation_id = %correlation_id,
        channel_id = %channel,
        file_id = %file_id,
        size,
        "uploaded file through bot identity"
    );
    Ok(Json(UploadFileResponse { ok: true, file_id }))
}

async fn read_upload_form(
    mut multipart: Multipart,
    correlation_id: &str,
) -> Result<UploadFileForm, ApiFailure> {
    let mut form = UploadFileForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| bad_request(format!("multipart error: {error}"), correlation_id))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        if name == "file" {
            form.file_name = field.file_name().unwrap_or("upload").to_owned();
            form.content = field
                .bytes()
                .await
                .map_err(|error| bad_request(format!("failed to read file: {error}"), correlation_id))?
                .to_vec();
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|error| bad_request(format!("failed to read {name}: {error}"), correlation_id))?;
        match name.as_str() {
            "channel" => form.channel = value,
            "title" => form.title = Some(value),
            "initial_comment" => form.initial_comment = Some(value),
            "author" if !value.trim().is_empty() => {
                let author = serde_json::from_str::<MemberRef>(&value).map_err(|error| {
                    bad_request(format!("author is not valid: {error}"), correlation_id)
                })?;
                form.author = Some(author);
            }
            _ => {}
        }
    }
    Ok(form)
}

async fn update_message(
    State(state): State<ApiState>,
    Json(body): Json<UpdateMessageRequest>,
) -> Result<Json<OkResponse>, ApiFailure> {
    let correlation_id = correlation_id();
    let channel = required_channel(&body.channel, &correlation_id)?;
    let ts = SlackTimestamp::new(body.ts);
    let text = body.text.trim();
    if text.is_empty() {
        return Err(mutation_failure(DomainError::EmptyMessage.into(), &correlation_id));
    }

    let original = bot_authored_message(&state, &channel, &ts)
        .await
        .map_err(|error| mutation_failure(error, &correlation_id))?;
    let replacement = signature::resign(&original.text, text, original.real_author.as_ref());

    state
        .slack
        .update_message(&channel, &ts, &replacement)
        .await
        .map_err(|error| mutation_failure(error.into(), &correlation_id))?;

    info!(
        event_name = "api.message.updated",
        correlation_id = %correlation_id,
        channel_id = %channel,
        ts = %ts,
        "edited bot-posted message"
    );
    Ok(Json(OkResponse { ok: true }))
}

async fn delete_message(
    State(state): State<ApiState>,
    Json(body): Json<DeleteMessageRequest>,
) -> Result<Json<OkResponse>, ApiFailure> {
    let correlation_id = correlation_id();
    let channel = required_channel(&body.channel, &correlation_id)?;
    let ts = SlackTimestamp::new(body.ts);

    bot_authored_message(&state, &channel, &ts)
        .await
        .map_err(|error| mutation_failure(error, &correlation_id))?;
    state
        .slack
        .delete_message(&channel, &ts)
        .await
        .map_err(|error| mutation_failure(error.into(), &correlation_id))?;

    info!(
        event_name = "api.message.deleted",
        correlation_id = %correlation_id,
        channel_id = %channel,
        ts = %ts,
        "deleted bot-posted message"
    );
    Ok(Json(OkResponse { ok: true }))
}

/// Always accepted. Failures are logged and never reach the caller.
async fn update_cache(
    State(state): State<ApiState>,
    Json(body): Json<UpdateCacheRequest>,
) -> StatusCode {
    let correlation_id = correlation_id();
    let channel = ChannelId(body.channel.trim().to_owned());
    if channel.0.is_empty() {
        return StatusCode::ACCEPTED;
    }

    match state.slack.conversations_history(&channel, state.pages.short, None).await {
        Ok(page) => store_cache(&state, &channel, &page.messages, &correlation_id).await,
        Err(error) => warn!(
            event_name = "api.cache.fetch_failed",
            correlation_id = %correlation_id,
            channel_id = %channel,
            error = %error,
            "could not fetch messages for cache"
        ),
    }

    StatusCode::ACCEPTED
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Best-effort cache write of a newest-first page, stored oldest first.
async fn store_cache(
    state: &ApiState,
    channel: &ChannelId,
    newest_first: &[ChannelMessage],
    correlation_id: &str,
) {
    let messages: Vec<ChannelMessage> = newest_first.iter().rev().cloned().collect();
    let stored = messages.len();
    let cached = CachedMessages { channel_id: channel.clone(), messages, refreshed_at: Utc::now() };
    match state.cache.store(cached).await {
        Ok(()) => info!(
            event_name = "api.cache.warmed",
            correlation_id = %correlation_id,
            channel_id = %channel,
            stored,
            "message cache refreshed"
        ),
        Err(error) => warn!(
            event_name = "api.cache.store_failed",
            correlation_id = %correlation_id,
            channel_id = %channel,
            error = %error,
            "could not store message cache"
        ),
    }
}

fn required_channel(raw: &str, correlation_id: &str) -> Result<ChannelId, ApiFailure> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(bad_request("channel is required".to_owned(), correlation_id));
    }
    Ok(ChannelId(trimmed.to_owned()))
}

/// Roster of the group owning `channel`, used for author attribution.
/// Missing groups or lookup failures yield an empty roster.
async fn channel_members(
    state: &ApiState,
    channel: &ChannelId,
    correlation_id: &str,
) -> Vec<MemberRef> {
    let group = match state.groups.find_by_channel(channel).await {
        Ok(Some(group)) => group,
        Ok(None) => return Vec::new(),
        Err(error) => {
            warn!(
                event_name = "api.members.lookup_failed",
                correlation_id = %correlation_id,
                channel_id = %channel,
                error = %error,
                "could not resolve group for channel"
            );
            return Vec::new();
        }
    };

    match state.groups.members(&group.group_id).await {
        Ok(members) => members.iter().filter_map(|member| member.as_member_ref()).collect(),
        Err(error) => {
            warn!(
                event_name = "api.members.lookup_failed",
                correlation_id = %correlation_id,
                group_id = %group.group_id,
                error = %error,
                "could not load group members"
            );
            Vec::new()
        }
    }
}

async fn bot_authored_message(
    state: &ApiState,
    channel: &ChannelId,
    ts: &SlackTimestamp,
) -> Result<ChannelMessage, MutationError> {
    let Some(bot_user_id) = state.bot_user_id.as_ref() else {
        return Err(MutationError::Slack(SlackApiError::api("auth.test", "bot_identity_unknown")));
    };
    let message = state
        .slack
        .fetch_message(channel, ts)
        .await?
        .ok_or_else(|| MutationError::NotFound(ts.clone()))?;

    if !signature::is_bot_authored(&message, bot_user_id) {
        return Err(DomainError::NotBotAuthored { channel: channel.clone(), ts: ts.clone() }.into());
    }
    Ok(message)
}

fn bad_request(message: String, correlation_id: &str) -> ApiFailure {
    interface_failure(InterfaceError::BadRequest {
        message,
        correlation_id: correlation_id.to_owned(),
    })
}

fn slack_failure(error: SlackApiError, correlation_id: &str) -> ApiFailure {
    application_failure(ApplicationError::Integration(error.to_string()), correlation_id)
}

fn application_failure(error: ApplicationError, correlation_id: &str) -> ApiFailure {
    warn!(
        event_name = "api.request.failed",
        correlation_id = %correlation_id,
        error = %error,
        "slack api request failed"
    );
    interface_failure(error.into_interface(correlation_id))
}

fn interface_failure(error: InterfaceError) -> ApiFailure {
    let status = match &error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::Forbidden { .. } => StatusCode::FORBIDDEN,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiError {
            error: error.error_class().to_owned(),
            message: error.user_message().to_owned(),
            correlation_id: error.correlation_id().to_owned(),
        }),
    )
}

fn mutation_failure(error: MutationError, correlation_id: &str) -> ApiFailure {
    let (status, class) = match &error {
        MutationError::Domain(DomainError::NotBotAuthored { .. }) => {
            (StatusCode::FORBIDDEN, "forbidden")
        }
        MutationError::Domain(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        MutationError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        MutationError::MessageTooOld => (StatusCode::CONFLICT, "message_too_old"),
        MutationError::Slack(_) => (StatusCode::BAD_GATEWAY, "slack_error"),
    };
    warn!(
        event_name = "api.mutation.rejected",
        correlation_id = %correlation_id,
        error_class = class,
        error = %error,
        "message mutation rejected"
    );
    (
        status,
        Json(ApiError {
            error: class.to_owned(),
            message: error.user_message().to_owned(),
            correlation_id: correlation_id.to_owned(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    use caucus_core::domain::group::{GroupChannel, GroupMember};
    use caucus_core::domain::message::GroupId;
    use caucus_db::repositories::{InMemoryGroupChannelRepository, InMemoryMessageCacheRepository};
    use caucus_slack::web::{BotIdentity, HistoryPage};

    use super::*;

    #[derive(Default)]
    struct FakeSlack {
        messages: Mutex<HashMap<String, Vec<ChannelMessage>>>,
        posted: Mutex<Vec<(String, Option<MemberRef>)>>,
        uploads: Mutex<Vec<FileUpload>>,
        updates: Mutex<Vec<(SlackTimestamp, String)>>,
        deletes: Mutex<Vec<SlackTimestamp>>,
        fail_history: bool,
    }

    #[async_trait]
    impl SlackApi for FakeSlack {
        async fn auth_test(&self) -> Result<BotIdentity, SlackApiError> {
            Ok(BotIdentity { user_id: SlackUserId("UBOT".into()), team_id: "T1".into(), bot_id: None })
        }

        async fn conversations_history(
            &self,
            channel: &ChannelId,
            limit: usize,
            _latest: Option<&SlackTimestamp>,
        ) -> Result<HistoryPage, SlackApiError> {
            if self.fail_history {
                return Err(SlackApiError::api("conversations.history", "ratelimited"));
            }
            let all = self.messages.lock().await.get(&channel.0).cloned().unwrap_or_default();
            let has_more = all.len() > limit;
            Ok(HistoryPage { messages: all.into_iter().rev().take(limit).collect(), has_more })
        }

        async fn fetch_message(
            &self,
            channel: &ChannelId,
            ts: &SlackTimestamp,
        ) -> Result<Option<ChannelMessage>, SlackApiError> {
            let all = self.messages.lock().await.get(&channel.0).cloned().unwrap_or_default();
            Ok(all.into_iter().find(|message| &message.ts == ts))
        }

        async fn post_message(
            &self,
            _channel: &ChannelId,
            text: &str,
            author: Option<&MemberRef>,
        ) -> Result<SlackTimestamp, SlackApiError> {
            self.posted.lock().await.push((text.to_owned(), author.cloned()));
            Ok(SlackTimestamp::from("1767225700.000100"))
        }

        async fn update_message(
            &self,
            _channel: &ChannelId,
            ts: &SlackTimestamp,
            text: &str,
        ) -> Result<(), SlackApiError> {
            self.updates.lock().await.push((ts.clone(), text.to_owned()));
            Ok(())
        }

        async fn delete_message(
            &self,
            _channel: &ChannelId,
            ts: &SlackTimestamp,
        ) -> Result<(), SlackApiError> {
            self.deletes.lock().await.push(ts.clone());
            Ok(())
        }

        async fn upload_file(&self, upload: FileUpload) -> Result<String, SlackApiError> {
            self.uploads.lock().await.push(upload);
            Ok("F100".into())
        }

        async fn create_channel(&self, _name: &str) -> Result<ChannelId, SlackApiError> {
            Err(SlackApiError::api("conversations.create", "not_scripted"))
        }

        async fn channel_members(
            &self,
            _channel: &ChannelId,
        ) -> Result<Vec<SlackUserId>, SlackApiError> {
            Ok(Vec::new())
        }

        async fn invite_members(
            &self,
            _channel: &ChannelId,
            _users: &[SlackUserId],
        ) -> Result<(), SlackApiError> {
            Ok(())
        }

        async fn kick_member(
            &self,
            _channel: &ChannelId,
            _user: &SlackUserId,
        ) -> Result<(), SlackApiError> {
            Ok(())
        }
    }

    fn ada() -> MemberRef {
        MemberRef {
            slack_user_id: SlackUserId("U42".into()),
            first_name: "Ada".into(),
            last_name: "Martin".into(),
            photo_url: None,
        }
    }

    fn message(user: &str, ts: &str, text: &str) -> ChannelMessage {
        ChannelMessage::new(ChannelId("C1".into()), SlackUserId(user.into()), ts, text)
    }

    async fn fake_with_history(history: Vec<ChannelMessage>) -> Arc<FakeSlack> {
        let slack = FakeSlack::default();
        slack.messages.lock().await.insert("C1".into(), history);
        Arc::new(slack)
    }

    type Stores = (Arc<InMemoryMessageCacheRepository>, Arc<InMemoryGroupChannelRepository>);

    fn state_for(slack: Arc<FakeSlack>) -> (ApiState, Stores) {
        let cache = Arc::new(InMemoryMessageCacheRepository::default());
        let groups = Arc::new(InMemoryGroupChannelRepository::default());
        let state = ApiState::new(
            slack,
            cache.clone(),
            groups.clone(),
            Some(SlackUserId("UBOT".into())),
            PageSizes::default(),
        );
        (state, (cache, groups))
    }

    #[tokio::test]
    async fn list_messages_returns_newest_first_with_members() {
        let slack = fake_with_history(vec![
            message("U42", "100.000100", "first"),
            message("U77", "101.000100", "second"),
        ])
        .await;
        let (state, (_, groups)) = state_for(slack);
        groups
            .save(GroupChannel {
                group_id: GroupId("g-1".into()),
                group_name: "North".into(),
                slack_channel_id: Some(ChannelId("C1".into())),
            })
            .await
            .expect("save group");
        groups
            .save_member(GroupMember {
                group_id: GroupId("g-1".into()),
                member_id: "member-1".into(),
                slack_user_id: Some(SlackUserId("U42".into())),
                first_name: "Ada".into(),
                last_name: "Martin".into(),
            })
            .await
            .expect("save member");

        let Json(response) = list_messages(
            State(state),
            Query(MessagesQuery { channel_id: "C1".into(), limit: Some(50), before: None }),
        )
        .await
        .expect("messages");

        assert_eq!(response.messages.len(), 2);
        assert_eq!(response.messages[0].text, "second");
        assert_eq!(response.messages[1].member.as_ref().map(MemberRef::display_name), Some("Ada Martin".to_owned()));
        assert!(!response.has_more);
    }

    #[tokio::test]
    async fn list_messages_rejects_unsupported_limits() {
        let (state, _) = state_for(fake_with_history(Vec::new()).await);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/slack/messages?channelId=C1&limit=7")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["error"], "bad_request");
        assert!(body["correlation_id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn slack_outage_maps_to_service_unavailable() {
        let slack = Arc::new(FakeSlack { fail_history: true, ..FakeSlack::default() });
        let (state, _) = state_for(slack);

        let (status, Json(error)) = list_messages(
            State(state),
            Query(MessagesQuery { channel_id: "C1".into(), limit: Some(5), before: None }),
        )
        .await
        .expect_err("slack failure");

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.error, "service_unavailable");
        assert!(!error.message.contains("ratelimited"), "raw slack errors stay out of responses");
    }

    #[tokio::test]
    async fn send_message_forwards_author_and_rejects_empty_text() {
        let slack = fake_with_history(Vec::new()).await;
        let (state, _) = state_for(slack.clone());

        let Json(response) = send_message(
            State(state.clone()),
            Json(SendMessageRequest { channel: "C1".into(), text: " hello ".into(), author: Some(ada()) }),
        )
        .await
        .expect("send");
        assert!(response.ok);
        assert_eq!(slack.posted.lock().await.as_slice(), &[("hello".to_owned(), Some(ada()))]);

        let (status, _) = send_message(
            State(state),
            Json(SendMessageRequest { channel: "C1".into(), text: "   ".into(), author: None }),
        )
        .await
        .expect_err("empty text");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    const BOUNDARY: &str = "caucus-test-boundary";

    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((file_name, content)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn post_upload(state: ApiState, body: Vec<u8>) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/slack/upload-file")
                    .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
                    .body(Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    #[tokio::test]
    async fn upload_reads_multipart_form_and_signs_comment() {
        let slack = fake_with_history(Vec::new()).await;
        let (state, _) = state_for(slack.clone());
        let author = serde_json::to_string(&ada()).expect("author json");

        let (status, body) = post_upload(
            state,
            multipart_body(
                &[
                    ("channel", "C1"),
                    ("title", "Minutes"),
                    ("initial_comment", "from tuesday"),
                    ("author", &author),
                ],
                Some(("minutes.txt", b"hello")),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["file_id"], "F100");
        let uploads = slack.uploads.lock().await.clone();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].file_name, "minutes.txt");
        assert_eq!(uploads[0].content, b"hello".to_vec());
        assert_eq!(uploads[0].title.as_deref(), Some("Minutes"));
        assert_eq!(uploads[0].initial_comment, Some(signature::sign("from tuesday", &ada())));
    }

    #[tokio::test]
    async fn upload_without_a_file_field_is_rejected() {
        let slack = fake_with_history(Vec::new()).await;
        let (state, _) = state_for(slack.clone());

        let (status, body) = post_upload(state, multipart_body(&[("channel", "C1")], None)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
        assert!(slack.uploads.lock().await.is_empty());
    }

    #[tokio::test]
    async fn list_messages_writes_the_newest_page_through_to_the_cache() {
        let slack = fake_with_history(vec![
            message("U42", "100.000100", "first"),
            message("U77", "101.000100", "second"),
        ])
        .await;
        let (state, (cache, _)) = state_for(slack);

        list_messages(
            State(state.clone()),
            Query(MessagesQuery { channel_id: "C1".into(), limit: Some(5), before: None }),
        )
        .await
        .expect("messages");
        let cached = cache.load(&ChannelId("C1".into())).await.expect("load").expect("cached");
        assert_eq!(cached.messages.len(), 2);
        assert_eq!(cached.messages[0].text, "first");

        let other = Arc::new(InMemoryMessageCacheRepository::default());
        let older_page = ApiState { cache: other.clone(), ..state };
        list_messages(
            State(older_page),
            Query(MessagesQuery {
                channel_id: "C1".into(),
                limit: Some(5),
                before: Some("101.000100".into()),
            }),
        )
        .await
        .expect("older messages");
        assert!(other.load(&ChannelId("C1".into())).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn update_rejects_messages_not_posted_by_the_bot() {
        let slack = fake_with_history(vec![message("U42", "100.000100", "typed in slack")]).await;
        let (state, _) = state_for(slack.clone());

        let (status, Json(error)) = update_message(
            State(state),
            Json(UpdateMessageRequest { channel: "C1".into(), ts: "100.000100".into(), text: "edit".into() }),
        )
        .await
        .expect_err("not bot authored");

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error.error, "forbidden");
        assert!(slack.updates.lock().await.is_empty());
    }

    #[tokio::test]
    async fn update_keeps_the_signature_of_bot_messages() {
        let original = message("UBOT", "100.000100", &signature::sign("original", &ada()));
        let slack = fake_with_history(vec![original]).await;
        let (state, _) = state_for(slack.clone());

        update_message(
            State(state),
            Json(UpdateMessageRequest { channel: "C1".into(), ts: "100.000100".into(), text: "fixed".into() }),
        )
        .await
        .expect("update");

        let updates = slack.updates.lock().await.clone();
        assert_eq!(updates, vec![(SlackTimestamp::from("100.000100"), signature::sign("fixed", &ada()))]);
    }

    #[tokio::test]
    async fn delete_reports_missing_messages() {
        let original = message("UBOT", "100.000100", &signature::sign("original", &ada()));
        let slack = fake_with_history(vec![original]).await;
        let (state, _) = state_for(slack.clone());

        delete_message(
            State(state.clone()),
            Json(DeleteMessageRequest { channel: "C1".into(), ts: "100.000100".into() }),
        )
        .await
        .expect("delete");
        assert_eq!(slack.deletes.lock().await.len(), 1);

        let (status, _) = delete_message(
            State(state),
            Json(DeleteMessageRequest { channel: "C1".into(), ts: "999.000100".into() }),
        )
        .await
        .expect_err("missing");
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn update_cache_stores_latest_short_page_and_always_accepts() {
        let history: Vec<ChannelMessage> = (0..8)
            .map(|index| message("U77", &format!("{}.000100", 100 + index), "note"))
            .collect();
        let (state, (cache, _)) = state_for(fake_with_history(history).await);

        let status =
            update_cache(State(state), Json(UpdateCacheRequest { channel: "C1".into() })).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let cached = cache.load(&ChannelId("C1".into())).await.expect("load").expect("cached");
        assert_eq!(cached.messages.len(), 5);
        assert_eq!(cached.messages[0].ts, SlackTimestamp::from("103.000100"));
        assert_eq!(cached.messages[4].ts, SlackTimestamp::from("107.000100"));

        let failing = Arc::new(FakeSlack { fail_history: true, ..FakeSlack::default() });
        let (state, _) = state_for(failing);
        let status =
            update_cache(State(state), Json(UpdateCacheRequest { channel: "C1".into() })).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
}
