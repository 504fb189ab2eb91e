//! Slack Web API client used by the message routes and the synchronizer.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use caucus_core::config::SlackConfig;
use caucus_core::domain::message::{
    ChannelId, ChannelMessage, FileAttachment, MemberRef, SlackTimestamp, SlackUserId,
};
use caucus_core::errors::DomainError;
use caucus_core::signature::{self, AuthorMetadata};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SlackApiError {
    #[error("request to slack method `{method}` failed: {message}")]
    Http { method: String, message: String },
    #[error("slack method `{method}` returned error `{error}`")]
    Api { method: String, error: String },
    #[error("could not decode `{method}` response: {message}")]
    Decode { method: String, message: String },
}

impl SlackApiError {
    pub fn api(method: &str, error: &str) -> Self {
        Self::Api { method: method.to_owned(), error: error.to_owned() }
    }

    /// Slack's machine-readable error code, when the API answered.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Edit and delete failures, mapped to what a member should be told.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("message {0} was not found")]
    NotFound(SlackTimestamp),
    #[error("message is too old to change")]
    MessageTooOld,
    #[error(transparent)]
    Slack(SlackApiError),
}

impl From<SlackApiError> for MutationError {
    fn from(value: SlackApiError) -> Self {
        match value.code() {
            Some("cant_update_message" | "cant_delete_message" | "edit_window_closed") => {
                Self::MessageTooOld
            }
            _ => Self::Slack(value),
        }
    }
}

impl MutationError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Domain(DomainError::NotBotAuthored { .. }) => {
                "Only messages sent from this app can be changed."
            }
            Self::Domain(_) => "The message could not be changed.",
            Self::NotFound(_) => "That message no longer exists.",
            Self::MessageTooOld => "This message is too old to be edited or deleted.",
            Self::Slack(_) => "Slack rejected the change. Please try again.",
        }
    }
}

/// Identity of the bot token, from `auth.test`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotIdentity {
    pub user_id: SlackUserId,
    pub team_id: String,
    pub bot_id: Option<String>,
}

/// One `conversations.history` page, newest first as Slack returns it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryPage {
    pub messages: Vec<ChannelMessage>,
    pub has_more: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileUpload {
    pub channel: ChannelId,
    pub file_name: String,
    pub content: Vec<u8>,
    pub title: Option<String>,
    pub initial_comment: Option<String>,
}

#[async_trait]
pub trait SlackApi: Send + Sync {
    async fn auth_test(&self) -> Result<BotIdentity, SlackApiError>;

    /// Messages strictly older than `latest` when given, else the newest page.
    async fn conversations_history(
        &self,
        channel: &ChannelId,
        limit: usize,
        latest: Option<&SlackTimestamp>,
    ) -> Result<HistoryPage, SlackApiError>;

    async fn fetch_message(
        &self,
        channel: &ChannelId,
        ts: &SlackTimestamp,
    ) -> Result<Option<ChannelMessage>, SlackApiError>;

    /// Posts `text` through the bot. With an author, the text is signed and
    /// the author travels as message metadata.
    async fn post_message(
        &self,
        channel: &ChannelId,
        text: &str,
        author: Option<&MemberRef>,
    ) -> Result<SlackTimestamp, SlackApiError>;

    async fn update_message(
        &self,
        channel: &ChannelId,
        ts: &SlackTimestamp,
        text: &str,
    ) -> Result<(), SlackApiError>;

    async fn delete_message(
        &self,
        channel: &ChannelId,
        ts: &SlackTimestamp,
    ) -> Result<(), SlackApiError>;

    /// Returns the Slack file id.
    async fn upload_file(&self, upload: FileUpload) -> Result<String, SlackApiError>;

    async fn create_channel(&self, name: &str) -> Result<ChannelId, SlackApiError>;

    async fn channel_members(&self, channel: &ChannelId)
        -> Result<Vec<SlackUserId>, SlackApiError>;

    async fn invite_members(
        &self,
        channel: &ChannelId,
        users: &[SlackUserId],
    ) -> Result<(), SlackApiError>;

    async fn kick_member(&self, channel: &ChannelId, user: &SlackUserId)
        -> Result<(), SlackApiError>;
}

pub struct SlackWebClient {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
}

impl SlackWebClient {
    pub fn new(config: &SlackConfig) -> Result<Self, SlackApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| SlackApiError::Http {
                method: "client.build".to_owned(),
                message: error.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_owned(),
            token: config.bot_token.clone(),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: Value,
    ) -> Result<T, SlackApiError> {
        debug!(event_name = "slack.api.call", method, "calling slack web api");
        let response = self
            .http
            .post(self.url(method))
            .bearer_auth(self.token.expose_secret())
            .json(&payload)
            .send()
            .await
            .map_err(|error| http_error(method, error))?;

        decode_response(method, response).await
    }

    async fn get_query<T: DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<T, SlackApiError> {
        debug!(event_name = "slack.api.call", method, "calling slack web api");
        let response = self
            .http
            .get(self.url(method))
            .bearer_auth(self.token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|error| http_error(method, error))?;

        decode_response(method, response).await
    }
}

fn http_error(method: &str, error: reqwest::Error) -> SlackApiError {
    SlackApiError::Http { method: method.to_owned(), message: error.to_string() }
}

async fn decode_response<T: DeserializeOwned>(
    method: &str,
    response: reqwest::Response,
) -> Result<T, SlackApiError> {
    let status = response.status();
    let body: Value = response.json().await.map_err(|error| SlackApiError::Decode {
        method: method.to_owned(),
        message: format!("status {status}: {error}"),
    })?;

    check_envelope(method, body)
}

/// Every Web API answer carries `ok`; anything else is an API-level failure.
fn check_envelope<T: DeserializeOwned>(method: &str, body: Value) -> Result<T, SlackApiError> {
    if !body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        let error = body.get("error").and_then(Value::as_str).unwrap_or("unknown_error");
        warn!(event_name = "slack.api.error", method, error, "slack web api returned an error");
        return Err(SlackApiError::api(method, error));
    }

    serde_json::from_value(body).map_err(|error| SlackApiError::Decode {
        method: method.to_owned(),
        message: error.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct AuthTestResponse {
    user_id: String,
    team_id: String,
    #[serde(default)]
    bot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<RawMessage>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: String,
    ts: String,
    #[serde(default)]
    files: Vec<RawFile>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    url_private: Option<String>,
    #[serde(default)]
    permalink: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ts: String,
}

#[derive(Debug, Deserialize)]
struct UploadUrlResponse {
    upload_url: String,
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateChannelResponse {
    channel: CreatedChannel,
}

#[derive(Debug, Deserialize)]
struct CreatedChannel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<String>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

#[derive(Debug, Deserialize)]
struct Acknowledged {}

impl RawMessage {
    fn into_message(self, channel: &ChannelId) -> ChannelMessage {
        let user = self.user.or(self.bot_id).unwrap_or_default();
        let mut message = ChannelMessage::new(channel.clone(), SlackUserId(user), self.ts, self.text);
        message.files = self
            .files
            .into_iter()
            .map(|file| FileAttachment {
                name: file.name.or(file.title).unwrap_or_else(|| file.id.clone()),
                id: file.id,
                mimetype: file.mimetype,
                url_private: file.url_private,
                permalink: file.permalink,
            })
            .collect();
        signature::attribute(&mut message, self.metadata.as_ref(), &[]);
        message
    }
}

fn history_page(channel: &ChannelId, response: HistoryResponse) -> HistoryPage {
    HistoryPage {
        messages: response.messages.into_iter().map(|raw| raw.into_message(channel)).collect(),
        has_more: response.has_more,
    }
}

#[async_trait]
impl SlackApi for SlackWebClient {
    async fn auth_test(&self) -> Result<BotIdentity, SlackApiError> {
        let response: AuthTestResponse = self.post_json("auth.test", json!({})).await?;
        Ok(BotIdentity {
            user_id: SlackUserId(response.user_id),
            team_id: response.team_id,
            bot_id: response.bot_id,
        })
    }

    async fn conversations_history(
        &self,
        channel: &ChannelId,
        limit: usize,
        latest: Option<&SlackTimestamp>,
    ) -> Result<HistoryPage, SlackApiError> {
        let mut query = vec![
            ("channel", channel.0.clone()),
            ("limit", limit.to_string()),
            ("include_all_metadata", "true".to_owned()),
        ];
        if let Some(latest) = latest {
            query.push(("latest", latest.as_str().to_owned()));
        }

        let response: HistoryResponse = self.get_query("conversations.history", &query).await?;
        Ok(history_page(channel, response))
    }

    async fn fetch_message(
        &self,
        channel: &ChannelId,
        ts: &SlackTimestamp,
    ) -> Result<Option<ChannelMessage>, SlackApiError> {
        let query = [
            ("channel", channel.0.clone()),
            ("latest", ts.as_str().to_owned()),
            ("inclusive", "true".to_owned()),
            ("limit", "1".to_owned()),
            ("include_all_metadata", "true".to_owned()),
        ];

        let response: HistoryResponse = self.get_query("conversations.history", &query).await?;
        Ok(history_page(channel, response).messages.into_iter().find(|message| &message.ts == ts))
    }

    async fn post_message(
        &self,
        channel: &ChannelId,
        text: &str,
        author: Option<&MemberRef>,
    ) -> Result<SlackTimestamp, SlackApiError> {
        let payload = match author {
            Some(author) => json!({
                "channel": channel.0,
                "text": signature::sign(text, author),
                "metadata": AuthorMetadata::from(author).to_slack_metadata(),
            }),
            None => json!({ "channel": channel.0, "text": text }),
        };

        let response: PostMessageResponse = self.post_json("chat.postMessage", payload).await?;
        Ok(SlackTimestamp(response.ts))
    }

    async fn update_message(
        &self,
        channel: &ChannelId,
        ts: &SlackTimestamp,
        text: &str,
    ) -> Result<(), SlackApiError> {
        let _: Acknowledged = self
            .post_json("chat.update", json!({ "channel": channel.0, "ts": ts.as_str(), "text": text }))
            .await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        channel: &ChannelId,
        ts: &SlackTimestamp,
    ) -> Result<(), SlackApiError> {
        let _: Acknowledged = self
            .post_json("chat.delete", json!({ "channel": channel.0, "ts": ts.as_str() }))
            .await?;
        Ok(())
    }

    async fn upload_file(&self, upload: FileUpload) -> Result<String, SlackApiError> {
        let reserve: UploadUrlResponse = self
            .get_query(
                "files.getUploadURLExternal",
                &[
                    ("filename", upload.file_name.clone()),
                    ("length", upload.content.len().to_string()),
                ],
            )
            .await?;

        let method = "files.upload_url";
        let response = self
            .http
            .post(&reserve.upload_url)
            .header("Content-Type", "application/octet-stream")
            .body(upload.content)
            .send()
            .await
            .map_err(|error| http_error(method, error))?;
        if !response.status().is_success() {
            return Err(SlackApiError::Http {
                method: method.to_owned(),
                message: format!("upload returned status {}", response.status()),
            });
        }

        let title = upload.title.unwrap_or_else(|| upload.file_name.clone());
        let mut payload = json!({
            "files": [{ "id": reserve.file_id, "title": title }],
            "channel_id": upload.channel.0,
        });
        if let Some(comment) = upload.initial_comment.filter(|comment| !comment.trim().is_empty())
        {
            payload["initial_comment"] = json!(comment);
        }

        let _: Acknowledged = self.post_json("files.completeUploadExternal", payload).await?;
        Ok(reserve.file_id)
    }

    async fn create_channel(&self, name: &str) -> Result<ChannelId, SlackApiError> {
        let response: CreateChannelResponse = self
            .post_json("conversations.create", json!({ "name": name, "is_private": false }))
            .await?;
        Ok(ChannelId(response.channel.id))
    }

    async fn channel_members(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<SlackUserId>, SlackApiError> {
        let mut members = Vec::new();
        let mut cursor = String::new();

        loop {
            let mut query = vec![("channel", channel.0.clone()), ("limit", "200".to_owned())];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.clone()));
            }

            let page: MembersResponse = self.get_query("conversations.members", &query).await?;
            members.extend(page.members.into_iter().map(SlackUserId));
            cursor = page.response_metadata.map(|meta| meta.next_cursor).unwrap_or_default();
            if cursor.is_empty() {
                return Ok(members);
            }
        }
    }

    async fn invite_members(
        &self,
        channel: &ChannelId,
        users: &[SlackUserId],
    ) -> Result<(), SlackApiError> {
        if users.is_empty() {
            return Ok(());
        }
        let joined = users.iter().map(|user| user.0.as_str()).collect::<Vec<_>>().join(",");
        let _: Acknowledged = self
            .post_json("conversations.invite", json!({ "channel": channel.0, "users": joined }))
            .await?;
        Ok(())
    }

    async fn kick_member(
        &self,
        channel: &ChannelId,
        user: &SlackUserId,
    ) -> Result<(), SlackApiError> {
        let _: Acknowledged = self
            .post_json("conversations.kick", json!({ "channel": channel.0, "user": user.0 }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use caucus_core::domain::message::{ChannelId, SlackTimestamp, SlackUserId};
    use caucus_core::errors::DomainError;

    use super::{check_envelope, history_page, HistoryResponse, MutationError, SlackApiError};

    #[test]
    fn not_ok_envelope_maps_to_api_error() {
        let result: Result<HistoryResponse, _> = check_envelope(
            "conversations.history",
            json!({ "ok": false, "error": "channel_not_found" }),
        );

        assert_eq!(
            result.err(),
            Some(SlackApiError::api("conversations.history", "channel_not_found"))
        );
    }

    #[test]
    fn history_decodes_files_and_metadata_author() {
        let response: HistoryResponse = check_envelope(
            "conversations.history",
            json!({
                "ok": true,
                "has_more": true,
                "messages": [
                    {
                        "user": "UBOT",
                        "text": "Flyers attached\n\n_— Sent by Ada Martin_",
                        "ts": "1700000000.000200",
                        "metadata": {
                            "event_type": "caucus_member_post",
                            "event_payload": {
                                "slack_user_id": "U42",
                                "first_name": "Ada",
                                "last_name": "Martin"
                            }
                        },
                        "files": [{ "id": "F1", "title": "flyer.pdf", "mimetype": "application/pdf" }]
                    },
                    { "bot_id": "B1", "text": "joined", "ts": "1700000000.000100" }
                ]
            }),
        )
        .expect("decode");

        let page = history_page(&ChannelId("C1".into()), response);

        assert!(page.has_more);
        assert_eq!(page.messages.len(), 2);
        let first = &page.messages[0];
        assert_eq!(first.real_author.as_ref().map(|a| a.slack_user_id.clone()), Some(SlackUserId("U42".into())));
        assert_eq!(first.files[0].name, "flyer.pdf");
        assert_eq!(page.messages[1].user, SlackUserId("B1".into()));
    }

    #[test]
    fn edit_window_errors_map_to_too_old() {
        let error = MutationError::from(SlackApiError::api("chat.update", "cant_update_message"));
        assert_eq!(error, MutationError::MessageTooOld);
        assert_eq!(error.user_message(), "This message is too old to be edited or deleted.");
    }

    #[test]
    fn foreign_message_has_specific_user_message() {
        let error = MutationError::from(DomainError::NotBotAuthored {
            channel: ChannelId("C1".into()),
            ts: SlackTimestamp::from("1.0"),
        });
        assert_eq!(error.user_message(), "Only messages sent from this app can be changed.");
    }
}
