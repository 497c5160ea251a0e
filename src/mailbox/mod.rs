//! Gmail REST client for the mailbox operations.
pub mod poller;

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use mailparse::MailHeaderMap;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::types::{Message, MessageRef, OutgoingMessage};

pub use poller::wait_for;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
pub const DEFAULT_USER: &str = "me";

/// Gmail hands out base64url with or without padding.
const RAW_DECODER: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    /// Gmail search syntax, e.g. `from:a@b.c subject:hello is:unread`.
    pub q: Option<String>,
    pub label_ids: Vec<String>,
    pub max_results: Option<u32>,
    pub page_token: Option<String>,
    pub include_spam_trash: bool,
}

impl ListQuery {
    pub fn matching(q: impl Into<String>) -> Self {
        Self {
            q: Some(q.into()),
            ..Self::default()
        }
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(q) = &self.q {
            params.push(("q", q.clone()));
        }
        for label in &self.label_ids {
            params.push(("labelIds", label.clone()));
        }
        if let Some(max) = self.max_results {
            params.push(("maxResults", max.to_string()));
        }
        if let Some(token) = &self.page_token {
            params.push(("pageToken", token.clone()));
        }
        if self.include_spam_trash {
            params.push(("includeSpamTrash", "true".to_string()));
        }
        params
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum MessageFormat {
    #[default]
    Raw,
    Full,
    Metadata,
    Minimal,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Raw => "raw",
            MessageFormat::Full => "full",
            MessageFormat::Metadata => "metadata",
            MessageFormat::Minimal => "minimal",
        }
    }
}

#[async_trait]
pub trait MailClient: Send + Sync {
    async fn list(&self, query: &ListQuery) -> AppResult<Vec<MessageRef>>;
    async fn get(&self, id: &str, format: MessageFormat) -> AppResult<Message>;
    async fn send(&self, message: &OutgoingMessage) -> AppResult<MessageRef>;
    async fn delete(&self, id: &str) -> AppResult<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Option<Vec<MessageRef>>,
    #[serde(default)]
    result_size_estimate: Option<u64>,
}

pub struct GmailClient {
    client: reqwest::Client,
    access_token: String,
    base_url: String,
    user_id: String,
}

impl GmailClient {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token: access_token.into(),
            base_url: GMAIL_API_BASE.to_string(),
            user_id: DEFAULT_USER.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/users/{}/messages", self.base_url, self.user_id)
    }
}

#[async_trait]
impl MailClient for GmailClient {
    async fn list(&self, query: &ListQuery) -> AppResult<Vec<MessageRef>> {
        debug!(query = ?query.q, labels = ?query.label_ids, "Gmail: listing messages");
        let response = self
            .client
            .get(self.messages_url())
            .bearer_auth(&self.access_token)
            .query(&query.params())
            .send()
            .await?;
        let response = check_status(response).await?;

        let list: ListResponse = response
            .json()
            .await
            .map_err(|e| AppError::Unexpected(format!("parse message list: {e}")))?;
        let messages = match list.result_size_estimate {
            Some(0) => Vec::new(),
            _ => list.messages.unwrap_or_default(),
        };
        debug!("Gmail: found {} messages", messages.len());
        Ok(messages)
    }

    async fn get(&self, id: &str, format: MessageFormat) -> AppResult<Message> {
        debug!(id, format = format.as_str(), "Gmail: fetching message");
        let response = self
            .client
            .get(format!("{}/{}", self.messages_url(), id))
            .bearer_auth(&self.access_token)
            .query(&[("format", format.as_str())])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("message {id}")));
        }
        let response = check_status(response).await?;

        let mut message: Message = response
            .json()
            .await
            .map_err(|e| AppError::Unexpected(format!("parse message {id}: {e}")))?;
        if let Some(raw) = message.raw.take() {
            message.raw = Some(decode_raw(&raw)?);
        }
        Ok(message)
    }

    async fn send(&self, message: &OutgoingMessage) -> AppResult<MessageRef> {
        let raw = URL_SAFE.encode(compose_raw(message)?);
        let response = self
            .client
            .post(format!("{}/send", self.messages_url()))
            .bearer_auth(&self.access_token)
            .json(&json!({ "raw": raw }))
            .send()
            .await?;
        let response = check_status(response).await?;

        let sent: MessageRef = response
            .json()
            .await
            .map_err(|e| AppError::Unexpected(format!("parse send response: {e}")))?;
        info!(id = %sent.id, to = %message.to, "Gmail: message sent");
        Ok(sent)
    }

    async fn delete(&self, id: &str) -> AppResult<()> {
        let response = self
            .client
            .delete(format!("{}/{}", self.messages_url(), id))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("message {id}")));
        }
        check_status(response).await?;
        info!(id, "Gmail: message deleted");
        Ok(())
    }
}

impl Message {
    /// First value of header `name` in the decoded raw message.
    pub fn header(&self, name: &str) -> Option<String> {
        let raw = self.raw.as_deref()?;
        let (headers, _) = mailparse::parse_headers(raw.as_bytes()).ok()?;
        headers.get_first_value(name)
    }
}

async fn check_status(response: reqwest::Response) -> AppResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(AppError::Api { status, body })
}

fn decode_raw(raw: &str) -> AppResult<String> {
    let bytes = RAW_DECODER
        .decode(raw.trim())
        .map_err(|e| AppError::Unexpected(format!("decode raw message: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Plain-text RFC 822 message as accepted by `messages.send`.
/// Header values may not contain line breaks.
pub fn compose_raw(message: &OutgoingMessage) -> AppResult<String> {
    for (name, value) in [
        ("to", &message.to),
        ("from", &message.from),
        ("subject", &message.subject),
    ] {
        if value.contains(|c: char| c == '\r' || c == '\n') {
            return Err(AppError::Config(format!(
                "{name} header must not contain line breaks"
            )));
        }
    }
    Ok([
        "Content-Type: text/plain; charset=\"UTF-8\"\n",
        "MIME-Version: 1.0\n",
        "Content-Transfer-Encoding: 7bit\n",
        "to: ",
        message.to.as_str(),
        "\n",
        "from: ",
        message.from.as_str(),
        "\n",
        "subject: ",
        message.subject.as_str(),
        "\n\n",
        message.body.as_str(),
    ]
    .concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> OutgoingMessage {
        OutgoingMessage {
            to: "to@example.com".into(),
            from: "from@example.com".into(),
            subject: "Hello".into(),
            body: "Line one\nLine two".into(),
        }
    }

    #[test]
    fn composed_message_has_headers_then_body() {
        let raw = compose_raw(&outgoing()).unwrap();
        let (headers, body_offset) = mailparse::parse_headers(raw.as_bytes()).unwrap();
        assert_eq!(headers.get_first_value("To").as_deref(), Some("to@example.com"));
        assert_eq!(headers.get_first_value("Subject").as_deref(), Some("Hello"));
        assert_eq!(&raw[body_offset..], "Line one\nLine two");
    }

    #[test]
    fn line_breaks_in_headers_are_rejected() {
        let injected = OutgoingMessage {
            subject: "Hello\r\nBcc: attacker@example.com".into(),
            ..outgoing()
        };
        match compose_raw(&injected) {
            Err(AppError::Config(msg)) => assert!(msg.contains("subject"), "{msg}"),
            other => panic!("unexpected: {other:?}"),
        }

        let injected = OutgoingMessage {
            to: "to@example.com\nCc: other@example.com".into(),
            ..outgoing()
        };
        assert!(matches!(compose_raw(&injected), Err(AppError::Config(_))));

        let multiline_body = OutgoingMessage {
            body: "a\r\nb".into(),
            ..outgoing()
        };
        assert!(compose_raw(&multiline_body).is_ok());
    }

    #[test]
    fn raw_decoding_accepts_padded_and_unpadded() {
        let text = "Subject: hi?\n\nbody>>";
        let padded = URL_SAFE.encode(text);
        let unpadded = padded.trim_end_matches('=');
        assert_eq!(decode_raw(&padded).unwrap(), text);
        assert_eq!(decode_raw(unpadded).unwrap(), text);
    }

    #[test]
    fn list_params_repeat_label_ids() {
        let query = ListQuery {
            q: Some("subject:Security alert".into()),
            label_ids: vec!["INBOX".into(), "UNREAD".into()],
            max_results: Some(10),
            ..ListQuery::default()
        };
        let params = query.params();
        assert_eq!(params[0], ("q", "subject:Security alert".to_string()));
        assert_eq!(
            params.iter().filter(|(k, _)| *k == "labelIds").count(),
            2
        );
        assert!(params.contains(&("maxResults", "10".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "includeSpamTrash"));
    }

    #[test]
    fn header_lookup_reads_decoded_raw() {
        let message = Message {
            id: "m1".into(),
            raw: Some("Subject: Security alert\r\nFrom: a@b.c\r\n\r\nbody".into()),
            ..Message::default()
        };
        assert_eq!(message.header("subject").as_deref(), Some("Security alert"));
        assert_eq!(message.header("X-Missing"), None);
    }
}
