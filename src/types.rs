use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
pub const DEFAULT_TOKEN_DIRECTORY: &str = "./tokens/";

/// OAuth client credentials. Never persisted.
#[derive(Clone)]
pub struct ClientIdentity {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientIdentity {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Replaces the client id inside `text` so it can be logged.
    pub fn mask(&self, text: &str) -> String {
        if self.client_id.is_empty() {
            return text.to_string();
        }
        text.replace(&self.client_id, "*****")
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("client_id", &"*****")
            .field("client_secret", &"*****")
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedirectEndpoint {
    pub protocol: String,
    pub domain: String,
    pub port: u16,
    pub path: String,
}

impl Default for RedirectEndpoint {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            domain: "localhost".to_string(),
            port: 3000,
            path: "/oauth2callback".to_string(),
        }
    }
}

impl RedirectEndpoint {
    /// The `redirect_uri` registered with the consent request.
    pub fn uri(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.domain, self.port, self.path
        )
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

/// Token pair as written to disk. Field names follow the Google client
/// token-file format so files stay interchangeable with other tooling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: String,
    pub token_type: String,
    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
}

impl CredentialToken {
    /// True when the access token expires within `skew_secs`.
    pub fn is_expired(&self, skew_secs: i64) -> bool {
        match self.expiry_date {
            Some(expiry_ms) => expiry_ms - Utc::now().timestamp_millis() < skew_secs * 1000,
            None => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenLocation {
    pub directory: PathBuf,
    pub file_name: String,
}

impl TokenLocation {
    /// `name` gets a `.json` suffix when it does not already carry one.
    pub fn new(directory: impl Into<PathBuf>, name: &str) -> Self {
        let file_name = if name.ends_with(".json") {
            name.to_string()
        } else {
            format!("{name}.json")
        };
        Self {
            directory: directory.into(),
            file_name,
        }
    }

    pub fn default_for(identity: &ClientIdentity) -> Self {
        Self::new(
            DEFAULT_TOKEN_DIRECTORY,
            &format!("{}-token", identity.client_id),
        )
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionState {
    NotStarted,
    AwaitingCallback,
    Completed,
    Failed,
}

/// Entry returned by a mailbox list query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub size_estimate: Option<u64>,
    /// Decoded RFC 822 text when fetched in raw format.
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}
