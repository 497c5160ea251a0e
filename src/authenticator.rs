use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::acquire::Orchestrator;
use crate::browser::{BrowserLoginDriver, WebDriverConfig, WebDriverLogin};
use crate::config::{AuthDefaults, NewTokenOptions};
use crate::errors::{AppError, AppResult};
use crate::mailbox::{GmailClient, ListQuery, MailClient, MessageFormat, GMAIL_API_BASE};
use crate::oauth::{GoogleOAuth, TokenExchanger};
use crate::storage::CredentialStore;
use crate::types::{
    ClientIdentity, CredentialToken, Message, MessageRef, OutgoingMessage, TokenLocation,
};

const EXPIRY_SKEW_SECS: i64 = 60;

struct Credential {
    token: CredentialToken,
    /// File the token came from or went to; refreshed tokens are written back.
    path: Option<PathBuf>,
}

/// Entry point: obtains a credential one of three ways and hands out
/// mailbox clients bound to it.
pub struct Authenticator {
    identity: ClientIdentity,
    defaults: AuthDefaults,
    exchanger: Arc<dyn TokenExchanger>,
    orchestrator: Orchestrator,
    store: CredentialStore,
    credential: Mutex<Option<Credential>>,
    gmail_base: String,
}

impl Authenticator {
    /// Google OAuth endpoints and a WebDriver-driven browser.
    pub fn new(identity: ClientIdentity, browser: WebDriverConfig) -> AppResult<Self> {
        let exchanger = Arc::new(GoogleOAuth::new(identity.clone()));
        let browser = Arc::new(WebDriverLogin::new(browser)?);
        Ok(Self::with_collaborators(
            identity,
            AuthDefaults::load(),
            exchanger,
            browser,
        ))
    }

    pub fn with_collaborators(
        identity: ClientIdentity,
        defaults: AuthDefaults,
        exchanger: Arc<dyn TokenExchanger>,
        browser: Arc<dyn BrowserLoginDriver>,
    ) -> Self {
        let store = CredentialStore::new();
        let orchestrator = Orchestrator::new(exchanger.clone(), browser, store.clone());
        Self {
            identity,
            defaults,
            exchanger,
            orchestrator,
            store,
            credential: Mutex::new(None),
            gmail_base: GMAIL_API_BASE.to_string(),
        }
    }

    pub fn with_gmail_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.gmail_base = base_url.into();
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Runs the browser flow and persists the resulting token.
    pub async fn authorize_with_new_token(
        &self,
        options: NewTokenOptions,
    ) -> AppResult<CredentialToken> {
        let config = options.merge(&self.identity, &self.defaults)?;
        let token = self.orchestrator.acquire(&config).await?;
        self.set_credential(token.clone(), Some(config.location.path()))
            .await;
        Ok(token)
    }

    /// `name` may omit the `.json` suffix.
    pub async fn authorize_with_token_file(
        &self,
        name: &str,
        directory: impl AsRef<Path>,
    ) -> AppResult<CredentialToken> {
        let path = TokenLocation::new(directory.as_ref(), name).path();
        info!(path = %self.identity.mask(&path.display().to_string()), "Authorizing from token file");
        let token = self.store.load(&path).await?;
        self.set_credential(token.clone(), Some(path)).await;
        Ok(token)
    }

    pub async fn authorize_with_token(&self, token: CredentialToken) {
        debug!("Authorizing with supplied token");
        self.set_credential(token, None).await;
    }

    pub async fn credential(&self) -> Option<CredentialToken> {
        self.credential.lock().await.as_ref().map(|c| c.token.clone())
    }

    /// Current access token, refreshed first when it is about to expire.
    pub async fn access_token(&self) -> AppResult<String> {
        let mut guard = self.credential.lock().await;
        let credential = guard.as_mut().ok_or_else(|| {
            AppError::Config("no credential; authorize before calling the mailbox".into())
        })?;

        if credential.token.is_expired(EXPIRY_SKEW_SECS) && credential.token.refresh_token.is_some() {
            debug!("Access token expired, refreshing");
            let refreshed = self.exchanger.refresh(&credential.token).await?;
            if let Some(path) = &credential.path {
                self.store.save(path, &refreshed).await?;
            }
            credential.token = refreshed;
        }
        Ok(credential.token.access_token.clone())
    }

    /// Client bound to the access token current at call time. It is not
    /// refreshed afterwards; use the `MailClient` impl on `Authenticator` for
    /// long-running work such as `wait_for`.
    pub async fn gmail(&self) -> AppResult<GmailClient> {
        Ok(GmailClient::new(self.access_token().await?).with_base_url(&self.gmail_base))
    }

    async fn set_credential(&self, token: CredentialToken, path: Option<PathBuf>) {
        *self.credential.lock().await = Some(Credential { token, path });
    }
}

/// Every request goes through `access_token()`, so polling outlives token expiry.
#[async_trait]
impl MailClient for Authenticator {
    async fn list(&self, query: &ListQuery) -> AppResult<Vec<MessageRef>> {
        self.gmail().await?.list(query).await
    }

    async fn get(&self, id: &str, format: MessageFormat) -> AppResult<Message> {
        self.gmail().await?.get(id, format).await
    }

    async fn send(&self, message: &OutgoingMessage) -> AppResult<MessageRef> {
        self.gmail().await?.send(message).await
    }

    async fn delete(&self, id: &str) -> AppResult<()> {
        self.gmail().await?.delete(id).await
    }
}
