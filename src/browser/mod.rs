//! Scripted login through the provider's hosted consent UI.
mod webdriver;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::AppResult;

pub use webdriver::WebDriverLogin;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[async_trait]
pub trait BrowserLoginDriver: Send + Sync {
    /// Drives the login UI at `consent_url` until the page leaves the credential screens.
    /// Must release every browser resource before returning, including when `cancel` fires.
    async fn run(
        &self,
        consent_url: &Url,
        username: &str,
        password: &str,
        cancel: CancellationToken,
    ) -> AppResult<()>;
}

/// Where the WebDriver endpoint comes from.
#[derive(Clone, Debug)]
pub enum DriverSource {
    /// Launch a dedicated driver process per login; port 0 picks a free one.
    Spawn { binary: PathBuf, port: u16 },
    /// Use a WebDriver server that is already running.
    Remote { url: String },
}

#[derive(Clone, Debug)]
pub struct LoginSelectors {
    pub email_input: String,
    pub email_next: String,
    pub password_input: String,
    pub password_next: String,
}

impl Default for LoginSelectors {
    fn default() -> Self {
        Self {
            email_input: "input[type=email]".to_string(),
            email_next: "#identifierNext".to_string(),
            password_input: "input[type=password]".to_string(),
            password_next: "#passwordNext".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WebDriverConfig {
    pub driver: DriverSource,
    pub headless: bool,
    pub browser_binary: Option<PathBuf>,
    pub user_agent: String,
    /// Host serving the credential screens; the flow is done once the page leaves it.
    pub login_host: String,
    pub selectors: LoginSelectors,
    pub element_timeout: Duration,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            driver: DriverSource::Spawn {
                binary: PathBuf::from("chromedriver"),
                port: 0,
            },
            headless: true,
            browser_binary: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            login_host: "accounts.google.com".to_string(),
            selectors: LoginSelectors::default(),
            element_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// True once `current` no longer points at the credential screens.
pub(crate) fn left_login_ui(current: &str, login_host: &str) -> bool {
    match Url::parse(current) {
        Ok(url) => url.host_str() != Some(login_host),
        Err(_) => true,
    }
}
