#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mailwright::browser::BrowserLoginDriver;
use mailwright::config::{AuthDefaults, NewTokenOptions, RedirectOptions};
use mailwright::errors::{AppError, AppResult};
use mailwright::oauth::{ConsentRequest, TokenExchanger};
use mailwright::types::{ClientIdentity, CredentialToken, RedirectEndpoint};
use tokio_util::sync::CancellationToken;
use url::Url;

pub const STUB_STATE: &str = "st4te";

pub fn identity() -> ClientIdentity {
    ClientIdentity::new("abc", "xyz")
}

pub fn loopback_defaults(token_directory: &Path) -> AuthDefaults {
    AuthDefaults {
        token_directory: token_directory.to_path_buf(),
        redirect: RedirectEndpoint {
            protocol: "http".into(),
            domain: "127.0.0.1".into(),
            port: 0,
            path: "/oauth2callback".into(),
        },
        acquire_timeout: Duration::from_secs(10),
    }
}

pub fn new_token_options() -> NewTokenOptions {
    NewTokenOptions {
        username: Some("user@example.com".into()),
        password: Some("hunter2".into()),
        scope: vec!["https://www.googleapis.com/auth/gmail.readonly".into()],
        redirect: RedirectOptions::default(),
        ..NewTokenOptions::default()
    }
}

pub fn stub_token() -> CredentialToken {
    CredentialToken {
        access_token: "A".into(),
        refresh_token: Some("R".into()),
        scope: "https://www.googleapis.com/auth/gmail.readonly".into(),
        token_type: "Bearer".into(),
        expiry_date: Some(1234),
    }
}

/// Consent URLs point at a fake host; exchanges and refreshes are canned.
#[derive(Default)]
pub struct StubExchanger {
    pub fail_exchange: bool,
    /// Delays every code exchange, like a stalled token endpoint.
    pub exchange_delay: Option<Duration>,
    pub exchanged: AtomicUsize,
    pub refreshed: AtomicUsize,
    pub last_code: std::sync::Mutex<Option<String>>,
}

impl StubExchanger {
    pub fn failing() -> Self {
        Self {
            fail_exchange: true,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            exchange_delay: Some(delay),
            ..Self::default()
        }
    }
}

#[async_trait]
impl TokenExchanger for StubExchanger {
    fn consent_request(
        &self,
        scope: &[String],
        redirect: &RedirectEndpoint,
    ) -> AppResult<ConsentRequest> {
        let url = Url::parse_with_params(
            "https://auth.example.test/o/oauth2/v2/auth",
            &[
                ("client_id", "abc"),
                ("redirect_uri", redirect.uri().as_str()),
                ("scope", scope.join(" ").as_str()),
                ("state", STUB_STATE),
            ],
        )
        .map_err(|e| AppError::Config(e.to_string()))?;
        Ok(ConsentRequest {
            url,
            state: STUB_STATE.into(),
            pkce_verifier: None,
        })
    }

    async fn exchange_code(
        &self,
        code: &str,
        _consent: &ConsentRequest,
        _redirect: &RedirectEndpoint,
    ) -> AppResult<CredentialToken> {
        self.exchanged.fetch_add(1, Ordering::SeqCst);
        *self.last_code.lock().unwrap() = Some(code.to_string());
        if let Some(delay) = self.exchange_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_exchange {
            return Err(AppError::TokenExchange("invalid_grant".into()));
        }
        Ok(stub_token())
    }

    async fn refresh(&self, token: &CredentialToken) -> AppResult<CredentialToken> {
        self.refreshed.fetch_add(1, Ordering::SeqCst);
        Ok(CredentialToken {
            access_token: "A2".into(),
            expiry_date: Some(chrono::Utc::now().timestamp_millis() + 3_600_000),
            ..token.clone()
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Redirect {
    /// Provider redirects back with `code=GOODCODE`.
    Approve,
    /// Provider redirects back with `error=access_denied`.
    Deny,
    /// Login never completes; waits for cancellation.
    Hang,
    /// Login page breaks before any redirect.
    Fail,
    /// Login finishes but the provider never redirects, e.g. it shows the
    /// consent screen again.
    CompleteWithoutRedirect,
}

/// Stands in for the browser: follows the consent URL's redirect_uri the way
/// the provider would after a successful login.
pub struct SimulatedBrowser {
    pub redirect: Redirect,
    pub cancelled: Arc<AtomicBool>,
    pub credentials: std::sync::Mutex<Option<(String, String)>>,
    pub redirect_uri: std::sync::Mutex<Option<Url>>,
}

impl SimulatedBrowser {
    pub fn new(redirect: Redirect) -> Self {
        Self {
            redirect,
            cancelled: Arc::new(AtomicBool::new(false)),
            credentials: std::sync::Mutex::new(None),
            redirect_uri: std::sync::Mutex::new(None),
        }
    }

    pub fn redirect_port(&self) -> u16 {
        self.redirect_uri
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|u| u.port())
            .expect("browser never saw a redirect uri")
    }
}

#[async_trait]
impl BrowserLoginDriver for SimulatedBrowser {
    async fn run(
        &self,
        consent_url: &Url,
        username: &str,
        password: &str,
        cancel: CancellationToken,
    ) -> AppResult<()> {
        *self.credentials.lock().unwrap() = Some((username.to_string(), password.to_string()));
        let param = |name: &str| {
            consent_url
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        };
        let redirect_uri = param("redirect_uri");
        let state = param("state");
        *self.redirect_uri.lock().unwrap() = Url::parse(&redirect_uri).ok();

        let target = match self.redirect {
            Redirect::Approve => format!("{redirect_uri}?code=GOODCODE&state={state}"),
            Redirect::Deny => format!(
                "{redirect_uri}?error=access_denied&error_description=User+declined&state={state}"
            ),
            Redirect::Hang => {
                cancel.cancelled().await;
                self.cancelled.store(true, Ordering::SeqCst);
                return Err(AppError::UiAutomation("browser flow cancelled".into()));
            }
            Redirect::Fail => {
                return Err(AppError::UiAutomation(
                    "element input[type=password] did not become interactable".into(),
                ));
            }
            Redirect::CompleteWithoutRedirect => return Ok(()),
        };
        reqwest::get(target)
            .await
            .map_err(|e| AppError::UiAutomation(e.to_string()))?;
        Ok(())
    }
}

/// Asserts nothing is listening on `port` any more by binding it.
pub fn assert_port_released(port: u16) {
    std::net::TcpListener::bind(("127.0.0.1", port))
        .unwrap_or_else(|e| panic!("port {port} still bound: {e}"));
}
