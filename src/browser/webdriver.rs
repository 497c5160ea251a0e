//! Minimal W3C WebDriver client covering the login steps.
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{left_login_ui, BrowserLoginDriver, DriverSource, WebDriverConfig};
use crate::errors::{AppError, AppResult};

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WebDriverLogin {
    config: WebDriverConfig,
    http: Client,
}

impl WebDriverLogin {
    pub fn new(config: WebDriverConfig) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(COMMAND_TIMEOUT)
            .build()
            .map_err(|e| AppError::Unexpected(format!("building webdriver http client: {e}")))?;
        Ok(Self { config, http })
    }

    async fn launch(&self) -> AppResult<(String, Option<Child>)> {
        match &self.config.driver {
            DriverSource::Remote { url } => Ok((url.trim_end_matches('/').to_string(), None)),
            DriverSource::Spawn { binary, port } => {
                let port = match *port {
                    0 => free_port()?,
                    p => p,
                };
                let child = Command::new(binary)
                    .arg(format!("--port={port}"))
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        AppError::UiAutomation(format!(
                            "failed to launch webdriver {}: {e}",
                            binary.display()
                        ))
                    })?;
                info!(binary = %binary.display(), port, "WebDriver process launched");
                Ok((format!("http://127.0.0.1:{port}"), Some(child)))
            }
        }
    }

    async fn wait_ready(&self, base: &str, cancel: &CancellationToken) -> AppResult<()> {
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            let status = self
                .http
                .get(format!("{base}/status"))
                .timeout(CLEANUP_TIMEOUT)
                .send()
                .await;
            if let Ok(res) = status {
                if let Ok(body) = res.json::<Value>().await {
                    if body["value"]["ready"].as_bool().unwrap_or(false) {
                        return Ok(());
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(AppError::UiAutomation(format!(
                    "webdriver at {base} not ready within {}s",
                    self.config.startup_timeout.as_secs()
                )));
            }
            pause(self.config.poll_interval, cancel).await?;
        }
    }

    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-gpu".to_string(),
            "--window-size=1280,900".to_string(),
            format!("--user-agent={}", self.config.user_agent),
        ];
        if self.config.headless {
            args.push("--headless=new".to_string());
        }
        let mut chrome = json!({ "args": args });
        if let Some(binary) = &self.config.browser_binary {
            chrome["binary"] = json!(binary.display().to_string());
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": chrome,
                }
            }
        })
    }

    async fn login(
        &self,
        session: &Session<'_>,
        consent_url: &Url,
        username: &str,
        password: &str,
    ) -> AppResult<()> {
        let selectors = &self.config.selectors;

        session
            .command(Method::POST, "/url", Some(json!({ "url": consent_url.as_str() })))
            .await
            .map_err(|e| AppError::UiAutomation(format!("navigating to consent url: {e}")))?;

        let email = self.wait_interactable(session, &selectors.email_input).await?;
        debug!("Filling the username");
        session.type_text(&email, username).await?;
        let next = self.wait_interactable(session, &selectors.email_next).await?;
        session.click(&next).await?;

        let pwd = self.wait_interactable(session, &selectors.password_input).await?;
        debug!("Filling the password");
        session.type_text(&pwd, password).await?;
        let next = self.wait_interactable(session, &selectors.password_next).await?;
        session.click(&next).await?;

        self.wait_left_login_ui(session).await
    }

    async fn wait_interactable(&self, session: &Session<'_>, css: &str) -> AppResult<String> {
        let deadline = Instant::now() + self.config.element_timeout;
        loop {
            if let Some(id) = session.find_element(css).await? {
                let ready = session.element_flag(&id, "displayed").await.unwrap_or(false)
                    && session.element_flag(&id, "enabled").await.unwrap_or(false);
                if ready {
                    return Ok(id);
                }
            }
            session.check_cancelled()?;
            if Instant::now() >= deadline {
                return Err(AppError::UiAutomation(format!(
                    "element {css} did not become interactable within {}s",
                    self.config.element_timeout.as_secs()
                )));
            }
            pause(self.config.poll_interval, &session.cancel).await?;
        }
    }

    async fn wait_left_login_ui(&self, session: &Session<'_>) -> AppResult<()> {
        debug!("Waiting for the login page to redirect");
        let deadline = Instant::now() + self.config.element_timeout;
        loop {
            let current = session.command(Method::GET, "/url", None).await?;
            let current = current.as_str().unwrap_or_default();
            if left_login_ui(current, &self.config.login_host) {
                info!("Login UI completed");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AppError::UiAutomation(format!(
                    "login page did not redirect within {}s (still at {})",
                    self.config.element_timeout.as_secs(),
                    strip_query(current)
                )));
            }
            pause(self.config.poll_interval, &session.cancel).await?;
        }
    }
}

#[async_trait]
impl BrowserLoginDriver for WebDriverLogin {
    async fn run(
        &self,
        consent_url: &Url,
        username: &str,
        password: &str,
        cancel: CancellationToken,
    ) -> AppResult<()> {
        let (base, mut child) = self.launch().await?;

        let result = async {
            self.wait_ready(&base, &cancel).await?;
            let session = Session::open(&self.http, &base, self.capabilities(), cancel.clone()).await?;
            let outcome = self.login(&session, consent_url, username, password).await;
            session.close().await;
            outcome
        }
        .await;

        if let Some(child) = child.as_mut() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill webdriver process");
            }
            debug!("WebDriver process stopped");
        }
        result
    }
}

struct Session<'a> {
    http: &'a Client,
    base: &'a str,
    id: String,
    cancel: CancellationToken,
}

impl<'a> Session<'a> {
    async fn open(
        http: &'a Client,
        base: &'a str,
        capabilities: Value,
        cancel: CancellationToken,
    ) -> AppResult<Session<'a>> {
        let send = http.post(format!("{base}/session")).json(&capabilities).send();
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            res = send => res.map_err(|e| AppError::UiAutomation(format!("creating browser session: {e}")))?,
        };
        let (status, value) = read_reply(res).await?;
        if !status.is_success() {
            return Err(AppError::UiAutomation(format!(
                "creating browser session: {}",
                describe_error(&value)
            )));
        }
        let id = value["sessionId"]
            .as_str()
            .ok_or_else(|| AppError::UiAutomation("webdriver returned no session id".into()))?
            .to_string();
        info!(session = %id, "Browser session opened");
        Ok(Session {
            http,
            base,
            id,
            cancel,
        })
    }

    fn check_cancelled(&self) -> AppResult<()> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        Ok(())
    }

    async fn raw(&self, method: Method, path: &str, body: Option<Value>) -> AppResult<(StatusCode, Value)> {
        let url = format!("{}/session/{}{}", self.base, self.id, path);
        let mut req = self.http.request(method.clone(), url);
        if method != Method::GET && method != Method::DELETE {
            req = req.json(&body.unwrap_or_else(|| json!({})));
        }
        let res = tokio::select! {
            _ = self.cancel.cancelled() => return Err(cancelled()),
            res = req.send() => res.map_err(|e| AppError::UiAutomation(format!("webdriver {path}: {e}")))?,
        };
        read_reply(res).await
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> AppResult<Value> {
        let (status, value) = self.raw(method, path, body).await?;
        if !status.is_success() {
            return Err(AppError::UiAutomation(format!(
                "webdriver {path}: {}",
                describe_error(&value)
            )));
        }
        Ok(value)
    }

    async fn find_element(&self, css: &str) -> AppResult<Option<String>> {
        let (status, value) = self
            .raw(
                Method::POST,
                "/element",
                Some(json!({ "using": "css selector", "value": css })),
            )
            .await?;
        if status.is_success() {
            return Ok(element_id(&value));
        }
        match value["error"].as_str() {
            Some("no such element") | Some("stale element reference") => Ok(None),
            _ => Err(AppError::UiAutomation(format!(
                "looking up {css}: {}",
                describe_error(&value)
            ))),
        }
    }

    async fn element_flag(&self, id: &str, flag: &str) -> AppResult<bool> {
        let value = self
            .command(Method::GET, &format!("/element/{id}/{flag}"), None)
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn type_text(&self, id: &str, text: &str) -> AppResult<()> {
        self.command(
            Method::POST,
            &format!("/element/{id}/value"),
            Some(json!({ "text": text })),
        )
        .await
        .map(|_| ())
    }

    async fn click(&self, id: &str) -> AppResult<()> {
        self.command(Method::POST, &format!("/element/{id}/click"), None)
            .await
            .map(|_| ())
    }

    /// Not cancellable: runs on every exit path.
    async fn close(self) {
        let res = self
            .http
            .delete(format!("{}/session/{}", self.base, self.id))
            .timeout(CLEANUP_TIMEOUT)
            .send()
            .await;
        match res {
            Ok(_) => debug!(session = %self.id, "Browser session closed"),
            Err(e) => warn!(session = %self.id, error = %e, "Failed to close browser session"),
        }
    }
}

async fn read_reply(res: reqwest::Response) -> AppResult<(StatusCode, Value)> {
    let status = res.status();
    let body: Value = res
        .json()
        .await
        .map_err(|e| AppError::UiAutomation(format!("unreadable webdriver reply: {e}")))?;
    Ok((status, body.get("value").cloned().unwrap_or(Value::Null)))
}

fn element_id(value: &Value) -> Option<String> {
    value[ELEMENT_KEY]
        .as_str()
        .or_else(|| value["ELEMENT"].as_str())
        .map(str::to_string)
}

fn describe_error(value: &Value) -> String {
    let error = value["error"].as_str().unwrap_or("unknown error");
    match value["message"].as_str() {
        Some(msg) if !msg.is_empty() => format!("{error}: {}", msg.lines().next().unwrap_or(msg)),
        _ => error.to_string(),
    }
}

fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

fn cancelled() -> AppError {
    AppError::UiAutomation("browser flow cancelled".into())
}

async fn pause(interval: Duration, cancel: &CancellationToken) -> AppResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(cancelled()),
        _ = sleep(interval) => Ok(()),
    }
}

fn free_port() -> AppResult<u16> {
    let socket = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(socket.local_addr()?.port())
}
