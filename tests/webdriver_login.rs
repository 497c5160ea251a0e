mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use mailwright::authenticator::Authenticator;
use mailwright::browser::{DriverSource, WebDriverConfig, WebDriverLogin};
use mailwright::config::NewTokenOptions;
use mailwright::errors::AppError;
use mailwright::storage::CredentialStore;
use serde_json::{json, Value};
use support::StubExchanger;
use url::Url;

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Default)]
struct Driver {
    current_url: String,
    typed: Vec<(String, String)>,
    sessions_closed: usize,
    /// Never renders the login form.
    blank_page: bool,
}

type Shared = Arc<Mutex<Driver>>;

fn element(id: &str) -> Json<Value> {
    let mut value = json!({});
    value[ELEMENT_KEY] = json!(id);
    Json(json!({ "value": value }))
}

fn no_such_element() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "value": { "error": "no such element", "message": "not rendered" } })),
    )
}

async fn status() -> Json<Value> {
    Json(json!({ "value": { "ready": true, "message": "ok" } }))
}

async fn new_session() -> Json<Value> {
    Json(json!({ "value": { "sessionId": "s1", "capabilities": {} } }))
}

async fn close_session(State(driver): State<Shared>, Path(_sid): Path<String>) -> Json<Value> {
    driver.lock().unwrap().sessions_closed += 1;
    Json(json!({ "value": null }))
}

async fn navigate(
    State(driver): State<Shared>,
    Path(_sid): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    driver.lock().unwrap().current_url = body["url"].as_str().unwrap_or_default().to_string();
    Json(json!({ "value": null }))
}

async fn current_url(State(driver): State<Shared>, Path(_sid): Path<String>) -> Json<Value> {
    let url = driver.lock().unwrap().current_url.clone();
    Json(json!({ "value": url }))
}

async fn find(
    State(driver): State<Shared>,
    Path(_sid): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if driver.lock().unwrap().blank_page {
        return Err(no_such_element());
    }
    match body["value"].as_str() {
        Some("input[type=email]") => Ok(element("email")),
        Some("#identifierNext") => Ok(element("email-next")),
        Some("input[type=password]") => Ok(element("password")),
        Some("#passwordNext") => Ok(element("password-next")),
        _ => Err(no_such_element()),
    }
}

async fn flag(Path((_sid, _id, _flag)): Path<(String, String, String)>) -> Json<Value> {
    Json(json!({ "value": true }))
}

async fn act(
    State(driver): State<Shared>,
    Path((_sid, id, action)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    match action.as_str() {
        "value" => {
            let text = body["text"].as_str().unwrap_or_default().to_string();
            driver.lock().unwrap().typed.push((id, text));
        }
        "click" if id == "password-next" => {
            // The provider redirects to redirect_uri with a code.
            let consent = Url::parse(&driver.lock().unwrap().current_url).unwrap();
            let param = |name: &str| {
                consent
                    .query_pairs()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.into_owned())
                    .unwrap_or_default()
            };
            let target = format!("{}?code=GOODCODE&state={}", param("redirect_uri"), param("state"));
            reqwest::get(&target).await.unwrap();
            driver.lock().unwrap().current_url = target;
        }
        _ => {}
    }
    Json(json!({ "value": null }))
}

async fn fake_webdriver(driver: Shared) -> String {
    let app = Router::new()
        .route("/status", get(status))
        .route("/session", post(new_session))
        .route("/session/:sid", delete(close_session))
        .route("/session/:sid/url", get(current_url).post(navigate))
        .route("/session/:sid/element", post(find))
        .route("/session/:sid/element/:id/:action", get(flag).post(act))
        .with_state(driver);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn browser_config(url: String) -> WebDriverConfig {
    WebDriverConfig {
        driver: DriverSource::Remote { url },
        login_host: "auth.example.test".into(),
        element_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        ..WebDriverConfig::default()
    }
}

#[tokio::test]
async fn scripted_login_fills_both_screens_and_yields_token() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Shared::default();
    let login = WebDriverLogin::new(browser_config(fake_webdriver(driver.clone()).await)).unwrap();
    let auth = Authenticator::with_collaborators(
        support::identity(),
        support::loopback_defaults(dir.path()),
        Arc::new(StubExchanger::default()),
        Arc::new(login),
    );

    let token = auth
        .authorize_with_new_token(support::new_token_options())
        .await
        .unwrap();

    assert_eq!(token, support::stub_token());
    let saved = CredentialStore::new()
        .load(&dir.path().join("abc-token.json"))
        .await
        .unwrap();
    assert_eq!(saved, token);

    let driver = driver.lock().unwrap();
    assert_eq!(
        driver.typed,
        vec![
            ("email".to_string(), "user@example.com".to_string()),
            ("password".to_string(), "hunter2".to_string()),
        ]
    );
    assert_eq!(driver.sessions_closed, 1);
}

#[tokio::test]
async fn stalled_login_page_is_cancelled_at_timeout_and_session_closed() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Shared::new(Mutex::new(Driver {
        blank_page: true,
        ..Driver::default()
    }));
    let login = WebDriverLogin::new(browser_config(fake_webdriver(driver.clone()).await)).unwrap();
    let auth = Authenticator::with_collaborators(
        support::identity(),
        support::loopback_defaults(dir.path()),
        Arc::new(StubExchanger::default()),
        Arc::new(login),
    );

    let options = NewTokenOptions {
        timeout: Some(Duration::from_millis(500)),
        ..support::new_token_options()
    };
    let err = auth.authorize_with_new_token(options).await.unwrap_err();

    assert!(matches!(err, AppError::AcquisitionTimeout { .. }), "got {err:?}");
    let driver = driver.lock().unwrap();
    assert!(driver.typed.is_empty());
    assert_eq!(driver.sessions_closed, 1);
}

#[tokio::test]
async fn missing_form_element_is_ui_automation_error() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Shared::new(Mutex::new(Driver {
        blank_page: true,
        ..Driver::default()
    }));
    let mut config = browser_config(fake_webdriver(driver.clone()).await);
    config.element_timeout = Duration::from_millis(100);
    let auth = Authenticator::with_collaborators(
        support::identity(),
        support::loopback_defaults(dir.path()),
        Arc::new(StubExchanger::default()),
        Arc::new(WebDriverLogin::new(config).unwrap()),
    );

    let err = auth
        .authorize_with_new_token(support::new_token_options())
        .await
        .unwrap_err();

    match err {
        AppError::UiAutomation(msg) => assert!(msg.contains("input[type=email]"), "{msg}"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(driver.lock().unwrap().sessions_closed, 1);
}
