//! One-shot localhost listener for the OAuth redirect.
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::types::RedirectEndpoint;

const SUCCESS_HTML: &str =
    "<html><body><h1>Authentication successful</h1><p>You may close this window.</p></body></html>";
const ERROR_HTML: &str =
    "<html><body><h1>Authentication failed</h1><p>You may close this window and retry.</p></body></html>";
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REQUEST_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Code {
        code: String,
        state: Option<String>,
    },
    Error {
        error: String,
        description: Option<String>,
    },
}

pub struct CallbackListener {
    endpoint: RedirectEndpoint,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Binds `endpoint` and serves it in the background. `on_outcome` runs at
    /// most once, for the first request that hits the configured path.
    pub async fn start<F>(endpoint: &RedirectEndpoint, on_outcome: F) -> AppResult<Self>
    where
        F: FnOnce(CallbackOutcome) + Send + 'static,
    {
        let (primary, secondary) = bind(endpoint).await?;
        let port = primary
            .local_addr()
            .map(|addr| addr.port())
            .map_err(|e| AppError::Unexpected(format!("failed to read local addr: {e}")))?;

        let bound = endpoint.with_port(port);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            primary,
            secondary,
            bound.path.clone(),
            shutdown.clone(),
            on_outcome,
        ));
        info!(redirect = %bound.uri(), "Callback listener started");

        Ok(Self {
            endpoint: bound,
            shutdown,
            task: Some(task),
        })
    }

    /// The endpoint actually bound; differs from the requested one when port 0 was asked for.
    pub fn endpoint(&self) -> &RedirectEndpoint {
        &self.endpoint
    }

    /// Stops accepting and waits until the port is released. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Callback listener task ended abnormally");
            }
            debug!(redirect = %self.endpoint.uri(), "Callback listener stopped");
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// `localhost` gets both loopbacks on one port, since browsers may resolve it
/// to either. Other domains bind their first resolved address.
async fn bind(endpoint: &RedirectEndpoint) -> AppResult<(TcpListener, Option<TcpListener>)> {
    let port = endpoint.port;
    if endpoint.domain != "localhost" {
        let listener = TcpListener::bind((endpoint.domain.as_str(), port))
            .await
            .map_err(|e| bind_error(&endpoint.domain, port, e.to_string()))?;
        return Ok((listener, None));
    }

    match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(v4) => {
            let port = v4.local_addr()?.port();
            let v6 = match TcpListener::bind(("::1", port)).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    debug!(port, error = %e, "IPv6 loopback unavailable for callback listener");
                    None
                }
            };
            Ok((v4, v6))
        }
        Err(v4_err) => {
            let v6 = TcpListener::bind(("::1", port)).await.map_err(|v6_err| {
                bind_error("localhost", port, format!("127.0.0.1 ({v4_err}); ::1 ({v6_err})"))
            })?;
            Ok((v6, None))
        }
    }
}

fn bind_error(domain: &str, port: u16, cause: String) -> AppError {
    AppError::Network(format!(
        "failed to bind callback listener on {domain}:{port}: {cause}"
    ))
}

async fn accept_on(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Each connection is served on its own task so an idle socket cannot hold
/// up the redirect behind it.
async fn accept_loop<F>(
    primary: TcpListener,
    secondary: Option<TcpListener>,
    path: String,
    shutdown: CancellationToken,
    on_outcome: F,
) where
    F: FnOnce(CallbackOutcome) + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<CallbackOutcome>(1);
    let mut connections = JoinSet::new();

    let outcome = loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break None,
            Some(outcome) = rx.recv() => break Some(outcome),
            Some(joined) = connections.join_next() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(error = %e, "Callback connection task panicked");
                    }
                }
                continue;
            }
            accepted = primary.accept() => accepted,
            accepted = accept_on(secondary.as_ref()) => accepted,
        };
        let (mut stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Callback accept failed");
                continue;
            }
        };
        debug!(peer = %peer, "Callback connection accepted");

        let tx = tx.clone();
        let path = path.clone();
        connections.spawn(async move {
            match handle_connection(&mut stream, &path).await {
                Ok(Some(outcome)) => {
                    let _ = tx.send(outcome).await;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Ignoring malformed callback request"),
            }
        });
    };

    connections.abort_all();
    drop(primary);
    drop(secondary);
    if let Some(outcome) = outcome {
        on_outcome(outcome);
    }
}

/// Returns `Some` only for a GET on the configured path.
async fn handle_connection(stream: &mut TcpStream, path: &str) -> AppResult<Option<CallbackOutcome>> {
    let request = read_request_head(stream).await?;
    let (method, target) = parse_request_line(&request)?;

    let parsed = url::Url::parse(&format!("http://localhost{target}"))
        .map_err(|e| AppError::Unexpected(format!("failed to parse callback url: {e}")))?;
    if parsed.path() != path {
        write_response(stream, "404 Not Found", "").await;
        return Ok(None);
    }
    if method != "GET" {
        write_response(stream, "405 Method Not Allowed", "").await;
        return Ok(None);
    }

    let outcome = outcome_from_query(&parsed);
    match &outcome {
        CallbackOutcome::Code { .. } => {
            info!("Authorization code received");
            write_response(stream, "200 OK", SUCCESS_HTML).await;
        }
        CallbackOutcome::Error { error, .. } => {
            warn!(error = %error, "Provider redirected with an error");
            write_response(stream, "400 Bad Request", ERROR_HTML).await;
        }
    }
    Ok(Some(outcome))
}

async fn read_request_head(stream: &mut TcpStream) -> AppResult<String> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| AppError::Network("callback request read timed out".into()))??;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }
    if buf.is_empty() {
        return Err(AppError::Unexpected("callback request is empty".into()));
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_request_line(request: &str) -> AppResult<(&str, &str)> {
    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts
        .next()
        .filter(|t| t.starts_with('/'))
        .ok_or_else(|| AppError::Unexpected("invalid HTTP request".into()))?;
    Ok((method, target))
}

fn outcome_from_query(url: &url::Url) -> CallbackOutcome {
    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };
    if let Some(error) = param("error") {
        return CallbackOutcome::Error {
            error,
            description: param("error_description"),
        };
    }
    match param("code").filter(|c| !c.is_empty()) {
        Some(code) => CallbackOutcome::Code {
            code,
            state: param("state"),
        },
        None => CallbackOutcome::Error {
            error: "missing_code".to_string(),
            description: Some("callback carried neither code nor error".to_string()),
        },
    }
}

async fn write_response(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(target: &str) -> url::Url {
        url::Url::parse(&format!("http://localhost{target}")).unwrap()
    }

    #[test]
    fn code_and_state_are_extracted() {
        assert_eq!(
            outcome_from_query(&url("/cb?code=4%2F0Ab&state=xyz")),
            CallbackOutcome::Code {
                code: "4/0Ab".into(),
                state: Some("xyz".into())
            }
        );
    }

    #[test]
    fn error_wins_over_code() {
        assert_eq!(
            outcome_from_query(&url("/cb?error=access_denied&code=zzz")),
            CallbackOutcome::Error {
                error: "access_denied".into(),
                description: None
            }
        );
    }

    #[test]
    fn missing_code_is_reported_as_error() {
        match outcome_from_query(&url("/cb?scope=x")) {
            CallbackOutcome::Error { error, .. } => assert_eq!(error, "missing_code"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn request_line_requires_origin_form_target() {
        assert_eq!(
            parse_request_line("GET /cb?code=1 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap(),
            ("GET", "/cb?code=1")
        );
        assert!(parse_request_line("garbage").is_err());
    }
}
