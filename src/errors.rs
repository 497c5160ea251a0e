use std::time::Duration;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("UI automation error: {0}")]
    UiAutomation(String),
    #[error("OAuth callback error: {error}{}", describe(.description))]
    Callback {
        error: String,
        description: Option<String>,
    },
    #[error("Token exchange error: {0}")]
    TokenExchange(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Token acquisition timed out after {}s (limit {}s)", .elapsed.as_secs(), .limit.as_secs())]
    AcquisitionTimeout { elapsed: Duration, limit: Duration },
    #[error("Network error: {0}")]
    Network(String),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub(crate) fn callback(error: impl Into<String>, description: Option<String>) -> Self {
        AppError::Callback {
            error: error.into(),
            description,
        }
    }
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Network(err.to_string())
    }
}
