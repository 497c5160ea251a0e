use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::types::{
    ClientIdentity, RedirectEndpoint, TokenLocation, DEFAULT_SCOPE, DEFAULT_TOKEN_DIRECTORY,
};

pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 300;

/// Process-wide defaults. These can be overridden by env vars but do not
/// require any user-authored config files.
#[derive(Debug, Clone)]
pub struct AuthDefaults {
    pub token_directory: PathBuf,
    pub redirect: RedirectEndpoint,
    pub acquire_timeout: Duration,
}

impl Default for AuthDefaults {
    fn default() -> Self {
        Self {
            token_directory: PathBuf::from(DEFAULT_TOKEN_DIRECTORY),
            redirect: RedirectEndpoint::default(),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl AuthDefaults {
    pub fn load() -> Self {
        let mut defaults = Self::default();
        if let Ok(dir) = env::var("MAILWRIGHT_TOKEN_DIR") {
            defaults.token_directory = PathBuf::from(dir);
        }
        if let Some(port) = env::var("MAILWRIGHT_REDIRECT_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            defaults.redirect.port = port;
        }
        if let Ok(domain) = env::var("MAILWRIGHT_REDIRECT_DOMAIN") {
            defaults.redirect.domain = domain;
        }
        if let Some(secs) = env::var("MAILWRIGHT_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            defaults.acquire_timeout = Duration::from_secs(secs);
        }
        defaults
    }
}

/// Partial redirect endpoint; unset fields fall back to the defaults.
#[derive(Debug, Clone, Default)]
pub struct RedirectOptions {
    pub protocol: Option<String>,
    pub domain: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
}

/// Caller-facing options for a first-time authorization.
#[derive(Debug, Clone, Default)]
pub struct NewTokenOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    pub scope: Vec<String>,
    pub redirect: RedirectOptions,
    pub token_name: Option<String>,
    pub token_directory: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

/// Fully populated, validated input of one acquisition attempt.
#[derive(Clone)]
pub struct AcquisitionConfig {
    pub username: String,
    pub password: String,
    pub scope: Vec<String>,
    pub redirect: RedirectEndpoint,
    pub location: TokenLocation,
    pub timeout: Duration,
}

impl std::fmt::Debug for AcquisitionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionConfig")
            .field("username", &"***")
            .field("password", &"***")
            .field("scope", &self.scope)
            .field("redirect", &self.redirect)
            .field("location", &self.location)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl NewTokenOptions {
    /// Merge with `defaults` and validate in one step.
    pub fn merge(
        self,
        identity: &ClientIdentity,
        defaults: &AuthDefaults,
    ) -> AppResult<AcquisitionConfig> {
        if identity.client_id.trim().is_empty() || identity.client_secret.trim().is_empty() {
            return Err(AppError::Config("client id and client secret are required".into()));
        }
        let username = self
            .username
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| AppError::Config("username is required for a new token".into()))?;
        let password = self
            .password
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AppError::Config("password is required for a new token".into()))?;

        let mut scope: Vec<String> = self
            .scope
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if scope.is_empty() {
            scope.push(DEFAULT_SCOPE.to_string());
        }

        let base = &defaults.redirect;
        let redirect = RedirectEndpoint {
            protocol: self.redirect.protocol.unwrap_or_else(|| base.protocol.clone()),
            domain: self.redirect.domain.unwrap_or_else(|| base.domain.clone()),
            port: self.redirect.port.unwrap_or(base.port),
            path: self.redirect.path.unwrap_or_else(|| base.path.clone()),
        };
        validate_redirect(&redirect)?;

        let name = self
            .token_name
            .unwrap_or_else(|| format!("{}-token", identity.client_id));
        if name.trim().is_empty() || name.contains('/') {
            return Err(AppError::Config(format!("invalid token name {name:?}")));
        }
        let directory = self
            .token_directory
            .unwrap_or_else(|| defaults.token_directory.clone());
        let location = TokenLocation::new(directory, &name);

        let timeout = self.timeout.unwrap_or(defaults.acquire_timeout);
        if timeout.is_zero() {
            return Err(AppError::Config("acquisition timeout must be positive".into()));
        }

        let config = AcquisitionConfig {
            username,
            password,
            scope,
            redirect,
            location,
            timeout,
        };
        debug!(
            token = %identity.mask(&config.location.path().display().to_string()),
            scope = ?config.scope,
            redirect = %config.redirect.uri(),
            timeout_secs = config.timeout.as_secs(),
            "Configured new-token acquisition (username=***, password=***)"
        );
        Ok(config)
    }
}

fn validate_redirect(endpoint: &RedirectEndpoint) -> AppResult<()> {
    if endpoint.protocol != "http" {
        return Err(AppError::Config(format!(
            "redirect protocol {:?} not supported by the local listener",
            endpoint.protocol
        )));
    }
    if endpoint.domain.trim().is_empty() {
        return Err(AppError::Config("redirect domain is empty".into()));
    }
    if !endpoint.path.starts_with('/') {
        return Err(AppError::Config(format!(
            "redirect path {:?} must start with '/'",
            endpoint.path
        )));
    }
    url::Url::parse(&endpoint.uri())
        .map_err(|e| AppError::Config(format!("invalid redirect uri {}: {e}", endpoint.uri())))?;
    Ok(())
}
