use async_trait::async_trait;
use chrono::{Duration, Utc};
use oauth2::basic::{BasicClient, BasicTokenResponse, BasicTokenType};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use tracing::{debug, info};
use url::Url;

use crate::errors::{AppError, AppResult};
use crate::types::{ClientIdentity, CredentialToken, RedirectEndpoint};

pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Everything the callback side needs to validate and redeem a redirect.
#[derive(Clone, Debug)]
pub struct ConsentRequest {
    pub url: Url,
    pub state: String,
    pub pkce_verifier: Option<String>,
}

/// OAuth client collaborator: builds consent URLs and redeems codes.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    fn consent_request(
        &self,
        scope: &[String],
        redirect: &RedirectEndpoint,
    ) -> AppResult<ConsentRequest>;

    async fn exchange_code(
        &self,
        code: &str,
        consent: &ConsentRequest,
        redirect: &RedirectEndpoint,
    ) -> AppResult<CredentialToken>;

    async fn refresh(&self, token: &CredentialToken) -> AppResult<CredentialToken>;
}

#[derive(Clone, Debug)]
pub struct GoogleOAuth {
    identity: ClientIdentity,
    auth_url: String,
    token_url: String,
}

impl GoogleOAuth {
    pub fn new(identity: ClientIdentity) -> Self {
        Self::with_endpoints(identity, AUTH_URL, TOKEN_URL)
    }

    pub fn with_endpoints(
        identity: ClientIdentity,
        auth_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            auth_url: auth_url.into(),
            token_url: token_url.into(),
        }
    }

    fn build_client(&self, redirect: Option<&RedirectEndpoint>) -> AppResult<BasicClient> {
        let auth_url = AuthUrl::new(self.auth_url.clone())
            .map_err(|e| AppError::Config(format!("invalid auth url {}: {e}", self.auth_url)))?;
        let token_url = TokenUrl::new(self.token_url.clone())
            .map_err(|e| AppError::Config(format!("invalid token url {}: {e}", self.token_url)))?;
        let mut client = BasicClient::new(
            ClientId::new(self.identity.client_id.clone()),
            Some(ClientSecret::new(self.identity.client_secret.clone())),
            auth_url,
            Some(token_url),
        )
        .set_auth_type(oauth2::AuthType::RequestBody);

        if let Some(redirect) = redirect {
            let uri = redirect.uri();
            client = client.set_redirect_uri(
                RedirectUrl::new(uri.clone())
                    .map_err(|e| AppError::Config(format!("invalid redirect uri {uri}: {e}")))?,
            );
        }
        Ok(client)
    }
}

#[async_trait]
impl TokenExchanger for GoogleOAuth {
    fn consent_request(
        &self,
        scope: &[String],
        redirect: &RedirectEndpoint,
    ) -> AppResult<ConsentRequest> {
        if scope.is_empty() {
            return Err(AppError::Config("at least one scope is required".into()));
        }
        let client = self.build_client(Some(redirect))?;
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let mut req = client
            .authorize_url(CsrfToken::new_random)
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .set_pkce_challenge(challenge);
        for s in scope {
            req = req.add_scope(Scope::new(s.clone()));
        }
        let (url, csrf) = req.url();
        debug!(redirect = %redirect.uri(), "Built consent URL");
        Ok(ConsentRequest {
            url,
            state: csrf.secret().clone(),
            pkce_verifier: Some(verifier.secret().clone()),
        })
    }

    async fn exchange_code(
        &self,
        code: &str,
        consent: &ConsentRequest,
        redirect: &RedirectEndpoint,
    ) -> AppResult<CredentialToken> {
        let client = self.build_client(Some(redirect))?;
        let mut req = client.exchange_code(AuthorizationCode::new(code.to_string()));
        if let Some(verifier) = &consent.pkce_verifier {
            req = req.set_pkce_verifier(PkceCodeVerifier::new(verifier.clone()));
        }
        let token_res = req
            .request_async(async_http_client)
            .await
            .map_err(|e| AppError::TokenExchange(format!("code exchange failed: {e}")))?;
        info!("Authorization code exchanged for token");
        Ok(token_from_response(&token_res, &requested_scope(&consent.url), None))
    }

    async fn refresh(&self, token: &CredentialToken) -> AppResult<CredentialToken> {
        let refresh = token
            .refresh_token
            .clone()
            .ok_or_else(|| AppError::TokenExchange("token has no refresh token".into()))?;
        let client = self.build_client(None)?;
        let token_res = client
            .exchange_refresh_token(&RefreshToken::new(refresh.clone()))
            .request_async(async_http_client)
            .await
            .map_err(|e| AppError::TokenExchange(format!("refresh failed: {e}")))?;
        info!("Access token refreshed");
        let mut refreshed = token_from_response(&token_res, &token.scope, Some(refresh));
        if refreshed.scope.is_empty() {
            refreshed.scope = token.scope.clone();
        }
        Ok(refreshed)
    }
}

fn requested_scope(consent_url: &Url) -> String {
    consent_url
        .query_pairs()
        .find(|(k, _)| k == "scope")
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

fn token_from_response(
    res: &BasicTokenResponse,
    fallback_scope: &str,
    previous_refresh: Option<String>,
) -> CredentialToken {
    let scope = res
        .scopes()
        .map(|scopes| {
            scopes
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_else(|| fallback_scope.to_string());
    let token_type = match res.token_type() {
        BasicTokenType::Bearer => "Bearer".to_string(),
        BasicTokenType::Mac => "MAC".to_string(),
        BasicTokenType::Extension(other) => other.clone(),
    };
    CredentialToken {
        access_token: res.access_token().secret().to_string(),
        refresh_token: res
            .refresh_token()
            .map(|r| r.secret().to_string())
            .or(previous_refresh),
        scope,
        token_type,
        expiry_date: res.expires_in().map(|d| {
            (Utc::now() + Duration::from_std(d).unwrap_or_else(|_| Duration::seconds(0)))
                .timestamp_millis()
        }),
    }
}
