//! Token acquisition: listener, browser and exchange choreographed per attempt.
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::BrowserLoginDriver;
use crate::callback::{CallbackListener, CallbackOutcome};
use crate::config::AcquisitionConfig;
use crate::errors::{AppError, AppResult};
use crate::oauth::{ConsentRequest, TokenExchanger};
use crate::storage::CredentialStore;
use crate::types::{AcquisitionState, CredentialToken, RedirectEndpoint};

pub struct Orchestrator {
    exchanger: Arc<dyn TokenExchanger>,
    browser: Arc<dyn BrowserLoginDriver>,
    store: CredentialStore,
    state: watch::Sender<AcquisitionState>,
}

impl Orchestrator {
    pub fn new(
        exchanger: Arc<dyn TokenExchanger>,
        browser: Arc<dyn BrowserLoginDriver>,
        store: CredentialStore,
    ) -> Self {
        let (state, _) = watch::channel(AcquisitionState::NotStarted);
        Self {
            exchanger,
            browser,
            store,
            state,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AcquisitionState> {
        self.state.subscribe()
    }

    /// Runs one full acquisition. The listener and the browser are released
    /// before this returns, whatever the outcome.
    pub async fn acquire(&self, config: &AcquisitionConfig) -> AppResult<CredentialToken> {
        self.state.send_replace(AcquisitionState::NotStarted);
        info!(redirect = %config.redirect.uri(), "Starting token acquisition");

        let result = self.attempt(config).await;
        match &result {
            Ok(_) => {
                self.state.send_replace(AcquisitionState::Completed);
                info!(path = %config.location.path().display(), "Token acquisition completed");
            }
            Err(e) => {
                self.state.send_replace(AcquisitionState::Failed);
                warn!(error = %e, "Token acquisition failed");
            }
        }
        result
    }

    async fn attempt(&self, config: &AcquisitionConfig) -> AppResult<CredentialToken> {
        let started = Instant::now();
        let deadline = started + config.timeout;

        let (tx, rx) = oneshot::channel();
        let mut listener = CallbackListener::start(&config.redirect, move |outcome| {
            let _ = tx.send(outcome);
        })
        .await?;
        let redirect = listener.endpoint().clone();

        let waited = self
            .await_callback(config, &redirect, rx, started, deadline)
            .await;
        listener.stop().await;
        let (consent, outcome) = waited?;

        let code = accept_outcome(outcome, &consent)?;
        let redeem = async {
            let token = self
                .exchanger
                .exchange_code(&code, &consent, &redirect)
                .await?;
            self.store.save(&config.location.path(), &token).await?;
            Ok::<_, AppError>(token)
        };
        match timeout_at(deadline, redeem).await {
            Ok(redeemed) => redeemed,
            Err(_) => {
                warn!("Token exchange did not finish before the acquisition deadline");
                Err(timed_out(started, config))
            }
        }
    }

    async fn await_callback(
        &self,
        config: &AcquisitionConfig,
        redirect: &RedirectEndpoint,
        mut rx: oneshot::Receiver<CallbackOutcome>,
        started: Instant,
        deadline: Instant,
    ) -> AppResult<(ConsentRequest, CallbackOutcome)> {
        let consent = self.exchanger.consent_request(&config.scope, redirect)?;
        debug!(
            authorize = %consent.url.origin().ascii_serialization(),
            scope = ?config.scope,
            "Consent URL built"
        );

        let cancel = CancellationToken::new();
        self.state.send_replace(AcquisitionState::AwaitingCallback);

        let consent_url = consent.url.clone();
        let browser = self.browser.run(
            &consent_url,
            &config.username,
            &config.password,
            cancel.child_token(),
        );
        tokio::pin!(browser);
        let expiry = sleep_until(deadline);
        tokio::pin!(expiry);

        let mut browser_done = false;
        let outcome = loop {
            tokio::select! {
                biased;
                received = &mut rx => {
                    break received.map_err(|_| {
                        AppError::Unexpected("callback listener stopped without a result".into())
                    });
                }
                finished = &mut browser, if !browser_done => {
                    browser_done = true;
                    match finished {
                        Ok(()) => debug!("Browser flow finished, waiting for callback"),
                        Err(e) => break Err(e),
                    }
                }
                _ = &mut expiry => {
                    break Err(timed_out(started, config));
                }
            }
        };

        cancel.cancel();
        if !browser_done {
            if let Err(e) = browser.await {
                debug!(error = %e, "Browser flow stopped");
            }
        }
        outcome.map(|outcome| (consent, outcome))
    }
}

fn timed_out(started: Instant, config: &AcquisitionConfig) -> AppError {
    AppError::AcquisitionTimeout {
        elapsed: started.elapsed(),
        limit: config.timeout,
    }
}

fn accept_outcome(outcome: CallbackOutcome, consent: &ConsentRequest) -> AppResult<String> {
    match outcome {
        CallbackOutcome::Error { error, description } => Err(AppError::callback(error, description)),
        CallbackOutcome::Code { code, state } => {
            if !consent.state.is_empty() && state.as_deref() != Some(consent.state.as_str()) {
                return Err(AppError::callback(
                    "state_mismatch",
                    Some("redirect state does not match the consent request".into()),
                ));
            }
            Ok(code)
        }
    }
}
