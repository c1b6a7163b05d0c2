//! Short-lived access token manager.
//!
//! The pool holds one credential manager that keeps a read-only cloud
//! token warm for workers. Two sources exist: a static token from the
//! environment (no refresh; local testing) or a mint command executed
//! with a bounded timeout. The refresh loop re-mints when less than a
//! configured skew of the lifetime remains; mint failures flip
//! `token_ready` off (new submissions are refused) and back off
//! exponentially, while running jobs keep the token they were given.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Environment variable carrying a static token for local testing.
pub const STATIC_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Errors from the credential manager.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// No token source is configured at all.
    #[error("no token source configured: set {STATIC_TOKEN_ENV} or a mint command")]
    NoSource,

    /// The mint command failed.
    #[error("token mint failed: {0}")]
    MintFailed(String),

    /// No valid token and no refresh finished within the wait budget.
    #[error("token not ready: {0}")]
    NotReady(String),
}

/// Credential manager configuration.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Static token (wins over the mint command when set).
    pub static_token: Option<SecretString>,
    /// Command line that prints a fresh token on stdout.
    pub mint_command: Option<Vec<String>>,
    /// Assumed token lifetime when the mint source does not say.
    pub lifetime: Duration,
    /// Refresh when less than this much lifetime remains.
    pub refresh_skew: Duration,
    /// Mint command timeout.
    pub mint_timeout: Duration,
    /// How long `current_token` waits for an in-flight refresh.
    pub wait_budget: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            static_token: std::env::var(STATIC_TOKEN_ENV)
                .ok()
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            mint_command: None,
            lifetime: Duration::from_secs(3600),
            refresh_skew: Duration::from_secs(300),
            mint_timeout: Duration::from_secs(30),
            wait_budget: Duration::from_secs(2),
        }
    }
}

/// Manager status for health reporting.
#[derive(Debug, Clone)]
pub struct TokenStatus {
    /// A non-expired token is available.
    pub ready: bool,
    /// Last mint error, if any.
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct TokenState {
    token: Option<SecretString>,
    expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TokenState {
    fn valid_token(&self) -> Option<SecretString> {
        let token = self.token.as_ref()?;
        match self.expires_at {
            Some(expiry) if expiry <= Utc::now() => None,
            _ => Some(token.clone()),
        }
    }
}

/// Keeps a short-lived access token warm.
#[derive(Debug)]
pub struct AccessTokenManager {
    config: TokenConfig,
    state: Mutex<TokenState>,
    refreshed: Notify,
}

impl AccessTokenManager {
    /// Creates a manager; call [`AccessTokenManager::start`] next.
    #[must_use]
    pub fn new(config: TokenConfig) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            config,
            state: Mutex::new(TokenState::default()),
            refreshed: Notify::new(),
        })
    }

    /// Seeds the first token and spawns the refresh loop.
    ///
    /// Fails fast: the service refuses to come up without a working
    /// token source.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] when no source is configured or the
    /// first mint fails.
    pub async fn start(self: &std::sync::Arc<Self>) -> Result<(), TokenError> {
        if let Some(static_token) = &self.config.static_token {
            let mut state = self.state.lock().expect("token state lock");
            state.token = Some(static_token.clone());
            state.expires_at = None;
            info!("credential manager using static token (no refresh)");
            return Ok(());
        }

        if self.config.mint_command.is_none() {
            return Err(TokenError::NoSource);
        }

        self.refresh_once().await?;
        let manager = std::sync::Arc::clone(self);
        tokio::spawn(async move { manager.refresh_loop().await });
        Ok(())
    }

    /// Returns a non-expired token, waiting briefly for an in-flight
    /// refresh when the cached one just expired.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::NotReady`] after the wait budget.
    pub async fn current_token(&self) -> Result<SecretString, TokenError> {
        if let Some(token) = self.state.lock().expect("token state lock").valid_token() {
            return Ok(token);
        }

        let wait = tokio::time::timeout(self.config.wait_budget, self.refreshed.notified()).await;
        let state = self.state.lock().expect("token state lock");
        if let Some(token) = state.valid_token() {
            return Ok(token);
        }
        let cause = state
            .last_error
            .clone()
            .unwrap_or_else(|| {
                if wait.is_err() {
                    "refresh did not complete in time".to_string()
                } else {
                    "no token available".to_string()
                }
            });
        Err(TokenError::NotReady(cause))
    }

    /// Health status.
    #[must_use]
    pub fn status(&self) -> TokenStatus {
        let state = self.state.lock().expect("token state lock");
        TokenStatus {
            ready: state.valid_token().is_some(),
            last_error: state.last_error.clone(),
        }
    }

    async fn refresh_once(&self) -> Result<(), TokenError> {
        let command = self
            .config
            .mint_command
            .as_ref()
            .ok_or(TokenError::NoSource)?;
        let (program, args) = command
            .split_first()
            .ok_or_else(|| TokenError::MintFailed("empty mint command".to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.mint_timeout, async {
            cmd.spawn()?.wait_with_output().await
        })
        .await
        .map_err(|_| TokenError::MintFailed("mint command timed out".to_string()))?
        .map_err(|e| TokenError::MintFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TokenError::MintFailed(format!(
                "mint command exited {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(TokenError::MintFailed(
                "mint command printed an empty token".to_string(),
            ));
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.config.lifetime)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        {
            let mut state = self.state.lock().expect("token state lock");
            state.token = Some(SecretString::from(token));
            state.expires_at = Some(expires_at);
            state.last_error = None;
        }
        self.refreshed.notify_waiters();
        Ok(())
    }

    async fn refresh_loop(&self) {
        let mut backoff = Duration::from_secs(5);
        loop {
            let sleep = {
                let state = self.state.lock().expect("token state lock");
                match state.expires_at {
                    Some(expiry) => {
                        let remaining = (expiry - Utc::now())
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        remaining
                            .saturating_sub(self.config.refresh_skew)
                            .max(Duration::from_secs(30))
                    }
                    None => Duration::from_secs(1800),
                }
            };
            tokio::time::sleep(sleep).await;

            match self.refresh_once().await {
                Ok(()) => backoff = Duration::from_secs(5),
                Err(err) => {
                    warn!(error = %err, "token refresh failed");
                    self.state
                        .lock()
                        .expect("token state lock")
                        .last_error = Some(err.to_string());
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(300));
                }
            }
        }
    }
}

/// Exposes a token for handing to a child process environment.
#[must_use]
pub fn expose(token: &SecretString) -> String {
    token.expose_secret().to_string()
}
