//! Secret redaction for logs and persisted artifacts.
//!
//! Access tokens are injected into the sandbox for the lifetime of a
//! single job. Nothing that leaves the job (serial console output, job
//! logs, result documents) may contain the token, so every stream is
//! passed through a [`SecretRedactor`] before it is written anywhere.

const PLACEHOLDER: &str = "[REDACTED]";

/// Minimum secret length worth redacting.
///
/// Replacing very short strings would mangle ordinary log text (a
/// two-character "secret" matches everywhere) without protecting
/// anything real; access tokens are always far longer.
const MIN_SECRET_LEN: usize = 8;

/// Replaces known secret substrings with a placeholder.
///
/// The redactor is cheap to clone and immutable once built, so one
/// instance can be shared by the log streamer and the result parser of
/// a job.
#[derive(Debug, Clone, Default)]
pub struct SecretRedactor {
    secrets: Vec<String>,
}

impl SecretRedactor {
    /// Creates a redactor with no registered secrets (identity).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a secret to scrub. Secrets shorter than the minimum
    /// length are ignored.
    pub fn add_secret(&mut self, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.len() >= MIN_SECRET_LEN && !self.secrets.contains(&secret) {
            self.secrets.push(secret);
        }
    }

    /// Builder-style variant of [`SecretRedactor::add_secret`].
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.add_secret(secret);
        self
    }

    /// Returns `true` if no secrets are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Returns `input` with every registered secret replaced.
    #[must_use]
    pub fn redact(&self, input: &str) -> String {
        let mut out = input.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), PLACEHOLDER);
            }
        }
        out
    }

    /// Returns `true` if `input` contains any registered secret.
    #[must_use]
    pub fn contains_secret(&self, input: &str) -> bool {
        self.secrets.iter().any(|s| input.contains(s.as_str()))
    }
}
