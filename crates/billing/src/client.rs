//! Stripe client wrapper
//!
//! Wraps the `async-stripe` client for typed calls and a `reqwest` client for
//! the endpoints whose responses we parse ourselves (invoice previews,
//! intents, subscription updates). Parsing raw JSON keeps us working when the
//! account's Stripe API version is newer than the one `async-stripe` targets.
//! Both clients honour the configured API base and per-request timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

const DEFAULT_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Stripe credentials and transport settings
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Base URL for raw API calls, overridable for tests
    pub api_base: String,
    /// Per-request timeout applied to every gateway call
    pub timeout_secs: u64,
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Load from `STRIPE_SECRET_KEY`, `STRIPE_API_BASE`, `STRIPE_TIMEOUT_SECS`
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let api_base = std::env::var("STRIPE_API_BASE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let timeout_secs = match std::env::var("STRIPE_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                BillingError::Config(format!("STRIPE_TIMEOUT_SECS is not a number: {}", raw))
            })?,
            Err(_) => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            secret_key,
            api_base,
            timeout_secs,
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

/// Shared Stripe client, cheap to clone
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    http: reqwest::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;

        // `from_url` panics on a malformed base
        url::Url::parse(&config.api_base).map_err(|e| {
            BillingError::Config(format!("Invalid Stripe API base '{}': {}", config.api_base, e))
        })?;
        let inner = stripe::Client::from_url(config.api_base.as_str(), config.secret_key.clone());

        Ok(Self {
            inner,
            http,
            config: Arc::new(config),
        })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    /// Typed `async-stripe` client
    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Run a typed `async-stripe` call under the configured timeout
    pub async fn typed<T, F>(&self, operation: &str, call: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.timeout(), call).await {
            Ok(result) => result.map_err(BillingError::from),
            Err(_) => {
                tracing::warn!(
                    operation = operation,
                    timeout_secs = self.config.timeout_secs,
                    "Stripe API request timed out"
                );
                Err(BillingError::GatewayTimeout(self.config.timeout_secs))
            }
        }
    }

    /// POST a form-encoded body using Stripe's nested parameter format
    pub async fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> BillingResult<serde_json::Value> {
        let url = format!("{}{}", self.config.api_base, path);
        let request = self
            .http
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .form(form);

        self.send(path, request).await
    }

    /// POST with an `Idempotency-Key` so Stripe applies a replayed request once
    pub async fn post_form_idempotent(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: &str,
    ) -> BillingResult<serde_json::Value> {
        let url = format!("{}{}", self.config.api_base, path);
        let request = self
            .http
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", idempotency_key)
            .form(form);

        self.send(path, request).await
    }

    /// GET with query parameters (used for `expand[]`)
    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> BillingResult<serde_json::Value> {
        let url = format!("{}{}", self.config.api_base, path);
        let request = self
            .http
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .query(query);

        self.send(path, request).await
    }

    async fn send(
        &self,
        path: &str,
        request: reqwest::RequestBuilder,
    ) -> BillingResult<serde_json::Value> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BillingError::GatewayTimeout(self.config.timeout_secs)
            } else {
                BillingError::from(e)
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(BillingError::from)?;

        if !status.is_success() {
            let message = stripe_error_message(&body).unwrap_or_else(|| body.clone());
            tracing::error!(
                path = %path,
                status = %status,
                error_body = %body,
                "Stripe API call failed"
            );
            return Err(BillingError::StripeApi(format!(
                "Stripe API error ({}): {}",
                status.as_u16(),
                message
            )));
        }

        serde_json::from_str(&body).map_err(|e| {
            BillingError::StripeApi(format!("Failed to parse Stripe response: {}", e))
        })
    }
}

/// Pull `error.message` out of a Stripe error body
fn stripe_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value["error"]["message"].as_str().map(str::to_string)
}
