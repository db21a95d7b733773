//! Checkout behaviour settings

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Trial length offered on first acquisition when no live subscription exists
pub const DEFAULT_TRIAL_DAYS: u32 = 14;

/// Stripe rejects trials ending more than two years out
pub const MAX_TRIAL_DAYS: u32 = 730;

const DEFAULT_APP_ROUTES: &[&str] = &[
    "/checkout/{session}",
    "/checkout/{session}/complete",
    "/o/{offer}",
];

const DEFAULT_REDIRECT_PATH: &str = "/checkout/{session}/redirect";

#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub trial_days: u32,
    /// Public base URL of the application, e.g. `https://pay.example.com`
    pub app_base_url: String,
    /// Route templates served by the application itself. Segments written as
    /// `{name}` match any single path segment.
    pub app_routes: Vec<String>,
    /// Callback route for full-page redirect payment methods, `{session}` is
    /// replaced with the session id
    pub redirect_path: String,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            trial_days: DEFAULT_TRIAL_DAYS,
            app_base_url: "http://localhost:3000".to_string(),
            app_routes: DEFAULT_APP_ROUTES.iter().map(|r| r.to_string()).collect(),
            redirect_path: DEFAULT_REDIRECT_PATH.to_string(),
        }
    }
}

impl CheckoutConfig {
    pub fn from_env() -> BillingResult<Self> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("CHECKOUT_TRIAL_DAYS") {
            config.trial_days = parse_trial_days(&raw)?;
        }
        if let Ok(base) = std::env::var("APP_BASE_URL") {
            config.app_base_url = base.trim_end_matches('/').to_string();
        }
        if let Ok(routes) = std::env::var("CHECKOUT_APP_ROUTES") {
            config.app_routes = routes
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
        }
        if let Ok(path) = std::env::var("CHECKOUT_REDIRECT_PATH") {
            config.redirect_path = path;
        }

        Ok(config)
    }

    /// Absolute URL the gateway sends redirect-method customers back to
    pub fn redirect_callback_url(&self, session_id: Uuid) -> String {
        format!(
            "{}{}",
            self.app_base_url,
            self.redirect_path
                .replace("{session}", &session_id.to_string())
        )
    }

    /// Whether a URL path is one of the application's own routes
    pub fn is_app_route(&self, path: &str) -> bool {
        self.app_routes
            .iter()
            .any(|template| route_matches(template, path))
    }
}

fn parse_trial_days(raw: &str) -> BillingResult<u32> {
    let days: u32 = raw.trim().parse().map_err(|_| {
        BillingError::Config(format!("CHECKOUT_TRIAL_DAYS is not a number: {}", raw))
    })?;
    if days > MAX_TRIAL_DAYS {
        return Err(BillingError::Config(format!(
            "CHECKOUT_TRIAL_DAYS must be at most {}, got {}",
            MAX_TRIAL_DAYS, days
        )));
    }
    Ok(days)
}

fn route_matches(template: &str, path: &str) -> bool {
    let template_segments: Vec<&str> = template
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let path_segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    template_segments.len() == path_segments.len()
        && template_segments
            .iter()
            .zip(path_segments.iter())
            .all(|(t, p)| (t.starts_with('{') && t.ends_with('}')) || t == p)
}
