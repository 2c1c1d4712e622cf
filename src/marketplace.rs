//! Marketplace collaborator boundary.
//!
//! `HttpMarketplaceClient` is the production implementation: OAuth
//! refresh-token caching plus a `tokio::sync::Semaphore` per rate-limit
//! category, matching the reference platform's pattern of keeping shared
//! external resources out of the coordination core's components and
//! behind a narrow adapter trait (same shape as `LlmAdapter`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

use crate::config::MarketplaceRateLimits;

/// The five rate-limited marketplace endpoint categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketplaceCategory {
    /// Catalog/product lookups.
    Catalog,
    /// Inventory reads/writes.
    Inventory,
    /// Pricing updates.
    Pricing,
    /// Order queries.
    Orders,
    /// Listing create/update.
    Listings,
}

/// Errors raised by marketplace calls.
#[derive(Debug, Error)]
pub enum MarketplaceError {
    /// The marketplace returned a non-2xx status after exhausting retries.
    #[error("marketplace error (status {status}): {message}")]
    Remote {
        /// HTTP status code.
        status: u16,
        /// Response body or error detail.
        message: String,
    },
    /// OAuth token acquisition failed.
    #[error("token refresh failed: {0}")]
    Auth(String),
    /// Transport-level failure (DNS, connect, timeout).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// A required environment variable was not set.
    #[error("missing environment variable: {0}")]
    MissingEnv(String),
}

/// Blocking-shaped (from the caller's perspective) marketplace API surface.
#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    /// Calls `endpoint` with `method`, applying the category's rate limit
    /// and automatic token refresh.
    ///
    /// # Errors
    ///
    /// Returns `MarketplaceError` on transport failure, auth failure, or a
    /// non-2xx response that survives retries.
    async fn call(
        &self,
        category: MarketplaceCategory,
        endpoint: &str,
        method: &str,
        params: HashMap<String, String>,
        body: Option<Value>,
    ) -> Result<Value, MarketplaceError>;
}

/// Credentials read once from the process environment at startup.
#[derive(Debug, Clone)]
pub struct MarketplaceCredentials {
    /// Login With Amazon application id.
    pub lwa_app_id: String,
    /// Login With Amazon client secret.
    pub lwa_client_secret: String,
    /// SP-API long-lived refresh token.
    pub refresh_token: String,
    /// Target marketplace id.
    pub marketplace_id: String,
}

impl MarketplaceCredentials {
    /// Reads all four required variables from the environment.
    ///
    /// # Errors
    ///
    /// Returns `MarketplaceError::MissingEnv` naming the first unset variable.
    pub fn from_env() -> Result<Self, MarketplaceError> {
        let var = |name: &str| std::env::var(name).map_err(|_| MarketplaceError::MissingEnv(name.to_string()));
        Ok(Self {
            lwa_app_id: var("LWA_APP_ID")?,
            lwa_client_secret: var("LWA_CLIENT_SECRET")?,
            refresh_token: var("SP_API_REFRESH_TOKEN")?,
            marketplace_id: var("MARKETPLACE_ID")?,
        })
    }
}

const TOKEN_TTL: Duration = Duration::from_secs(50 * 60);
const MAX_RETRIES: u32 = 3;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

struct CachedToken {
    access_token: String,
    fetched_at: Instant,
}

/// `reqwest`-backed `MarketplaceClient` with per-category semaphores and a
/// cached OAuth access token.
pub struct HttpMarketplaceClient {
    http: reqwest::Client,
    credentials: MarketplaceCredentials,
    base_url: String,
    token: Mutex<Option<CachedToken>>,
    semaphores: HashMap<&'static str, Arc<Semaphore>>,
}

fn category_key(category: MarketplaceCategory) -> &'static str {
    match category {
        MarketplaceCategory::Catalog => "catalog",
        MarketplaceCategory::Inventory => "inventory",
        MarketplaceCategory::Pricing => "pricing",
        MarketplaceCategory::Orders => "orders",
        MarketplaceCategory::Listings => "listings",
    }
}

impl HttpMarketplaceClient {
    /// Builds a client against `base_url`, sizing its rate-limit semaphores
    /// from `limits`.
    #[must_use]
    pub fn new(credentials: MarketplaceCredentials, base_url: impl Into<String>, limits: &MarketplaceRateLimits) -> Self {
        let semaphores = HashMap::from([
            ("catalog", Arc::new(Semaphore::new(limits.catalog))),
            ("inventory", Arc::new(Semaphore::new(limits.inventory))),
            ("pricing", Arc::new(Semaphore::new(limits.pricing))),
            ("orders", Arc::new(Semaphore::new(limits.orders))),
            ("listings", Arc::new(Semaphore::new(limits.listings))),
        ]);
        Self {
            http: reqwest::Client::new(),
            credentials,
            base_url: base_url.into(),
            token: Mutex::new(None),
            semaphores,
        }
    }

    async fn access_token(&self) -> Result<String, MarketplaceError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.fetched_at.elapsed() < TOKEN_TTL {
                return Ok(cached.access_token.clone());
            }
        }

        let response = self
            .http
            .post("https://api.amazon.com/auth/o2/token")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.credentials.refresh_token.as_str()),
                ("client_id", self.credentials.lwa_app_id.as_str()),
                ("client_secret", self.credentials.lwa_client_secret.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MarketplaceError::Auth(format!("token endpoint returned {}", response.status())));
        }

        let parsed: TokenResponse = response.json().await?;
        *guard = Some(CachedToken {
            access_token: parsed.access_token.clone(),
            fetched_at: Instant::now(),
        });
        Ok(parsed.access_token)
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_millis(200 * 2u64.pow(attempt))
    }
}

#[async_trait]
impl MarketplaceClient for HttpMarketplaceClient {
    async fn call(
        &self,
        category: MarketplaceCategory,
        endpoint: &str,
        method: &str,
        params: HashMap<String, String>,
        body: Option<Value>,
    ) -> Result<Value, MarketplaceError> {
        let semaphore = self.semaphores.get(category_key(category)).cloned().expect("all categories have a semaphore");
        let _permit = semaphore.acquire().await.expect("semaphore is never closed");

        let token = self.access_token().await?;
        let url = format!("{}{endpoint}", self.base_url);

        let mut last_error = None;
        for attempt in 0..=MAX_RETRIES {
            let mut request = self
                .http
                .request(method.parse().unwrap_or(reqwest::Method::GET), &url)
                .bearer_auth(&token)
                .query(&[("MarketplaceId", self.credentials.marketplace_id.as_str())])
                .query(&params);
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response.json().await?);
            }
            if status.as_u16() == 429 || status.is_server_error() {
                last_error = Some(MarketplaceError::Remote {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
                if attempt < MAX_RETRIES {
                    tokio::time::sleep(Self::backoff(attempt)).await;
                    continue;
                }
                break;
            }
            return Err(MarketplaceError::Remote {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Err(last_error.expect("loop always runs at least once"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> MarketplaceCredentials {
        MarketplaceCredentials {
            lwa_app_id: "app".into(),
            lwa_client_secret: "secret".into(),
            refresh_token: "refresh".into(),
            marketplace_id: "ATVPDKIKX0DER".into(),
        }
    }

    #[test]
    fn semaphores_are_sized_from_rate_limits() {
        let limits = MarketplaceRateLimits::default();
        let client = HttpMarketplaceClient::new(credentials(), "https://example.invalid", &limits);
        assert_eq!(client.semaphores["pricing"].available_permits(), 1);
        assert_eq!(client.semaphores["catalog"].available_permits(), 5);
    }

    #[test]
    fn from_env_reports_the_first_missing_variable() {
        // SAFETY: test runs single-threaded with respect to these vars.
        unsafe {
            std::env::remove_var("LWA_APP_ID");
            std::env::remove_var("LWA_CLIENT_SECRET");
            std::env::remove_var("SP_API_REFRESH_TOKEN");
            std::env::remove_var("MARKETPLACE_ID");
        }
        let result = MarketplaceCredentials::from_env();
        assert!(matches!(result, Err(MarketplaceError::MissingEnv(name)) if name == "LWA_APP_ID"));
    }
}
