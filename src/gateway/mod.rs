//! Payment gateway credentials.
//!
//! The gateway hands out short-lived bearer tokens. `CredentialCache`
//! keeps the current one and refreshes it shortly before it expires. It is
//! an ordinary value owned by whoever needs it (the HTTP boundary holds
//! one in its state), never process-wide.

pub mod ezipay;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default token lifetime when the gateway does not say.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 2 * 60 * 60;

/// Refresh this long before the token expires.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

/// A freshly issued token.
pub struct IssuedToken {
    pub access_token: SecretString,
    /// Lifetime reported by the gateway, if any.
    pub expires_in: Option<Duration>,
}

/// Something that can exchange credentials for an access token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<IssuedToken>;
}

struct CachedToken {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

/// Caches one access token with an expiry.
pub struct CredentialCache {
    source: Box<dyn TokenSource>,
    ttl: Duration,
    refresh_margin: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl CredentialCache {
    pub fn new(source: Box<dyn TokenSource>, ttl: Duration, refresh_margin: Duration) -> Self {
        Self {
            source,
            ttl,
            refresh_margin,
            cached: Mutex::new(None),
        }
    }

    pub fn with_defaults(source: Box<dyn TokenSource>) -> Self {
        Self::new(
            source,
            Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
            Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
        )
    }

    /// A valid access token, fetching a new one if needed.
    pub async fn token(&self) -> Result<SecretString> {
        self.token_at(Utc::now()).await
    }

    /// Same as [`token`](Self::token) with an explicit clock.
    pub async fn token_at(&self, now: DateTime<Utc>) -> Result<SecretString> {
        // Held across the fetch so concurrent callers share one refresh.
        let mut cached = self.cached.lock().await;

        if let Some(c) = cached.as_ref() {
            if now < c.expires_at - self.refresh_margin {
                debug!(expires_at = %c.expires_at, "Using cached gateway token");
                return Ok(SecretString::new(c.token.expose_secret().clone()));
            }
        }

        let issued = self.source.fetch_token().await?;
        let expires_at = now + issued.expires_in.unwrap_or(self.ttl);
        let token = SecretString::new(issued.access_token.expose_secret().clone());
        *cached = Some(CachedToken { token: issued.access_token, expires_at });

        info!(%expires_at, "Gateway token refreshed");
        Ok(token)
    }

    /// Whether a cached token is usable at `now`.
    pub async fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.cached
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| now < c.expires_at - self.refresh_margin)
    }

    /// Forget the cached token, e.g. after the gateway rejected it.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
