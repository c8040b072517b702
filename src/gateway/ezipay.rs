//! EziPay merchant API token exchange.
//!
//! `POST {base_url}/access-token` with the merchant client id and secret;
//! the token comes back under `data.access_token`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{IssuedToken, TokenSource};

pub const DEFAULT_BASE_URL: &str = "https://ezipaywallet.com/merchant/api";

#[derive(Debug, Serialize)]
struct AccessTokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    data: AccessTokenData,
}

#[derive(Debug, Deserialize)]
struct AccessTokenData {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl AccessTokenResponse {
    fn into_issued(self) -> IssuedToken {
        IssuedToken {
            access_token: SecretString::new(self.data.access_token),
            expires_in: self
                .data
                .expires_in
                .filter(|secs| *secs > 0)
                .map(Duration::seconds),
        }
    }
}

/// Fetches merchant tokens over HTTP.
pub struct EziPayTokenSource {
    http: Client,
    base_url: String,
    client_id: String,
    client_secret: SecretString,
}

impl EziPayTokenSource {
    pub fn new(base_url: &str, client_id: String, client_secret: SecretString) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent("CHANPYON/0.1.0")
            .build()
            .context("Failed to build HTTP client for EziPay")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
        })
    }
}

#[async_trait]
impl TokenSource for EziPayTokenSource {
    async fn fetch_token(&self) -> Result<IssuedToken> {
        let url = format!("{}/access-token", self.base_url);
        debug!(url = %url, "Requesting EziPay access token");

        let resp = self
            .http
            .post(&url)
            .json(&AccessTokenRequest {
                client_id: &self.client_id,
                client_secret: self.client_secret.expose_secret(),
            })
            .send()
            .await
            .context("EziPay access-token request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, "EziPay rejected token request");
            anyhow::bail!("EziPay access-token failed {status}: {body}");
        }

        let parsed: AccessTokenResponse = resp
            .json()
            .await
            .context("Failed to parse EziPay access-token response")?;
        Ok(parsed.into_issued())
    }
}
