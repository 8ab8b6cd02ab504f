//! Fitbit OAuth2 authorization-code flow and the on-disk token file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const AUTHORIZE_URL: &str = "https://www.fitbit.com/oauth2/authorize";
pub const TOKEN_URL: &str = "https://api.fitbit.com/oauth2/token";

const SCOPES: &str = "activity%20heartrate%20sleep%20nutrition%20weight";
const TOKEN_LIFETIME_SECS: u32 = 604_800;

/// Vendor-issued credential. Fields we don't model are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Result of looking a token up somewhere it may not exist.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenLookup {
    Present(Token),
    Absent,
}

impl TokenLookup {
    pub fn into_option(self) -> Option<Token> {
        match self {
            TokenLookup::Present(token) => Some(token),
            TokenLookup::Absent => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// URL the browser is sent to for consent.
pub fn build_authorize_url(client_id: &str, redirect_uri: &str) -> String {
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&expires_in={}",
        AUTHORIZE_URL,
        client_id,
        urlencoding::encode(redirect_uri),
        SCOPES,
        TOKEN_LIFETIME_SECS
    )
}

pub async fn exchange_code_for_token(
    client: &Client,
    token_url: &str,
    credentials: &Credentials,
    code: &str,
) -> Result<Token, OAuthError> {
    let form = [
        ("client_id", credentials.client_id.as_str()),
        ("grant_type", "authorization_code"),
        ("redirect_uri", credentials.redirect_uri.as_str()),
        ("code", code),
    ];
    request_token(client, token_url, credentials, &form).await
}

pub async fn refresh_access_token(
    client: &Client,
    token_url: &str,
    credentials: &Credentials,
    refresh_token: &str,
) -> Result<Token, OAuthError> {
    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    request_token(client, token_url, credentials, &form).await
}

async fn request_token(
    client: &Client,
    token_url: &str,
    credentials: &Credentials,
    form: &[(&str, &str)],
) -> Result<Token, OAuthError> {
    let auth = format!("{}:{}", credentials.client_id, credentials.client_secret);
    let encoded =
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, auth.as_bytes());

    let response = client
        .post(token_url)
        .header("Authorization", format!("Basic {}", encoded))
        .form(form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::Status {
            status: status.as_u16(),
            body,
        });
    }

    Ok(response.json().await?)
}

/// JSON token file shared by the web service and `poll_biometrics`.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Expiry is not checked here; the vendor rejects stale tokens.
    pub async fn load(&self) -> anyhow::Result<TokenLookup> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(TokenLookup::Absent),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };

        let token = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(TokenLookup::Present(token))
    }

    pub async fn save(&self, token: &Token) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(token)?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}
