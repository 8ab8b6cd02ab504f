//! Server-side sessions keyed by a signed cookie.
//!
//! The cookie carries `<session id>.<hex hmac-sha256 of the id>`; tokens stay in
//! process memory and are lost on restart, at which point the token file takes over.
//! A session lives as long as its access token (`expires_in`) and is swept
//! once that has passed.

use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::oauth::Token;

pub const SESSION_COOKIE: &str = "fitmusic_session";

/// Fitbit's default access token lifetime, used when `expires_in` is absent.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(28_800);

type HmacSha256 = Hmac<Sha256>;

struct Session {
    token: Token,
    expires_at: Instant,
}

pub struct SessionStore {
    mac: HmacSha256,
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    pub fn new(secret: &str) -> Result<Self, ConfigError> {
        let mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
            ConfigError::Invalid {
                var: "SESSION_SECRET",
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            mac,
            sessions: DashMap::new(),
        })
    }

    /// Start a session holding `token`; returns the signed cookie value.
    pub fn create(&self, token: Token) -> String {
        self.create_at(token, Instant::now())
    }

    fn create_at(&self, token: Token, now: Instant) -> String {
        self.sweep(now);

        let ttl = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SESSION_TTL);
        let id = Uuid::new_v4().to_string();
        let value = format!("{}.{}", id, self.sign(&id));
        self.sessions.insert(
            id,
            Session {
                token,
                expires_at: now + ttl,
            },
        );
        value
    }

    pub fn token_from_headers(&self, headers: &HeaderMap) -> Option<Token> {
        self.token_at(headers, Instant::now())
    }

    fn token_at(&self, headers: &HeaderMap, now: Instant) -> Option<Token> {
        let value = cookie_value(headers, SESSION_COOKIE)?;
        let id = self.verify(&value)?;
        let token = {
            let entry = self.sessions.get(id)?;
            (entry.expires_at > now).then(|| entry.token.clone())
        };
        if token.is_none() {
            self.sessions.remove(id);
        }
        token
    }

    /// Drop every session whose token has expired.
    pub fn sweep(&self, now: Instant) {
        self.sessions.retain(|_, session| session.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn sign(&self, id: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify<'a>(&self, value: &'a str) -> Option<&'a str> {
        let (id, signature) = value.rsplit_once('.')?;
        let signature = hex::decode(signature).ok()?;
        let mut mac = self.mac.clone();
        mac.update(id.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(id)
    }
}

pub fn set_cookie_header(value: &str) -> String {
    format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, value)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}
