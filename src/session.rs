//! Signed session cookies.
//!
//! The cookie value is `<user id>.<hex HMAC-SHA256(secret, user id)>`. A value
//! that fails verification is treated as if no cookie had been sent.

use crate::config::SessionConfig;
use crate::error::{Result, StoreError};
use axum::http::{header, HeaderMap};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "user-id";

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Clone)]
pub struct SessionKeys {
    mac: HmacSha256,
    secure: bool,
    max_age_secs: u64,
}

impl SessionKeys {
    pub fn new(secret: &[u8], secure: bool, max_age_days: u64) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| StoreError::CryptoError(format!("Invalid session secret: {}", e)))?;
        Ok(SessionKeys {
            mac,
            secure,
            max_age_secs: max_age_days * SECONDS_PER_DAY,
        })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        Self::new(
            config.secret.as_bytes(),
            config.secure_cookies,
            config.max_age_days,
        )
    }

    pub fn sign(&self, user_id: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(user_id.as_bytes());
        format!("{}.{}", user_id, hex::encode(mac.finalize().into_bytes()))
    }

    /// The user id carried by a correctly signed value.
    pub fn verify(&self, value: &str) -> Option<String> {
        let (user_id, signature) = value.rsplit_once('.')?;
        if user_id.is_empty() {
            return None;
        }
        let signature = hex::decode(signature).ok()?;

        let mut mac = self.mac.clone();
        mac.update(user_id.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(user_id.to_string())
    }

    /// `Set-Cookie` value starting a session for the user.
    pub fn session_cookie(&self, user_id: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            SESSION_COOKIE,
            self.sign(user_id),
            self.max_age_secs
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` value that removes the session cookie.
    pub fn clear_cookie(&self) -> String {
        let mut cookie = format!(
            "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
            SESSION_COOKIE
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// User id from the request's session cookie, if present and valid.
    pub fn user_id_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        cookie_value(headers, SESSION_COOKIE).and_then(|value| self.verify(&value))
    }
}

/// Look a cookie up across every `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}
