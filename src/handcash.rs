//! Identity provider integration.
//!
//! Users authenticate with HandCash; the auth token handed back to us is the
//! secret of a per-user key pair, and every API call is signed with it.

use crate::bsv::KeyPair;
use crate::config::{HandCashConfig, IdentityMode};
use crate::error::{Result, StoreError};
use crate::models::UserProfile;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use reqwest::{Client, Method, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Auth token accepted in development in place of a real one.
pub const MOCK_AUTH_TOKEN: &str = "mock-token";

/// Prefix of development auth tokens naming the handle to log in as.
pub const DEV_TOKEN_PREFIX: &str = "dev:";

const PROFILE_ENDPOINT: &str = "/v1/connect/profile/currentUserProfile";
const BALANCE_ENDPOINT: &str = "/v1/connect/wallet/spendableBalance";
const PAY_ENDPOINT: &str = "/v1/connect/wallet/pay";

/// A single payout to a handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub destination: String,
    pub amount: u64,
    pub currency_code: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendableBalance {
    pub currency_code: String,
    pub spendable_amount: f64,
}

impl SpendableBalance {
    fn fallback() -> Self {
        SpendableBalance {
            currency_code: "USD".to_string(),
            spendable_amount: 100.0,
        }
    }
}

fn demo_profile() -> UserProfile {
    UserProfile {
        handcash_handle: "@DemoUser".to_string(),
        display_name: Some("Demo User".to_string()),
        profile_picture_url: Some("https://via.placeholder.com/100".to_string()),
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Where to send a browser to authorise the app.
    fn redirection_url(&self, params: &[(String, String)]) -> Result<String>;

    async fn user_profile(&self, auth_token: &str) -> Result<UserProfile>;

    async fn spendable_balance(&self, auth_token: &str) -> Result<SpendableBalance>;

    /// Pay from the wallet behind `auth_token`.
    async fn pay(&self, auth_token: &str, payment: &PaymentRequest) -> Result<PaymentReceipt>;
}

/// Build the provider selected by `handcash.mode`.
pub fn provider_from_config(config: &HandCashConfig) -> Result<Arc<dyn IdentityProvider>> {
    match config.mode {
        IdentityMode::Connect => Ok(Arc::new(HandCashConnect::new(config)?)),
        IdentityMode::Dev => {
            info!("using the development identity provider");
            Ok(Arc::new(DevIdentityProvider::new()))
        }
    }
}

// ============================================================================
// HandCash Connect
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    public_profile: PublicProfile,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicProfile {
    handle: String,
    display_name: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    spendable_fiat_balance: f64,
    currency_code: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayBody<'a> {
    description: Option<&'a str>,
    app_action: &'a str,
    receivers: Vec<PayReceiver<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayReceiver<'a> {
    destination: &'a str,
    currency_code: &'a str,
    send_amount: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    message: Option<String>,
}

/// Headers authenticating one request on behalf of a user.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedHeaders {
    pub public_key: String,
    pub timestamp: String,
    pub signature: String,
}

/// Sign `method\nendpoint\ntimestamp\nbody` with the key behind the auth token.
pub fn sign_request(
    auth_token: &str,
    method: &str,
    endpoint: &str,
    timestamp: &str,
    body: &str,
) -> Result<SignedHeaders> {
    let keypair = KeyPair::from_secret_hex(auth_token)
        .map_err(|_| StoreError::IdentityError("Invalid auth token".to_string()))?;
    let payload = format!("{}\n{}\n{}\n{}", method, endpoint, timestamp, body);
    Ok(SignedHeaders {
        public_key: keypair.public_key_hex(),
        timestamp: timestamp.to_string(),
        signature: hex::encode(keypair.sign(payload.as_bytes())),
    })
}

pub struct HandCashConnect {
    client: Client,
    app_id: String,
    app_secret: String,
    api_base: String,
    client_base: String,
    profiles: Mutex<LruCache<String, UserProfile>>,
}

impl HandCashConnect {
    pub fn new(config: &HandCashConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| StoreError::IdentityError(format!("Failed to build HTTP client: {}", e)))?;
        let capacity = NonZeroUsize::new(config.profile_cache_size.max(1))
            .ok_or_else(|| StoreError::ConfigError("profile cache size must be positive".into()))?;

        Ok(HandCashConnect {
            client,
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client_base: config.client_base.trim_end_matches('/').to_string(),
            profiles: Mutex::new(LruCache::new(capacity)),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        auth_token: &str,
        body: Option<String>,
    ) -> Result<T> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let body_text = body.unwrap_or_default();
        let signed = sign_request(auth_token, method.as_str(), endpoint, &timestamp, &body_text)?;

        let mut request = self
            .client
            .request(method, format!("{}{}", self.api_base, endpoint))
            .header("app-id", &self.app_id)
            .header("app-secret", &self.app_secret)
            .header("oauth-publickey", signed.public_key)
            .header("oauth-timestamp", signed.timestamp)
            .header("oauth-signature", signed.signature);
        if !body_text.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body_text);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                StoreError::IdentityError(format!("Cannot reach HandCash at {}", self.api_base))
            } else {
                StoreError::IdentityError(format!("HandCash request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_else(|| status.to_string());
            return Err(StoreError::IdentityError(message));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| StoreError::IdentityError(format!("Failed to parse HandCash response: {}", e)))
    }
}

#[async_trait]
impl IdentityProvider for HandCashConnect {
    fn redirection_url(&self, params: &[(String, String)]) -> Result<String> {
        let mut pairs = vec![("appId".to_string(), self.app_id.clone())];
        pairs.extend(params.iter().cloned());
        let url = Url::parse_with_params(&format!("{}/authorizeApp", self.client_base), &pairs)
            .map_err(|e| StoreError::IdentityError(format!("Invalid HandCash client URL: {}", e)))?;
        Ok(url.to_string())
    }

    async fn user_profile(&self, auth_token: &str) -> Result<UserProfile> {
        if let Some(profile) = self.profiles.lock().get(auth_token).cloned() {
            return Ok(profile);
        }

        let fetched = self
            .call::<ProfileResponse>(Method::GET, PROFILE_ENDPOINT, auth_token, None)
            .await;
        let profile = match fetched {
            Ok(response) => UserProfile {
                handcash_handle: response.public_profile.handle,
                display_name: response.public_profile.display_name,
                profile_picture_url: response.public_profile.avatar_url,
            },
            Err(e) if auth_token == MOCK_AUTH_TOKEN => {
                warn!(error = %e, "HandCash unavailable, using the demo profile");
                demo_profile()
            }
            Err(e) => return Err(e),
        };

        self.profiles
            .lock()
            .put(auth_token.to_string(), profile.clone());
        Ok(profile)
    }

    async fn spendable_balance(&self, auth_token: &str) -> Result<SpendableBalance> {
        let endpoint = format!("{}?currencyCode=USD", BALANCE_ENDPOINT);
        match self
            .call::<BalanceResponse>(Method::GET, &endpoint, auth_token, None)
            .await
        {
            Ok(balance) => Ok(SpendableBalance {
                currency_code: balance.currency_code,
                spendable_amount: balance.spendable_fiat_balance,
            }),
            Err(e) => {
                warn!(error = %e, "balance lookup failed, returning the fallback balance");
                Ok(SpendableBalance::fallback())
            }
        }
    }

    async fn pay(&self, auth_token: &str, payment: &PaymentRequest) -> Result<PaymentReceipt> {
        let body = serde_json::to_string(&PayBody {
            description: payment.description.as_deref(),
            app_action: "dividend",
            receivers: vec![PayReceiver {
                destination: &payment.destination,
                currency_code: &payment.currency_code,
                send_amount: payment.amount,
            }],
        })?;
        self.call::<PaymentReceipt>(Method::POST, PAY_ENDPOINT, auth_token, Some(body))
            .await
    }
}

// ============================================================================
// Development provider
// ============================================================================

/// Offline provider: `mock-token` is the demo user and `dev:<handle>` logs in
/// as that handle. Payouts succeed unless the destination is marked failing.
#[derive(Default)]
pub struct DevIdentityProvider {
    failing_destinations: Mutex<HashSet<String>>,
    payments: Mutex<Vec<PaymentRequest>>,
}

impl DevIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every payout to `destination` fail.
    pub fn fail_payments_to(&self, destination: &str) {
        self.failing_destinations
            .lock()
            .insert(destination.to_string());
    }

    /// Payouts that went through, oldest first.
    pub fn payments(&self) -> Vec<PaymentRequest> {
        self.payments.lock().clone()
    }
}

#[async_trait]
impl IdentityProvider for DevIdentityProvider {
    fn redirection_url(&self, params: &[(String, String)]) -> Result<String> {
        let mut pairs = vec![("authToken".to_string(), MOCK_AUTH_TOKEN.to_string())];
        pairs.extend(params.iter().cloned());
        let url = Url::parse_with_params("http://localhost/api/auth/handcash/callback", &pairs)
            .map_err(|e| StoreError::IdentityError(e.to_string()))?;
        // Relative so the callback lands on whichever host served the login.
        Ok(format!("{}?{}", url.path(), url.query().unwrap_or_default()))
    }

    async fn user_profile(&self, auth_token: &str) -> Result<UserProfile> {
        if auth_token == MOCK_AUTH_TOKEN {
            return Ok(demo_profile());
        }
        match auth_token.strip_prefix(DEV_TOKEN_PREFIX) {
            Some(handle) if !handle.trim().is_empty() => {
                let handle = handle.trim();
                let handle = if handle.starts_with('@') {
                    handle.to_string()
                } else {
                    format!("@{}", handle)
                };
                Ok(UserProfile {
                    display_name: Some(handle.trim_start_matches('@').to_string()),
                    handcash_handle: handle,
                    profile_picture_url: None,
                })
            }
            _ => Err(StoreError::IdentityError("Invalid auth token".to_string())),
        }
    }

    async fn spendable_balance(&self, _auth_token: &str) -> Result<SpendableBalance> {
        Ok(SpendableBalance::fallback())
    }

    async fn pay(&self, _auth_token: &str, payment: &PaymentRequest) -> Result<PaymentReceipt> {
        if self
            .failing_destinations
            .lock()
            .contains(&payment.destination)
        {
            return Err(StoreError::IdentityError(format!(
                "Payment to {} was declined",
                payment.destination
            )));
        }
        self.payments.lock().push(payment.clone());
        Ok(PaymentReceipt {
            transaction_id: format!("dev_{}", Uuid::new_v4().simple()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsv::verify_signature;

    fn connect_config() -> HandCashConfig {
        HandCashConfig {
            app_id: "app-123".to_string(),
            // Nothing listens here, so every API call fails fast.
            api_base: "http://127.0.0.1:9".to_string(),
            ..HandCashConfig::default()
        }
    }

    #[test]
    fn test_redirection_url_carries_app_id() {
        let provider = HandCashConnect::new(&connect_config()).unwrap();
        let url = provider
            .redirection_url(&[("next".to_string(), "/dashboard".to_string())])
            .unwrap();
        assert!(url.starts_with("https://app.handcash.io/authorizeApp?"));
        assert!(url.contains("appId=app-123"));
        assert!(url.contains("next=%2Fdashboard"));
    }

    #[test]
    fn test_signed_headers_verify() {
        let keypair = KeyPair::generate();
        let token = hex::encode(keypair.secret_key.secret_bytes());
        let signed = sign_request(&token, "GET", PROFILE_ENDPOINT, "2024-01-01T00:00:00.000Z", "")
            .unwrap();

        assert_eq!(signed.public_key, keypair.public_key_hex());
        let payload = format!("GET\n{}\n2024-01-01T00:00:00.000Z\n", PROFILE_ENDPOINT);
        let signature = hex::decode(&signed.signature).unwrap();
        verify_signature(&keypair.public_key.serialize(), payload.as_bytes(), &signature).unwrap();

        assert!(sign_request("mock-token", "GET", "/", "t", "").is_err());
    }

    #[tokio::test]
    async fn test_mock_token_falls_back_to_demo_profile() {
        let provider = HandCashConnect::new(&connect_config()).unwrap();
        let profile = provider.user_profile(MOCK_AUTH_TOKEN).await.unwrap();
        assert_eq!(profile.handcash_handle, "@DemoUser");
        assert!(provider.user_profile("not-a-key").await.is_err());
    }

    #[tokio::test]
    async fn test_balance_falls_back() {
        let provider = HandCashConnect::new(&connect_config()).unwrap();
        let balance = provider.spendable_balance(MOCK_AUTH_TOKEN).await.unwrap();
        assert_eq!(balance, SpendableBalance::fallback());
    }

    #[tokio::test]
    async fn test_dev_provider_profiles() {
        let provider = DevIdentityProvider::new();
        let alice = provider.user_profile("dev:alice").await.unwrap();
        assert_eq!(alice.handcash_handle, "@alice");
        let bob = provider.user_profile("dev:@bob").await.unwrap();
        assert_eq!(bob.handcash_handle, "@bob");
        assert_eq!(
            provider.user_profile(MOCK_AUTH_TOKEN).await.unwrap().handcash_handle,
            "@DemoUser"
        );
        assert!(provider.user_profile("dev:").await.is_err());
        assert!(provider.user_profile("garbage").await.is_err());
    }

    #[tokio::test]
    async fn test_dev_provider_payments() {
        let provider = DevIdentityProvider::new();
        provider.fail_payments_to("@mallory");

        let ok = PaymentRequest {
            destination: "@bob".to_string(),
            amount: 10,
            currency_code: "BSV".to_string(),
            description: None,
        };
        let receipt = provider.pay("dev:alice", &ok).await.unwrap();
        assert!(receipt.transaction_id.starts_with("dev_"));

        let declined = PaymentRequest {
            destination: "@mallory".to_string(),
            ..ok.clone()
        };
        assert!(provider.pay("dev:alice", &declined).await.is_err());
        assert_eq!(provider.payments(), vec![ok]);
    }

    #[test]
    fn test_dev_redirect_targets_callback() {
        let url = DevIdentityProvider::new().redirection_url(&[]).unwrap();
        assert_eq!(url, "/api/auth/handcash/callback?authToken=mock-token");
    }
}
