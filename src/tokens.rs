//! Handle token rules: symbol derivation, the fixed supply and market metrics.

use crate::error::{Result, StoreError};
use crate::persistence::{Database, TradeSnapshot};
use crate::models::Token;
use chrono::{Duration, Utc};
use serde::Serialize;

/// Every handle token is minted with exactly this many units.
pub const TOKEN_TOTAL_SUPPLY: u64 = 1_000_000_000;

/// Price (minor units per token) of a token that has never traded.
pub const DEFAULT_TOKEN_PRICE: f64 = 0.000001;

/// Trailing window used for volume and price change.
pub const MARKET_WINDOW_HOURS: i64 = 24;

/// Largest amount or value the store accepts. Amounts live in SQLite INTEGER columns.
pub const MAX_AMOUNT: u64 = i64::MAX as u64;

/// `@Alice` becomes `$Alice`; a handle without the `@` is used as is.
pub fn symbol_for_handle(handle: &str) -> Result<String> {
    let trimmed = handle.trim();
    let bare = trimmed.strip_prefix('@').unwrap_or(trimmed);
    if bare.is_empty() {
        return Err(StoreError::InvalidInput(
            "HandCash handle is required".to_string(),
        ));
    }
    Ok(format!("${}", bare))
}

pub fn default_description(handle: &str) -> String {
    format!("Token representing {} HandCash handle", handle)
}

/// Price, capitalisation and trailing activity of a token.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketMetrics {
    pub price: f64,
    pub market_cap: f64,
    pub volume_24h: u64,
    pub change_24h: f64,
}

impl MarketMetrics {
    pub fn from_snapshot(total_supply: u64, snapshot: &TradeSnapshot) -> Self {
        let price = snapshot.last_price.unwrap_or(DEFAULT_TOKEN_PRICE);
        let reference = snapshot.reference_price.unwrap_or(DEFAULT_TOKEN_PRICE);
        let change_24h = if reference > 0.0 {
            (price - reference) / reference * 100.0
        } else {
            0.0
        };

        MarketMetrics {
            price,
            market_cap: total_supply as f64 * price,
            volume_24h: snapshot.volume,
            change_24h,
        }
    }

    /// Metrics of a token that has never traded.
    pub fn untraded(total_supply: u64) -> Self {
        Self::from_snapshot(total_supply, &TradeSnapshot::default())
    }
}

/// Load the trade history of a token and derive its metrics.
pub fn market_metrics(db: &Database, token: &Token) -> Result<MarketMetrics> {
    let since = Utc::now() - Duration::hours(MARKET_WINDOW_HOURS);
    let snapshot = db.trade_snapshot(&token.id, since)?;
    Ok(MarketMetrics::from_snapshot(token.total_supply, &snapshot))
}

/// Parse a token amount given either as a JSON number or a decimal string.
pub fn parse_amount(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}
