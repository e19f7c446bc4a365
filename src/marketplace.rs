//! Marketplace rules for listing token tranches.

use crate::error::{Result, StoreError};
use crate::tokens::{MAX_AMOUNT, TOKEN_TOTAL_SUPPLY};

/// Smallest amount that can be listed, and the smallest holding that earns dividends.
pub const MINIMUM_TRANCHE: u64 = TOKEN_TOTAL_SUPPLY / 5_000;

/// Validated sell order terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SellTerms {
    pub amount: u64,
    pub price_per_token: f64,
    pub total_value: u64,
}

/// Check amount and price of a new listing and compute its total value.
pub fn sell_terms(amount: u64, price_per_token: f64) -> Result<SellTerms> {
    if amount < MINIMUM_TRANCHE {
        return Err(StoreError::InvalidInput(format!(
            "Minimum sell amount is {} tokens",
            group_thousands(MINIMUM_TRANCHE)
        )));
    }
    if amount > MAX_AMOUNT {
        return Err(StoreError::InvalidInput(
            "Sell amount is too large".to_string(),
        ));
    }
    if !price_per_token.is_finite() || price_per_token <= 0.0 {
        return Err(StoreError::InvalidInput(
            "Price per token must be a positive number".to_string(),
        ));
    }

    // MAX_AMOUNT rounds up to 2^63 as f64, which no longer fits.
    let total = (amount as f64 * price_per_token).round();
    if total >= MAX_AMOUNT as f64 {
        return Err(StoreError::InvalidInput(
            "Order value is too large".to_string(),
        ));
    }

    Ok(SellTerms {
        amount,
        price_per_token,
        total_value: total as u64,
    })
}

/// `200000` becomes `200,000`.
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
