//! Domain records stored by the token store.
//!
//! Token amounts are whole token units. Cash amounts are integers in the payment
//! currency's minor unit (satoshis for BSV).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Declares a string-backed status enum with SQL text conversions.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: StoreError| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::DatabaseError(format!(
                        "Unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum!(
    /// How a token exists outside the database.
    TokenType {
        Standard => "STANDARD",
        Ordinal => "ORDINAL",
    }
);

text_enum!(OrderStatus {
    Active => "ACTIVE",
    Filled => "FILLED",
    Cancelled => "CANCELLED",
});

text_enum!(DistributionStatus {
    Pending => "PENDING",
    // Claimed by a distribution run with its payout in flight.
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

text_enum!(ChainTxType {
    Mint => "MINT",
    Transfer => "TRANSFER",
});

text_enum!(ChainTxStatus {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
    Failed => "FAILED",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub handcash_handle: String,
    /// Identity-provider token used to act on the user's behalf.
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub display_name: Option<String>,
    pub profile_picture_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public profile returned by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub handcash_handle: String,
    pub display_name: Option<String>,
    pub profile_picture_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: String,
    pub symbol: String,
    pub handcash_handle: String,
    pub owner_id: String,
    pub description: Option<String>,
    pub total_supply: u64,
    pub token_type: TokenType,
    pub inscription_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenHolding {
    pub id: String,
    pub user_id: String,
    pub token_id: String,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A holding joined with the holder's handle, as used for dividend planning.
#[derive(Debug, Clone, PartialEq)]
pub struct HolderStake {
    pub user_id: String,
    pub handcash_handle: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SellOrder {
    pub id: String,
    pub seller_id: String,
    pub token_id: String,
    pub amount: u64,
    pub price_per_token: f64,
    pub total_value: u64,
    pub status: OrderStatus,
    pub buyer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyOrder {
    pub id: String,
    pub buyer_id: String,
    pub token_id: String,
    pub sell_order_id: Option<String>,
    pub amount: u64,
    pub price_per_token: f64,
    pub total_value: u64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DividendPayment {
    pub id: String,
    pub token_id: String,
    pub payment_tx_id: String,
    pub currency: String,
    pub total_amount: u64,
    pub distributed_amount: u64,
    pub remaining_amount: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DividendDistribution {
    pub id: String,
    pub payment_id: String,
    pub holder_id: String,
    pub holder_handle: String,
    pub holding_amount: u64,
    pub amount: u64,
    pub status: DistributionStatus,
    pub tx_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTransaction {
    pub id: String,
    pub tx_id: String,
    pub token_id: String,
    pub inscription_id: Option<String>,
    pub transaction_type: ChainTxType,
    pub from_address: String,
    pub to_address: Option<String>,
    pub to_user_id: Option<String>,
    pub amount: u64,
    pub status: ChainTxStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Owner fields exposed next to a token.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSummary {
    pub handcash_handle: String,
    pub display_name: Option<String>,
    pub profile_picture_url: Option<String>,
}

/// Seller fields exposed on a marketplace listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SellerSummary {
    pub handcash_handle: String,
    pub display_name: Option<String>,
}

/// Token fields exposed on a marketplace listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRef {
    pub symbol: String,
    pub handcash_handle: String,
}

/// An order together with the seller and token it refers to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SellOrderListing {
    #[serde(flatten)]
    pub order: SellOrder,
    pub seller: SellerSummary,
    pub token: TokenRef,
}

/// A dividend payment with its token and every distribution row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    #[serde(flatten)]
    pub payment: DividendPayment,
    pub token: Token,
    pub distributions: Vec<DividendDistribution>,
}

/// A pending distribution with the payment and token it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDistribution {
    #[serde(flatten)]
    pub distribution: DividendDistribution,
    pub payment: DividendPayment,
    pub token: Token,
}
