//! Showcase data for a fresh store.
//!
//! Each demo token gets its owner, a few holders above the dividend threshold,
//! one filled trade so market metrics have a price, and settled dividend history.
//! Demo users log in through the development provider with `dev:<handle>`.

use crate::divvy::plan_distribution;
use crate::error::Result;
use crate::handcash::DEV_TOKEN_PREFIX;
use crate::marketplace::{sell_terms, MINIMUM_TRANCHE};
use crate::models::{ChainTxStatus, ChainTxType, TokenType, UserProfile};
use crate::persistence::{Database, NewChainTransaction, NewSellOrder, NewToken};
use crate::tokens::{default_description, TOKEN_TOTAL_SUPPLY};
use tracing::info;

struct DemoToken {
    symbol: &'static str,
    handle: &'static str,
    display_name: &'static str,
    picture: &'static str,
    price: f64,
    /// Dividend payments in satoshis, oldest first.
    dividends: &'static [u64],
}

const DEMO_TOKENS: &[DemoToken] = &[
    DemoToken {
        symbol: "$NINJAPUNKGIRLS",
        handle: "@NinjaPunkGirls",
        display_name: "Ninja Punk Girls NFT",
        picture: "/images/ninjapunk.png",
        price: 0.00245,
        dividends: &[250_000, 400_000, 180_000],
    },
    DemoToken {
        symbol: "$PEPE",
        handle: "@PepeBSV",
        display_name: "Pepe BSV Community",
        picture: "/images/pepe.png",
        price: 0.00189,
        dividends: &[120_000, 95_000],
    },
    DemoToken {
        symbol: "$HANDCASH",
        handle: "@HandCashOfficial",
        display_name: "HandCash Inc.",
        picture: "/images/handcash.png",
        price: 0.00312,
        dividends: &[600_000, 750_000, 820_000, 910_000],
    },
    DemoToken {
        symbol: "$CRAIG",
        handle: "@DrCraigWright",
        display_name: "Dr. Craig S Wright",
        picture: "/images/craig.png",
        price: 0.00089,
        dividends: &[60_000],
    },
    DemoToken {
        symbol: "$BITCOIN",
        handle: "@BitcoinSV",
        display_name: "Bitcoin SV Node",
        picture: "/images/bitcoin.png",
        price: 0.00456,
        dividends: &[1_200_000, 1_450_000, 1_100_000],
    },
    DemoToken {
        symbol: "$TWETCH",
        handle: "@Twetch",
        display_name: "Twetch Inc.",
        picture: "/images/twetch.png",
        price: 0.00123,
        dividends: &[210_000, 140_000],
    },
    DemoToken {
        symbol: "$RARECANDY",
        handle: "@RareCandy",
        display_name: "Rare Candy",
        picture: "/images/rarecandy.png",
        price: 0.00278,
        dividends: &[330_000],
    },
    DemoToken {
        symbol: "$DURODOGS",
        handle: "@DuroDogs",
        display_name: "Duro Dogs",
        picture: "/images/durodogs.png",
        price: 0.00067,
        dividends: &[],
    },
];

/// Holders that receive a slice of every demo token.
const DEMO_HOLDERS: &[(&str, &str)] = &[
    ("@satoshi_fan", "Satoshi Fan"),
    ("@bsv_whale", "BSV Whale"),
    ("@micropay", "Micro Pay"),
];

/// Share of the supply given to each demo holder, in basis points.
const HOLDER_SHARES_BPS: &[u64] = &[1_500, 800, 300];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub tokens_created: usize,
    pub tokens_skipped: usize,
    pub payments_recorded: usize,
}

/// Seed every demo token whose handle is not taken yet.
pub fn seed_demo(db: &Database) -> Result<SeedReport> {
    let mut report = SeedReport::default();

    let mut holders = Vec::with_capacity(DEMO_HOLDERS.len());
    for (handle, name) in DEMO_HOLDERS {
        holders.push(db.upsert_user(&profile(handle, name, None), &dev_token(handle))?);
    }

    for (index, demo) in DEMO_TOKENS.iter().enumerate() {
        if db.find_token_by_handle(demo.handle)?.is_some() {
            report.tokens_skipped += 1;
            continue;
        }

        let owner = db.upsert_user(
            &profile(demo.handle, demo.display_name, Some(demo.picture)),
            &dev_token(demo.handle),
        )?;
        let token = db.create_token(
            &NewToken {
                symbol: demo.symbol.to_string(),
                handcash_handle: demo.handle.to_string(),
                owner_id: owner.id.clone(),
                description: Some(default_description(demo.handle)),
                total_supply: TOKEN_TOTAL_SUPPLY,
                token_type: TokenType::Standard,
                inscription_id: None,
            },
            None,
        )?;

        for (holder, bps) in holders.iter().zip(HOLDER_SHARES_BPS) {
            let amount = TOKEN_TOTAL_SUPPLY / 10_000 * bps;
            db.transfer_tokens(
                &owner.id,
                &token.id,
                &NewChainTransaction {
                    tx_id: format!("demo_{}_{}", token.id, holder.id),
                    inscription_id: None,
                    transaction_type: ChainTxType::Transfer,
                    from_address: owner.handcash_handle.clone(),
                    to_address: None,
                    to_user_id: Some(holder.id.clone()),
                    amount,
                    status: ChainTxStatus::Confirmed,
                },
            )?;
        }

        // One filled tranche gives the token a market price.
        let buyer = &holders[index % holders.len()];
        let terms = sell_terms(MINIMUM_TRANCHE, demo.price)?;
        let order = db.create_sell_order(&NewSellOrder {
            seller_id: owner.id.clone(),
            token_id: token.id.clone(),
            amount: terms.amount,
            price_per_token: terms.price_per_token,
            total_value: terms.total_value,
        })?;
        db.fill_sell_order(&order.id, &buyer.id)?;

        let stakes = db.token_stakes(&token.id)?;
        for (n, amount) in demo.dividends.iter().enumerate() {
            let plan = plan_distribution(token.total_supply, &stakes, *amount, MINIMUM_TRANCHE)?;
            let payment = db.record_dividend_payment(
                &token.id,
                &format!("demo_dividend_{}_{}", token.id, n),
                "BSV",
                &plan,
            )?;
            for distribution in db.claim_pending_distributions(&payment.id)? {
                db.mark_distribution_completed(
                    &distribution.id,
                    &format!("demo_payout_{}", distribution.id),
                )?;
            }
            report.payments_recorded += 1;
        }

        info!(symbol = demo.symbol, "demo token seeded");
        report.tokens_created += 1;
    }

    Ok(report)
}

fn profile(handle: &str, name: &str, picture: Option<&str>) -> UserProfile {
    UserProfile {
        handcash_handle: handle.to_string(),
        display_name: Some(name.to_string()),
        profile_picture_url: picture.map(str::to_string),
    }
}

fn dev_token(handle: &str) -> String {
    format!("{}{}", DEV_TOKEN_PREFIX, handle)
}
