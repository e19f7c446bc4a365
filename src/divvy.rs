//! Divvy: pro-rata dividend distribution to token holders.
//!
//! An incoming payment to a handle is split across holders of that handle's
//! token in proportion to their holdings. Holders below the tranche threshold
//! get nothing; whatever is not distributed stays with the handle owner.

use crate::config::DivvyConfig;
use crate::error::{Result, StoreError};
use crate::handcash::{IdentityProvider, PaymentRequest};
use crate::models::{
    DividendDistribution, DividendPayment, HolderStake, PaymentRecord, PendingDistribution,
    User,
};
use crate::persistence::{Database, DividendOverview};
use crate::tokens::{market_metrics, MarketMetrics, MAX_AMOUNT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Number of payments returned by the recent payments listing.
pub const RECENT_PAYMENTS_LIMIT: usize = 10;

/// Number of pending distributions returned for manual processing.
pub const PENDING_DISTRIBUTIONS_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivvySettings {
    pub min_holding: u64,
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl From<&DivvyConfig> for DivvySettings {
    fn from(config: &DivvyConfig) -> Self {
        DivvySettings {
            min_holding: config.min_holding,
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay,
        }
    }
}

/// The amount one holder is owed from a payment.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedShare {
    pub holder_id: String,
    pub holder_handle: String,
    pub holding_amount: u64,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistributionPlan {
    pub total: u64,
    pub distributed: u64,
    pub remaining: u64,
    pub shares: Vec<PlannedShare>,
}

/// Split `payment` across eligible holders.
///
/// Each share is `floor(holding * payment / total_supply)`, so the shares
/// never add up to more than the payment.
pub fn plan_distribution(
    total_supply: u64,
    stakes: &[HolderStake],
    payment: u64,
    min_holding: u64,
) -> Result<DistributionPlan> {
    if total_supply == 0 {
        return Err(StoreError::InvalidInput(
            "Token has no supply to distribute against".to_string(),
        ));
    }

    let shares: Vec<PlannedShare> = stakes
        .iter()
        .filter(|stake| stake.amount >= min_holding)
        .filter_map(|stake| {
            let amount =
                (stake.amount as u128 * payment as u128 / total_supply as u128) as u64;
            (amount > 0).then(|| PlannedShare {
                holder_id: stake.user_id.clone(),
                holder_handle: stake.handcash_handle.clone(),
                holding_amount: stake.amount,
                amount,
            })
        })
        .collect();

    let distributed: u64 = shares.iter().map(|share| share.amount).sum();
    if distributed > payment {
        return Err(StoreError::InvalidInput(
            "Holdings exceed the token supply".to_string(),
        ));
    }

    Ok(DistributionPlan {
        total: payment,
        distributed,
        remaining: payment - distributed,
        shares,
    })
}

/// A payment received by a handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingPayment {
    pub handcash_handle: String,
    pub amount: u64,
    pub currency: String,
    pub tx_id: String,
    #[serde(default)]
    pub from_handle: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPayment {
    pub payment: DividendPayment,
    pub eligible_holders: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReport {
    pub payment_id: String,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingOwner {
    pub display_name: String,
    pub profile_picture_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DivvyRanking {
    pub id: String,
    pub symbol: String,
    pub handcash_handle: String,
    #[serde(flatten)]
    pub metrics: MarketMetrics,
    pub holders: u64,
    pub total_dividends_paid: u64,
    pub dividend_payments: u64,
    pub owner: RankingOwner,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEarnings {
    pub token_id: String,
    pub token_symbol: String,
    pub holding_amount: u64,
    pub ownership_percentage: f64,
    pub total_dividends_paid: u64,
    pub estimated_earnings: f64,
    pub received_earnings: u64,
    pub pending_earnings: u64,
    pub dividend_payments: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningsReport {
    pub earnings: Vec<TokenEarnings>,
    pub total_earnings: f64,
    pub total_received: u64,
    pub total_tokens: usize,
}

pub struct DivvyService {
    db: Arc<Database>,
    identity: Arc<dyn IdentityProvider>,
    settings: DivvySettings,
}

impl DivvyService {
    pub fn new(
        db: Arc<Database>,
        identity: Arc<dyn IdentityProvider>,
        settings: DivvySettings,
    ) -> Self {
        DivvyService {
            db,
            identity,
            settings,
        }
    }

    pub fn settings(&self) -> DivvySettings {
        self.settings
    }

    /// Record a payment to a handle and plan its distributions against current holdings.
    pub fn record_payment(&self, incoming: &IncomingPayment) -> Result<RecordedPayment> {
        if incoming.handcash_handle.trim().is_empty()
            || incoming.amount == 0
            || incoming.currency.trim().is_empty()
            || incoming.tx_id.trim().is_empty()
        {
            return Err(StoreError::InvalidInput(
                "Missing required fields: handcashHandle, amount, currency, txId".to_string(),
            ));
        }
        if incoming.amount > MAX_AMOUNT {
            return Err(StoreError::InvalidInput(
                "Payment amount is too large".to_string(),
            ));
        }

        let token = self
            .db
            .find_token_by_handle(&incoming.handcash_handle)?
            .ok_or_else(|| {
                StoreError::NotFound("No token found for this HandCash handle".to_string())
            })?;
        if self.db.payment_recorded(&incoming.tx_id)? {
            return Err(StoreError::Conflict(format!(
                "Payment {} has already been recorded",
                incoming.tx_id
            )));
        }

        let stakes = self.db.token_stakes(&token.id)?;
        let plan = plan_distribution(
            token.total_supply,
            &stakes,
            incoming.amount,
            self.settings.min_holding,
        )?;
        let eligible_holders = plan.shares.len();
        let payment = self.db.record_dividend_payment(
            &token.id,
            &incoming.tx_id,
            &incoming.currency,
            &plan,
        )?;

        Ok(RecordedPayment {
            payment,
            eligible_holders,
        })
    }

    /// Distribute a payment on behalf of the owner of the paid token.
    pub async fn distribute_as_owner(
        &self,
        owner: &User,
        payment_id: &str,
    ) -> Result<DistributionReport> {
        let payment = self
            .db
            .get_dividend_payment(payment_id)?
            .ok_or_else(|| StoreError::NotFound("Dividend payment not found".to_string()))?;
        let token = self
            .db
            .get_token(&payment.token_id)?
            .ok_or_else(|| StoreError::NotFound("Token not found".to_string()))?;
        if token.owner_id != owner.id {
            return Err(StoreError::Forbidden(
                "Unauthorized to distribute this payment".to_string(),
            ));
        }
        self.distribute(payment_id, &owner.auth_token).await
    }

    /// Pay out every PENDING distribution of a payment, funded by `payer_auth_token`.
    ///
    /// Rows are claimed before any money moves, so concurrent runs for the same
    /// payment never pay a holder twice. Payouts inside a batch run
    /// concurrently. A failed payout marks its row FAILED and never stops the
    /// rest of the run.
    pub async fn distribute(
        &self,
        payment_id: &str,
        payer_auth_token: &str,
    ) -> Result<DistributionReport> {
        let payment = self
            .db
            .get_dividend_payment(payment_id)?
            .ok_or_else(|| StoreError::NotFound("Dividend payment not found".to_string()))?;
        let claimed = self.db.claim_pending_distributions(payment_id)?;

        let mut report = DistributionReport {
            payment_id: payment_id.to_string(),
            ..DistributionReport::default()
        };
        let batches: Vec<&[DividendDistribution]> =
            claimed.chunks(self.settings.batch_size).collect();

        for (index, batch) in batches.iter().enumerate() {
            let mut tasks = JoinSet::new();
            for distribution in batch.iter() {
                let identity = Arc::clone(&self.identity);
                let auth_token = payer_auth_token.to_string();
                let request = PaymentRequest {
                    destination: distribution.holder_handle.clone(),
                    amount: distribution.amount,
                    currency_code: payment.currency.clone(),
                    description: Some(format!("Divvy dividend for payment {}", payment.payment_tx_id)),
                };
                let distribution_id = distribution.id.clone();
                tasks.spawn(async move {
                    let outcome = identity.pay(&auth_token, &request).await;
                    (distribution_id, request.destination, outcome)
                });
            }

            let mut settled = HashSet::new();
            while let Some(joined) = tasks.join_next().await {
                let (distribution_id, destination, outcome) = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        error!(error = %e, "payout task aborted");
                        continue;
                    }
                };
                settled.insert(distribution_id.clone());
                report.processed += 1;

                match outcome {
                    Ok(receipt) => {
                        report.successful += 1;
                        if let Err(e) = self
                            .db
                            .mark_distribution_completed(&distribution_id, &receipt.transaction_id)
                        {
                            error!(
                                distribution = %distribution_id,
                                payout = %receipt.transaction_id,
                                error = %e,
                                "payout sent but not recorded"
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            distribution = %distribution_id,
                            destination = %destination,
                            error = %e,
                            "dividend payout failed"
                        );
                        report.failed += 1;
                        self.record_failure(&distribution_id, e.message());
                    }
                }
            }

            for distribution in batch.iter().filter(|d| !settled.contains(&d.id)) {
                report.processed += 1;
                report.failed += 1;
                self.record_failure(&distribution.id, "Payout task aborted");
            }

            if index + 1 < batches.len() && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
        }

        info!(
            payment = %payment_id,
            processed = report.processed,
            successful = report.successful,
            failed = report.failed,
            "batch distribution completed"
        );
        Ok(report)
    }

    fn record_failure(&self, distribution_id: &str, reason: &str) {
        if let Err(e) = self.db.mark_distribution_failed(distribution_id, reason) {
            error!(distribution = %distribution_id, error = %e, "failed to record payout failure");
        }
    }

    pub fn recent_payments(&self) -> Result<Vec<PaymentRecord>> {
        self.db.recent_payments(RECENT_PAYMENTS_LIMIT)
    }

    pub fn pending_distributions(&self) -> Result<Vec<PendingDistribution>> {
        self.db.pending_distributions(PENDING_DISTRIBUTIONS_LIMIT)
    }

    pub fn stats(&self) -> Result<DividendOverview> {
        self.db.dividend_overview()
    }

    /// Tokens ordered by the dividends they have paid out, most first.
    pub fn rankings(&self) -> Result<Vec<DivvyRanking>> {
        let mut rankings = Vec::new();
        for token in self.db.list_tokens()? {
            let owner = self.db.get_user(&token.owner_id)?;
            let (total_dividends_paid, dividend_payments) =
                self.db.token_dividend_totals(&token.id)?;

            rankings.push(DivvyRanking {
                metrics: market_metrics(&self.db, &token)?,
                holders: self.db.holder_count(&token.id)?,
                total_dividends_paid,
                dividend_payments,
                owner: RankingOwner {
                    display_name: owner
                        .as_ref()
                        .and_then(|o| o.display_name.clone())
                        .unwrap_or_else(|| "Anonymous".to_string()),
                    profile_picture_url: owner.and_then(|o| o.profile_picture_url),
                },
                id: token.id,
                symbol: token.symbol,
                handcash_handle: token.handcash_handle,
            });
        }

        rankings.sort_by(|a, b| b.total_dividends_paid.cmp(&a.total_dividends_paid));
        Ok(rankings)
    }

    /// What a user has earned, and can expect to earn, from each token held.
    pub fn earnings(&self, user: &User) -> Result<EarningsReport> {
        let mut earnings = Vec::new();
        for holding in self.db.user_holdings(&user.id)? {
            let Some(token) = self.db.get_token(&holding.token_id)? else {
                continue;
            };
            let (total_dividends_paid, dividend_payments) =
                self.db.token_dividend_totals(&token.id)?;
            let (received_earnings, pending_earnings) =
                self.db.holder_distribution_totals(&user.id, &token.id)?;
            let fraction = holding.amount as f64 / token.total_supply as f64;

            earnings.push(TokenEarnings {
                token_id: token.id,
                token_symbol: token.symbol,
                holding_amount: holding.amount,
                ownership_percentage: fraction * 100.0,
                total_dividends_paid,
                estimated_earnings: fraction * total_dividends_paid as f64,
                received_earnings,
                pending_earnings,
                dividend_payments,
            });
        }

        Ok(EarningsReport {
            total_earnings: earnings.iter().map(|e| e.estimated_earnings).sum(),
            total_received: earnings.iter().map(|e| e.received_earnings).sum(),
            total_tokens: earnings.len(),
            earnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stake(id: &str, amount: u64) -> HolderStake {
        HolderStake {
            user_id: id.to_string(),
            handcash_handle: format!("@{}", id),
            amount,
        }
    }

    #[test]
    fn test_shares_are_pro_rata() {
        let stakes = vec![stake("a", 600_000_000), stake("b", 400_000_000)];
        let plan = plan_distribution(1_000_000_000, &stakes, 10_000, 200_000).unwrap();
        assert_eq!(plan.shares.len(), 2);
        assert_eq!(plan.shares[0].amount, 6_000);
        assert_eq!(plan.shares[1].amount, 4_000);
        assert_eq!(plan.distributed, 10_000);
        assert_eq!(plan.remaining, 0);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let stakes = vec![
            stake("owner", 999_600_001),
            stake("exact", 200_000),
            stake("below", 199_999),
        ];
        let plan = plan_distribution(1_000_000_000, &stakes, 1_000_000_000, 200_000).unwrap();
        let holders: Vec<&str> = plan.shares.iter().map(|s| s.holder_id.as_str()).collect();
        assert_eq!(holders, vec!["owner", "exact"]);
        assert_eq!(plan.remaining, 199_999);
    }

    #[test]
    fn test_rounding_never_overpays() {
        let stakes = vec![
            stake("a", 333_333_333),
            stake("b", 333_333_333),
            stake("c", 333_333_334),
        ];
        for payment in [1u64, 2, 7, 99, 1_000, 123_456_789, u64::MAX] {
            let plan = plan_distribution(1_000_000_000, &stakes, payment, 200_000).unwrap();
            assert!(plan.distributed <= payment);
            assert_eq!(plan.distributed + plan.remaining, payment);
            assert_eq!(
                plan.shares.iter().map(|s| s.amount).sum::<u64>(),
                plan.distributed
            );
        }
    }

    #[test]
    fn test_zero_shares_produce_no_rows() {
        let stakes = vec![stake("a", 300_000)];
        let plan = plan_distribution(1_000_000_000, &stakes, 100, 200_000).unwrap();
        assert!(plan.shares.is_empty());
        assert_eq!(plan.remaining, 100);
    }

    #[test]
    fn test_zero_supply_is_rejected() {
        assert!(plan_distribution(0, &[], 100, 200_000).is_err());
    }

    #[test]
    fn test_incoming_payment_json() {
        let payment: IncomingPayment = serde_json::from_str(
            r#"{"handcashHandle":"@alice","amount":5000,"currency":"BSV","txId":"abc"}"#,
        )
        .unwrap();
        assert_eq!(payment.amount, 5000);
        assert!(payment.timestamp.is_none());
        assert!(payment.from_handle.is_none());
    }
}
