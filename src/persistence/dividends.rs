//! Dividend payments and their per-holder distributions.

use super::{get_amount, get_time, new_id, now_millis, token_from_row, Database};
use crate::divvy::DistributionPlan;
use crate::error::{Result, StoreError};
use crate::models::{
    DistributionStatus, DividendDistribution, DividendPayment, PaymentRecord,
    PendingDistribution, Token,
};
use crate::tokens::MAX_AMOUNT;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::info;

/// Store-wide Divvy figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DividendOverview {
    pub total_dividends_paid: u64,
    pub active_tokens: u64,
    pub pending_distributions: u64,
    pub total_holders: u64,
}

impl Database {
    /// Write a payment and one PENDING distribution per planned share.
    pub fn record_dividend_payment(
        &self,
        token_id: &str,
        payment_tx_id: &str,
        currency: &str,
        plan: &DistributionPlan,
    ) -> Result<DividendPayment> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        // Keeps every SUM over payments and distributions inside i64.
        let recorded: i64 = tx.query_row(
            "SELECT COALESCE(SUM(total_amount), 0) FROM dividend_payments",
            [],
            |row| row.get(0),
        )?;
        if (recorded as u64)
            .checked_add(plan.total)
            .map_or(true, |total| total > MAX_AMOUNT)
        {
            return Err(StoreError::InvalidInput(
                "Payment amount is too large".to_string(),
            ));
        }

        let now = now_millis();
        let payment_id = new_id();

        tx.execute(
            "INSERT INTO dividend_payments (id, token_id, payment_tx_id, currency, total_amount, distributed_amount, remaining_amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                payment_id,
                token_id,
                payment_tx_id,
                currency,
                plan.total as i64,
                plan.distributed as i64,
                plan.remaining as i64,
                now,
            ],
        )
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => {
                StoreError::Conflict(format!("Payment {} has already been recorded", payment_tx_id))
            }
            other => other,
        })?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO dividend_distributions (id, payment_id, holder_id, holder_handle, holding_amount, amount, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            )?;
            for share in &plan.shares {
                stmt.execute(params![
                    new_id(),
                    payment_id,
                    share.holder_id,
                    share.holder_handle,
                    share.holding_amount as i64,
                    share.amount as i64,
                    DistributionStatus::Pending,
                    now,
                ])?;
            }
        }

        let payment = load_payment(&tx, &payment_id)?
            .ok_or_else(|| StoreError::DatabaseError("payment vanished after insert".into()))?;
        tx.commit()?;

        info!(
            payment = %payment.id,
            tx_id = %payment_tx_id,
            total = plan.total,
            distributed = plan.distributed,
            holders = plan.shares.len(),
            "dividend payment recorded"
        );
        Ok(payment)
    }

    /// Whether an incoming payment transaction id has been recorded before.
    pub fn payment_recorded(&self, payment_tx_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM dividend_payments WHERE payment_tx_id = ?1",
                params![payment_tx_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_dividend_payment(&self, payment_id: &str) -> Result<Option<DividendPayment>> {
        let conn = self.conn.lock();
        load_payment(&conn, payment_id)
    }

    pub fn distributions_for_payment(
        &self,
        payment_id: &str,
        status: Option<DistributionStatus>,
    ) -> Result<Vec<DividendDistribution>> {
        let conn = self.conn.lock();
        load_distributions(&conn, payment_id, status)
    }

    /// Move every PENDING distribution of a payment to PROCESSING and return
    /// the rows this call claimed. A row is claimed by at most one caller.
    pub fn claim_pending_distributions(&self, payment_id: &str) -> Result<Vec<DividendDistribution>> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let pending = load_distributions(&tx, payment_id, Some(DistributionStatus::Pending))?;

        let mut claimed = Vec::with_capacity(pending.len());
        {
            let mut stmt = tx.prepare(
                "UPDATE dividend_distributions SET status = ?2, updated_at = ?3
                 WHERE id = ?1 AND status = ?4",
            )?;
            let now = now_millis();
            for mut distribution in pending {
                let changed = stmt.execute(params![
                    distribution.id,
                    DistributionStatus::Processing,
                    now,
                    DistributionStatus::Pending,
                ])?;
                if changed == 1 {
                    distribution.status = DistributionStatus::Processing;
                    claimed.push(distribution);
                }
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    pub fn mark_distribution_completed(&self, distribution_id: &str, tx_id: &str) -> Result<()> {
        self.set_distribution_outcome(distribution_id, DistributionStatus::Completed, Some(tx_id), None)
    }

    pub fn mark_distribution_failed(&self, distribution_id: &str, reason: &str) -> Result<()> {
        self.set_distribution_outcome(distribution_id, DistributionStatus::Failed, None, Some(reason))
    }

    fn set_distribution_outcome(
        &self,
        distribution_id: &str,
        status: DistributionStatus,
        tx_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE dividend_distributions SET status = ?2, tx_id = ?3, failure_reason = ?4, updated_at = ?5
             WHERE id = ?1 AND status = ?6",
            params![
                distribution_id,
                status,
                tx_id,
                reason,
                now_millis(),
                DistributionStatus::Processing,
            ],
        )?;
        if changed != 1 {
            return Err(StoreError::Conflict(format!(
                "Distribution {} is not being processed",
                distribution_id
            )));
        }
        Ok(())
    }

    /// Oldest PENDING distributions with the payment and token they belong to.
    pub fn pending_distributions(&self, limit: usize) -> Result<Vec<PendingDistribution>> {
        let conn = self.conn.lock();
        let distributions = {
            let mut stmt = conn.prepare(
                "SELECT * FROM dividend_distributions WHERE status = ?1
                 ORDER BY created_at ASC, rowid ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![DistributionStatus::Pending, limit as i64],
                distribution_from_row,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        distributions
            .into_iter()
            .map(|distribution| -> Result<PendingDistribution> {
                let payment = load_payment(&conn, &distribution.payment_id)?.ok_or_else(|| {
                    StoreError::DatabaseError("distribution without payment".into())
                })?;
                let token = load_token(&conn, &payment.token_id)?;
                Ok(PendingDistribution {
                    distribution,
                    payment,
                    token,
                })
            })
            .collect()
    }

    pub fn pending_distribution_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dividend_distributions WHERE status = ?1",
            params![DistributionStatus::Pending],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Newest payments with their token and every distribution row.
    pub fn recent_payments(&self, limit: usize) -> Result<Vec<PaymentRecord>> {
        let conn = self.conn.lock();
        let payments = {
            let mut stmt = conn.prepare(
                "SELECT * FROM dividend_payments ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], payment_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        payments
            .into_iter()
            .map(|payment| -> Result<PaymentRecord> {
                let token = load_token(&conn, &payment.token_id)?;
                let distributions = load_distributions(&conn, &payment.id, None)?;
                Ok(PaymentRecord {
                    payment,
                    token,
                    distributions,
                })
            })
            .collect()
    }

    pub fn dividend_overview(&self) -> Result<DividendOverview> {
        let conn = self.conn.lock();
        let (total, active): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(total_amount), 0), COUNT(DISTINCT token_id) FROM dividend_payments",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dividend_distributions WHERE status = ?1",
            params![DistributionStatus::Pending],
            |row| row.get(0),
        )?;
        let holders: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT user_id) FROM token_holdings WHERE amount > 0",
            [],
            |row| row.get(0),
        )?;

        Ok(DividendOverview {
            total_dividends_paid: total as u64,
            active_tokens: active as u64,
            pending_distributions: pending as u64,
            total_holders: holders as u64,
        })
    }

    /// Total paid into a token and the number of payments.
    pub fn token_dividend_totals(&self, token_id: &str) -> Result<(u64, u64)> {
        let conn = self.conn.lock();
        let (total, count): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(total_amount), 0), COUNT(*) FROM dividend_payments WHERE token_id = ?1",
            params![token_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((total as u64, count as u64))
    }

    /// Amounts distributed to a holder for one token: (completed, pending).
    /// Payouts in flight count as pending.
    pub fn holder_distribution_totals(&self, holder_id: &str, token_id: &str) -> Result<(u64, u64)> {
        let conn = self.conn.lock();
        let (received, pending): (i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN d.status = ?3 THEN d.amount ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN d.status IN (?4, ?5) THEN d.amount ELSE 0 END), 0)
             FROM dividend_distributions d
             JOIN dividend_payments p ON p.id = d.payment_id
             WHERE d.holder_id = ?1 AND p.token_id = ?2",
            params![
                holder_id,
                token_id,
                DistributionStatus::Completed,
                DistributionStatus::Pending,
                DistributionStatus::Processing,
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((received as u64, pending as u64))
    }
}

fn load_payment(conn: &Connection, payment_id: &str) -> Result<Option<DividendPayment>> {
    conn.query_row(
        "SELECT * FROM dividend_payments WHERE id = ?1",
        params![payment_id],
        payment_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn load_token(conn: &Connection, token_id: &str) -> Result<Token> {
    conn.query_row(
        "SELECT * FROM tokens WHERE id = ?1",
        params![token_id],
        token_from_row,
    )
    .map_err(StoreError::from)
}

fn load_distributions(
    conn: &Connection,
    payment_id: &str,
    status: Option<DistributionStatus>,
) -> Result<Vec<DividendDistribution>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM dividend_distributions
         WHERE payment_id = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY holding_amount DESC, rowid ASC",
    )?;
    let rows = stmt.query_map(params![payment_id, status], distribution_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}

fn payment_from_row(row: &Row) -> rusqlite::Result<DividendPayment> {
    Ok(DividendPayment {
        id: row.get("id")?,
        token_id: row.get("token_id")?,
        payment_tx_id: row.get("payment_tx_id")?,
        currency: row.get("currency")?,
        total_amount: get_amount(row, "total_amount")?,
        distributed_amount: get_amount(row, "distributed_amount")?,
        remaining_amount: get_amount(row, "remaining_amount")?,
        created_at: get_time(row, "created_at")?,
    })
}

fn distribution_from_row(row: &Row) -> rusqlite::Result<DividendDistribution> {
    Ok(DividendDistribution {
        id: row.get("id")?,
        payment_id: row.get("payment_id")?,
        holder_id: row.get("holder_id")?,
        holder_handle: row.get("holder_handle")?,
        holding_amount: get_amount(row, "holding_amount")?,
        amount: get_amount(row, "amount")?,
        status: row.get("status")?,
        tx_id: row.get("tx_id")?,
        failure_reason: row.get("failure_reason")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}
