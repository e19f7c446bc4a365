//! Direct token transfers and the chain transaction log.

use super::{
    available_balance, credit_holding, debit_holding, get_amount, get_opt_time, get_time, new_id,
    now_millis, Database,
};
use crate::error::{Result, StoreError};
use crate::models::{ChainTransaction, ChainTxStatus, ChainTxType};
use rusqlite::{params, Connection, Row};
use tracing::info;

#[derive(Debug, Clone)]
pub struct NewChainTransaction {
    pub tx_id: String,
    pub inscription_id: Option<String>,
    pub transaction_type: ChainTxType,
    pub from_address: String,
    pub to_address: Option<String>,
    pub to_user_id: Option<String>,
    pub amount: u64,
    pub status: ChainTxStatus,
}

impl Database {
    /// Move tokens from a sender to a recipient and log the transfer.
    ///
    /// The recipient holding is only credited when the recipient is a known
    /// user; transfers to a bare address just leave the sender's balance.
    pub fn transfer_tokens(
        &self,
        sender_id: &str,
        token_id: &str,
        record: &NewChainTransaction,
    ) -> Result<ChainTransaction> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        if available_balance(&tx, sender_id, token_id)? < record.amount {
            return Err(StoreError::InsufficientBalance(
                "Insufficient token balance".to_string(),
            ));
        }
        debit_holding(
            &tx,
            sender_id,
            token_id,
            record.amount,
            "Insufficient token balance",
        )?;
        if let Some(recipient) = &record.to_user_id {
            credit_holding(&tx, recipient, token_id, record.amount)?;
        }

        let id = insert_chain_transaction(&tx, token_id, record)?;
        let logged = tx.query_row(
            "SELECT * FROM chain_transactions WHERE id = ?1",
            params![id],
            chain_tx_from_row,
        )?;

        tx.commit()?;
        info!(
            token = %token_id,
            from = %sender_id,
            to = ?record.to_user_id,
            amount = record.amount,
            tx_id = %record.tx_id,
            "tokens transferred"
        );
        Ok(logged)
    }

    /// Chain transactions of a token, newest first.
    pub fn chain_transactions_for_token(&self, token_id: &str) -> Result<Vec<ChainTransaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM chain_transactions WHERE token_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![token_id], chain_tx_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)
    }
}

pub(super) fn insert_chain_transaction(
    conn: &Connection,
    token_id: &str,
    record: &NewChainTransaction,
) -> Result<String> {
    let id = new_id();
    let now = now_millis();
    let confirmed_at = (record.status == ChainTxStatus::Confirmed).then_some(now);
    conn.execute(
        "INSERT INTO chain_transactions
            (id, tx_id, token_id, inscription_id, transaction_type, from_address, to_address, to_user_id, amount, status, created_at, confirmed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            id,
            record.tx_id,
            token_id,
            record.inscription_id,
            record.transaction_type,
            record.from_address,
            record.to_address,
            record.to_user_id,
            record.amount as i64,
            record.status,
            now,
            confirmed_at,
        ],
    )?;
    Ok(id)
}

fn chain_tx_from_row(row: &Row) -> rusqlite::Result<ChainTransaction> {
    Ok(ChainTransaction {
        id: row.get("id")?,
        tx_id: row.get("tx_id")?,
        token_id: row.get("token_id")?,
        inscription_id: row.get("inscription_id")?,
        transaction_type: row.get("transaction_type")?,
        from_address: row.get("from_address")?,
        to_address: row.get("to_address")?,
        to_user_id: row.get("to_user_id")?,
        amount: get_amount(row, "amount")?,
        status: row.get("status")?,
        created_at: get_time(row, "created_at")?,
        confirmed_at: get_opt_time(row, "confirmed_at")?,
    })
}
