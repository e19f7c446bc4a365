//! Sell orders, fills and trade history.

use super::{
    available_balance, credit_holding, debit_holding, get_amount, get_opt_time, get_time, new_id,
    now_millis, Database,
};
use crate::error::{Result, StoreError};
use crate::models::{
    BuyOrder, OrderStatus, SellOrder, SellOrderListing, SellerSummary, TokenRef,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

const LISTING_SELECT: &str = "
    SELECT o.*, u.handcash_handle AS seller_handle, u.display_name AS seller_display_name,
           t.symbol AS token_symbol, t.handcash_handle AS token_handle
    FROM sell_orders o
    JOIN users u ON u.id = o.seller_id
    JOIN tokens t ON t.id = o.token_id";

#[derive(Debug, Clone)]
pub struct NewSellOrder {
    pub seller_id: String,
    pub token_id: String,
    pub amount: u64,
    pub price_per_token: f64,
    pub total_value: u64,
}

/// Result of a completed purchase.
#[derive(Debug, Clone)]
pub struct FillReceipt {
    pub order: SellOrder,
    pub buy_order: BuyOrder,
}

/// Filled trades of one token, summarised for market metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeSnapshot {
    /// Price of the most recent trade.
    pub last_price: Option<f64>,
    /// Price of the most recent trade at or before the window start.
    pub reference_price: Option<f64>,
    /// Sum of trade values inside the window.
    pub volume: u64,
    /// Number of trades inside the window.
    pub trades: u64,
}

impl Database {
    /// Insert an ACTIVE sell order once the seller's uncommitted balance covers it.
    pub fn create_sell_order(&self, new: &NewSellOrder) -> Result<SellOrder> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        if available_balance(&tx, &new.seller_id, &new.token_id)? < new.amount {
            return Err(StoreError::InsufficientBalance(
                "Insufficient token balance".to_string(),
            ));
        }

        let id = new_id();
        tx.execute(
            "INSERT INTO sell_orders (id, seller_id, token_id, amount, price_per_token, total_value, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                new.seller_id,
                new.token_id,
                new.amount as i64,
                new.price_per_token,
                new.total_value as i64,
                OrderStatus::Active,
                now_millis(),
            ],
        )?;
        let order = load_sell_order(&tx, &id)?
            .ok_or_else(|| StoreError::DatabaseError("sell order vanished after insert".into()))?;

        tx.commit()?;
        info!(order = %order.id, seller = %order.seller_id, amount = order.amount, "sell order listed");
        Ok(order)
    }

    /// ACTIVE orders, newest first, with seller and token details.
    pub fn list_active_listings(&self) -> Result<Vec<SellOrderListing>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE o.status = ?1 ORDER BY o.created_at DESC, o.rowid DESC",
            LISTING_SELECT
        ))?;
        let rows = stmt.query_map(params![OrderStatus::Active], listing_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)
    }

    pub fn get_sell_order(&self, order_id: &str) -> Result<Option<SellOrder>> {
        let conn = self.conn.lock();
        load_sell_order(&conn, order_id)
    }

    pub fn get_listing(&self, order_id: &str) -> Result<Option<SellOrderListing>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{} WHERE o.id = ?1", LISTING_SELECT),
            params![order_id],
            listing_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Buy a whole sell order. Either every row changes or none does.
    pub fn fill_sell_order(&self, order_id: &str, buyer_id: &str) -> Result<FillReceipt> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let order = load_sell_order(&tx, order_id)?
            .ok_or_else(|| StoreError::NotFound("Sell order not found".to_string()))?;
        if order.status != OrderStatus::Active {
            return Err(StoreError::InvalidInput(
                "Sell order is no longer active".to_string(),
            ));
        }
        if order.seller_id == buyer_id {
            return Err(StoreError::InvalidInput(
                "Cannot buy your own tokens".to_string(),
            ));
        }

        let filled_at = now_millis();
        let changed = tx.execute(
            "UPDATE sell_orders SET status = ?2, buyer_id = ?3, filled_at = ?4
             WHERE id = ?1 AND status = ?5",
            params![order_id, OrderStatus::Filled, buyer_id, filled_at, OrderStatus::Active],
        )?;
        if changed != 1 {
            return Err(StoreError::InvalidInput(
                "Sell order is no longer active".to_string(),
            ));
        }

        debit_holding(
            &tx,
            &order.seller_id,
            &order.token_id,
            order.amount,
            "Seller has insufficient tokens",
        )
        .map_err(|e| match e {
            StoreError::InsufficientBalance(msg) => StoreError::Conflict(msg),
            other => other,
        })?;
        credit_holding(&tx, buyer_id, &order.token_id, order.amount)?;

        let buy_id = new_id();
        tx.execute(
            "INSERT INTO buy_orders (id, buyer_id, token_id, sell_order_id, amount, price_per_token, total_value, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                buy_id,
                buyer_id,
                order.token_id,
                order.id,
                order.amount as i64,
                order.price_per_token,
                order.total_value as i64,
                OrderStatus::Filled,
                filled_at,
            ],
        )?;

        let order = load_sell_order(&tx, order_id)?
            .ok_or_else(|| StoreError::NotFound("Sell order not found".to_string()))?;
        let buy_order = tx.query_row(
            "SELECT * FROM buy_orders WHERE id = ?1",
            params![buy_id],
            buy_order_from_row,
        )?;

        tx.commit()?;
        info!(
            order = %order.id,
            buyer = %buyer_id,
            amount = order.amount,
            value = order.total_value,
            "sell order filled"
        );
        Ok(FillReceipt { order, buy_order })
    }

    /// Withdraw an ACTIVE order. Only its seller may cancel it.
    pub fn cancel_sell_order(&self, order_id: &str, seller_id: &str) -> Result<SellOrder> {
        let conn = self.conn.lock();
        let order = load_sell_order(&conn, order_id)?
            .ok_or_else(|| StoreError::NotFound("Sell order not found".to_string()))?;
        if order.seller_id != seller_id {
            return Err(StoreError::Forbidden(
                "Unauthorized to cancel this order".to_string(),
            ));
        }

        let changed = conn.execute(
            "UPDATE sell_orders SET status = ?2 WHERE id = ?1 AND status = ?3",
            params![order_id, OrderStatus::Cancelled, OrderStatus::Active],
        )?;
        if changed != 1 {
            return Err(StoreError::InvalidInput(
                "Sell order is no longer active".to_string(),
            ));
        }

        info!(order = %order_id, "sell order cancelled");
        load_sell_order(&conn, order_id)?
            .ok_or_else(|| StoreError::NotFound("Sell order not found".to_string()))
    }

    /// Summarise filled trades of a token relative to a window start.
    pub fn trade_snapshot(&self, token_id: &str, since: DateTime<Utc>) -> Result<TradeSnapshot> {
        let since = since.timestamp_millis();
        let conn = self.conn.lock();

        let last_price: Option<f64> = conn
            .query_row(
                "SELECT price_per_token FROM sell_orders
                 WHERE token_id = ?1 AND status = ?2
                 ORDER BY filled_at DESC, rowid DESC LIMIT 1",
                params![token_id, OrderStatus::Filled],
                |row| row.get(0),
            )
            .optional()?;

        let reference_price: Option<f64> = conn
            .query_row(
                "SELECT price_per_token FROM sell_orders
                 WHERE token_id = ?1 AND status = ?2 AND filled_at <= ?3
                 ORDER BY filled_at DESC, rowid DESC LIMIT 1",
                params![token_id, OrderStatus::Filled, since],
                |row| row.get(0),
            )
            .optional()?;

        // TOTAL() is a float sum and cannot overflow.
        let (volume, trades): (f64, i64) = conn.query_row(
            "SELECT TOTAL(total_value), COUNT(*) FROM sell_orders
             WHERE token_id = ?1 AND status = ?2 AND filled_at > ?3",
            params![token_id, OrderStatus::Filled, since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(TradeSnapshot {
            last_price,
            reference_price,
            volume: volume.round() as u64,
            trades: trades as u64,
        })
    }
}

fn load_sell_order(conn: &Connection, order_id: &str) -> Result<Option<SellOrder>> {
    conn.query_row(
        "SELECT * FROM sell_orders WHERE id = ?1",
        params![order_id],
        sell_order_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn sell_order_from_row(row: &Row) -> rusqlite::Result<SellOrder> {
    Ok(SellOrder {
        id: row.get("id")?,
        seller_id: row.get("seller_id")?,
        token_id: row.get("token_id")?,
        amount: get_amount(row, "amount")?,
        price_per_token: row.get("price_per_token")?,
        total_value: get_amount(row, "total_value")?,
        status: row.get("status")?,
        buyer_id: row.get("buyer_id")?,
        created_at: get_time(row, "created_at")?,
        filled_at: get_opt_time(row, "filled_at")?,
    })
}

fn buy_order_from_row(row: &Row) -> rusqlite::Result<BuyOrder> {
    Ok(BuyOrder {
        id: row.get("id")?,
        buyer_id: row.get("buyer_id")?,
        token_id: row.get("token_id")?,
        sell_order_id: row.get("sell_order_id")?,
        amount: get_amount(row, "amount")?,
        price_per_token: row.get("price_per_token")?,
        total_value: get_amount(row, "total_value")?,
        status: row.get("status")?,
        created_at: get_time(row, "created_at")?,
    })
}

fn listing_from_row(row: &Row) -> rusqlite::Result<SellOrderListing> {
    Ok(SellOrderListing {
        order: sell_order_from_row(row)?,
        seller: SellerSummary {
            handcash_handle: row.get("seller_handle")?,
            display_name: row.get("seller_display_name")?,
        },
        token: TokenRef {
            symbol: row.get("token_symbol")?,
            handcash_handle: row.get("token_handle")?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::{profile, seeded};
    use crate::tokens::TOKEN_TOTAL_SUPPLY;
    use chrono::Duration;

    fn order(seller_id: &str, token_id: &str, amount: u64) -> NewSellOrder {
        NewSellOrder {
            seller_id: seller_id.to_string(),
            token_id: token_id.to_string(),
            amount,
            price_per_token: 0.5,
            total_value: amount / 2,
        }
    }

    #[test]
    fn test_listing_commits_balance() {
        let (db, owner, token) = seeded();
        db.create_sell_order(&order(&owner.id, &token.id, TOKEN_TOTAL_SUPPLY - 100))
            .unwrap();
        assert_eq!(db.available_balance(&owner.id, &token.id).unwrap(), 100);

        let err = db
            .create_sell_order(&order(&owner.id, &token.id, 200_000))
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::InsufficientBalance("Insufficient token balance".to_string())
        );
    }

    #[test]
    fn test_fill_moves_tokens_and_records_buy() {
        let (db, owner, token) = seeded();
        let buyer = db.upsert_user(&profile("@bob"), "token-bob").unwrap();
        let listed = db
            .create_sell_order(&order(&owner.id, &token.id, 300_000))
            .unwrap();

        let receipt = db.fill_sell_order(&listed.id, &buyer.id).unwrap();
        assert_eq!(receipt.order.status, OrderStatus::Filled);
        assert_eq!(receipt.order.buyer_id.as_deref(), Some(buyer.id.as_str()));
        assert!(receipt.order.filled_at.is_some());
        assert_eq!(receipt.buy_order.sell_order_id.as_deref(), Some(listed.id.as_str()));

        assert_eq!(
            db.get_holding(&buyer.id, &token.id).unwrap().unwrap().amount,
            300_000
        );
        assert_eq!(
            db.get_holding(&owner.id, &token.id).unwrap().unwrap().amount,
            TOKEN_TOTAL_SUPPLY - 300_000
        );

        let again = db.fill_sell_order(&listed.id, &buyer.id).unwrap_err();
        assert_eq!(
            again,
            StoreError::InvalidInput("Sell order is no longer active".to_string())
        );
    }

    #[test]
    fn test_fill_rolls_back_when_seller_is_short() {
        let (db, owner, token) = seeded();
        let buyer = db.upsert_user(&profile("@bob"), "token-bob").unwrap();
        let listed = db
            .create_sell_order(&order(&owner.id, &token.id, 500_000))
            .unwrap();

        // Drain the seller behind the order's back.
        db.conn
            .lock()
            .execute(
                "UPDATE token_holdings SET amount = 10 WHERE user_id = ?1",
                params![owner.id],
            )
            .unwrap();

        let err = db.fill_sell_order(&listed.id, &buyer.id).unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict("Seller has insufficient tokens".to_string())
        );

        let unchanged = db.get_sell_order(&listed.id).unwrap().unwrap();
        assert_eq!(unchanged.status, OrderStatus::Active);
        assert!(unchanged.buyer_id.is_none());
        assert!(db.get_holding(&buyer.id, &token.id).unwrap().is_none());
    }

    #[test]
    fn test_cannot_buy_own_order() {
        let (db, owner, token) = seeded();
        let listed = db
            .create_sell_order(&order(&owner.id, &token.id, 200_000))
            .unwrap();
        let err = db.fill_sell_order(&listed.id, &owner.id).unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidInput("Cannot buy your own tokens".to_string())
        );
    }

    #[test]
    fn test_cancel_only_by_seller() {
        let (db, owner, token) = seeded();
        let other = db.upsert_user(&profile("@carol"), "token-carol").unwrap();
        let listed = db
            .create_sell_order(&order(&owner.id, &token.id, 200_000))
            .unwrap();

        assert!(matches!(
            db.cancel_sell_order(&listed.id, &other.id),
            Err(StoreError::Forbidden(_))
        ));
        let cancelled = db.cancel_sell_order(&listed.id, &owner.id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(db.list_active_listings().unwrap().is_empty());
        assert_eq!(
            db.available_balance(&owner.id, &token.id).unwrap(),
            TOKEN_TOTAL_SUPPLY
        );
    }

    #[test]
    fn test_listings_include_seller_and_token() {
        let (db, owner, token) = seeded();
        db.create_sell_order(&order(&owner.id, &token.id, 250_000))
            .unwrap();
        let listings = db.list_active_listings().unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].seller.handcash_handle, "@alice");
        assert_eq!(listings[0].token.symbol, "$alice");

        let json = serde_json::to_value(&listings[0]).unwrap();
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["seller"]["handcashHandle"], "@alice");
    }

    #[test]
    fn test_trade_snapshot_window() {
        let (db, owner, token) = seeded();
        let buyer = db.upsert_user(&profile("@bob"), "token-bob").unwrap();

        let empty = db
            .trade_snapshot(&token.id, Utc::now() - Duration::hours(24))
            .unwrap();
        assert_eq!(empty, TradeSnapshot::default());

        let listed = db
            .create_sell_order(&order(&owner.id, &token.id, 400_000))
            .unwrap();
        db.fill_sell_order(&listed.id, &buyer.id).unwrap();

        let snapshot = db
            .trade_snapshot(&token.id, Utc::now() - Duration::hours(24))
            .unwrap();
        assert_eq!(snapshot.last_price, Some(0.5));
        assert_eq!(snapshot.reference_price, None);
        assert_eq!(snapshot.volume, 200_000);
        assert_eq!(snapshot.trades, 1);
    }
}
