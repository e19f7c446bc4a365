//! Database persistence layer for CashHandle
//!
//! A single SQLite connection guarded by a mutex. Every operation that touches
//! more than one row runs inside one SQLite transaction, so a failed fill,
//! transfer or payment recording leaves no partial writes behind.

mod dividends;
mod orders;
mod transfers;

pub use dividends::DividendOverview;
pub use orders::{FillReceipt, NewSellOrder, TradeSnapshot};
pub use transfers::NewChainTransaction;

use crate::error::{Result, StoreError};
use crate::models::{HolderStake, Token, TokenHolding, TokenType, User, UserProfile};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    handcash_handle TEXT NOT NULL UNIQUE,
    auth_token TEXT NOT NULL,
    display_name TEXT,
    profile_picture_url TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tokens (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL UNIQUE,
    handcash_handle TEXT NOT NULL UNIQUE,
    owner_id TEXT NOT NULL REFERENCES users(id),
    description TEXT,
    total_supply INTEGER NOT NULL CHECK (total_supply > 0),
    token_type TEXT NOT NULL,
    inscription_id TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS token_holdings (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    token_id TEXT NOT NULL REFERENCES tokens(id),
    amount INTEGER NOT NULL CHECK (amount >= 0),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (user_id, token_id)
);

CREATE TABLE IF NOT EXISTS sell_orders (
    id TEXT PRIMARY KEY,
    seller_id TEXT NOT NULL REFERENCES users(id),
    token_id TEXT NOT NULL REFERENCES tokens(id),
    amount INTEGER NOT NULL CHECK (amount > 0),
    price_per_token REAL NOT NULL,
    total_value INTEGER NOT NULL,
    status TEXT NOT NULL,
    buyer_id TEXT REFERENCES users(id),
    created_at INTEGER NOT NULL,
    filled_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sell_orders_status ON sell_orders (status, created_at);

CREATE TABLE IF NOT EXISTS buy_orders (
    id TEXT PRIMARY KEY,
    buyer_id TEXT NOT NULL REFERENCES users(id),
    token_id TEXT NOT NULL REFERENCES tokens(id),
    sell_order_id TEXT REFERENCES sell_orders(id),
    amount INTEGER NOT NULL,
    price_per_token REAL NOT NULL,
    total_value INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_buy_orders_token ON buy_orders (token_id, created_at);

CREATE TABLE IF NOT EXISTS dividend_payments (
    id TEXT PRIMARY KEY,
    token_id TEXT NOT NULL REFERENCES tokens(id),
    payment_tx_id TEXT NOT NULL UNIQUE,
    currency TEXT NOT NULL,
    total_amount INTEGER NOT NULL,
    distributed_amount INTEGER NOT NULL,
    remaining_amount INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    CHECK (distributed_amount + remaining_amount = total_amount)
);

CREATE TABLE IF NOT EXISTS dividend_distributions (
    id TEXT PRIMARY KEY,
    payment_id TEXT NOT NULL REFERENCES dividend_payments(id),
    holder_id TEXT NOT NULL REFERENCES users(id),
    holder_handle TEXT NOT NULL,
    holding_amount INTEGER NOT NULL,
    amount INTEGER NOT NULL,
    status TEXT NOT NULL,
    tx_id TEXT,
    failure_reason TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_distributions_payment ON dividend_distributions (payment_id);
CREATE INDEX IF NOT EXISTS idx_distributions_status ON dividend_distributions (status, created_at);

CREATE TABLE IF NOT EXISTS chain_transactions (
    id TEXT PRIMARY KEY,
    tx_id TEXT NOT NULL,
    token_id TEXT NOT NULL REFERENCES tokens(id),
    inscription_id TEXT,
    transaction_type TEXT NOT NULL,
    from_address TEXT NOT NULL,
    to_address TEXT,
    to_user_id TEXT REFERENCES users(id),
    amount INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    confirmed_at INTEGER
);
";

/// Fields for a freshly minted token.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub symbol: String,
    pub handcash_handle: String,
    pub owner_id: String,
    pub description: Option<String>,
    pub total_supply: u64,
    pub token_type: TokenType,
    pub inscription_id: Option<String>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file, creating its parent directory if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| StoreError::DatabaseError(format!("Failed to open database: {}", e)))?;
        info!(path = %path.display(), "database opened");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::DatabaseError(format!("Failed to create schema: {}", e)))?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    // ------------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------------

    /// Create the user for a handle, or refresh the token and profile of an existing one.
    pub fn upsert_user(&self, profile: &UserProfile, auth_token: &str) -> Result<User> {
        let now = now_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, handcash_handle, auth_token, display_name, profile_picture_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(handcash_handle) DO UPDATE SET
                auth_token = excluded.auth_token,
                display_name = excluded.display_name,
                profile_picture_url = excluded.profile_picture_url,
                updated_at = excluded.updated_at",
            params![
                new_id(),
                profile.handcash_handle,
                auth_token,
                profile.display_name,
                profile.profile_picture_url,
                now,
            ],
        )?;

        conn.query_row(
            "SELECT * FROM users WHERE handcash_handle = ?1",
            params![profile.handcash_handle],
            user_from_row,
        )
        .map_err(StoreError::from)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM users WHERE id = ?1",
            params![user_id],
            user_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn find_user_by_handle(&self, handle: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM users WHERE handcash_handle = ?1",
            params![handle],
            user_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Resolve a bearer identity-provider token to the most recently refreshed user holding it.
    pub fn find_user_by_auth_token(&self, auth_token: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM users WHERE auth_token = ?1 ORDER BY updated_at DESC LIMIT 1",
            params![auth_token],
            user_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    // ------------------------------------------------------------------------
    // Tokens & holdings
    // ------------------------------------------------------------------------

    /// Insert a token and hand its whole supply to the owner. A mint record is
    /// written in the same transaction when one is given.
    pub fn create_token(
        &self,
        new: &NewToken,
        mint: Option<&NewChainTransaction>,
    ) -> Result<Token> {
        let token = Token {
            id: new_id(),
            symbol: new.symbol.clone(),
            handcash_handle: new.handcash_handle.clone(),
            owner_id: new.owner_id.clone(),
            description: new.description.clone(),
            total_supply: new.total_supply,
            token_type: new.token_type,
            inscription_id: new.inscription_id.clone(),
            created_at: from_millis(now_millis())?,
        };

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO tokens (id, symbol, handcash_handle, owner_id, description, total_supply, token_type, inscription_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                token.id,
                token.symbol,
                token.handcash_handle,
                token.owner_id,
                token.description,
                token.total_supply as i64,
                token.token_type,
                token.inscription_id,
                token.created_at.timestamp_millis(),
            ],
        )
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => {
                StoreError::Conflict("Token already exists for this handle".to_string())
            }
            other => other,
        })?;

        credit_holding(&tx, &token.owner_id, &token.id, token.total_supply)?;

        if let Some(record) = mint {
            transfers::insert_chain_transaction(&tx, &token.id, record)?;
        }

        tx.commit()?;
        info!(symbol = %token.symbol, owner = %token.owner_id, "token minted");
        Ok(token)
    }

    pub fn get_token(&self, token_id: &str) -> Result<Option<Token>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM tokens WHERE id = ?1",
            params![token_id],
            token_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn find_token_by_handle(&self, handle: &str) -> Result<Option<Token>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM tokens WHERE handcash_handle = ?1",
            params![handle],
            token_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn find_token_by_symbol(&self, symbol: &str) -> Result<Option<Token>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM tokens WHERE symbol = ?1",
            params![symbol],
            token_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// All tokens, newest first.
    pub fn list_tokens(&self) -> Result<Vec<Token>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM tokens ORDER BY created_at DESC, rowid DESC")?;
        let rows = stmt.query_map([], token_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)
    }

    /// Number of users holding a positive amount of the token.
    pub fn holder_count(&self, token_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM token_holdings WHERE token_id = ?1 AND amount > 0",
            params![token_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Holders of a token with their handles, largest stake first.
    pub fn token_stakes(&self, token_id: &str) -> Result<Vec<HolderStake>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT h.user_id, u.handcash_handle, h.amount
             FROM token_holdings h JOIN users u ON u.id = h.user_id
             WHERE h.token_id = ?1 AND h.amount > 0
             ORDER BY h.amount DESC, h.rowid ASC",
        )?;
        let rows = stmt.query_map(params![token_id], |row| {
            Ok(HolderStake {
                user_id: row.get(0)?,
                handcash_handle: row.get(1)?,
                amount: row.get::<_, i64>(2)? as u64,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)
    }

    pub fn get_holding(&self, user_id: &str, token_id: &str) -> Result<Option<TokenHolding>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM token_holdings WHERE user_id = ?1 AND token_id = ?2",
            params![user_id, token_id],
            holding_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Positive holdings of a user.
    pub fn user_holdings(&self, user_id: &str) -> Result<Vec<TokenHolding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM token_holdings WHERE user_id = ?1 AND amount > 0 ORDER BY amount DESC",
        )?;
        let rows = stmt.query_map(params![user_id], holding_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)
    }

    /// Holding minus the amounts the user has listed in active sell orders.
    pub fn available_balance(&self, user_id: &str, token_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        available_balance(&conn, user_id, token_id)
    }
}

// ============================================================================
// Shared helpers (also used by the submodules inside open transactions)
// ============================================================================

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {}", ms).into(),
        )
    })
}

fn get_time(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(row.get(column)?)
}

fn get_opt_time(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(column)?.map(from_millis).transpose()
}

fn get_amount(row: &Row, column: &str) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(column)? as u64)
}

fn holding_amount(conn: &Connection, user_id: &str, token_id: &str) -> Result<u64> {
    let amount: Option<i64> = conn
        .query_row(
            "SELECT amount FROM token_holdings WHERE user_id = ?1 AND token_id = ?2",
            params![user_id, token_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(amount.unwrap_or(0) as u64)
}

fn committed_amount(conn: &Connection, user_id: &str, token_id: &str) -> Result<u64> {
    let committed: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM sell_orders
         WHERE seller_id = ?1 AND token_id = ?2 AND status = 'ACTIVE'",
        params![user_id, token_id],
        |row| row.get(0),
    )?;
    Ok(committed as u64)
}

fn available_balance(conn: &Connection, user_id: &str, token_id: &str) -> Result<u64> {
    let holding = holding_amount(conn, user_id, token_id)?;
    let committed = committed_amount(conn, user_id, token_id)?;
    Ok(holding.saturating_sub(committed))
}

/// Add to a holding, creating the row when the user holds none yet.
fn credit_holding(conn: &Connection, user_id: &str, token_id: &str, amount: u64) -> Result<()> {
    let now = now_millis();
    conn.execute(
        "INSERT INTO token_holdings (id, user_id, token_id, amount, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(user_id, token_id) DO UPDATE SET
            amount = amount + excluded.amount,
            updated_at = excluded.updated_at",
        params![new_id(), user_id, token_id, amount as i64, now],
    )?;
    Ok(())
}

/// Subtract from a holding. Fails without writing when the holding is short.
fn debit_holding(
    conn: &Connection,
    user_id: &str,
    token_id: &str,
    amount: u64,
    shortfall: &str,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE token_holdings SET amount = amount - ?3, updated_at = ?4
         WHERE user_id = ?1 AND token_id = ?2 AND amount >= ?3",
        params![user_id, token_id, amount as i64, now_millis()],
    )?;
    if changed != 1 {
        return Err(StoreError::InsufficientBalance(shortfall.to_string()));
    }
    Ok(())
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        handcash_handle: row.get("handcash_handle")?,
        auth_token: row.get("auth_token")?,
        display_name: row.get("display_name")?,
        profile_picture_url: row.get("profile_picture_url")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}

fn token_from_row(row: &Row) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get("id")?,
        symbol: row.get("symbol")?,
        handcash_handle: row.get("handcash_handle")?,
        owner_id: row.get("owner_id")?,
        description: row.get("description")?,
        total_supply: get_amount(row, "total_supply")?,
        token_type: row.get("token_type")?,
        inscription_id: row.get("inscription_id")?,
        created_at: get_time(row, "created_at")?,
    })
}

fn holding_from_row(row: &Row) -> rusqlite::Result<TokenHolding> {
    Ok(TokenHolding {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        token_id: row.get("token_id")?,
        amount: get_amount(row, "amount")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}
