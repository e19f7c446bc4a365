//! Token handlers: minting, lookup, rankings and transfers.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::{ApiError, ApiEvent, AppState, CurrentUser};
use crate::divvy::RankingOwner;
use crate::models::{ChainTxStatus, ChainTxType, OwnerSummary, TokenType};
use crate::persistence::{NewChainTransaction, NewToken};
use crate::tokens::{
    default_description, market_metrics, parse_amount, symbol_for_handle, MarketMetrics,
    TOKEN_TOTAL_SUPPLY,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenRequest {
    handcash_handle: Option<String>,
    token_type: Option<String>,
    description: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenResponse {
    id: String,
    symbol: String,
    handcash_handle: String,
    total_supply: String,
    price: f64,
    market_cap: f64,
    holders: u64,
    token_type: TokenType,
    #[serde(skip_serializing_if = "Option::is_none")]
    inscription_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    id: String,
    symbol: String,
    handcash_handle: String,
    total_supply: String,
    description: Option<String>,
    price: f64,
    market_cap: f64,
    holders: u64,
    owner: OwnerSummary,
    created_at: DateTime<Utc>,
    token_type: TokenType,
    inscription_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRanking {
    id: String,
    symbol: String,
    handcash_handle: String,
    #[serde(flatten)]
    metrics: MarketMetrics,
    holders: u64,
    owner: RankingOwner,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    token_id: Option<String>,
    amount: Option<serde_json::Value>,
    to_handle: Option<String>,
    to_address: Option<String>,
    inscription_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    success: bool,
    transaction_id: String,
    transfer_tx_id: Option<String>,
    amount: String,
    to_address: Option<String>,
    to_handle: Option<String>,
    token_symbol: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn create_token(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    body: Result<Json<CreateTokenRequest>, JsonRejection>,
) -> Result<Json<CreateTokenResponse>, ApiError> {
    let Json(request) = body?;
    let handle = request.handcash_handle.unwrap_or_default();
    let symbol = symbol_for_handle(&handle)?;

    if user.handcash_handle != handle {
        return Err(ApiError::Forbidden(
            "Unauthorized to create token for this handle".to_string(),
        ));
    }
    if state.db.find_token_by_handle(&handle)?.is_some() {
        return Err(ApiError::Conflict(
            "Token already exists for this handle".to_string(),
        ));
    }

    let token_type = match non_empty(request.token_type) {
        Some(raw) => raw
            .to_uppercase()
            .parse::<TokenType>()
            .map_err(|_| ApiError::InvalidInput(format!("Unknown token type: {}", raw)))?,
        None => TokenType::Standard,
    };

    let mut new_token = NewToken {
        symbol,
        handcash_handle: handle.clone(),
        owner_id: user.id.clone(),
        description: Some(
            non_empty(request.description).unwrap_or_else(|| default_description(&handle)),
        ),
        total_supply: TOKEN_TOTAL_SUPPLY,
        token_type,
        inscription_id: None,
    };

    let mint = if token_type == TokenType::Ordinal {
        let inscription = state.wallet.create_inscription(
            &new_token.symbol,
            &handle,
            TOKEN_TOTAL_SUPPLY,
            &user.handcash_handle,
        )?;
        new_token.inscription_id = Some(inscription.inscription_id.clone());
        Some(NewChainTransaction {
            tx_id: format!("mint_{}", inscription.inscription_id),
            inscription_id: Some(inscription.inscription_id),
            transaction_type: ChainTxType::Mint,
            from_address: state.wallet.address(),
            to_address: Some(state.wallet.address()),
            to_user_id: Some(user.id.clone()),
            amount: TOKEN_TOTAL_SUPPLY,
            status: ChainTxStatus::Pending,
        })
    } else {
        None
    };

    let token = state.db.create_token(&new_token, mint.as_ref())?;
    state.record_event(ApiEvent::TokenCreated).await;

    let metrics = MarketMetrics::untraded(token.total_supply);
    Ok(Json(CreateTokenResponse {
        id: token.id,
        symbol: token.symbol,
        handcash_handle: token.handcash_handle,
        total_supply: token.total_supply.to_string(),
        price: metrics.price,
        market_cap: metrics.market_cap,
        holders: 1,
        token_type: token.token_type,
        inscription_id: token.inscription_id,
    }))
}

pub async fn token_by_handle(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = state
        .db
        .find_token_by_handle(&handle)?
        .ok_or_else(|| ApiError::NotFound("Token not found".to_string()))?;
    let owner = state
        .db
        .get_user(&token.owner_id)?
        .ok_or_else(|| ApiError::NotFound("Token owner not found".to_string()))?;
    let metrics = market_metrics(&state.db, &token)?;
    let holders = state.db.holder_count(&token.id)?;

    Ok(Json(TokenResponse {
        id: token.id,
        symbol: token.symbol,
        handcash_handle: token.handcash_handle,
        total_supply: token.total_supply.to_string(),
        description: token.description,
        price: metrics.price,
        market_cap: metrics.market_cap,
        holders,
        owner: OwnerSummary {
            handcash_handle: owner.handcash_handle,
            display_name: owner.display_name,
            profile_picture_url: owner.profile_picture_url,
        },
        created_at: token.created_at,
        token_type: token.token_type,
        inscription_id: token.inscription_id,
    }))
}

pub async fn rankings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TokenRanking>>, ApiError> {
    let mut rankings = Vec::new();
    for token in state.db.list_tokens()? {
        let owner = state.db.get_user(&token.owner_id)?;
        let metrics = market_metrics(&state.db, &token)?;
        let holders = state.db.holder_count(&token.id)?;
        rankings.push(TokenRanking {
            owner: RankingOwner {
                display_name: owner
                    .as_ref()
                    .and_then(|o| o.display_name.clone())
                    .unwrap_or_else(|| token.handcash_handle.clone()),
                profile_picture_url: owner.and_then(|o| o.profile_picture_url),
            },
            id: token.id,
            symbol: token.symbol,
            handcash_handle: token.handcash_handle,
            metrics,
            holders,
        });
    }
    Ok(Json(rankings))
}

pub async fn transfer(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    body: Result<Json<TransferRequest>, JsonRejection>,
) -> Result<Json<TransferResponse>, ApiError> {
    let Json(request) = body?;
    let token_id = non_empty(request.token_id);
    let to_handle = non_empty(request.to_handle);
    let to_address = non_empty(request.to_address);

    let (Some(token_id), Some(raw_amount)) = (token_id, request.amount) else {
        return Err(ApiError::InvalidInput(
            "tokenId, amount, and a recipient are required".to_string(),
        ));
    };
    if to_handle.is_none() && to_address.is_none() {
        return Err(ApiError::InvalidInput(
            "tokenId, amount, and a recipient are required".to_string(),
        ));
    }
    let amount = parse_amount(&raw_amount)
        .filter(|amount| *amount > 0)
        .ok_or_else(|| {
            ApiError::InvalidInput("Amount must be a positive whole number".to_string())
        })?;

    let token = state
        .db
        .get_token(&token_id)?
        .ok_or_else(|| ApiError::NotFound("Token not found".to_string()))?;

    let recipient = match &to_handle {
        Some(handle) => Some(
            state
                .db
                .find_user_by_handle(handle)?
                .ok_or_else(|| ApiError::NotFound("Recipient not found".to_string()))?,
        ),
        None => None,
    };
    if recipient.as_ref().is_some_and(|r| r.id == user.id) {
        return Err(ApiError::InvalidInput(
            "Cannot transfer to yourself".to_string(),
        ));
    }

    let inscription_id = non_empty(request.inscription_id).or_else(|| token.inscription_id.clone());
    let mut chain_tx_id = None;
    if token.token_type == TokenType::Ordinal {
        if let (Some(inscription), Some(address)) = (&inscription_id, &to_address) {
            match state
                .wallet
                .transfer_inscription(inscription, address, Some(amount))
            {
                Ok(tx_id) => chain_tx_id = Some(tx_id),
                Err(e) => warn!(
                    error = %e,
                    token = %token.id,
                    "inscription transfer failed, recording transfer as pending"
                ),
            }
        }
    }

    let record = NewChainTransaction {
        tx_id: chain_tx_id.clone().unwrap_or_else(local_transfer_id),
        inscription_id,
        transaction_type: ChainTxType::Transfer,
        from_address: state.wallet.address(),
        to_address: to_address.clone(),
        to_user_id: recipient.as_ref().map(|r| r.id.clone()),
        amount,
        status: if chain_tx_id.is_some() {
            ChainTxStatus::Confirmed
        } else {
            ChainTxStatus::Pending
        },
    };
    let logged = state.db.transfer_tokens(&user.id, &token.id, &record)?;

    info!(
        token = %token.symbol,
        from = %user.handcash_handle,
        to_handle = ?to_handle,
        to_address = ?to_address,
        amount,
        "transfer completed"
    );
    Ok(Json(TransferResponse {
        success: true,
        transaction_id: logged.id,
        transfer_tx_id: chain_tx_id,
        amount: amount.to_string(),
        to_address,
        to_handle,
        token_symbol: token.symbol,
    }))
}

/// `transfer_{millis}_{8 hex}` for transfers that never reached the chain.
fn local_transfer_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "transfer_{}_{}",
        Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}
