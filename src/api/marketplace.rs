//! Marketplace handlers: list, sell, buy and cancel token tranches.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{ApiError, ApiEvent, AppState, CurrentUser};
use crate::marketplace::sell_terms;
use crate::models::{SellOrder, SellOrderListing};
use crate::persistence::NewSellOrder;
use crate::tokens::parse_amount;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    token_symbol: Option<String>,
    amount: Option<serde_json::Value>,
    price_per_token: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResponse {
    success: bool,
    message: String,
    order_id: String,
}

pub async fn list_orders(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SellOrderListing>>, ApiError> {
    Ok(Json(state.db.list_active_listings()?))
}

pub async fn create_order(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<Json<SellOrderListing>, ApiError> {
    let Json(request) = body?;
    let symbol = request
        .token_symbol
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let amount = request.amount.as_ref().and_then(parse_amount).filter(|a| *a > 0);
    let price = request.price_per_token.filter(|p| *p != 0.0);

    let (Some(symbol), Some(amount), Some(price)) = (symbol, amount, price) else {
        return Err(ApiError::InvalidInput(
            "Token symbol, amount, and price are required".to_string(),
        ));
    };
    let terms = sell_terms(amount, price)?;

    let token = state
        .db
        .find_token_by_symbol(&symbol)?
        .ok_or_else(|| ApiError::NotFound("Token not found".to_string()))?;

    let order = state.db.create_sell_order(&NewSellOrder {
        seller_id: user.id.clone(),
        token_id: token.id.clone(),
        amount: terms.amount,
        price_per_token: terms.price_per_token,
        total_value: terms.total_value,
    })?;
    info!(
        order = %order.id,
        token = %token.symbol,
        seller = %user.handcash_handle,
        amount = order.amount,
        "sell order listed"
    );

    let listing = state
        .db
        .get_listing(&order.id)?
        .ok_or_else(|| ApiError::NotFound("Sell order not found".to_string()))?;
    Ok(Json(listing))
}

pub async fn buy_order(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(order_id): Path<String>,
) -> Result<Json<PurchaseResponse>, ApiError> {
    let receipt = state.db.fill_sell_order(&order_id, &user.id)?;
    state.record_event(ApiEvent::OrderFilled).await;

    Ok(Json(PurchaseResponse {
        success: true,
        message: "Purchase completed successfully".to_string(),
        order_id: receipt.order.id,
    }))
}

pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(order_id): Path<String>,
) -> Result<Json<SellOrder>, ApiError> {
    Ok(Json(state.db.cancel_sell_order(&order_id, &user.id)?))
}
