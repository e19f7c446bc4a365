//! Divvy handlers: dividend payments, payouts, stats and the payment webhook.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{ApiError, ApiEvent, AppState, CurrentUser};
use crate::divvy::{DivvyRanking, EarningsReport, IncomingPayment};
use crate::models::{PaymentRecord, PendingDistribution};
use crate::persistence::DividendOverview;
use crate::tokens::parse_amount;

pub const WEBHOOK_SECRET_HEADER: &str = "x-divvy-webhook-secret";

const MISSING_PAYMENT_FIELDS: &str =
    "Missing required fields: handcashHandle, amount, currency, txId";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    handcash_handle: Option<String>,
    amount: Option<serde_json::Value>,
    currency: Option<String>,
    tx_id: Option<String>,
    from_handle: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl PaymentRequest {
    fn into_incoming(self) -> Result<IncomingPayment, ApiError> {
        let text = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let amount = self.amount.as_ref().and_then(parse_amount).filter(|a| *a > 0);

        match (
            text(self.handcash_handle),
            amount,
            text(self.currency),
            text(self.tx_id),
        ) {
            (Some(handcash_handle), Some(amount), Some(currency), Some(tx_id)) => {
                Ok(IncomingPayment {
                    handcash_handle,
                    amount,
                    currency,
                    tx_id,
                    from_handle: text(self.from_handle),
                    timestamp: self.timestamp,
                })
            }
            _ => Err(ApiError::InvalidInput(MISSING_PAYMENT_FIELDS.to_string())),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPaymentResponse {
    success: bool,
    message: String,
    dividend_payment_id: String,
    eligible_holders: usize,
    total_distributed: u64,
    remaining_amount: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeRequest {
    payment_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeResponse {
    success: bool,
    message: String,
    processed: usize,
    successful: usize,
    failed: usize,
    payment_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResponse {
    pending_distributions: Vec<PendingDistribution>,
    count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    success: bool,
    message: String,
    tx_id: String,
}

pub async fn record_payment(
    State(state): State<Arc<AppState>>,
    body: Result<Json<PaymentRequest>, JsonRejection>,
) -> Result<Json<RecordPaymentResponse>, ApiError> {
    let incoming = body
        .map_err(|_| ApiError::InvalidInput(MISSING_PAYMENT_FIELDS.to_string()))?
        .0
        .into_incoming()?;

    let recorded = state.divvy.record_payment(&incoming)?;
    state.record_event(ApiEvent::PaymentRecorded).await;

    Ok(Json(RecordPaymentResponse {
        success: true,
        message: "Payment processed successfully".to_string(),
        dividend_payment_id: recorded.payment.id,
        eligible_holders: recorded.eligible_holders,
        total_distributed: recorded.payment.distributed_amount,
        remaining_amount: recorded.payment.remaining_amount,
    }))
}

pub async fn recent_payments(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PaymentRecord>>, ApiError> {
    Ok(Json(state.divvy.recent_payments()?))
}

/// Checks run in request order: body, payment, then session and ownership.
/// Only a missing session waits for the later checks; other session errors
/// are returned at once.
pub async fn distribute(
    State(state): State<Arc<AppState>>,
    user: Result<CurrentUser, ApiError>,
    body: Result<Json<DistributeRequest>, JsonRejection>,
) -> Result<Json<DistributeResponse>, ApiError> {
    let user = match user {
        Ok(CurrentUser(user)) => Some(user),
        Err(ApiError::Unauthorized(_)) => None,
        Err(other) => return Err(other),
    };
    let payment_id = body
        .ok()
        .and_then(|Json(request)| request.payment_id)
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidInput("paymentId is required".to_string()))?;

    if state.db.get_dividend_payment(&payment_id)?.is_none() {
        return Err(ApiError::NotFound("Dividend payment not found".to_string()));
    }
    let user = user.ok_or_else(|| ApiError::Unauthorized("Not authenticated".to_string()))?;

    let report = state.divvy.distribute_as_owner(&user, &payment_id).await?;
    Ok(Json(DistributeResponse {
        success: true,
        message: "Batch distribution completed".to_string(),
        processed: report.processed,
        successful: report.successful,
        failed: report.failed,
        payment_id: report.payment_id,
    }))
}

pub async fn pending_distributions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PendingResponse>, ApiError> {
    let pending_distributions = state.divvy.pending_distributions()?;
    Ok(Json(PendingResponse {
        count: pending_distributions.len(),
        pending_distributions,
    }))
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DividendOverview>, ApiError> {
    Ok(Json(state.divvy.stats()?))
}

pub async fn rankings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DivvyRanking>>, ApiError> {
    Ok(Json(state.divvy.rankings()?))
}

pub async fn earnings(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<EarningsReport>, ApiError> {
    Ok(Json(state.divvy.earnings(&user)?))
}

/// Queue a payment notification for the monitor.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<PaymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    if let Some(secret) = &state.webhook_secret {
        let presented = headers
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|value| value.to_str().ok());
        if presented != Some(secret.as_str()) {
            return Err(ApiError::Unauthorized("Invalid webhook secret".to_string()));
        }
    }

    let incoming = body
        .map_err(|_| ApiError::InvalidInput(MISSING_PAYMENT_FIELDS.to_string()))?
        .0
        .into_incoming()?;
    let tx_id = incoming.tx_id.clone();

    info!(tx_id = %tx_id, handle = %incoming.handcash_handle, "payment notification queued");
    state.webhook_queue.push(incoming);

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            success: true,
            message: "Payment queued for processing".to_string(),
            tx_id,
        }),
    ))
}
