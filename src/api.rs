//! REST API server for CashHandle
//!
//! Routes live under `/api`; everything else falls through to the static
//! front-end. Handlers are grouped by area in the submodules.

mod auth;
mod divvy;
mod marketplace;
mod tokens;

use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, Request, State},
    http::{self, request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::bsv::BsvWallet;
use crate::config::Config;
use crate::divvy::{DivvyService, DivvySettings};
use crate::error::StoreError;
use crate::handcash::{provider_from_config, IdentityProvider};
use crate::models::User;
use crate::monitor::WebhookQueue;
use crate::persistence::Database;
use crate::session::{bearer_token, SessionKeys};

/// Shared state handed to every handler.
pub struct AppState {
    pub db: Arc<Database>,
    pub identity: Arc<dyn IdentityProvider>,
    pub wallet: Arc<BsvWallet>,
    pub sessions: SessionKeys,
    pub divvy: Arc<DivvyService>,
    pub webhook_queue: Arc<WebhookQueue>,
    pub webhook_secret: Option<String>,
    pub static_dir: String,
    api_stats: RwLock<ApiStats>,
}

impl AppState {
    pub fn new(
        config: &Config,
        db: Arc<Database>,
        identity: Arc<dyn IdentityProvider>,
        wallet: Arc<BsvWallet>,
    ) -> Result<Self, StoreError> {
        let divvy = Arc::new(DivvyService::new(
            Arc::clone(&db),
            Arc::clone(&identity),
            DivvySettings::from(&config.divvy),
        ));

        Ok(AppState {
            db,
            identity,
            wallet,
            sessions: SessionKeys::from_config(&config.session)?,
            divvy,
            webhook_queue: Arc::new(WebhookQueue::new()),
            webhook_secret: config.divvy.webhook_secret.clone(),
            static_dir: config.server.static_dir.clone(),
            api_stats: RwLock::new(ApiStats::new()),
        })
    }

    /// Open the database and build the identity provider and wallet from config.
    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        let db = Arc::new(Database::open(&config.database.path)?);
        let identity = provider_from_config(&config.handcash)?;
        let wallet = Arc::new(BsvWallet::from_config(&config.bsv));
        Self::new(config, db, identity, wallet)
    }

    async fn record_event(&self, event: ApiEvent) {
        let mut stats = self.api_stats.write().await;
        match event {
            ApiEvent::TokenCreated => stats.tokens_created += 1,
            ApiEvent::OrderFilled => stats.orders_filled += 1,
            ApiEvent::PaymentRecorded => stats.payments_recorded += 1,
        }
    }
}

/// API statistics and monitoring
#[derive(Debug, Default)]
struct ApiStats {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    tokens_created: u64,
    orders_filled: u64,
    payments_recorded: u64,
    start_time: Option<Instant>,
}

impl ApiStats {
    fn new() -> Self {
        ApiStats {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    fn record_request(&mut self, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ApiEvent {
    TokenCreated,
    OrderFilled,
    PaymentRecorded,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStatsResponse {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub tokens_created: u64,
    pub orders_filled: u64,
    pub payments_recorded: u64,
    pub uptime_seconds: u64,
}

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    InvalidInput(String),
    NotFound(String),
    Conflict(String),
    UpstreamError(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::UpstreamError(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => ApiError::NotFound(msg),
            StoreError::InvalidInput(msg) | StoreError::InsufficientBalance(msg) => {
                ApiError::InvalidInput(msg)
            }
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::Forbidden(msg) => ApiError::Forbidden(msg),
            StoreError::IdentityError(msg) => ApiError::UpstreamError(msg),
            other => {
                error!(error = %other, "request failed");
                ApiError::InternalError("Internal server error".to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidInput(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
    message: String,
}

// ============================================================================
// Authentication
// ============================================================================

/// The user behind the request's session cookie, or behind an
/// `Authorization: Bearer <authToken>` header when no cookie is sent.
pub struct CurrentUser(pub User);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(user_id) = state.sessions.user_id_from_headers(&parts.headers) {
            return state
                .db
                .get_user(&user_id)?
                .map(CurrentUser)
                .ok_or_else(|| ApiError::NotFound("User not found".to_string()));
        }

        if let Some(token) = bearer_token(&parts.headers) {
            if let Some(user) = state.db.find_user_by_auth_token(&token)? {
                return Ok(CurrentUser(user));
            }
        }

        Err(ApiError::Unauthorized("Not authenticated".to_string()))
    }
}

// ============================================================================
// Middleware
// ============================================================================

async fn stats_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let response = next.run(req).await;

    let success = response.status().is_success() || response.status().is_redirection();
    let mut stats = state.api_stats.write().await;
    stats.record_request(success);

    response
}

/// Logs method, path, status and duration of every request.
async fn logging_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = %start.elapsed().as_millis(),
        "api.request"
    );

    response
}

// ============================================================================
// API Server
// ============================================================================

/// Build the API router with all endpoints
pub fn build_api_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![http::header::CONTENT_TYPE, http::header::AUTHORIZATION])
        .allow_credentials(true);

    let api_routes = Router::new()
        // Authentication
        .route("/auth/handcash/login", get(auth::login))
        .route("/auth/handcash/callback", get(auth::callback))
        .route("/auth/user", get(auth::current_user))
        .route("/auth/logout", post(auth::logout))
        .route("/wallet/balance", get(auth::wallet_balance))
        // Tokens
        .route("/tokens/create", post(tokens::create_token))
        .route("/tokens/user/:handle", get(tokens::token_by_handle))
        .route("/tokens/rankings", get(tokens::rankings))
        .route("/tokens/transfer", post(tokens::transfer))
        // Marketplace
        .route(
            "/marketplace/orders",
            get(marketplace::list_orders).post(marketplace::create_order),
        )
        .route("/marketplace/orders/:order_id", delete(marketplace::cancel_order))
        .route("/marketplace/orders/:order_id/buy", post(marketplace::buy_order))
        // Divvy
        .route(
            "/divvy/payments",
            get(divvy::recent_payments).post(divvy::record_payment),
        )
        .route(
            "/divvy/distribute",
            get(divvy::pending_distributions).post(divvy::distribute),
        )
        .route("/divvy/stats", get(divvy::stats))
        .route("/divvy/rankings", get(divvy::rankings))
        .route("/divvy/earnings", get(divvy::earnings))
        .route("/divvy/webhook", post(divvy::webhook))
        // System
        .route("/health", get(health_check))
        .route("/stats", get(get_api_stats))
        .layer(middleware::from_fn(logging_middleware))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            stats_middleware,
        ))
        .with_state(state.clone());

    let serve_dir = ServeDir::new(&state.static_dir);
    Router::new()
        .nest("/api", api_routes)
        .fallback_service(serve_dir)
        .layer(cors)
}

/// Bind the port and serve until `shutdown` resolves.
pub async fn run_api_server<F>(
    state: Arc<AppState>,
    port: u16,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_api_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(%addr, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

// ============================================================================
// System Handlers
// ============================================================================

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.db.list_tokens() {
        Ok(tokens) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "tokens": tokens.len(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            })),
        ),
        Err(e) => {
            error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "timestamp": chrono::Utc::now().to_rfc3339()
                })),
            )
        }
    }
}

async fn get_api_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.api_stats.read().await;
    Json(ApiStatsResponse {
        total_requests: stats.total_requests,
        successful_requests: stats.successful_requests,
        failed_requests: stats.failed_requests,
        tokens_created: stats.tokens_created,
        orders_filled: stats.orders_filled,
        payments_recorded: stats.payments_recorded,
        uptime_seconds: stats
            .start_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0),
    })
}
