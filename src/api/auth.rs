//! Login, session and wallet handlers.

use axum::{
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{ApiError, AppState, CurrentUser, SuccessResponse};
use crate::handcash::SpendableBalance;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackQuery {
    auth_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    id: String,
    handcash_handle: String,
    display_name: Option<String>,
    profile_picture_url: Option<String>,
    created_at: DateTime<Utc>,
}

pub async fn login(State(state): State<Arc<AppState>>) -> Result<Redirect, ApiError> {
    match state.identity.redirection_url(&[]) {
        Ok(url) => Ok(Redirect::temporary(&url)),
        Err(e) => {
            error!(error = %e, "failed to build HandCash redirect");
            Err(ApiError::InternalError(
                "Failed to initiate HandCash login".to_string(),
            ))
        }
    }
}

pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(auth_token) = query.auth_token.filter(|t| !t.trim().is_empty()) else {
        return Redirect::temporary("/?error=no-auth-token").into_response();
    };

    let profile = match state.identity.user_profile(&auth_token).await {
        Ok(profile) => profile,
        Err(e) => {
            warn!(error = %e, "HandCash profile lookup failed");
            return Redirect::temporary("/?error=auth-failed").into_response();
        }
    };

    let user = match state.db.upsert_user(&profile, &auth_token) {
        Ok(user) => user,
        Err(e) => {
            error!(error = %e, handle = %profile.handcash_handle, "failed to store user");
            return Redirect::temporary("/?error=auth-failed").into_response();
        }
    };

    info!(user = %user.id, handle = %user.handcash_handle, "user logged in");
    (
        [(header::SET_COOKIE, state.sessions.session_cookie(&user.id))],
        Redirect::temporary("/dashboard"),
    )
        .into_response()
}

pub async fn current_user(CurrentUser(user): CurrentUser) -> Json<UserResponse> {
    Json(UserResponse {
        id: user.id,
        handcash_handle: user.handcash_handle,
        display_name: user.display_name,
        profile_picture_url: user.profile_picture_url,
        created_at: user.created_at,
    })
}

pub async fn logout(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::SET_COOKIE, state.sessions.clear_cookie())],
        Json(SuccessResponse {
            success: true,
            message: "Logged out".to_string(),
        }),
    )
}

pub async fn wallet_balance(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<SpendableBalance>, ApiError> {
    let balance = state.identity.spendable_balance(&user.auth_token).await?;
    Ok(Json(balance))
}
