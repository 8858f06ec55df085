/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Local control surface. Replaces the desktop bus the original clients
//! spoke: triggers, outbound actions, account lifecycle notifications from
//! the account provider, and read access to the aggregated rows.

use crate::account::{Account, AccountRegistry};
use crate::dispatcher::{Dispatcher, OpKind};
use crate::errors::ProtocolError;
use crate::protocol::ProtocolRegistry;
use crate::shortener::Shortener;
use crate::stream_store::StreamStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub accounts: AccountRegistry,
    pub store: StreamStore,
    pub protocols: ProtocolRegistry,
    pub shortener: Shortener,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/refresh", post(trigger_refresh))
        .route("/contacts", post(trigger_contacts))
        .route("/expire_avatars", post(trigger_expire_avatars))
        .route("/send", post(send_message))
        .route("/reply", post(send_reply))
        .route("/do", post(do_action))
        .route("/shorten", post(shorten_url))
        .route("/rows", get(list_rows))
        .route("/stats", get(stats))
        .route("/features/:protocol", get(features))
        .route("/purge", post(purge_account))
        .route("/accounts/added", post(account_added))
        .route("/accounts/removed", post(account_removed))
        .route("/accounts/reauthorized", post(account_reauthorized))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: &ProtocolError) -> Response {
    let status = match err {
        ProtocolError::Transient(_) | ProtocolError::RateLimited { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ProtocolError::AuthExpired => StatusCode::UNAUTHORIZED,
        ProtocolError::UnsupportedAction(_) => StatusCode::BAD_REQUEST,
        ProtocolError::Permanent(_) => StatusCode::BAD_REQUEST,
    };
    (status, err.to_string()).into_response()
}

async fn trigger_refresh(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move { dispatcher.run_cycle(OpKind::Refresh).await });
    StatusCode::ACCEPTED
}

async fn trigger_contacts(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move { dispatcher.run_cycle(OpKind::FetchContacts).await });
    StatusCode::ACCEPTED
}

async fn trigger_expire_avatars(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move { dispatcher.run_cycle(OpKind::ExpireAvatars).await });
    StatusCode::ACCEPTED
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    message: String,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    reply_to: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendOutcome {
    account_id: String,
    ok: bool,
    message_id: Option<String>,
    error: Option<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Response {
    match req.account_id {
        Some(account_id) => {
            match state
                .dispatcher
                .send(&account_id, &req.message, req.reply_to.as_deref())
                .await
            {
                Ok(row) => Json(row).into_response(),
                Err(err) => error_response(&err),
            }
        }
        None => {
            let results = state.dispatcher.send_to_all(&req.message).await;
            if results.is_empty() {
                return (StatusCode::BAD_REQUEST, "no send-enabled accounts found")
                    .into_response();
            }
            let outcomes: Vec<SendOutcome> = results
                .into_iter()
                .map(|(account_id, res)| match res {
                    Ok(row) => SendOutcome {
                        account_id,
                        ok: true,
                        message_id: Some(row.message_id),
                        error: None,
                    },
                    Err(err) => SendOutcome {
                        account_id,
                        ok: false,
                        message_id: None,
                        error: Some(err.to_string()),
                    },
                })
                .collect();
            Json(outcomes).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReplyRequest {
    account_id: String,
    message_id: String,
    message: String,
}

async fn send_reply(State(state): State<AppState>, Json(req): Json<ReplyRequest>) -> Response {
    match state
        .dispatcher
        .send(&req.account_id, &req.message, Some(&req.message_id))
        .await
    {
        Ok(row) => Json(row).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct DoRequest {
    #[serde(default)]
    account_id: Option<String>,
    action: String,
    #[serde(default)]
    message_id: String,
}

#[derive(Debug, Serialize)]
struct DoOutcome {
    account_id: String,
    ok: bool,
    result: Option<String>,
    error: Option<String>,
}

async fn do_action(State(state): State<AppState>, Json(req): Json<DoRequest>) -> Response {
    match req.account_id.filter(|id| !id.trim().is_empty()) {
        Some(account_id) => {
            match state
                .dispatcher
                .perform_action(&account_id, &req.action, &req.message_id)
                .await
            {
                Ok(result) => Json(serde_json::json!({ "result": result })).into_response(),
                Err(err) => error_response(&err),
            }
        }
        None => {
            let results = state
                .dispatcher
                .perform_action_all(&req.action, &req.message_id)
                .await;
            if results.is_empty() {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("no accounts supporting {} found", req.action),
                )
                    .into_response();
            }
            let outcomes: Vec<DoOutcome> = results
                .into_iter()
                .map(|(account_id, res)| match res {
                    Ok(result) => DoOutcome {
                        account_id,
                        ok: true,
                        result: Some(result),
                        error: None,
                    },
                    Err(err) => DoOutcome {
                        account_id,
                        ok: false,
                        result: None,
                        error: Some(err.to_string()),
                    },
                })
                .collect();
            Json(outcomes).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ShortenRequest {
    url: String,
}

async fn shorten_url(State(state): State<AppState>, Json(req): Json<ShortenRequest>) -> Response {
    let short = state.shortener.shorten(&req.url).await;
    Json(serde_json::json!({ "url": short })).into_response()
}

#[derive(Debug, Deserialize)]
struct RowsQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_rows(State(state): State<AppState>, Query(q): Query<RowsQuery>) -> Response {
    let rows = state.store.rows();
    let rows = match q.limit {
        Some(limit) if rows.len() > limit => rows[rows.len() - limit..].to_vec(),
        _ => rows,
    };
    Json(rows).into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "rows": state.store.len(),
        "accounts": state.accounts.len(),
        "unread": state.dispatcher.unread(),
        "protocols": state.protocols.names(),
    }))
    .into_response()
}

async fn features(State(state): State<AppState>, Path(protocol): Path<String>) -> Response {
    match state.protocols.features(&protocol) {
        Some(features) => Json(features).into_response(),
        None => (StatusCode::NOT_FOUND, format!("unknown protocol: {protocol}")).into_response(),
    }
}

/// Drop every row belonging to one account without removing the account
/// itself. Returns the number of rows deleted.
async fn purge_account(
    State(state): State<AppState>,
    Json(req): Json<AccountIdRequest>,
) -> Response {
    let purged = state.store.purge_by_account(&req.id);
    Json(serde_json::json!({ "purged": purged })).into_response()
}

async fn account_added(State(state): State<AppState>, Json(account): Json<Account>) -> Response {
    if account.id.trim().is_empty() || account.protocol.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "account needs id and protocol").into_response();
    }
    state.accounts.account_added(account);
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Deserialize)]
struct AccountIdRequest {
    id: String,
}

async fn account_removed(
    State(state): State<AppState>,
    Json(req): Json<AccountIdRequest>,
) -> Response {
    let removed = state.accounts.account_removed(&req.id).is_some();
    Json(serde_json::json!({ "removed": removed })).into_response()
}

async fn account_reauthorized(
    State(state): State<AppState>,
    Json(req): Json<AccountIdRequest>,
) -> Response {
    state.accounts.reauthorized(&req.id);
    StatusCode::NO_CONTENT.into_response()
}
