use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::apple::{self, TokenShape};
use crate::db::{Status, StoreKind, SubscriptionUpdate};
use crate::error::AppError;
use crate::google;
use crate::state::AppState;
use crate::util;

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub purchase_token: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub store: Option<StoreKind>,
}

#[derive(Debug, Default, Serialize)]
pub struct VerifyResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_sandbox: Option<bool>,
}

pub async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<VerifyResponse>, AppError> {
    // 1. Auth gate — nothing upstream is called without the shared secret.
    let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if state.config.api_secret.is_empty() || presented != Some(state.config.api_secret.as_str()) {
        return Err(AppError::Unauthorized);
    }

    // 2. Parse + validate
    let req: VerifyRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {e}")))?;
    if req.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("user_id required".into()));
    }
    let store = req.store.unwrap_or(StoreKind::GooglePlay);

    // 3. Token resolution — newest stored row for the user when absent.
    let (purchase_token, product_id) = match req.purchase_token {
        Some(token) if !token.trim().is_empty() => (token, req.product_id),
        _ => {
            let row = state
                .db
                .latest_subscription(&req.user_id, store)
                .await?
                .ok_or(AppError::NoSubscriptionRow)?;
            let token = row.purchase_token.ok_or(AppError::NoSubscriptionRow)?;
            (token, req.product_id.or(row.product_id))
        }
    };

    info!(user_id = %req.user_id, store = %store, "reconciling subscription");

    // 4. Per-store verification + persistence
    let resp = match store {
        StoreKind::GooglePlay => reconcile_google(&state, &purchase_token, product_id).await?,
        StoreKind::AppleAppStore => reconcile_apple(&state, &purchase_token, product_id).await?,
    };
    Ok(Json(resp))
}

// ─── google_play ─────────────────────────────────────────────────────

async fn reconcile_google(
    state: &AppState,
    purchase_token: &str,
    product_id: Option<String>,
) -> Result<VerifyResponse, AppError> {
    let access_token = google::fetch_access_token(&state.http_client, &state.config).await?;
    let body =
        google::fetch_subscription(&state.http_client, &state.config, &access_token, purchase_token)
            .await?;
    let v = google::normalize(&body);

    let update = SubscriptionUpdate {
        status: Some(v.status),
        product_id,
        start_date: v.start_date.clone(),
        end_date: v.end_date.clone(),
        last_verified_date: util::now_iso(),
        is_sandbox: Some(v.is_sandbox),
        canceled_date_period_end: Some(v.canceled_period_end),
    };
    state.db.update_subscription(purchase_token, &update).await?;

    Ok(VerifyResponse {
        ok: true,
        status: Some(v.status),
        active: Some(v.status == Status::Active),
        start_date: v.start_date,
        end_date: v.end_date,
        is_sandbox: Some(v.is_sandbox),
        ..Default::default()
    })
}

// ─── apple_app_store ─────────────────────────────────────────────────

async fn reconcile_apple(
    state: &AppState,
    purchase_token: &str,
    product_id: Option<String>,
) -> Result<VerifyResponse, AppError> {
    match apple::classify_token(purchase_token) {
        TokenShape::StoreKit2 {
            original_transaction_id,
            product_id: token_product,
        } => {
            let product_id = product_id.or(token_product);
            reconcile_storekit(state, purchase_token, &original_transaction_id, product_id).await
        }
        TokenShape::Receipt => reconcile_receipt(state, purchase_token, product_id).await,
        TokenShape::Invalid => {
            // Unusable token says nothing about entitlement; record the
            // attempt only.
            state
                .db
                .update_subscription(purchase_token, &SubscriptionUpdate::touch())
                .await?;
            Ok(VerifyResponse {
                ok: false,
                error: Some("invalid token format".into()),
                ..Default::default()
            })
        }
    }
}

async fn reconcile_storekit(
    state: &AppState,
    purchase_token: &str,
    original_transaction_id: &str,
    product_id: Option<String>,
) -> Result<VerifyResponse, AppError> {
    let asc_token = apple::mint_asc_token(&state.config)?;
    let statuses = apple::fetch_subscription_statuses(
        &state.http_client,
        &state.config,
        &asc_token,
        original_transaction_id,
    )
    .await?;

    let candidates = apple::extract_candidates(&statuses.body);
    let Some(latest) = apple::select_latest(&candidates, product_id.as_deref()) else {
        state
            .db
            .update_subscription(
                purchase_token,
                &SubscriptionUpdate::downgrade(Status::Pending, statuses.sandbox),
            )
            .await?;
        return Ok(VerifyResponse {
            ok: false,
            error: Some("no-candidates".into()),
            source: Some("asc"),
            is_sandbox: Some(statuses.sandbox),
            ..Default::default()
        });
    };

    let v = apple::normalize_candidate(&latest);
    persist_apple(state, purchase_token, product_id, v, statuses.sandbox).await
}

async fn reconcile_receipt(
    state: &AppState,
    purchase_token: &str,
    product_id: Option<String>,
) -> Result<VerifyResponse, AppError> {
    let outcome =
        apple::verify_receipt(&state.http_client, &state.config, purchase_token).await?;

    let receipt_status = outcome
        .body
        .get("status")
        .and_then(|v| v.as_i64())
        .unwrap_or(-1);
    if receipt_status != 0 {
        state
            .db
            .update_subscription(
                purchase_token,
                &SubscriptionUpdate::downgrade(Status::Pending, outcome.sandbox),
            )
            .await?;
        return Err(AppError::StoreVerification {
            source: "apple",
            status: Some(receipt_status),
            detail: "verifyReceipt rejected the receipt".into(),
        });
    }

    let infos = outcome
        .body
        .get("latest_receipt_info")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    // Product filter falls back to the full list when it matches nothing.
    let selected = apple::select_latest(&infos, product_id.as_deref())
        .or_else(|| apple::select_latest(&infos, None));

    let Some(latest) = selected else {
        state
            .db
            .update_subscription(
                purchase_token,
                &SubscriptionUpdate::downgrade(Status::Expired, outcome.sandbox),
            )
            .await?;
        return Ok(VerifyResponse {
            ok: true,
            status: Some(Status::Expired),
            active: Some(false),
            is_sandbox: Some(outcome.sandbox),
            ..Default::default()
        });
    };

    let v = apple::normalize_candidate(&latest);
    persist_apple(state, purchase_token, product_id, v, outcome.sandbox).await
}

async fn persist_apple(
    state: &AppState,
    purchase_token: &str,
    product_id: Option<String>,
    v: apple::AppleVerification,
    sandbox: bool,
) -> Result<VerifyResponse, AppError> {
    let update = SubscriptionUpdate {
        status: Some(v.status),
        product_id: v.product_id.clone().or(product_id),
        start_date: v.start_date.clone(),
        end_date: v.end_date.clone(),
        last_verified_date: util::now_iso(),
        is_sandbox: Some(sandbox),
        ..Default::default()
    };
    state.db.update_subscription(purchase_token, &update).await?;

    Ok(VerifyResponse {
        ok: true,
        status: Some(v.status),
        active: Some(v.active),
        start_date: v.start_date,
        end_date: v.end_date,
        is_sandbox: Some(sandbox),
        ..Default::default()
    })
}
