use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::metrics::Metrics;
use crate::models::{
    AdminPayoutQuery, AdminTransactionQuery, BalanceResponse, CancelSubscriptionRequest,
    CreatePayoutRequest, CreatePurchaseRequest, CreateSubscriptionRequest, CreatorSettings,
    ErrorResponse, Payout, Purchase, RefundRequest, Subscription, Transaction,
    TransactionListQuery, UpdateCreatorSettingsRequest,
};
use crate::services::{
    ConfigService, PayoutEngine, PayoutRequestOutcome, RefundOutcome, SettlementEngine,
    SubscriptionEngine,
};
use crate::store::{BillingStore, CompletionOutcome};
use crate::whop::webhook::verify_webhook_signature;
use crate::whop::types::WebhookEvent;
use crate::whop::PaymentGateway;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BillingStore>,
    pub settlement: SettlementEngine,
    pub subscriptions: SubscriptionEngine,
    pub payouts: PayoutEngine,
    pub config: ConfigService,
    pub metrics: Metrics,
    pub webhook_secret: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        webhook_secret: String,
    ) -> Self {
        Self {
            settlement: SettlementEngine::new(store.clone(), gateway.clone()),
            subscriptions: SubscriptionEngine::new(store.clone(), gateway.clone()),
            payouts: PayoutEngine::new(store.clone(), gateway.clone()),
            config: ConfigService::new(store.clone()),
            metrics: Metrics::new(),
            store,
            webhook_secret,
        }
    }
}

pub fn billing_router(state: AppState) -> Router {
    Router::new()
        // Purchases
        .route("/api/billing/purchases", post(create_purchase))
        .route("/api/billing/purchases/{id}", get(get_purchase))
        .route("/api/billing/purchases/{id}/refund", post(refund_purchase))
        // Subscriptions
        .route("/api/billing/subscriptions", post(create_subscription))
        .route("/api/billing/subscriptions/cancel", post(cancel_subscription))
        .route("/api/billing/creators/{creator_id}/stats", get(creator_stats))
        .route(
            "/api/billing/creators/{creator_id}/settings",
            get(get_creator_settings).put(update_creator_settings),
        )
        // Balances, ledger, payouts
        .route("/api/billing/balance/{user_id}", get(get_balance))
        .route("/api/billing/transactions/{user_id}", get(list_user_transactions))
        .route("/api/billing/payouts/{user_id}", get(list_user_payouts))
        .route("/api/billing/payouts", post(create_payout))
        // Webhooks
        .route("/api/billing/webhooks/whop", post(receive_whop_webhook))
        // Admin
        .route("/api/billing/config", get(get_config))
        .route("/api/billing/admin/transactions", get(admin_list_transactions))
        .route("/api/billing/admin/payouts", get(admin_list_payouts))
        // Operational
        .route("/api/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

// ============================================================================
// PURCHASE HANDLERS
// ============================================================================

/// POST /api/billing/purchases - Initiate a pick purchase
async fn create_purchase(
    State(state): State<AppState>,
    Json(req): Json<CreatePurchaseRequest>,
) -> Result<(StatusCode, Json<Purchase>), BillingError> {
    let result = state.settlement.create_pending_purchase(req).await;

    match &result {
        Ok(_) => state
            .metrics
            .billing_purchases_total
            .with_label_values(&["created"])
            .inc(),
        Err(BillingError::Validation(_)) => state
            .metrics
            .billing_purchases_total
            .with_label_values(&["rejected"])
            .inc(),
        Err(_) => state
            .metrics
            .billing_purchases_total
            .with_label_values(&["failed"])
            .inc(),
    }

    result.map(|p| (StatusCode::CREATED, Json(p)))
}

/// GET /api/billing/purchases/{id}
async fn get_purchase(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Purchase>, BillingError> {
    match state.store.find_purchase(id).await? {
        Some(purchase) => Ok(Json(purchase)),
        None => Err(BillingError::NotFound(format!("no purchase {}", id))),
    }
}

/// POST /api/billing/purchases/{id}/refund - Operator-initiated refund
async fn refund_purchase(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RefundRequest>,
) -> Result<Json<Purchase>, BillingError> {
    let purchase = state
        .settlement
        .process_refund(id, req.amount, req.reason.as_deref())
        .await?;

    state
        .metrics
        .billing_purchases_total
        .with_label_values(&["refunded"])
        .inc();

    Ok(Json(purchase))
}

// ============================================================================
// SUBSCRIPTION HANDLERS
// ============================================================================

/// POST /api/billing/subscriptions
async fn create_subscription(
    State(state): State<AppState>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<Subscription>), BillingError> {
    let result = state.subscriptions.create_subscription(req).await;

    let label = if result.is_ok() { "ok" } else { "error" };
    state
        .metrics
        .billing_subscriptions_total
        .with_label_values(&["create", label])
        .inc();

    result.map(|s| (StatusCode::CREATED, Json(s)))
}

/// POST /api/billing/subscriptions/cancel
async fn cancel_subscription(
    State(state): State<AppState>,
    Json(req): Json<CancelSubscriptionRequest>,
) -> Result<Json<Subscription>, BillingError> {
    let result = state
        .subscriptions
        .cancel_subscription(req.subscriber_id, req.creator_id, req.cancel_at_period_end)
        .await;

    let label = if result.is_ok() { "ok" } else { "error" };
    state
        .metrics
        .billing_subscriptions_total
        .with_label_values(&["cancel", label])
        .inc();

    result.map(Json)
}

/// GET /api/billing/creators/{creator_id}/stats
async fn creator_stats(
    State(state): State<AppState>,
    Path(creator_id): Path<Uuid>,
) -> Result<Json<crate::models::CreatorStats>, BillingError> {
    let stats = state.subscriptions.get_creator_stats(creator_id).await?;
    Ok(Json(stats))
}

/// GET /api/billing/creators/{creator_id}/settings
async fn get_creator_settings(
    State(state): State<AppState>,
    Path(creator_id): Path<Uuid>,
) -> Result<Json<CreatorSettings>, BillingError> {
    match state.store.get_creator_settings(creator_id).await? {
        Some(settings) => Ok(Json(settings)),
        None => Err(BillingError::NotFound(format!(
            "no settings for creator {}",
            creator_id
        ))),
    }
}

/// PUT /api/billing/creators/{creator_id}/settings
async fn update_creator_settings(
    State(state): State<AppState>,
    Path(creator_id): Path<Uuid>,
    Json(req): Json<UpdateCreatorSettingsRequest>,
) -> Result<Json<CreatorSettings>, BillingError> {
    if let Some(threshold) = req.auto_withdraw_threshold {
        if threshold <= 0 {
            return Err(BillingError::Validation(
                "auto_withdraw_threshold must be positive".to_string(),
            ));
        }
    }

    let settings = state
        .store
        .upsert_creator_settings(CreatorSettings {
            user_id: creator_id,
            provider_account_id: req.provider_account_id,
            subscriptions_enabled: req.subscriptions_enabled,
            auto_withdraw_enabled: req.auto_withdraw_enabled,
            auto_withdraw_threshold: req.auto_withdraw_threshold,
            payout_method: req.payout_method,
            payout_destination: req.payout_destination,
        })
        .await?;

    Ok(Json(settings))
}

// ============================================================================
// BALANCE / LEDGER / PAYOUT HANDLERS
// ============================================================================

/// GET /api/billing/balance/{user_id}
async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<BalanceResponse>, BillingError> {
    let balance = state.payouts.calculate_creator_balance(user_id).await?;
    Ok(Json(BalanceResponse { user_id, balance }))
}

/// GET /api/billing/transactions/{user_id}
async fn list_user_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<TransactionListQuery>,
) -> Result<Json<Vec<Transaction>>, BillingError> {
    let transactions = state
        .store
        .list_transactions(&AdminTransactionQuery {
            user_id: Some(user_id),
            transaction_type: query.transaction_type,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;
    Ok(Json(transactions))
}

/// GET /api/billing/payouts/{user_id}
async fn list_user_payouts(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<Payout>>, BillingError> {
    let payouts = state
        .store
        .list_payouts(&AdminPayoutQuery {
            user_id: Some(user_id),
            status: None,
            limit: None,
            offset: None,
        })
        .await?;
    Ok(Json(payouts))
}

/// POST /api/billing/payouts - Manual payout request
async fn create_payout(
    State(state): State<AppState>,
    Json(req): Json<CreatePayoutRequest>,
) -> Result<(StatusCode, Json<Payout>), BillingError> {
    let result = state
        .payouts
        .create_payout_request(req.user_id, req.amount)
        .await;

    match result {
        Ok(PayoutRequestOutcome::Created(payout)) => {
            state
                .metrics
                .billing_payouts_total
                .with_label_values(&["created"])
                .inc();
            Ok((StatusCode::CREATED, Json(payout)))
        }
        Ok(PayoutRequestOutcome::AlreadyInFlight) => {
            state
                .metrics
                .billing_payouts_total
                .with_label_values(&["in_flight"])
                .inc();
            state
                .metrics
                .billing_idempotent_skips_total
                .with_label_values(&["payout"])
                .inc();
            Err(BillingError::Validation(
                "a payout is already in flight for this user".to_string(),
            ))
        }
        Err(e) => {
            let label = if matches!(e, BillingError::Validation(_)) {
                "rejected"
            } else {
                "failed"
            };
            state
                .metrics
                .billing_payouts_total
                .with_label_values(&[label])
                .inc();
            Err(e)
        }
    }
}

// ============================================================================
// WEBHOOK HANDLERS
// ============================================================================

/// POST /api/billing/webhooks/whop - Signed provider webhook receiver.
///
/// The signature is verified over the raw body before anything is parsed;
/// a rejected delivery has zero side effects. Handlers are idempotent, so
/// Whop may redeliver any event at will.
async fn receive_whop_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<JsonValue>, (StatusCode, Json<ErrorResponse>)> {
    let signature_header = headers
        .get("whop-signature")
        .and_then(|v| v.to_str().ok());

    if let Err(e) = verify_webhook_signature(&body, signature_header, &state.webhook_secret) {
        tracing::warn!(error = %e, "Webhook signature verification failed");
        state
            .metrics
            .billing_webhook_events_total
            .with_label_values(&["unknown", "rejected"])
            .inc();
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new(
                "invalid_signature",
                "Webhook signature verification failed",
            )),
        ));
    }

    let event: WebhookEvent = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(error = %e, "Webhook payload is not valid JSON");
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("invalid_payload", "Malformed webhook payload")),
        )
    })?;

    match process_webhook_event(&state, &event).await {
        Ok(processed) => {
            let result = if processed { "processed" } else { "skipped" };
            state
                .metrics
                .billing_webhook_events_total
                .with_label_values(&[event.event_type.as_str(), result])
                .inc();
            Ok(Json(serde_json::json!({ "received": true })))
        }
        Err(e) => {
            state
                .metrics
                .billing_webhook_events_total
                .with_label_values(&[event.event_type.as_str(), "error"])
                .inc();
            tracing::error!(
                event_type = %event.event_type,
                error = %e,
                "Webhook processing failed"
            );
            Err((
                e.status_code(),
                Json(ErrorResponse::new(e.code(), e.to_string())),
            ))
        }
    }
}

/// Dispatch one verified webhook event. Returns true when the event caused a
/// write, false when idempotency suppressed it or the type is unhandled.
async fn process_webhook_event(state: &AppState, event: &WebhookEvent) -> BillingResult<bool> {
    tracing::info!(event_type = %event.event_type, "Processing webhook event");

    match event.event_type.as_str() {
        "payment.completed" => {
            let payment_id = event_str(event, "id")?;
            match state.settlement.complete_purchase(payment_id).await? {
                CompletionOutcome::Completed(_) => {
                    state
                        .metrics
                        .billing_purchases_total
                        .with_label_values(&["completed"])
                        .inc();
                    Ok(true)
                }
                CompletionOutcome::AlreadyCompleted(_) => {
                    state
                        .metrics
                        .billing_idempotent_skips_total
                        .with_label_values(&["purchase_completion"])
                        .inc();
                    Ok(false)
                }
            }
        }
        "payment.failed" => {
            let payment_id = event_str(event, "id")?;
            let reason = event.data.get("failure_message").and_then(|v| v.as_str());
            state.settlement.fail_purchase(payment_id, reason).await?;
            state
                .metrics
                .billing_purchases_total
                .with_label_values(&["failed"])
                .inc();
            Ok(true)
        }
        "subscription.activated" => {
            let subscription_id = event_str(event, "id")?;
            let period_end = event_period_end(event);
            let (_, outcome) = state
                .subscriptions
                .activate_subscription(subscription_id, period_end)
                .await?;
            Ok(record_billing_metrics(state, "activate", outcome))
        }
        "subscription.renewed" => {
            let subscription_id = event_str(event, "id")?;
            let period_end = event_period_end(event);
            let (_, outcome) = state
                .subscriptions
                .renew_subscription(subscription_id, period_end)
                .await?;
            Ok(record_billing_metrics(state, "renew", outcome))
        }
        "subscription.canceled" => {
            let subscription_id = event_str(event, "id")?;
            state
                .subscriptions
                .deactivate_subscription(subscription_id)
                .await?;
            state
                .metrics
                .billing_subscriptions_total
                .with_label_values(&["deactivate", "ok"])
                .inc();
            Ok(true)
        }
        "refund.completed" => {
            let payment_id = event_str(event, "payment_id")?;
            let amount = event.data.get("amount").and_then(|v| v.as_i64());
            let refund_id = event
                .data
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            match state
                .settlement
                .record_provider_refund(payment_id, amount, refund_id)
                .await?
            {
                RefundOutcome::Applied(_) => {
                    state
                        .metrics
                        .billing_purchases_total
                        .with_label_values(&["refunded"])
                        .inc();
                    Ok(true)
                }
                RefundOutcome::AlreadyRefunded(_) => {
                    state
                        .metrics
                        .billing_idempotent_skips_total
                        .with_label_values(&["refund"])
                        .inc();
                    Ok(false)
                }
            }
        }
        other => {
            tracing::warn!(event_type = %other, "Unhandled webhook event type");
            Ok(false)
        }
    }
}

fn record_billing_metrics(
    state: &AppState,
    action: &str,
    outcome: crate::services::BillingOutcome,
) -> bool {
    state
        .metrics
        .billing_subscriptions_total
        .with_label_values(&[action, "ok"])
        .inc();
    match outcome {
        crate::services::BillingOutcome::Billed => true,
        crate::services::BillingOutcome::AlreadyBilled => {
            state
                .metrics
                .billing_idempotent_skips_total
                .with_label_values(&["billing_period"])
                .inc();
            false
        }
    }
}

fn event_str<'a>(event: &'a WebhookEvent, key: &str) -> BillingResult<&'a str> {
    event
        .data
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            BillingError::Validation(format!(
                "webhook event {} is missing data.{}",
                event.event_type, key
            ))
        })
}

fn event_period_end(event: &WebhookEvent) -> Option<DateTime<Utc>> {
    event
        .data
        .get("current_period_end")
        .and_then(|v| v.as_i64())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

// ============================================================================
// ADMIN / OPERATIONAL HANDLERS
// ============================================================================

/// GET /api/billing/config
async fn get_config(
    State(state): State<AppState>,
) -> Result<Json<crate::models::PaymentConfiguration>, BillingError> {
    let config = state.config.get_configuration().await?;
    Ok(Json(config))
}

/// GET /api/billing/admin/transactions
async fn admin_list_transactions(
    State(state): State<AppState>,
    Query(query): Query<AdminTransactionQuery>,
) -> Result<Json<Vec<Transaction>>, BillingError> {
    let transactions = state.store.list_transactions(&query).await?;
    Ok(Json(transactions))
}

/// GET /api/billing/admin/payouts
async fn admin_list_payouts(
    State(state): State<AppState>,
    Query(query): Query<AdminPayoutQuery>,
) -> Result<Json<Vec<Payout>>, BillingError> {
    let payouts = state.store.list_payouts(&query).await?;
    Ok(Json(payouts))
}

async fn health() -> Json<JsonValue> {
    Json(serde_json::json!({
        "status": "healthy",
        "module": "billing",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response()
        }
    }
}
