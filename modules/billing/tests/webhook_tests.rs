//! Webhook receiver: signature enforcement over the raw body and idempotent
//! event dispatch, exercised through the full axum router.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use billing_rs::models::{AdminTransactionQuery, CreatePurchaseRequest, PurchaseStatus};
use billing_rs::whop::webhook::sign_payload;
use billing_rs::{AppState, BillingStore, PaymentGateway};
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "whsec_test";

fn test_app(ctx: &common::TestContext) -> Router {
    let store: Arc<dyn BillingStore> = ctx.store.clone();
    let gateway: Arc<dyn PaymentGateway> = Arc::new(ctx.gateway.clone());
    billing_rs::billing_router(AppState::new(store, gateway, SECRET.to_string()))
}

fn signed_request(body: &str) -> Request<Body> {
    let header = sign_payload(body.as_bytes(), "1700000000", SECRET);
    Request::builder()
        .method("POST")
        .uri("/api/billing/webhooks/whop")
        .header("content-type", "application/json")
        .header("whop-signature", header)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn pending_purchase(ctx: &common::TestContext, creator: Uuid) -> billing_rs::models::Purchase {
    ctx.settlement
        .create_pending_purchase(CreatePurchaseRequest {
            user_id: Uuid::new_v4(),
            creator_id: creator,
            item_id: Uuid::new_v4(),
            amount: 500,
            payment_method: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn rejects_unsigned_delivery_with_no_side_effects() {
    let ctx = common::setup();
    let creator = common::seed_creator(&ctx.store).await;
    let purchase = pending_purchase(&ctx, creator).await;
    let app = test_app(&ctx);

    let body = format!(
        r#"{{"type":"payment.completed","data":{{"id":"{}"}}}}"#,
        purchase.provider_payment_id
    );

    // Missing header
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/billing/webhooks/whop")
                .header("content-type", "application/json")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong secret
    let bad_header = sign_payload(body.as_bytes(), "1700000000", "whsec_wrong");
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/billing/webhooks/whop")
                .header("content-type", "application/json")
                .header("whop-signature", bad_header)
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Tampered body under a signature for different content
    let header = sign_payload(b"something else", "1700000000", SECRET);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/billing/webhooks/whop")
                .header("content-type", "application/json")
                .header("whop-signature", header)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // The purchase was never touched
    let unchanged = ctx
        .store
        .find_purchase(purchase.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.status, PurchaseStatus::Pending);
    let txns = ctx
        .store
        .list_transactions(&AdminTransactionQuery::default())
        .await
        .unwrap();
    assert!(txns.is_empty());
}

#[tokio::test]
async fn payment_completed_settles_and_redelivery_is_safe() {
    let ctx = common::setup();
    let creator = common::seed_creator(&ctx.store).await;
    let purchase = pending_purchase(&ctx, creator).await;
    let app = test_app(&ctx);

    let body = format!(
        r#"{{"type":"payment.completed","data":{{"id":"{}"}}}}"#,
        purchase.provider_payment_id
    );

    let response = app.clone().oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let settled = ctx.store.find_purchase(purchase.id).await.unwrap().unwrap();
    assert_eq!(settled.status, PurchaseStatus::Completed);

    // Redeliver the exact same event twice more
    for _ in 0..2 {
        let response = app.clone().oneshot(signed_request(&body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let txns = ctx
        .store
        .list_transactions(&AdminTransactionQuery::default())
        .await
        .unwrap();
    assert_eq!(txns.len(), 3);
}

#[tokio::test]
async fn payment_failed_marks_purchase_failed() {
    let ctx = common::setup();
    let creator = common::seed_creator(&ctx.store).await;
    let purchase = pending_purchase(&ctx, creator).await;
    let app = test_app(&ctx);

    let body = format!(
        r#"{{"type":"payment.failed","data":{{"id":"{}","failure_message":"card_declined"}}}}"#,
        purchase.provider_payment_id
    );

    let response = app.oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let failed = ctx.store.find_purchase(purchase.id).await.unwrap().unwrap();
    assert_eq!(failed.status, PurchaseStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("card_declined"));
}

#[tokio::test]
async fn refund_completed_records_provider_refund() {
    let ctx = common::setup();
    let creator = common::seed_creator(&ctx.store).await;
    let purchase = pending_purchase(&ctx, creator).await;
    ctx.settlement
        .complete_purchase(&purchase.provider_payment_id)
        .await
        .unwrap();
    let app = test_app(&ctx);

    let body = format!(
        r#"{{"type":"refund.completed","data":{{"id":"re_1","payment_id":"{}","amount":500}}}}"#,
        purchase.provider_payment_id
    );

    let response = app.clone().oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let refunded = ctx.store.find_purchase(purchase.id).await.unwrap().unwrap();
    assert_eq!(refunded.status, PurchaseStatus::Refunded);

    // Redelivery is absorbed
    let response = app.oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn subscription_events_flow_through_router() {
    let ctx = common::setup();
    let creator = common::seed_creator(&ctx.store).await;
    let subscription = ctx
        .subscriptions
        .create_subscription(billing_rs::models::CreateSubscriptionRequest {
            subscriber_id: Uuid::new_v4(),
            creator_id: creator,
            amount: 999,
        })
        .await
        .unwrap();
    let app = test_app(&ctx);

    let body = format!(
        r#"{{"type":"subscription.activated","data":{{"id":"{}"}}}}"#,
        subscription.provider_subscription_id
    );
    let response = app.clone().oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let active = ctx
        .store
        .find_subscription_by_provider_id(&subscription.provider_subscription_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.status, billing_rs::models::SubscriptionStatus::Active);

    let body = format!(
        r#"{{"type":"subscription.canceled","data":{{"id":"{}"}}}}"#,
        subscription.provider_subscription_id
    );
    let response = app.oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let canceled = ctx
        .store
        .find_subscription_by_provider_id(&subscription.provider_subscription_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        canceled.status,
        billing_rs::models::SubscriptionStatus::Canceled
    );
}

#[tokio::test]
async fn unknown_event_type_is_acknowledged() {
    let ctx = common::setup();
    let app = test_app(&ctx);

    let body = r#"{"type":"membership.went_valid","data":{"id":"mem_1"}}"#;
    let response = app.oneshot(signed_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn malformed_payload_is_bad_request() {
    let ctx = common::setup();
    let app = test_app(&ctx);

    let body = "not json at all";
    let response = app.oneshot(signed_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_payment_id_is_not_found() {
    let ctx = common::setup();
    let app = test_app(&ctx);

    let body = r#"{"type":"payment.completed","data":{"id":"mock_pay_missing"}}"#;
    let response = app.oneshot(signed_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
