//! Subscription lifecycle: creation guards, activation, renewal billing
//! idempotency, cancellation semantics, derived stats.

mod common;

use billing_rs::models::{
    AdminTransactionQuery, CreateSubscriptionRequest, CreatorSettings, PayoutMethod,
    SubscriptionStatus, TransactionType,
};
use billing_rs::{BillingError, BillingOutcome, BillingStore};
use uuid::Uuid;

fn subscribe(subscriber_id: Uuid, creator_id: Uuid, amount: i64) -> CreateSubscriptionRequest {
    CreateSubscriptionRequest {
        subscriber_id,
        creator_id,
        amount,
    }
}

async fn transactions_for(
    store: &billing_rs::store::MemoryStore,
    user_id: Uuid,
) -> Vec<billing_rs::models::Transaction> {
    store
        .list_transactions(&AdminTransactionQuery {
            user_id: Some(user_id),
            ..Default::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn create_and_activate_bills_first_period() {
    let ctx = common::setup();
    let subscriber = Uuid::new_v4();
    let creator = common::seed_creator(&ctx.store).await;

    // $9.99/month at the default 15% fee
    let subscription = ctx
        .subscriptions
        .create_subscription(subscribe(subscriber, creator, 999))
        .await
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Pending);
    assert_eq!(subscription.platform_fee, 150);
    assert!(subscription.current_period_end > subscription.current_period_start);

    // Pending subscriptions produce no revenue
    assert!(transactions_for(&ctx.store, creator).await.is_empty());

    let (active, outcome) = ctx
        .subscriptions
        .activate_subscription(&subscription.provider_subscription_id, None)
        .await
        .unwrap();
    assert_eq!(active.status, SubscriptionStatus::Active);
    assert_eq!(outcome, BillingOutcome::Billed);

    let subscriber_txns = transactions_for(&ctx.store, subscriber).await;
    assert_eq!(subscriber_txns.len(), 1);
    assert_eq!(subscriber_txns[0].transaction_type, TransactionType::Subscription);
    assert_eq!(subscriber_txns[0].amount, 999);

    let creator_txns = transactions_for(&ctx.store, creator).await;
    assert_eq!(creator_txns.len(), 1);
    assert_eq!(
        creator_txns[0].transaction_type,
        TransactionType::SubscriptionRevenue
    );
    assert_eq!(creator_txns[0].amount, 849);
}

#[tokio::test]
async fn activation_redelivery_bills_once()  {
    let ctx = common::setup();
    let subscriber = Uuid::new_v4();
    let creator = common::seed_creator(&ctx.store).await;

    let subscription = ctx
        .subscriptions
        .create_subscription(subscribe(subscriber, creator, 999))
        .await
        .unwrap();

    let (_, first) = ctx
        .subscriptions
        .activate_subscription(&subscription.provider_subscription_id, None)
        .await
        .unwrap();
    assert_eq!(first, BillingOutcome::Billed);

    let (active, second) = ctx
        .subscriptions
        .activate_subscription(&subscription.provider_subscription_id, None)
        .await
        .unwrap();
    assert_eq!(active.status, SubscriptionStatus::Active);
    assert_eq!(second, BillingOutcome::AlreadyBilled);

    // 2 entries total (1 subscriber + 1 creator), not 4
    assert_eq!(transactions_for(&ctx.store, subscriber).await.len(), 1);
    assert_eq!(transactions_for(&ctx.store, creator).await.len(), 1);
}

#[tokio::test]
async fn renewal_advances_period_and_bills_again() {
    let ctx = common::setup();
    let subscriber = Uuid::new_v4();
    let creator = common::seed_creator(&ctx.store).await;

    let subscription = ctx
        .subscriptions
        .create_subscription(subscribe(subscriber, creator, 999))
        .await
        .unwrap();
    ctx.subscriptions
        .activate_subscription(&subscription.provider_subscription_id, None)
        .await
        .unwrap();

    let first_period_end = ctx
        .store
        .find_subscription_by_provider_id(&subscription.provider_subscription_id)
        .await
        .unwrap()
        .unwrap()
        .current_period_end;

    let (renewed, outcome) = ctx
        .subscriptions
        .renew_subscription(&subscription.provider_subscription_id, None)
        .await
        .unwrap();
    assert_eq!(outcome, BillingOutcome::Billed);
    // Old period end becomes the new period start
    assert_eq!(renewed.current_period_start, first_period_end);
    assert!(renewed.current_period_end > first_period_end);

    // Redelivered renewal webhook writes nothing new
    let (_, replay) = ctx
        .subscriptions
        .renew_subscription(
            &subscription.provider_subscription_id,
            Some(renewed.current_period_end),
        )
        .await
        .unwrap();
    assert_eq!(replay, BillingOutcome::AlreadyBilled);

    // Two billed periods -> two revenue entries of 849 each
    let revenue: i64 = transactions_for(&ctx.store, creator)
        .await
        .iter()
        .filter(|t| t.transaction_type == TransactionType::SubscriptionRevenue)
        .map(|t| t.amount)
        .sum();
    assert_eq!(revenue, 1698);

    // MRR counts the subscription once, at full price
    let stats = ctx.subscriptions.get_creator_stats(creator).await.unwrap();
    assert_eq!(stats.active_subscribers, 1);
    assert_eq!(stats.monthly_recurring_revenue, 999);
    assert_eq!(stats.average_subscription_value, 999);
}

#[tokio::test]
async fn one_active_subscription_per_pair() {
    let ctx = common::setup();
    let subscriber = Uuid::new_v4();
    let creator = common::seed_creator(&ctx.store).await;

    let subscription = ctx
        .subscriptions
        .create_subscription(subscribe(subscriber, creator, 999))
        .await
        .unwrap();
    ctx.subscriptions
        .activate_subscription(&subscription.provider_subscription_id, None)
        .await
        .unwrap();

    let err = ctx
        .subscriptions
        .create_subscription(subscribe(subscriber, creator, 999))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    // After cancellation the pair may re-subscribe
    ctx.subscriptions
        .cancel_subscription(subscriber, creator, false)
        .await
        .unwrap();
    let renewed = ctx
        .subscriptions
        .create_subscription(subscribe(subscriber, creator, 1499))
        .await
        .unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Pending);
    assert_eq!(renewed.amount, 1499);
}

#[tokio::test]
async fn rejects_self_subscription_and_unconfigured_creators() {
    let ctx = common::setup();
    let user = Uuid::new_v4();

    let err = ctx
        .subscriptions
        .create_subscription(subscribe(user, user, 999))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    // Creator with no settings row at all
    let err = ctx
        .subscriptions
        .create_subscription(subscribe(user, Uuid::new_v4(), 999))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    // Creator with subscriptions switched off
    let disabled = Uuid::new_v4();
    ctx.store
        .upsert_creator_settings(CreatorSettings {
            user_id: disabled,
            provider_account_id: Some("acct_disabled".to_string()),
            subscriptions_enabled: false,
            auto_withdraw_enabled: false,
            auto_withdraw_threshold: None,
            payout_method: PayoutMethod::Bank,
            payout_destination: None,
        })
        .await
        .unwrap();
    let err = ctx
        .subscriptions
        .create_subscription(subscribe(user, disabled, 999))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    // Creator without a provider account
    let no_account = Uuid::new_v4();
    ctx.store
        .upsert_creator_settings(CreatorSettings {
            user_id: no_account,
            provider_account_id: None,
            subscriptions_enabled: true,
            auto_withdraw_enabled: false,
            auto_withdraw_threshold: None,
            payout_method: PayoutMethod::Bank,
            payout_destination: None,
        })
        .await
        .unwrap();
    let err = ctx
        .subscriptions
        .create_subscription(subscribe(user, no_account, 999))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

#[tokio::test]
async fn rejects_out_of_range_subscription_price() {
    let ctx = common::setup();
    let creator = common::seed_creator(&ctx.store).await;

    for amount in [498, 100_000] {
        let err = ctx
            .subscriptions
            .create_subscription(subscribe(Uuid::new_v4(), creator, amount))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}

#[tokio::test]
async fn cancel_at_period_end_keeps_subscription_active() {
    let ctx = common::setup();
    let subscriber = Uuid::new_v4();
    let creator = common::seed_creator(&ctx.store).await;

    let subscription = ctx
        .subscriptions
        .create_subscription(subscribe(subscriber, creator, 999))
        .await
        .unwrap();
    ctx.subscriptions
        .activate_subscription(&subscription.provider_subscription_id, None)
        .await
        .unwrap();

    let flagged = ctx
        .subscriptions
        .cancel_subscription(subscriber, creator, true)
        .await
        .unwrap();
    assert_eq!(flagged.status, SubscriptionStatus::Active);
    assert!(flagged.cancel_at_period_end);
    assert!(flagged.canceled_at.is_some());

    // Period lapses: the provider sends the hard cancel
    let canceled = ctx
        .subscriptions
        .deactivate_subscription(&subscription.provider_subscription_id)
        .await
        .unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
}

#[tokio::test]
async fn immediate_cancel_and_stats() {
    let ctx = common::setup();
    let creator = common::seed_creator(&ctx.store).await;

    // Three subscribers, one cancels immediately
    let mut provider_ids = Vec::new();
    for _ in 0..3 {
        let subscriber = Uuid::new_v4();
        let s = ctx
            .subscriptions
            .create_subscription(subscribe(subscriber, creator, 999))
            .await
            .unwrap();
        ctx.subscriptions
            .activate_subscription(&s.provider_subscription_id, None)
            .await
            .unwrap();
        provider_ids.push((subscriber, s.provider_subscription_id));
    }

    let (first_subscriber, _) = &provider_ids[0];
    let canceled = ctx
        .subscriptions
        .cancel_subscription(*first_subscriber, creator, false)
        .await
        .unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);

    let stats = ctx.subscriptions.get_creator_stats(creator).await.unwrap();
    assert_eq!(stats.active_subscribers, 2);
    assert_eq!(stats.monthly_recurring_revenue, 1998);
    assert_eq!(stats.average_subscription_value, 999);

    // Canceling again is a validation error, not silent
    let err = ctx
        .subscriptions
        .cancel_subscription(*first_subscriber, creator, false)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));
}

#[tokio::test]
async fn deactivation_is_idempotent() {
    let ctx = common::setup();
    let subscriber = Uuid::new_v4();
    let creator = common::seed_creator(&ctx.store).await;

    let subscription = ctx
        .subscriptions
        .create_subscription(subscribe(subscriber, creator, 999))
        .await
        .unwrap();
    ctx.subscriptions
        .activate_subscription(&subscription.provider_subscription_id, None)
        .await
        .unwrap();

    let first = ctx
        .subscriptions
        .deactivate_subscription(&subscription.provider_subscription_id)
        .await
        .unwrap();
    let canceled_at = first.canceled_at;
    assert!(canceled_at.is_some());

    let second = ctx
        .subscriptions
        .deactivate_subscription(&subscription.provider_subscription_id)
        .await
        .unwrap();
    assert_eq!(second.status, SubscriptionStatus::Canceled);
    assert_eq!(second.canceled_at, canceled_at);
}
