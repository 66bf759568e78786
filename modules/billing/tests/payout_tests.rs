//! Payout orchestration: derived balances, per-user serialization, transfer
//! failure handling, auto-withdrawal.

mod common;

use std::sync::atomic::Ordering;

use billing_rs::models::{
    CreatePurchaseRequest, CreatorSettings, PayoutMethod, PayoutStatus, TransactionType,
};
use billing_rs::whop::mock::MockGateway;
use billing_rs::{
    AutoWithdrawalOutcome, BillingError, BillingStore, PayoutRequestOutcome,
};
use uuid::Uuid;

/// Complete a pick sale so the creator earns `amount * 85%`.
async fn sell_pick(ctx: &common::TestContext, creator: Uuid, amount: i64) {
    let purchase = ctx
        .settlement
        .create_pending_purchase(CreatePurchaseRequest {
            user_id: Uuid::new_v4(),
            creator_id: creator,
            item_id: Uuid::new_v4(),
            amount,
            payment_method: None,
        })
        .await
        .unwrap();
    ctx.settlement
        .complete_purchase(&purchase.provider_payment_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn balance_is_earnings_minus_payouts() {
    let ctx = common::setup();
    let creator = common::seed_creator(&ctx.store).await;

    // $10.00 and $25.00 sales at 15% -> $8.50 + $21.25 earned
    sell_pick(&ctx, creator, 1000).await;
    sell_pick(&ctx, creator, 2500).await;
    assert_eq!(
        ctx.payouts.calculate_creator_balance(creator).await.unwrap(),
        2975
    );

    // $20.00 payout leaves $9.75
    let outcome = ctx
        .payouts
        .create_payout_request(creator, 2000)
        .await
        .unwrap();
    let PayoutRequestOutcome::Created(payout) = outcome else {
        panic!("expected payout to be created");
    };
    assert_eq!(payout.status, PayoutStatus::Processing);
    assert!(payout.provider_transfer_id.is_some());

    assert_eq!(
        ctx.payouts.calculate_creator_balance(creator).await.unwrap(),
        975
    );

    // A PAYOUT ledger entry documents the withdrawal
    let payouts: Vec<_> = ctx
        .store
        .list_transactions(&billing_rs::models::AdminTransactionQuery {
            user_id: Some(creator),
            transaction_type: Some(TransactionType::Payout),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].amount, 2000);
}

#[tokio::test]
async fn one_payout_in_flight_per_user() {
    let ctx = common::setup();
    let creator = common::seed_creator(&ctx.store).await;
    sell_pick(&ctx, creator, 10_000).await; // 8500 earned

    let first = ctx
        .payouts
        .create_payout_request(creator, 2000)
        .await
        .unwrap();
    assert!(matches!(first, PayoutRequestOutcome::Created(_)));

    // Second request while the first is still processing
    let second = ctx
        .payouts
        .create_payout_request(creator, 2000)
        .await
        .unwrap();
    assert!(matches!(second, PayoutRequestOutcome::AlreadyInFlight));

    // Only one transfer reached the provider
    assert_eq!(ctx.gateway.transfers.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn payout_validation_failures_create_no_rows() {
    let ctx = common::setup();
    let creator = common::seed_creator(&ctx.store).await;
    sell_pick(&ctx, creator, 1000).await; // 850 earned

    // Below the withdrawal minimum
    let err = ctx.payouts.create_payout_request(creator, 500).await.unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    // More than the balance
    let err = ctx.payouts.create_payout_request(creator, 5000).await.unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    // No payment account configured
    let stranger = Uuid::new_v4();
    let err = ctx.payouts.create_payout_request(stranger, 2000).await.unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let rows = ctx
        .store
        .list_payouts(&billing_rs::models::AdminPayoutQuery::default())
        .await
        .unwrap();
    assert!(rows.is_empty());
    assert_eq!(ctx.gateway.transfers.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_transfer_restores_balance() {
    let ctx = common::setup_with_gateway(MockGateway::new().with_failing_transfers());
    let creator = common::seed_creator(&ctx.store).await;
    sell_pick(&ctx, creator, 2000).await; // 1700 earned

    let err = ctx
        .payouts
        .create_payout_request(creator, 1700)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Provider(_)));

    // The row exists as FAILED and no longer counts against the balance
    let rows = ctx
        .store
        .list_payouts(&billing_rs::models::AdminPayoutQuery {
            user_id: Some(creator),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, PayoutStatus::Failed);

    assert_eq!(
        ctx.payouts.calculate_creator_balance(creator).await.unwrap(),
        1700
    );

    // And the user may try again
    let retry = ctx.payouts.create_payout_request(creator, 1700).await;
    assert!(matches!(retry, Err(BillingError::Provider(_))));
    assert_eq!(ctx.gateway.transfers.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn auto_withdrawal_triggers_at_threshold() {
    let ctx = common::setup();
    let creator = Uuid::new_v4();
    ctx.store
        .upsert_creator_settings(CreatorSettings {
            user_id: creator,
            provider_account_id: Some("acct_auto".to_string()),
            subscriptions_enabled: true,
            auto_withdraw_enabled: true,
            auto_withdraw_threshold: Some(5000),
            payout_method: PayoutMethod::Bank,
            payout_destination: Some("ba_123".to_string()),
        })
        .await
        .unwrap();

    // 850 earned: below the 5000 threshold
    sell_pick(&ctx, creator, 1000).await;
    let rows = ctx
        .store
        .list_payouts(&billing_rs::models::AdminPayoutQuery {
            user_id: Some(creator),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(rows.is_empty());

    // A big sale pushes the balance past the threshold; the completed
    // purchase itself triggers the withdrawal of the full balance.
    sell_pick(&ctx, creator, 6000).await; // + 5100 -> 5950
    let rows = ctx
        .store
        .list_payouts(&billing_rs::models::AdminPayoutQuery {
            user_id: Some(creator),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount, 5950);
    assert_eq!(rows[0].status, PayoutStatus::Processing);

    assert_eq!(
        ctx.payouts.calculate_creator_balance(creator).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn auto_withdrawal_outcomes_are_distinguishable() {
    let ctx = common::setup();

    // No settings row
    let outcome = ctx
        .payouts
        .check_auto_withdrawal(Uuid::new_v4())
        .await
        .unwrap();
    assert!(matches!(outcome, AutoWithdrawalOutcome::Disabled));

    // Enabled but below threshold
    let creator = Uuid::new_v4();
    ctx.store
        .upsert_creator_settings(CreatorSettings {
            user_id: creator,
            provider_account_id: Some("acct_x".to_string()),
            subscriptions_enabled: true,
            auto_withdraw_enabled: true,
            auto_withdraw_threshold: Some(9000),
            payout_method: PayoutMethod::Crypto,
            payout_destination: Some("0xabc".to_string()),
        })
        .await
        .unwrap();
    let outcome = ctx.payouts.check_auto_withdrawal(creator).await.unwrap();
    assert!(
        matches!(outcome, AutoWithdrawalOutcome::BelowThreshold { balance: 0, threshold: 9000 })
    );
}
