//! Shared fixtures: engines wired to the in-memory store and the mock
//! payment gateway, so every test runs hermetically.

use std::sync::Arc;

use billing_rs::models::{CreatorSettings, PayoutMethod};
use billing_rs::store::MemoryStore;
use billing_rs::whop::mock::MockGateway;
use billing_rs::{
    BillingStore, PaymentGateway, PayoutEngine, SettlementEngine, SubscriptionEngine,
};
use uuid::Uuid;

pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub gateway: MockGateway,
    pub settlement: SettlementEngine,
    pub subscriptions: SubscriptionEngine,
    pub payouts: PayoutEngine,
}

pub fn setup() -> TestContext {
    setup_with_gateway(MockGateway::new())
}

pub fn setup_with_gateway(gateway: MockGateway) -> TestContext {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn BillingStore> = store.clone();
    let dyn_gateway: Arc<dyn PaymentGateway> = Arc::new(gateway.clone());

    TestContext {
        settlement: SettlementEngine::new(dyn_store.clone(), dyn_gateway.clone()),
        subscriptions: SubscriptionEngine::new(dyn_store.clone(), dyn_gateway.clone()),
        payouts: PayoutEngine::new(dyn_store, dyn_gateway),
        store,
        gateway,
    }
}

/// Creator with a configured payment account, subscriptions on, manual
/// withdrawals only.
pub async fn seed_creator(store: &MemoryStore) -> Uuid {
    let creator_id = Uuid::new_v4();
    store
        .upsert_creator_settings(CreatorSettings {
            user_id: creator_id,
            provider_account_id: Some(format!("acct_{}", creator_id.simple())),
            subscriptions_enabled: true,
            auto_withdraw_enabled: false,
            auto_withdraw_threshold: None,
            payout_method: PayoutMethod::Bank,
            payout_destination: None,
        })
        .await
        .expect("seed creator settings");
    creator_id
}
