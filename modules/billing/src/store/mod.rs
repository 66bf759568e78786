pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    AdminPayoutQuery, AdminTransactionQuery, CreatorSettings, NewPayout, NewPurchase,
    NewSubscription, NewTransaction, PaymentConfiguration, Payout, Purchase, PurchaseStatus,
    Subscription, Transaction,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Outcome of a settlement attempt. `AlreadyCompleted` is the idempotency
/// short-circuit for redelivered webhooks: the existing record is returned
/// and nothing was written.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Completed(Purchase),
    AlreadyCompleted(Purchase),
}

impl CompletionOutcome {
    pub fn purchase(&self) -> &Purchase {
        match self {
            CompletionOutcome::Completed(p) | CompletionOutcome::AlreadyCompleted(p) => p,
        }
    }
}

/// Raw subscription aggregates for one creator, computed from the
/// subscriptions table at read time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionStatsRow {
    pub active_count: i64,
    pub mrr: i64,
    pub canceled_this_month: i64,
    pub active_at_month_start: i64,
}

/// Storage interface for the billing engines.
///
/// Every method that writes more than one row is a single atomic unit in
/// both backends: a Postgres transaction, or one critical section of the
/// in-memory store. Engines never compose multi-row money writes themselves,
/// so a crash can never leave a dangling single-sided ledger entry.
#[async_trait]
pub trait BillingStore: Send + Sync {
    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Fetch the singleton configuration, creating it from `defaults` on
    /// first access. Safe under concurrent first-call creation.
    async fn get_or_create_configuration(
        &self,
        defaults: &PaymentConfiguration,
    ) -> BillingResult<PaymentConfiguration>;

    // ------------------------------------------------------------------
    // Purchases
    // ------------------------------------------------------------------

    async fn insert_purchase(&self, new: NewPurchase) -> BillingResult<Purchase>;

    /// True if a non-failed purchase exists for (user, item). Failed
    /// attempts may be retried, so they do not count.
    async fn purchase_exists(&self, user_id: Uuid, item_id: Uuid) -> BillingResult<bool>;

    async fn find_purchase(&self, id: Uuid) -> BillingResult<Option<Purchase>>;

    async fn find_purchase_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Purchase>>;

    /// Status-guarded completion: PENDING -> COMPLETED plus the given ledger
    /// entries, all-or-nothing. A concurrent or redelivered completion
    /// observes the already-completed row and writes nothing.
    async fn complete_purchase(
        &self,
        provider_payment_id: &str,
        entries: Vec<NewTransaction>,
    ) -> BillingResult<CompletionOutcome>;

    /// PENDING -> FAILED. Idempotent for an already-failed purchase; a
    /// failure report for a completed purchase is an invariant violation.
    async fn fail_purchase(
        &self,
        provider_payment_id: &str,
        reason: Option<&str>,
    ) -> BillingResult<Purchase>;

    /// COMPLETED -> REFUNDED / PARTIALLY_REFUNDED plus exactly one REFUND
    /// ledger entry, all-or-nothing.
    async fn apply_refund(
        &self,
        purchase_id: Uuid,
        refund_amount: i64,
        new_status: PurchaseStatus,
        entry: NewTransaction,
    ) -> BillingResult<Purchase>;

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    async fn list_transactions(
        &self,
        query: &AdminTransactionQuery,
    ) -> BillingResult<Vec<Transaction>>;

    /// Sum of completed PICK_SALE and SUBSCRIPTION_REVENUE entries for the
    /// user. One of the two inputs to balance computation.
    async fn sum_completed_earnings(&self, user_id: Uuid) -> BillingResult<i64>;

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Insert a PENDING subscription for the (subscriber, creator) pair,
    /// reusing a canceled or stale pending row if one exists. Returns None
    /// when an ACTIVE row blocks the pair (race-safe duplicate guard).
    async fn upsert_pending_subscription(
        &self,
        new: NewSubscription,
    ) -> BillingResult<Option<Subscription>>;

    async fn find_subscription_pair(
        &self,
        subscriber_id: Uuid,
        creator_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    async fn find_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// PENDING -> ACTIVE with the confirmed period end. Idempotent for an
    /// already-active subscription.
    async fn activate_subscription(
        &self,
        provider_subscription_id: &str,
        period_end: DateTime<Utc>,
    ) -> BillingResult<Subscription>;

    /// Advance the billing period of an ACTIVE subscription: the old period
    /// end becomes the new period start.
    async fn renew_subscription(
        &self,
        provider_subscription_id: &str,
        new_period_end: DateTime<Utc>,
    ) -> BillingResult<Subscription>;

    /// Record a billing event for (subscription, period_end): the billed
    /// period marker and the ledger entries commit together. Returns false
    /// without writing anything when the period was already billed.
    async fn record_billing_if_new(
        &self,
        subscription_id: Uuid,
        period_end: DateTime<Utc>,
        entries: Vec<NewTransaction>,
    ) -> BillingResult<bool>;

    /// Record a cancellation request: either flag cancel-at-period-end on a
    /// still-active row, or move it to CANCELED immediately.
    async fn set_cancellation(
        &self,
        subscription_id: Uuid,
        cancel_at_period_end: bool,
        canceled_at: DateTime<Utc>,
    ) -> BillingResult<Subscription>;

    /// Webhook-driven hard cancel, regardless of any prior flag. Idempotent
    /// for an already-canceled subscription.
    async fn deactivate_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Subscription>;

    async fn subscription_stats(
        &self,
        creator_id: Uuid,
        month_start: DateTime<Utc>,
    ) -> BillingResult<SubscriptionStatsRow>;

    // ------------------------------------------------------------------
    // Payouts
    // ------------------------------------------------------------------

    /// Insert a PENDING payout unless the user already has one in flight
    /// (PENDING or PROCESSING). Returns None in that case. This conditional
    /// insert is the per-user serialization point for payout creation.
    async fn create_payout_if_idle(&self, new: NewPayout) -> BillingResult<Option<Payout>>;

    /// PENDING -> PROCESSING with the provider transfer id, plus the PAYOUT
    /// ledger entry, all-or-nothing.
    async fn mark_payout_processing(
        &self,
        payout_id: Uuid,
        provider_transfer_id: &str,
        entry: NewTransaction,
    ) -> BillingResult<Payout>;

    /// Transfer request failed before the provider accepted it; the row
    /// stops counting against the balance.
    async fn mark_payout_failed(&self, payout_id: Uuid) -> BillingResult<Payout>;

    /// Sum of payouts in PENDING, PROCESSING or COMPLETED for the user. The
    /// other input to balance computation.
    async fn sum_payouts_counted(&self, user_id: Uuid) -> BillingResult<i64>;

    async fn list_payouts(&self, query: &AdminPayoutQuery) -> BillingResult<Vec<Payout>>;

    // ------------------------------------------------------------------
    // Creator settings
    // ------------------------------------------------------------------

    async fn get_creator_settings(&self, user_id: Uuid) -> BillingResult<Option<CreatorSettings>>;

    async fn upsert_creator_settings(
        &self,
        settings: CreatorSettings,
    ) -> BillingResult<CreatorSettings>;
}
