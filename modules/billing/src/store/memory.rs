use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    AdminPayoutQuery, AdminTransactionQuery, CreatorSettings, NewPayout, NewPurchase,
    NewSubscription, NewTransaction, PaymentConfiguration, Payout, PayoutStatus, Purchase,
    PurchaseStatus, Subscription, SubscriptionStatus, Transaction, TransactionStatus,
    TransactionType,
};

use super::{BillingStore, CompletionOutcome, SubscriptionStatsRow};

#[derive(Default)]
struct Inner {
    configuration: Option<PaymentConfiguration>,
    purchases: Vec<Purchase>,
    transactions: Vec<Transaction>,
    subscriptions: Vec<Subscription>,
    billed_periods: HashSet<(Uuid, DateTime<Utc>)>,
    payouts: Vec<Payout>,
    settings: HashMap<Uuid, CreatorSettings>,
}

/// In-memory billing store. A single mutex over the whole state makes each
/// trait method one critical section, which gives the same atomicity and
/// per-key mutual exclusion the Postgres backend gets from transactions and
/// unique constraints.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn make_transaction(entry: NewTransaction) -> Transaction {
    Transaction {
        id: Uuid::new_v4(),
        user_id: entry.user_id,
        transaction_type: entry.transaction_type,
        amount: entry.amount,
        status: TransactionStatus::Completed,
        provider_reference_id: entry.provider_reference_id,
        reference_id: entry.reference_id,
        description: entry.description,
        metadata: entry.metadata,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn get_or_create_configuration(
        &self,
        defaults: &PaymentConfiguration,
    ) -> BillingResult<PaymentConfiguration> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .configuration
            .get_or_insert_with(|| defaults.clone())
            .clone())
    }

    async fn insert_purchase(&self, new: NewPurchase) -> BillingResult<Purchase> {
        let mut inner = self.inner.lock().await;

        if inner.purchases.iter().any(|p| {
            p.user_id == new.user_id && p.item_id == new.item_id && p.status != PurchaseStatus::Failed
        }) {
            return Err(BillingError::Validation(
                "item already purchased by this user".to_string(),
            ));
        }
        if inner
            .purchases
            .iter()
            .any(|p| p.provider_payment_id == new.provider_payment_id)
        {
            return Err(BillingError::Invariant(format!(
                "duplicate provider payment id {}",
                new.provider_payment_id
            )));
        }

        let now = Utc::now();
        let purchase = Purchase {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            creator_id: new.creator_id,
            item_id: new.item_id,
            amount: new.amount,
            platform_fee: new.platform_fee,
            creator_earnings: new.creator_earnings,
            provider_payment_id: new.provider_payment_id,
            payment_method: new.payment_method,
            status: PurchaseStatus::Pending,
            failure_reason: None,
            refunded_at: None,
            refund_amount: None,
            created_at: now,
            updated_at: now,
        };
        inner.purchases.push(purchase.clone());

        Ok(purchase)
    }

    async fn purchase_exists(&self, user_id: Uuid, item_id: Uuid) -> BillingResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.purchases.iter().any(|p| {
            p.user_id == user_id && p.item_id == item_id && p.status != PurchaseStatus::Failed
        }))
    }

    async fn find_purchase(&self, id: Uuid) -> BillingResult<Option<Purchase>> {
        let inner = self.inner.lock().await;
        Ok(inner.purchases.iter().find(|p| p.id == id).cloned())
    }

    async fn find_purchase_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Purchase>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .purchases
            .iter()
            .find(|p| p.provider_payment_id == provider_payment_id)
            .cloned())
    }

    async fn complete_purchase(
        &self,
        provider_payment_id: &str,
        entries: Vec<NewTransaction>,
    ) -> BillingResult<CompletionOutcome> {
        let mut inner = self.inner.lock().await;

        let Some(idx) = inner
            .purchases
            .iter()
            .position(|p| p.provider_payment_id == provider_payment_id)
        else {
            return Err(BillingError::NotFound(format!(
                "no purchase for provider payment id {}",
                provider_payment_id
            )));
        };

        match inner.purchases[idx].status {
            PurchaseStatus::Pending => {
                inner.purchases[idx].status = PurchaseStatus::Completed;
                inner.purchases[idx].updated_at = Utc::now();
                let purchase = inner.purchases[idx].clone();
                inner
                    .transactions
                    .extend(entries.into_iter().map(make_transaction));
                Ok(CompletionOutcome::Completed(purchase))
            }
            PurchaseStatus::Completed => {
                Ok(CompletionOutcome::AlreadyCompleted(inner.purchases[idx].clone()))
            }
            status => Err(BillingError::Invariant(format!(
                "completion webhook for purchase {} in state {:?}",
                inner.purchases[idx].id, status
            ))),
        }
    }

    async fn fail_purchase(
        &self,
        provider_payment_id: &str,
        reason: Option<&str>,
    ) -> BillingResult<Purchase> {
        let mut inner = self.inner.lock().await;

        let Some(purchase) = inner
            .purchases
            .iter_mut()
            .find(|p| p.provider_payment_id == provider_payment_id)
        else {
            return Err(BillingError::NotFound(format!(
                "no purchase for provider payment id {}",
                provider_payment_id
            )));
        };

        match purchase.status {
            PurchaseStatus::Pending => {
                purchase.status = PurchaseStatus::Failed;
                purchase.failure_reason = reason.map(|r| r.to_string());
                purchase.updated_at = Utc::now();
                Ok(purchase.clone())
            }
            PurchaseStatus::Failed => Ok(purchase.clone()),
            status => Err(BillingError::Invariant(format!(
                "failure webhook for purchase {} in state {:?}",
                purchase.id, status
            ))),
        }
    }

    async fn apply_refund(
        &self,
        purchase_id: Uuid,
        refund_amount: i64,
        new_status: PurchaseStatus,
        entry: NewTransaction,
    ) -> BillingResult<Purchase> {
        let mut inner = self.inner.lock().await;

        let Some(idx) = inner.purchases.iter().position(|p| p.id == purchase_id) else {
            return Err(BillingError::NotFound(format!("no purchase {}", purchase_id)));
        };

        if inner.purchases[idx].status != PurchaseStatus::Completed {
            return Err(BillingError::Invariant(format!(
                "purchase {} is no longer refundable",
                purchase_id
            )));
        }

        inner.purchases[idx].status = new_status;
        inner.purchases[idx].refunded_at = Some(Utc::now());
        inner.purchases[idx].refund_amount = Some(refund_amount);
        inner.purchases[idx].updated_at = Utc::now();
        let purchase = inner.purchases[idx].clone();
        inner.transactions.push(make_transaction(entry));

        Ok(purchase)
    }

    async fn list_transactions(
        &self,
        query: &AdminTransactionQuery,
    ) -> BillingResult<Vec<Transaction>> {
        let inner = self.inner.lock().await;
        let limit = query.limit.unwrap_or(50).clamp(1, 500) as usize;
        let offset = query.offset.unwrap_or(0).max(0) as usize;

        Ok(inner
            .transactions
            .iter()
            .rev()
            .filter(|t| query.user_id.is_none_or(|u| t.user_id == u))
            .filter(|t| query.transaction_type.is_none_or(|ty| t.transaction_type == ty))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn sum_completed_earnings(&self, user_id: Uuid) -> BillingResult<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id && t.status == TransactionStatus::Completed)
            .filter(|t| {
                matches!(
                    t.transaction_type,
                    TransactionType::PickSale | TransactionType::SubscriptionRevenue
                )
            })
            .map(|t| t.amount)
            .sum())
    }

    async fn upsert_pending_subscription(
        &self,
        new: NewSubscription,
    ) -> BillingResult<Option<Subscription>> {
        let mut inner = self.inner.lock().await;

        let now = Utc::now();
        if let Some(existing) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.subscriber_id == new.subscriber_id && s.creator_id == new.creator_id)
        {
            if existing.status == SubscriptionStatus::Active {
                return Ok(None);
            }
            existing.provider_subscription_id = new.provider_subscription_id;
            existing.status = SubscriptionStatus::Pending;
            existing.amount = new.amount;
            existing.platform_fee = new.platform_fee;
            existing.current_period_start = new.current_period_start;
            existing.current_period_end = new.current_period_end;
            existing.cancel_at_period_end = false;
            existing.canceled_at = None;
            existing.updated_at = now;
            return Ok(Some(existing.clone()));
        }

        let subscription = Subscription {
            id: Uuid::new_v4(),
            subscriber_id: new.subscriber_id,
            creator_id: new.creator_id,
            provider_subscription_id: new.provider_subscription_id,
            status: SubscriptionStatus::Pending,
            amount: new.amount,
            platform_fee: new.platform_fee,
            current_period_start: new.current_period_start,
            current_period_end: new.current_period_end,
            cancel_at_period_end: false,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.subscriptions.push(subscription.clone());

        Ok(Some(subscription))
    }

    async fn find_subscription_pair(
        &self,
        subscriber_id: Uuid,
        creator_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .iter()
            .find(|s| s.subscriber_id == subscriber_id && s.creator_id == creator_id)
            .cloned())
    }

    async fn find_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .iter()
            .find(|s| s.provider_subscription_id == provider_subscription_id)
            .cloned())
    }

    async fn activate_subscription(
        &self,
        provider_subscription_id: &str,
        period_end: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let mut inner = self.inner.lock().await;

        let Some(subscription) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.provider_subscription_id == provider_subscription_id)
        else {
            return Err(BillingError::NotFound(format!(
                "no subscription for provider id {}",
                provider_subscription_id
            )));
        };

        match subscription.status {
            SubscriptionStatus::Pending => {
                subscription.status = SubscriptionStatus::Active;
                subscription.current_period_end = period_end;
                subscription.updated_at = Utc::now();
                Ok(subscription.clone())
            }
            SubscriptionStatus::Active => Ok(subscription.clone()),
            SubscriptionStatus::Canceled => Err(BillingError::Invariant(format!(
                "activation webhook for subscription {} in state Canceled",
                subscription.id
            ))),
        }
    }

    async fn renew_subscription(
        &self,
        provider_subscription_id: &str,
        new_period_end: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let mut inner = self.inner.lock().await;

        let Some(subscription) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.provider_subscription_id == provider_subscription_id)
        else {
            return Err(BillingError::NotFound(format!(
                "no subscription for provider id {}",
                provider_subscription_id
            )));
        };

        if subscription.status != SubscriptionStatus::Active {
            return Err(BillingError::Validation(format!(
                "subscription {} is not active",
                subscription.id
            )));
        }

        subscription.current_period_start = subscription.current_period_end;
        subscription.current_period_end = new_period_end;
        subscription.updated_at = Utc::now();

        Ok(subscription.clone())
    }

    async fn record_billing_if_new(
        &self,
        subscription_id: Uuid,
        period_end: DateTime<Utc>,
        entries: Vec<NewTransaction>,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;

        if !inner.billed_periods.insert((subscription_id, period_end)) {
            return Ok(false);
        }

        inner
            .transactions
            .extend(entries.into_iter().map(make_transaction));

        Ok(true)
    }

    async fn set_cancellation(
        &self,
        subscription_id: Uuid,
        cancel_at_period_end: bool,
        canceled_at: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let mut inner = self.inner.lock().await;

        let Some(subscription) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
        else {
            return Err(BillingError::NotFound(format!(
                "no subscription {}",
                subscription_id
            )));
        };

        if subscription.status != SubscriptionStatus::Active {
            return Err(BillingError::Validation(format!(
                "subscription {} is not active",
                subscription_id
            )));
        }

        if cancel_at_period_end {
            subscription.cancel_at_period_end = true;
        } else {
            subscription.status = SubscriptionStatus::Canceled;
        }
        subscription.canceled_at = Some(canceled_at);
        subscription.updated_at = Utc::now();

        Ok(subscription.clone())
    }

    async fn deactivate_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Subscription> {
        let mut inner = self.inner.lock().await;

        let Some(subscription) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.provider_subscription_id == provider_subscription_id)
        else {
            return Err(BillingError::NotFound(format!(
                "no subscription for provider id {}",
                provider_subscription_id
            )));
        };

        if subscription.status != SubscriptionStatus::Canceled {
            subscription.status = SubscriptionStatus::Canceled;
            subscription.canceled_at = subscription.canceled_at.or_else(|| Some(Utc::now()));
            subscription.updated_at = Utc::now();
        }

        Ok(subscription.clone())
    }

    async fn subscription_stats(
        &self,
        creator_id: Uuid,
        month_start: DateTime<Utc>,
    ) -> BillingResult<SubscriptionStatsRow> {
        let inner = self.inner.lock().await;

        let mut stats = SubscriptionStatsRow::default();
        for s in inner.subscriptions.iter().filter(|s| s.creator_id == creator_id) {
            let canceled_this_month = s.status == SubscriptionStatus::Canceled
                && s.canceled_at.is_some_and(|at| at >= month_start);

            if s.status == SubscriptionStatus::Active {
                stats.active_count += 1;
                stats.mrr += s.amount;
            }
            if canceled_this_month {
                stats.canceled_this_month += 1;
            }
            if s.created_at < month_start
                && (s.status == SubscriptionStatus::Active || canceled_this_month)
            {
                stats.active_at_month_start += 1;
            }
        }

        Ok(stats)
    }

    async fn create_payout_if_idle(&self, new: NewPayout) -> BillingResult<Option<Payout>> {
        let mut inner = self.inner.lock().await;

        let in_flight = inner.payouts.iter().any(|p| {
            p.user_id == new.user_id
                && matches!(p.status, PayoutStatus::Pending | PayoutStatus::Processing)
        });
        if in_flight {
            return Ok(None);
        }

        let now = Utc::now();
        let payout = Payout {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            amount: new.amount,
            method: new.method,
            status: PayoutStatus::Pending,
            provider_transfer_id: None,
            created_at: now,
            updated_at: now,
        };
        inner.payouts.push(payout.clone());

        Ok(Some(payout))
    }

    async fn mark_payout_processing(
        &self,
        payout_id: Uuid,
        provider_transfer_id: &str,
        entry: NewTransaction,
    ) -> BillingResult<Payout> {
        let mut inner = self.inner.lock().await;

        let Some(idx) = inner.payouts.iter().position(|p| p.id == payout_id) else {
            return Err(BillingError::NotFound(format!("no payout {}", payout_id)));
        };

        if inner.payouts[idx].status != PayoutStatus::Pending {
            return Err(BillingError::Invariant(format!(
                "payout {} is not pending",
                payout_id
            )));
        }

        inner.payouts[idx].status = PayoutStatus::Processing;
        inner.payouts[idx].provider_transfer_id = Some(provider_transfer_id.to_string());
        inner.payouts[idx].updated_at = Utc::now();
        let payout = inner.payouts[idx].clone();
        inner.transactions.push(make_transaction(entry));

        Ok(payout)
    }

    async fn mark_payout_failed(&self, payout_id: Uuid) -> BillingResult<Payout> {
        let mut inner = self.inner.lock().await;

        let Some(payout) = inner.payouts.iter_mut().find(|p| p.id == payout_id) else {
            return Err(BillingError::NotFound(format!("no payout {}", payout_id)));
        };

        payout.status = PayoutStatus::Failed;
        payout.updated_at = Utc::now();

        Ok(payout.clone())
    }

    async fn sum_payouts_counted(&self, user_id: Uuid) -> BillingResult<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payouts
            .iter()
            .filter(|p| p.user_id == user_id)
            .filter(|p| {
                matches!(
                    p.status,
                    PayoutStatus::Pending | PayoutStatus::Processing | PayoutStatus::Completed
                )
            })
            .map(|p| p.amount)
            .sum())
    }

    async fn list_payouts(&self, query: &AdminPayoutQuery) -> BillingResult<Vec<Payout>> {
        let inner = self.inner.lock().await;
        let limit = query.limit.unwrap_or(50).clamp(1, 500) as usize;
        let offset = query.offset.unwrap_or(0).max(0) as usize;

        Ok(inner
            .payouts
            .iter()
            .rev()
            .filter(|p| query.user_id.is_none_or(|u| p.user_id == u))
            .filter(|p| query.status.is_none_or(|s| p.status == s))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_creator_settings(&self, user_id: Uuid) -> BillingResult<Option<CreatorSettings>> {
        let inner = self.inner.lock().await;
        Ok(inner.settings.get(&user_id).cloned())
    }

    async fn upsert_creator_settings(
        &self,
        settings: CreatorSettings,
    ) -> BillingResult<CreatorSettings> {
        let mut inner = self.inner.lock().await;
        inner.settings.insert(settings.user_id, settings.clone());
        Ok(settings)
    }
}
