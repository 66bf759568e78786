use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    AdminPayoutQuery, AdminTransactionQuery, CreatorSettings, NewPayout, NewPurchase,
    NewSubscription, NewTransaction, PaymentConfiguration, Payout, Purchase, PurchaseStatus,
    Subscription, SubscriptionStatus, Transaction,
};

use super::{BillingStore, CompletionOutcome, SubscriptionStatsRow};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

/// Postgres-backed billing store. Multi-row money writes run inside a
/// database transaction; the schema's unique constraints back the
/// idempotency guarantees.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_entries(
        tx: &mut PgTransaction<'_, Postgres>,
        entries: &[NewTransaction],
    ) -> Result<(), sqlx::Error> {
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO ledger_transactions
                    (id, user_id, transaction_type, amount, status,
                     provider_reference_id, reference_id, description, metadata)
                VALUES ($1, $2, $3, $4, 'completed', $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(entry.user_id)
            .bind(entry.transaction_type)
            .bind(entry.amount)
            .bind(&entry.provider_reference_id)
            .bind(entry.reference_id)
            .bind(&entry.description)
            .bind(&entry.metadata)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    fn page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn get_or_create_configuration(
        &self,
        defaults: &PaymentConfiguration,
    ) -> BillingResult<PaymentConfiguration> {
        // Create-or-fetch, not create-then-fail-on-duplicate: concurrent
        // first calls race on the singleton row and both must succeed.
        sqlx::query(
            r#"
            INSERT INTO billing_configuration
                (id, platform_fee_percent, min_pick_price, max_pick_price,
                 min_subscription_price, max_subscription_price,
                 withdrawal_minimum, withdrawal_enabled, payment_provider)
            VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(defaults.platform_fee_percent)
        .bind(defaults.min_pick_price)
        .bind(defaults.max_pick_price)
        .bind(defaults.min_subscription_price)
        .bind(defaults.max_subscription_price)
        .bind(defaults.withdrawal_minimum)
        .bind(defaults.withdrawal_enabled)
        .bind(&defaults.payment_provider)
        .execute(&self.pool)
        .await?;

        let config = sqlx::query_as::<_, PaymentConfiguration>(
            r#"
            SELECT platform_fee_percent, min_pick_price, max_pick_price,
                   min_subscription_price, max_subscription_price,
                   withdrawal_minimum, withdrawal_enabled, payment_provider
            FROM billing_configuration
            WHERE id = 1
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(config)
    }

    async fn insert_purchase(&self, new: NewPurchase) -> BillingResult<Purchase> {
        let purchase = sqlx::query_as::<_, Purchase>(
            r#"
            INSERT INTO purchases
                (id, user_id, creator_id, item_id, amount, platform_fee,
                 creator_earnings, provider_payment_id, payment_method, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.creator_id)
        .bind(new.item_id)
        .bind(new.amount)
        .bind(new.platform_fee)
        .bind(new.creator_earnings)
        .bind(&new.provider_payment_id)
        .bind(&new.payment_method)
        .fetch_one(&self.pool)
        .await?;

        Ok(purchase)
    }

    async fn purchase_exists(&self, user_id: Uuid, item_id: Uuid) -> BillingResult<bool> {
        let exists = sqlx::query_as::<_, (bool,)>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM purchases
                WHERE user_id = $1 AND item_id = $2 AND status <> 'failed'
            )
            "#,
        )
        .bind(user_id)
        .bind(item_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists.0)
    }

    async fn find_purchase(&self, id: Uuid) -> BillingResult<Option<Purchase>> {
        let purchase = sqlx::query_as::<_, Purchase>("SELECT * FROM purchases WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(purchase)
    }

    async fn find_purchase_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Purchase>> {
        let purchase = sqlx::query_as::<_, Purchase>(
            "SELECT * FROM purchases WHERE provider_payment_id = $1",
        )
        .bind(provider_payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(purchase)
    }

    async fn complete_purchase(
        &self,
        provider_payment_id: &str,
        entries: Vec<NewTransaction>,
    ) -> BillingResult<CompletionOutcome> {
        let mut tx = self.pool.begin().await?;

        // Conditional update serializes concurrent completions for the same
        // provider payment id: only one attempt moves the row off PENDING.
        let updated = sqlx::query_as::<_, Purchase>(
            r#"
            UPDATE purchases
            SET status = 'completed', updated_at = NOW()
            WHERE provider_payment_id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(provider_payment_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(purchase) = updated else {
            tx.rollback().await?;

            let existing = self.find_purchase_by_provider_id(provider_payment_id).await?;
            return match existing {
                None => Err(BillingError::NotFound(format!(
                    "no purchase for provider payment id {}",
                    provider_payment_id
                ))),
                Some(p) if p.status == PurchaseStatus::Completed => {
                    Ok(CompletionOutcome::AlreadyCompleted(p))
                }
                Some(p) => Err(BillingError::Invariant(format!(
                    "completion webhook for purchase {} in state {:?}",
                    p.id, p.status
                ))),
            };
        };

        Self::insert_entries(&mut tx, &entries).await?;
        tx.commit().await?;

        Ok(CompletionOutcome::Completed(purchase))
    }

    async fn fail_purchase(
        &self,
        provider_payment_id: &str,
        reason: Option<&str>,
    ) -> BillingResult<Purchase> {
        let updated = sqlx::query_as::<_, Purchase>(
            r#"
            UPDATE purchases
            SET status = 'failed', failure_reason = $2, updated_at = NOW()
            WHERE provider_payment_id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(provider_payment_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(purchase) = updated {
            return Ok(purchase);
        }

        let existing = self.find_purchase_by_provider_id(provider_payment_id).await?;
        match existing {
            None => Err(BillingError::NotFound(format!(
                "no purchase for provider payment id {}",
                provider_payment_id
            ))),
            // Redelivered failure webhook: already failed, nothing to do.
            Some(p) if p.status == PurchaseStatus::Failed => Ok(p),
            Some(p) => Err(BillingError::Invariant(format!(
                "failure webhook for purchase {} in state {:?}",
                p.id, p.status
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
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Purchase>(
            r#"
            UPDATE purchases
            SET status = $2, refunded_at = NOW(), refund_amount = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'completed'
            RETURNING *
            "#,
        )
        .bind(purchase_id)
        .bind(new_status)
        .bind(refund_amount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(purchase) = updated else {
            tx.rollback().await?;
            return Err(BillingError::Invariant(format!(
                "purchase {} is no longer refundable",
                purchase_id
            )));
        };

        Self::insert_entries(&mut tx, std::slice::from_ref(&entry)).await?;
        tx.commit().await?;

        Ok(purchase)
    }

    async fn list_transactions(
        &self,
        query: &AdminTransactionQuery,
    ) -> BillingResult<Vec<Transaction>> {
        let (limit, offset) = Self::page(query.limit, query.offset);

        let rows = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT * FROM ledger_transactions
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::billing_transaction_type IS NULL OR transaction_type = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(query.user_id)
        .bind(query.transaction_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn sum_completed_earnings(&self, user_id: Uuid) -> BillingResult<i64> {
        let (sum,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT
            FROM ledger_transactions
            WHERE user_id = $1
              AND status = 'completed'
              AND transaction_type IN ('pick_sale', 'subscription_revenue')
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(sum)
    }

    async fn upsert_pending_subscription(
        &self,
        new: NewSubscription,
    ) -> BillingResult<Option<Subscription>> {
        // Guarded upsert: one row per (subscriber, creator); a canceled or
        // stale pending row is reused, an active row blocks the insert.
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions
                (id, subscriber_id, creator_id, provider_subscription_id, status,
                 amount, platform_fee, current_period_start, current_period_end)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8)
            ON CONFLICT (subscriber_id, creator_id) DO UPDATE SET
                provider_subscription_id = EXCLUDED.provider_subscription_id,
                status = 'pending',
                amount = EXCLUDED.amount,
                platform_fee = EXCLUDED.platform_fee,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = FALSE,
                canceled_at = NULL,
                updated_at = NOW()
            WHERE subscriptions.status <> 'active'
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.subscriber_id)
        .bind(new.creator_id)
        .bind(&new.provider_subscription_id)
        .bind(new.amount)
        .bind(new.platform_fee)
        .bind(new.current_period_start)
        .bind(new.current_period_end)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn find_subscription_pair(
        &self,
        subscriber_id: Uuid,
        creator_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE subscriber_id = $1 AND creator_id = $2",
        )
        .bind(subscriber_id)
        .bind(creator_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn find_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE provider_subscription_id = $1",
        )
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn activate_subscription(
        &self,
        provider_subscription_id: &str,
        period_end: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = 'active', current_period_end = $2, updated_at = NOW()
            WHERE provider_subscription_id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(provider_subscription_id)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(subscription) = updated {
            return Ok(subscription);
        }

        let existing = self
            .find_subscription_by_provider_id(provider_subscription_id)
            .await?;
        match existing {
            None => Err(BillingError::NotFound(format!(
                "no subscription for provider id {}",
                provider_subscription_id
            ))),
            // Redelivered activation: the billed-period key dedups the
            // ledger write downstream.
            Some(s) if s.status == SubscriptionStatus::Active => Ok(s),
            Some(s) => Err(BillingError::Invariant(format!(
                "activation webhook for subscription {} in state {:?}",
                s.id, s.status
            ))),
        }
    }

    async fn renew_subscription(
        &self,
        provider_subscription_id: &str,
        new_period_end: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET current_period_start = current_period_end,
                current_period_end = $2,
                updated_at = NOW()
            WHERE provider_subscription_id = $1 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(provider_subscription_id)
        .bind(new_period_end)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(subscription) = updated {
            return Ok(subscription);
        }

        let existing = self
            .find_subscription_by_provider_id(provider_subscription_id)
            .await?;
        match existing {
            None => Err(BillingError::NotFound(format!(
                "no subscription for provider id {}",
                provider_subscription_id
            ))),
            Some(s) => Err(BillingError::Validation(format!(
                "subscription {} is not active",
                s.id
            ))),
        }
    }

    async fn record_billing_if_new(
        &self,
        subscription_id: Uuid,
        period_end: DateTime<Utc>,
        entries: Vec<NewTransaction>,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        // (subscription, period_end) is the idempotency key for "has this
        // period been billed"; the marker and the entries commit together.
        let inserted = sqlx::query_as::<_, (Uuid,)>(
            r#"
            INSERT INTO subscription_billing_periods (id, subscription_id, period_end)
            VALUES ($1, $2, $3)
            ON CONFLICT (subscription_id, period_end) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(period_end)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::insert_entries(&mut tx, &entries).await?;
        tx.commit().await?;

        Ok(true)
    }

    async fn set_cancellation(
        &self,
        subscription_id: Uuid,
        cancel_at_period_end: bool,
        canceled_at: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let subscription = if cancel_at_period_end {
            sqlx::query_as::<_, Subscription>(
                r#"
                UPDATE subscriptions
                SET cancel_at_period_end = TRUE, canceled_at = $2, updated_at = NOW()
                WHERE id = $1 AND status = 'active'
                RETURNING *
                "#,
            )
        } else {
            sqlx::query_as::<_, Subscription>(
                r#"
                UPDATE subscriptions
                SET status = 'canceled', canceled_at = $2, updated_at = NOW()
                WHERE id = $1 AND status = 'active'
                RETURNING *
                "#,
            )
        }
        .bind(subscription_id)
        .bind(canceled_at)
        .fetch_optional(&self.pool)
        .await?;

        subscription.ok_or_else(|| {
            BillingError::Validation(format!("subscription {} is not active", subscription_id))
        })
    }

    async fn deactivate_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Subscription> {
        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = 'canceled',
                canceled_at = COALESCE(canceled_at, NOW()),
                updated_at = NOW()
            WHERE provider_subscription_id = $1 AND status <> 'canceled'
            RETURNING *
            "#,
        )
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(subscription) = updated {
            return Ok(subscription);
        }

        let existing = self
            .find_subscription_by_provider_id(provider_subscription_id)
            .await?;
        existing.ok_or_else(|| {
            BillingError::NotFound(format!(
                "no subscription for provider id {}",
                provider_subscription_id
            ))
        })
    }

    async fn subscription_stats(
        &self,
        creator_id: Uuid,
        month_start: DateTime<Utc>,
    ) -> BillingResult<SubscriptionStatsRow> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'active'),
                COALESCE(SUM(amount) FILTER (WHERE status = 'active'), 0)::BIGINT,
                COUNT(*) FILTER (WHERE status = 'canceled' AND canceled_at >= $2),
                COUNT(*) FILTER (WHERE created_at < $2
                                   AND (status = 'active'
                                        OR (status = 'canceled' AND canceled_at >= $2)))
            FROM subscriptions
            WHERE creator_id = $1
            "#,
        )
        .bind(creator_id)
        .bind(month_start)
        .fetch_one(&self.pool)
        .await?;

        Ok(SubscriptionStatsRow {
            active_count: row.0,
            mrr: row.1,
            canceled_this_month: row.2,
            active_at_month_start: row.3,
        })
    }

    async fn create_payout_if_idle(&self, new: NewPayout) -> BillingResult<Option<Payout>> {
        // The partial unique index on (user_id) WHERE in-flight makes this a
        // no-op when a payout is already pending or processing.
        let payout = sqlx::query_as::<_, Payout>(
            r#"
            INSERT INTO payouts (id, user_id, amount, method, status)
            VALUES ($1, $2, $3, $4, 'pending')
            ON CONFLICT (user_id) WHERE status IN ('pending', 'processing') DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.amount)
        .bind(new.method)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payout)
    }

    async fn mark_payout_processing(
        &self,
        payout_id: Uuid,
        provider_transfer_id: &str,
        entry: NewTransaction,
    ) -> BillingResult<Payout> {
        let mut tx = self.pool.begin().await?;

        let payout = sqlx::query_as::<_, Payout>(
            r#"
            UPDATE payouts
            SET status = 'processing', provider_transfer_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(payout_id)
        .bind(provider_transfer_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(payout) = payout else {
            tx.rollback().await?;
            return Err(BillingError::Invariant(format!(
                "payout {} is not pending",
                payout_id
            )));
        };

        Self::insert_entries(&mut tx, std::slice::from_ref(&entry)).await?;
        tx.commit().await?;

        Ok(payout)
    }

    async fn mark_payout_failed(&self, payout_id: Uuid) -> BillingResult<Payout> {
        let payout = sqlx::query_as::<_, Payout>(
            r#"
            UPDATE payouts
            SET status = 'failed', updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(payout_id)
        .fetch_optional(&self.pool)
        .await?;

        payout.ok_or_else(|| BillingError::NotFound(format!("no payout {}", payout_id)))
    }

    async fn sum_payouts_counted(&self, user_id: Uuid) -> BillingResult<i64> {
        let (sum,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT
            FROM payouts
            WHERE user_id = $1 AND status IN ('pending', 'processing', 'completed')
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(sum)
    }

    async fn list_payouts(&self, query: &AdminPayoutQuery) -> BillingResult<Vec<Payout>> {
        let (limit, offset) = Self::page(query.limit, query.offset);

        let rows = sqlx::query_as::<_, Payout>(
            r#"
            SELECT * FROM payouts
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::billing_payout_status IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(query.user_id)
        .bind(query.status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn get_creator_settings(&self, user_id: Uuid) -> BillingResult<Option<CreatorSettings>> {
        let settings = sqlx::query_as::<_, CreatorSettings>(
            r#"
            SELECT user_id, provider_account_id, subscriptions_enabled,
                   auto_withdraw_enabled, auto_withdraw_threshold,
                   payout_method, payout_destination
            FROM creator_settings
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(settings)
    }

    async fn upsert_creator_settings(
        &self,
        settings: CreatorSettings,
    ) -> BillingResult<CreatorSettings> {
        let settings = sqlx::query_as::<_, CreatorSettings>(
            r#"
            INSERT INTO creator_settings
                (user_id, provider_account_id, subscriptions_enabled,
                 auto_withdraw_enabled, auto_withdraw_threshold,
                 payout_method, payout_destination)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id) DO UPDATE SET
                provider_account_id = EXCLUDED.provider_account_id,
                subscriptions_enabled = EXCLUDED.subscriptions_enabled,
                auto_withdraw_enabled = EXCLUDED.auto_withdraw_enabled,
                auto_withdraw_threshold = EXCLUDED.auto_withdraw_threshold,
                payout_method = EXCLUDED.payout_method,
                payout_destination = EXCLUDED.payout_destination,
                updated_at = NOW()
            RETURNING user_id, provider_account_id, subscriptions_enabled,
                      auto_withdraw_enabled, auto_withdraw_threshold,
                      payout_method, payout_destination
            "#,
        )
        .bind(settings.user_id)
        .bind(&settings.provider_account_id)
        .bind(settings.subscriptions_enabled)
        .bind(settings.auto_withdraw_enabled)
        .bind(settings.auto_withdraw_threshold)
        .bind(settings.payout_method)
        .bind(&settings.payout_destination)
        .fetch_one(&self.pool)
        .await?;

        Ok(settings)
    }
}
