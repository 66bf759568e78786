//! Subscription lifecycle engine.
//!
//! Subscriptions move PENDING -> ACTIVE -> CANCELED, driven by provider
//! webhooks. Revenue recognition is keyed by (subscription, period end):
//! each billing period is ledgered at most once no matter how many times
//! the provider redelivers the payment event.

use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    CreateSubscriptionRequest, CreatorStats, NewSubscription, NewTransaction, Subscription,
    SubscriptionStatus, TransactionType,
};
use crate::services::config_service::{self, ConfigService};
use crate::services::payouts::PayoutEngine;
use crate::store::BillingStore;
use crate::whop::PaymentGateway;

/// Outcome of recording a billing period. `AlreadyBilled` means the period
/// was ledgered by an earlier delivery of the same event and nothing was
/// written this time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingOutcome {
    Billed,
    AlreadyBilled,
}

#[derive(Clone)]
pub struct SubscriptionEngine {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    config: ConfigService,
    payouts: PayoutEngine,
}

impl SubscriptionEngine {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        let config = ConfigService::new(store.clone());
        let payouts = PayoutEngine::new(store.clone(), gateway.clone());
        Self {
            store,
            gateway,
            config,
            payouts,
        }
    }

    /// Create a PENDING subscription for the (subscriber, creator) pair.
    /// At most one non-canceled subscription may exist per pair; a canceled
    /// pair may re-subscribe.
    pub async fn create_subscription(
        &self,
        req: CreateSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        if req.subscriber_id == req.creator_id {
            return Err(BillingError::Validation(
                "cannot subscribe to yourself".to_string(),
            ));
        }

        let Some(settings) = self.store.get_creator_settings(req.creator_id).await? else {
            return Err(BillingError::Validation(format!(
                "creator {} has not enabled subscriptions",
                req.creator_id
            )));
        };
        if !settings.subscriptions_enabled {
            return Err(BillingError::Validation(format!(
                "creator {} has not enabled subscriptions",
                req.creator_id
            )));
        }
        if settings.provider_account_id.is_none() {
            return Err(BillingError::Validation(format!(
                "creator {} has no payment account configured",
                req.creator_id
            )));
        }

        if let Some(existing) = self
            .store
            .find_subscription_pair(req.subscriber_id, req.creator_id)
            .await?
        {
            if existing.status == SubscriptionStatus::Active {
                return Err(BillingError::Validation(
                    "an active subscription already exists for this creator".to_string(),
                ));
            }
        }

        let config = self.config.get_configuration().await?;
        let validation = config_service::validate_subscription_price(&config, req.amount);
        if !validation.valid {
            return Err(BillingError::Validation(
                validation.reason.unwrap_or_else(|| "invalid price".to_string()),
            ));
        }

        let fees = config_service::calculate_fees(req.amount, config.platform_fee_percent)?;

        let mut metadata = HashMap::new();
        metadata.insert("creator_id".to_string(), req.creator_id.to_string());

        let provider = self
            .gateway
            .create_subscription(
                req.subscriber_id,
                &format!("creator_{}", req.creator_id),
                req.amount,
                None,
                Some(metadata),
            )
            .await?;

        let now = Utc::now();
        let Some(subscription) = self
            .store
            .upsert_pending_subscription(NewSubscription {
                subscriber_id: req.subscriber_id,
                creator_id: req.creator_id,
                provider_subscription_id: provider.id,
                amount: req.amount,
                platform_fee: fees.platform_fee,
                current_period_start: now,
                current_period_end: add_one_month(now),
            })
            .await?
        else {
            // Lost the race against a concurrent create that went active.
            return Err(BillingError::Validation(
                "an active subscription already exists for this creator".to_string(),
            ));
        };

        tracing::info!(
            subscription_id = %subscription.id,
            subscriber_id = %subscription.subscriber_id,
            creator_id = %subscription.creator_id,
            amount = subscription.amount,
            "Pending subscription created"
        );

        Ok(subscription)
    }

    /// Webhook confirmation of the first payment: activate the subscription
    /// and ledger the first billing period. Redelivery re-activates (a no-op)
    /// and the period key suppresses duplicate ledger entries.
    pub async fn activate_subscription(
        &self,
        provider_subscription_id: &str,
        period_end: Option<DateTime<Utc>>,
    ) -> BillingResult<(Subscription, BillingOutcome)> {
        let Some(existing) = self
            .store
            .find_subscription_by_provider_id(provider_subscription_id)
            .await?
        else {
            return Err(BillingError::NotFound(format!(
                "no subscription for provider id {}",
                provider_subscription_id
            )));
        };

        let period_end = period_end.unwrap_or(existing.current_period_end);
        let subscription = self
            .store
            .activate_subscription(provider_subscription_id, period_end)
            .await?;

        let outcome = self.record_subscription_payment(&subscription).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            billed = outcome == BillingOutcome::Billed,
            "Subscription activated"
        );

        Ok((subscription, outcome))
    }

    /// Webhook confirmation of a renewal payment: advance the billing period
    /// and ledger it. The old period end becomes the new period start.
    pub async fn renew_subscription(
        &self,
        provider_subscription_id: &str,
        period_end: Option<DateTime<Utc>>,
    ) -> BillingResult<(Subscription, BillingOutcome)> {
        let Some(existing) = self
            .store
            .find_subscription_by_provider_id(provider_subscription_id)
            .await?
        else {
            return Err(BillingError::NotFound(format!(
                "no subscription for provider id {}",
                provider_subscription_id
            )));
        };

        let new_period_end = period_end.unwrap_or_else(|| add_one_month(existing.current_period_end));

        // Same period end as the current one means a redelivered renewal
        // event: skip the period advance and let the billing key decide.
        let subscription = if new_period_end > existing.current_period_end {
            self.store
                .renew_subscription(provider_subscription_id, new_period_end)
                .await?
        } else {
            existing
        };

        let outcome = self.record_subscription_payment(&subscription).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            period_end = %subscription.current_period_end,
            billed = outcome == BillingOutcome::Billed,
            "Subscription renewed"
        );

        Ok((subscription, outcome))
    }

    /// Ledger one billing period: subscriber spend and creator revenue net
    /// of the platform fee, keyed by (subscription, period end).
    async fn record_subscription_payment(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<BillingOutcome> {
        let creator_revenue = subscription.amount - subscription.platform_fee;
        let provider_ref = Some(subscription.provider_subscription_id.clone());
        let entries = vec![
            NewTransaction {
                user_id: subscription.subscriber_id,
                transaction_type: TransactionType::Subscription,
                amount: subscription.amount,
                provider_reference_id: provider_ref.clone(),
                reference_id: Some(subscription.id),
                description: format!("Subscription payment to creator {}", subscription.creator_id),
                metadata: None,
            },
            NewTransaction {
                user_id: subscription.creator_id,
                transaction_type: TransactionType::SubscriptionRevenue,
                amount: creator_revenue,
                provider_reference_id: provider_ref,
                reference_id: Some(subscription.id),
                description: format!(
                    "Subscription revenue from subscriber {}",
                    subscription.subscriber_id
                ),
                metadata: None,
            },
        ];

        let billed = self
            .store
            .record_billing_if_new(subscription.id, subscription.current_period_end, entries)
            .await?;

        if !billed {
            tracing::warn!(
                subscription_id = %subscription.id,
                period_end = %subscription.current_period_end,
                "Billing period already recorded, skipping (idempotency)"
            );
            return Ok(BillingOutcome::AlreadyBilled);
        }

        if let Err(e) = self.payouts.check_auto_withdrawal(subscription.creator_id).await {
            tracing::warn!(
                creator_id = %subscription.creator_id,
                error = %e,
                "Auto-withdrawal check failed after subscription payment"
            );
        }

        Ok(BillingOutcome::Billed)
    }

    /// Subscriber-initiated cancellation: provider first, then the local
    /// record. Flagged cancellations stay ACTIVE until the period lapses.
    pub async fn cancel_subscription(
        &self,
        subscriber_id: Uuid,
        creator_id: Uuid,
        cancel_at_period_end: bool,
    ) -> BillingResult<Subscription> {
        let Some(subscription) = self
            .store
            .find_subscription_pair(subscriber_id, creator_id)
            .await?
        else {
            return Err(BillingError::NotFound(format!(
                "no subscription for subscriber {} and creator {}",
                subscriber_id, creator_id
            )));
        };

        if subscription.status == SubscriptionStatus::Canceled {
            return Err(BillingError::Validation(
                "subscription is already canceled".to_string(),
            ));
        }

        self.gateway
            .cancel_subscription(&subscription.provider_subscription_id, cancel_at_period_end)
            .await?;

        let subscription = self
            .store
            .set_cancellation(subscription.id, cancel_at_period_end, Utc::now())
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            cancel_at_period_end,
            status = ?subscription.status,
            "Subscription cancellation recorded"
        );

        Ok(subscription)
    }

    /// Webhook-driven hard cancel (provider deleted the subscription, e.g.
    /// payment method failure or a flagged cancellation lapsing).
    pub async fn deactivate_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .store
            .deactivate_subscription(provider_subscription_id)
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            "Subscription deactivated"
        );

        Ok(subscription)
    }

    /// Derived statistics for a creator, computed from current subscription
    /// rows at read time.
    pub async fn get_creator_stats(&self, creator_id: Uuid) -> BillingResult<CreatorStats> {
        let now = Utc::now();
        let month_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .ok_or_else(|| BillingError::Invariant("invalid month start".to_string()))?;

        let stats = self.store.subscription_stats(creator_id, month_start).await?;

        let churn_rate = if stats.active_at_month_start > 0 {
            stats.canceled_this_month as f64 / stats.active_at_month_start as f64
        } else {
            0.0
        };
        let average_subscription_value = if stats.active_count > 0 {
            stats.mrr / stats.active_count
        } else {
            0
        };

        Ok(CreatorStats {
            active_subscribers: stats.active_count,
            monthly_recurring_revenue: stats.mrr,
            churn_rate,
            average_subscription_value,
        })
    }
}

/// One calendar month later, clamping the day for short months (Jan 31 ->
/// Feb 28) and preserving the time of day.
pub fn add_one_month(from: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if from.month() == 12 {
        (from.year() + 1, 1)
    } else {
        (from.year(), from.month() + 1)
    };

    let mut day = from.day();
    loop {
        if let Some(date) = from.with_day(1).and_then(|d| {
            d.with_year(year)
                .and_then(|d| d.with_month(month))
                .and_then(|d| d.with_day(day))
        }) {
            return date;
        }
        day -= 1;
        if day == 0 {
            // Unreachable for any real calendar; fall back to 30 days.
            return from + Duration::days(30);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 30, 0).unwrap()
    }

    #[test]
    fn add_one_month_plain() {
        assert_eq!(add_one_month(utc(2026, 3, 15)), utc(2026, 4, 15));
    }

    #[test]
    fn add_one_month_clamps_short_months() {
        assert_eq!(add_one_month(utc(2026, 1, 31)), utc(2026, 2, 28));
        assert_eq!(add_one_month(utc(2024, 1, 31)), utc(2024, 2, 29));
        assert_eq!(add_one_month(utc(2026, 3, 31)), utc(2026, 4, 30));
    }

    #[test]
    fn add_one_month_rolls_over_year() {
        assert_eq!(add_one_month(utc(2025, 12, 9)), utc(2026, 1, 9));
    }
}
