//! Purchase settlement engine.
//!
//! Drives a pick purchase from PENDING to COMPLETED / FAILED / REFUNDED and
//! emits the matching ledger entries. The provider payment id is the
//! idempotency anchor: webhook redelivery and concurrent completion attempts
//! observe the already-settled row and write nothing.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    CreatePurchaseRequest, NewPurchase, NewTransaction, Purchase, PurchaseStatus, TransactionType,
};
use crate::services::config_service::{self, ConfigService};
use crate::services::payouts::PayoutEngine;
use crate::store::{BillingStore, CompletionOutcome};
use crate::whop::PaymentGateway;

/// Outcome of recording a provider-initiated refund. `AlreadyRefunded` is
/// the idempotency short-circuit for a redelivered refund webhook.
#[derive(Debug, Clone)]
pub enum RefundOutcome {
    Applied(Purchase),
    AlreadyRefunded(Purchase),
}

#[derive(Clone)]
pub struct SettlementEngine {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    config: ConfigService,
    payouts: PayoutEngine,
}

impl SettlementEngine {
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

    /// True if the buyer already holds a non-failed purchase of the item.
    pub async fn check_duplicate_purchase(&self, user_id: Uuid, item_id: Uuid) -> BillingResult<bool> {
        self.store.purchase_exists(user_id, item_id).await
    }

    /// Validate the price, compute the fee split, request the provider
    /// charge and persist the PENDING purchase keyed by the provider's
    /// payment id.
    pub async fn create_pending_purchase(
        &self,
        req: CreatePurchaseRequest,
    ) -> BillingResult<Purchase> {
        if self.check_duplicate_purchase(req.user_id, req.item_id).await? {
            return Err(BillingError::Validation(
                "item already purchased by this user".to_string(),
            ));
        }

        let config = self.config.get_configuration().await?;
        let validation = config_service::validate_pick_price(&config, req.amount);
        if !validation.valid {
            return Err(BillingError::Validation(
                validation.reason.unwrap_or_else(|| "invalid price".to_string()),
            ));
        }

        let fees = config_service::calculate_fees(req.amount, config.platform_fee_percent)?;

        let mut metadata = HashMap::new();
        metadata.insert("item_id".to_string(), req.item_id.to_string());
        metadata.insert("creator_id".to_string(), req.creator_id.to_string());

        let charge = self
            .gateway
            .charge(
                req.user_id,
                req.amount,
                "usd",
                &format!("Pick purchase {}", req.item_id),
                Some(metadata),
            )
            .await?;

        let purchase = self
            .store
            .insert_purchase(NewPurchase {
                user_id: req.user_id,
                creator_id: req.creator_id,
                item_id: req.item_id,
                amount: req.amount,
                platform_fee: fees.platform_fee,
                creator_earnings: fees.creator_earnings,
                provider_payment_id: charge.id,
                payment_method: req.payment_method,
            })
            .await?;

        tracing::info!(
            purchase_id = %purchase.id,
            user_id = %purchase.user_id,
            item_id = %purchase.item_id,
            amount = purchase.amount,
            provider_payment_id = %purchase.provider_payment_id,
            "Pending purchase created"
        );

        Ok(purchase)
    }

    /// Idempotent webhook confirmation. Completes the purchase and writes
    /// the three ledger entries (buyer spend, creator sale, platform fee) as
    /// one atomic unit, then runs the creator's auto-withdrawal check
    /// best-effort.
    pub async fn complete_purchase(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<CompletionOutcome> {
        let Some(purchase) = self
            .store
            .find_purchase_by_provider_id(provider_payment_id)
            .await?
        else {
            return Err(BillingError::NotFound(format!(
                "no purchase for provider payment id {}",
                provider_payment_id
            )));
        };

        if purchase.status == PurchaseStatus::Completed {
            tracing::warn!(
                purchase_id = %purchase.id,
                provider_payment_id,
                "Purchase already completed, skipping (idempotency)"
            );
            return Ok(CompletionOutcome::AlreadyCompleted(purchase));
        }

        let entries = Self::settlement_entries(&purchase);
        let outcome = self
            .store
            .complete_purchase(provider_payment_id, entries)
            .await?;

        match &outcome {
            CompletionOutcome::Completed(purchase) => {
                tracing::info!(
                    purchase_id = %purchase.id,
                    creator_id = %purchase.creator_id,
                    creator_earnings = purchase.creator_earnings,
                    platform_fee = purchase.platform_fee,
                    "Purchase completed and ledgered"
                );

                // Best-effort follow-on: a failing auto-withdrawal check must
                // never roll back the completed purchase.
                if let Err(e) = self.payouts.check_auto_withdrawal(purchase.creator_id).await {
                    tracing::warn!(
                        creator_id = %purchase.creator_id,
                        error = %e,
                        "Auto-withdrawal check failed after completed purchase"
                    );
                }
            }
            CompletionOutcome::AlreadyCompleted(purchase) => {
                tracing::warn!(
                    purchase_id = %purchase.id,
                    provider_payment_id,
                    "Purchase already completed, skipping (idempotency)"
                );
            }
        }

        Ok(outcome)
    }

    /// Provider reported the charge failed. No money moved, so no ledger
    /// entries are written.
    pub async fn fail_purchase(
        &self,
        provider_payment_id: &str,
        reason: Option<&str>,
    ) -> BillingResult<Purchase> {
        let purchase = self.store.fail_purchase(provider_payment_id, reason).await?;

        tracing::info!(
            purchase_id = %purchase.id,
            provider_payment_id,
            reason = reason.unwrap_or("unspecified"),
            "Purchase marked failed"
        );

        Ok(purchase)
    }

    /// Caller-initiated refund. Only legal from COMPLETED; the provider call
    /// happens first, so a provider failure leaves the purchase COMPLETED
    /// with no partial state.
    pub async fn process_refund(
        &self,
        purchase_id: Uuid,
        amount: Option<i64>,
        reason: Option<&str>,
    ) -> BillingResult<Purchase> {
        let Some(purchase) = self.store.find_purchase(purchase_id).await? else {
            return Err(BillingError::NotFound(format!("no purchase {}", purchase_id)));
        };

        if purchase.status != PurchaseStatus::Completed {
            return Err(BillingError::Validation(format!(
                "only completed purchases can be refunded (purchase {} is {:?})",
                purchase.id, purchase.status
            )));
        }

        let refund_amount = amount.unwrap_or(purchase.amount);
        if refund_amount <= 0 || refund_amount > purchase.amount {
            return Err(BillingError::Validation(format!(
                "refund amount {} is out of range for purchase amount {}",
                refund_amount, purchase.amount
            )));
        }

        let refund = self
            .gateway
            .refund(&purchase.provider_payment_id, Some(refund_amount), reason)
            .await?;

        self.apply_refund(&purchase, refund_amount, Some(refund.id))
            .await
    }

    /// Record a refund the provider already executed (`refund.completed`
    /// webhook, e.g. a dispute resolved in the buyer's favor). No provider
    /// call is made; idempotent for an already-refunded purchase.
    pub async fn record_provider_refund(
        &self,
        provider_payment_id: &str,
        amount: Option<i64>,
        provider_refund_id: Option<String>,
    ) -> BillingResult<RefundOutcome> {
        let Some(purchase) = self
            .store
            .find_purchase_by_provider_id(provider_payment_id)
            .await?
        else {
            return Err(BillingError::NotFound(format!(
                "no purchase for provider payment id {}",
                provider_payment_id
            )));
        };

        match purchase.status {
            PurchaseStatus::Refunded | PurchaseStatus::PartiallyRefunded => {
                tracing::warn!(
                    purchase_id = %purchase.id,
                    "Refund already recorded, skipping (idempotency)"
                );
                Ok(RefundOutcome::AlreadyRefunded(purchase))
            }
            PurchaseStatus::Completed => {
                let refund_amount = amount.unwrap_or(purchase.amount);
                if refund_amount <= 0 || refund_amount > purchase.amount {
                    return Err(BillingError::Invariant(format!(
                        "provider refund amount {} is out of range for purchase {}",
                        refund_amount, purchase.id
                    )));
                }
                let purchase = self
                    .apply_refund(&purchase, refund_amount, provider_refund_id)
                    .await?;
                Ok(RefundOutcome::Applied(purchase))
            }
            status => Err(BillingError::Invariant(format!(
                "refund webhook for purchase {} in state {:?}",
                purchase.id, status
            ))),
        }
    }

    async fn apply_refund(
        &self,
        purchase: &Purchase,
        refund_amount: i64,
        provider_refund_id: Option<String>,
    ) -> BillingResult<Purchase> {
        let new_status = if refund_amount == purchase.amount {
            PurchaseStatus::Refunded
        } else {
            PurchaseStatus::PartiallyRefunded
        };

        // Exactly one REFUND entry, on the buyer side. Creator earnings
        // already counted (or paid out) are not clawed back.
        let entry = NewTransaction {
            user_id: purchase.user_id,
            transaction_type: TransactionType::Refund,
            amount: refund_amount,
            provider_reference_id: provider_refund_id,
            reference_id: Some(purchase.id),
            description: format!("Refund for pick purchase {}", purchase.item_id),
            metadata: None,
        };

        let purchase = self
            .store
            .apply_refund(purchase.id, refund_amount, new_status, entry)
            .await?;

        tracing::info!(
            purchase_id = %purchase.id,
            refund_amount,
            status = ?purchase.status,
            "Refund recorded"
        );

        Ok(purchase)
    }

    /// The three entries for one settled purchase: buyer spend, creator
    /// sale, platform fee.
    fn settlement_entries(purchase: &Purchase) -> Vec<NewTransaction> {
        let provider_ref = Some(purchase.provider_payment_id.clone());
        vec![
            NewTransaction {
                user_id: purchase.user_id,
                transaction_type: TransactionType::PickPurchase,
                amount: purchase.amount,
                provider_reference_id: provider_ref.clone(),
                reference_id: Some(purchase.id),
                description: format!("Pick purchase {}", purchase.item_id),
                metadata: None,
            },
            NewTransaction {
                user_id: purchase.creator_id,
                transaction_type: TransactionType::PickSale,
                amount: purchase.creator_earnings,
                provider_reference_id: provider_ref.clone(),
                reference_id: Some(purchase.id),
                description: format!("Pick sale {}", purchase.item_id),
                metadata: None,
            },
            NewTransaction {
                user_id: purchase.creator_id,
                transaction_type: TransactionType::PlatformFee,
                amount: purchase.platform_fee,
                provider_reference_id: provider_ref,
                reference_id: Some(purchase.id),
                description: format!("Platform fee for pick sale {}", purchase.item_id),
                metadata: None,
            },
        ]
    }
}
