//! Payout orchestration.
//!
//! A creator's balance is always recomputed from the ledger and the payout
//! table, never stored, so it cannot drift from the source records. Payout
//! creation is serialized per user by a conditional insert: the PENDING row
//! goes in before the provider transfer is requested, and a failed transfer
//! marks the row FAILED so it stops counting against the balance.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{NewPayout, NewTransaction, Payout, TransactionType};
use crate::services::config_service::ConfigService;
use crate::store::BillingStore;
use crate::whop::PaymentGateway;

/// Outcome of `create_payout_request`. `AlreadyInFlight` is a successful
/// no-op, not an error: another payout for the same user is still pending or
/// processing.
#[derive(Debug, Clone)]
pub enum PayoutRequestOutcome {
    Created(Payout),
    AlreadyInFlight,
}

/// Outcome of the auto-withdrawal check. Only `Requested` performed any
/// write; the rest are cheap no-ops safe to hit after every sale.
#[derive(Debug, Clone)]
pub enum AutoWithdrawalOutcome {
    Disabled,
    BelowThreshold { balance: i64, threshold: i64 },
    AlreadyInFlight,
    Requested(Payout),
}

#[derive(Clone)]
pub struct PayoutEngine {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    config: ConfigService,
}

impl PayoutEngine {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        let config = ConfigService::new(store.clone());
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Withdrawable balance: completed sale and subscription revenue minus
    /// every payout that is pending, processing or completed.
    pub async fn calculate_creator_balance(&self, user_id: Uuid) -> BillingResult<i64> {
        let earnings = self.store.sum_completed_earnings(user_id).await?;
        let paid_out = self.store.sum_payouts_counted(user_id).await?;
        Ok(earnings - paid_out)
    }

    /// Runs after every completed sale and subscription payment, so it must
    /// be cheap and safe to call concurrently for the same user.
    pub async fn check_auto_withdrawal(&self, user_id: Uuid) -> BillingResult<AutoWithdrawalOutcome> {
        let Some(settings) = self.store.get_creator_settings(user_id).await? else {
            return Ok(AutoWithdrawalOutcome::Disabled);
        };
        if !settings.auto_withdraw_enabled {
            return Ok(AutoWithdrawalOutcome::Disabled);
        }

        let config = self.config.get_configuration().await?;
        if !config.withdrawal_enabled {
            return Ok(AutoWithdrawalOutcome::Disabled);
        }

        let threshold = settings
            .auto_withdraw_threshold
            .unwrap_or(config.withdrawal_minimum)
            .max(config.withdrawal_minimum);

        let balance = self.calculate_creator_balance(user_id).await?;
        if balance < threshold {
            return Ok(AutoWithdrawalOutcome::BelowThreshold { balance, threshold });
        }

        match self.create_payout_request(user_id, balance).await? {
            PayoutRequestOutcome::Created(payout) => {
                tracing::info!(
                    user_id = %user_id,
                    payout_id = %payout.id,
                    amount = payout.amount,
                    "Auto-withdrawal payout requested"
                );
                Ok(AutoWithdrawalOutcome::Requested(payout))
            }
            PayoutRequestOutcome::AlreadyInFlight => Ok(AutoWithdrawalOutcome::AlreadyInFlight),
        }
    }

    /// Request a payout for the creator. Validation failures (no payment
    /// account, amount out of bounds) never create a row; provider transfer
    /// failures mark the row FAILED and surface the provider error.
    pub async fn create_payout_request(
        &self,
        user_id: Uuid,
        amount: i64,
    ) -> BillingResult<PayoutRequestOutcome> {
        let Some(settings) = self.store.get_creator_settings(user_id).await? else {
            return Err(BillingError::Validation(format!(
                "creator {} has no payment account configured",
                user_id
            )));
        };
        let Some(account) = settings.provider_account_id.as_deref() else {
            return Err(BillingError::Validation(format!(
                "creator {} has no payment account configured",
                user_id
            )));
        };

        let config = self.config.get_configuration().await?;
        if !config.withdrawal_enabled {
            return Err(BillingError::Validation(
                "withdrawals are currently disabled".to_string(),
            ));
        }
        if amount < config.withdrawal_minimum {
            return Err(BillingError::Validation(format!(
                "payout amount {} is below the withdrawal minimum of {} cents",
                amount, config.withdrawal_minimum
            )));
        }

        let balance = self.calculate_creator_balance(user_id).await?;
        if amount > balance {
            return Err(BillingError::Validation(format!(
                "payout amount {} exceeds available balance {}",
                amount, balance
            )));
        }

        // Conditional insert is the per-user serialization point: a second
        // concurrent request observes the in-flight row and no-ops.
        let Some(payout) = self
            .store
            .create_payout_if_idle(NewPayout {
                user_id,
                amount,
                method: settings.payout_method,
            })
            .await?
        else {
            tracing::info!(user_id = %user_id, "Payout already in flight, skipping");
            return Ok(PayoutRequestOutcome::AlreadyInFlight);
        };

        let destination = settings.payout_destination.as_deref().unwrap_or(account);
        let transfer = match self
            .gateway
            .transfer(
                user_id,
                amount,
                "usd",
                settings.payout_method,
                destination,
                "Creator earnings payout",
            )
            .await
        {
            Ok(transfer) => transfer,
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    payout_id = %payout.id,
                    error = %e,
                    "Provider transfer failed, marking payout failed"
                );
                if let Err(mark_err) = self.store.mark_payout_failed(payout.id).await {
                    tracing::error!(
                        payout_id = %payout.id,
                        error = %mark_err,
                        "Failed to mark payout failed"
                    );
                }
                return Err(e.into());
            }
        };

        let entry = NewTransaction {
            user_id,
            transaction_type: TransactionType::Payout,
            amount,
            provider_reference_id: Some(transfer.id.clone()),
            reference_id: Some(payout.id),
            description: "Creator earnings payout".to_string(),
            metadata: None,
        };

        let payout = self
            .store
            .mark_payout_processing(payout.id, &transfer.id, entry)
            .await?;

        tracing::info!(
            user_id = %user_id,
            payout_id = %payout.id,
            transfer_id = %transfer.id,
            amount,
            "Payout transfer requested"
        );

        Ok(PayoutRequestOutcome::Created(payout))
    }
}
