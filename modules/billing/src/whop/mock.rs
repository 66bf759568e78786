use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::error::WhopError;
use super::types::{ChargeResponse, Metadata, RefundResponse, SubscriptionResponse, TransferResponse};
use super::PaymentGateway;
use crate::models::PayoutMethod;

/// Mock payment gateway for development and testing.
///
/// Every operation succeeds with generated provider ids unless the matching
/// `fail_*` flag is set, in which case it returns a declined-style API error.
/// Call counters let tests assert how often the provider was reached.
#[derive(Clone, Default)]
pub struct MockGateway {
    fail_charges: bool,
    fail_refunds: bool,
    fail_transfers: bool,
    pub charges: Arc<AtomicUsize>,
    pub refunds: Arc<AtomicUsize>,
    pub transfers: Arc<AtomicUsize>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing_charges(mut self) -> Self {
        self.fail_charges = true;
        self
    }

    pub fn with_failing_refunds(mut self) -> Self {
        self.fail_refunds = true;
        self
    }

    pub fn with_failing_transfers(mut self) -> Self {
        self.fail_transfers = true;
        self
    }

    fn declined(operation: &str) -> WhopError {
        WhopError::ApiError {
            status_code: 402,
            message: format!("{} declined by provider", operation),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn charge(
        &self,
        user_id: Uuid,
        amount: i64,
        _currency: &str,
        _description: &str,
        _metadata: Option<Metadata>,
    ) -> Result<ChargeResponse, WhopError> {
        self.charges.fetch_add(1, Ordering::SeqCst);

        if self.fail_charges {
            return Err(Self::declined("charge"));
        }

        tracing::info!(user_id = %user_id, amount, "Processing mock charge");

        Ok(ChargeResponse {
            id: format!("mock_pay_{}", Uuid::new_v4().simple()),
            status: "pending".to_string(),
            failure_code: None,
            failure_message: None,
        })
    }

    async fn create_subscription(
        &self,
        user_id: Uuid,
        plan_id: &str,
        _amount: i64,
        _trial_days: Option<i64>,
        _metadata: Option<Metadata>,
    ) -> Result<SubscriptionResponse, WhopError> {
        tracing::info!(user_id = %user_id, plan_id, "Creating mock subscription");

        Ok(SubscriptionResponse {
            id: format!("mock_sub_{}", Uuid::new_v4().simple()),
            status: "pending".to_string(),
            current_period_end: None,
            cancel_at_period_end: Some(false),
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<SubscriptionResponse, WhopError> {
        Ok(SubscriptionResponse {
            id: subscription_id.to_string(),
            status: if cancel_at_period_end { "active" } else { "canceled" }.to_string(),
            current_period_end: None,
            cancel_at_period_end: Some(cancel_at_period_end),
        })
    }

    async fn transfer(
        &self,
        destination_user_id: Uuid,
        amount: i64,
        _currency: &str,
        _method: PayoutMethod,
        _destination_account: &str,
        _description: &str,
    ) -> Result<TransferResponse, WhopError> {
        self.transfers.fetch_add(1, Ordering::SeqCst);

        if self.fail_transfers {
            return Err(Self::declined("transfer"));
        }

        tracing::info!(destination_user_id = %destination_user_id, amount, "Processing mock transfer");

        Ok(TransferResponse {
            id: format!("mock_tr_{}", Uuid::new_v4().simple()),
            status: "processing".to_string(),
        })
    }

    async fn refund(
        &self,
        payment_id: &str,
        amount: Option<i64>,
        _reason: Option<&str>,
    ) -> Result<RefundResponse, WhopError> {
        self.refunds.fetch_add(1, Ordering::SeqCst);

        if self.fail_refunds {
            return Err(Self::declined("refund"));
        }

        tracing::info!(payment_id, amount = ?amount, "Processing mock refund");

        Ok(RefundResponse {
            id: format!("mock_re_{}", Uuid::new_v4().simple()),
            status: "succeeded".to_string(),
            amount,
        })
    }
}
