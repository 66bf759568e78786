use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

// ============================================================================
// STATUS ENUMS
// ============================================================================

/// Purchase status enum (matches billing_purchase_status in schema)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "billing_purchase_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
    PartiallyRefunded,
}

/// Ledger entry type enum (matches billing_transaction_type in schema)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "billing_transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    PickPurchase,
    PickSale,
    Subscription,
    SubscriptionRevenue,
    PlatformFee,
    Payout,
    Refund,
    Adjustment,
}

/// Ledger entry status enum (matches billing_transaction_status in schema)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "billing_transaction_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// Subscription status enum (matches billing_subscription_status in schema)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "billing_subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Canceled,
}

/// Payout status enum (matches billing_payout_status in schema)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "billing_payout_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Payout method enum (matches billing_payout_method in schema)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "billing_payout_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    Bank,
    Crypto,
    WhopBalance,
}

// ============================================================================
// DOMAIN RECORDS
// ============================================================================

/// Platform payment configuration (singleton row, lazily created)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct PaymentConfiguration {
    pub platform_fee_percent: i64,
    pub min_pick_price: i64,
    pub max_pick_price: i64,
    pub min_subscription_price: i64,
    pub max_subscription_price: i64,
    pub withdrawal_minimum: i64,
    pub withdrawal_enabled: bool,
    pub payment_provider: String,
}

impl PaymentConfiguration {
    /// Platform defaults used on first access: 15% fee, $0.50-$10,000 pick
    /// range, $4.99-$999.99 subscription range, $10.00 withdrawal minimum.
    pub fn platform_defaults() -> Self {
        Self {
            platform_fee_percent: 15,
            min_pick_price: 50,
            max_pick_price: 1_000_000,
            min_subscription_price: 499,
            max_subscription_price: 99_999,
            withdrawal_minimum: 1_000,
            withdrawal_enabled: true,
            payment_provider: "whop".to_string(),
        }
    }
}

/// One buyer's attempt to unlock one priced pick
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct Purchase {
    pub id: Uuid,
    pub user_id: Uuid,
    pub creator_id: Uuid,
    pub item_id: Uuid,
    pub amount: i64,
    pub platform_fee: i64,
    pub creator_earnings: i64,
    pub provider_payment_id: String,
    pub payment_method: Option<String>,
    pub status: PurchaseStatus,
    pub failure_reason: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub refund_amount: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable ledger entry for one money movement
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub status: TransactionStatus,
    pub provider_reference_id: Option<String>,
    pub reference_id: Option<Uuid>,
    pub description: String,
    pub metadata: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

/// Recurring subscriber-to-creator relationship
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct Subscription {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub creator_id: Uuid,
    pub provider_subscription_id: String,
    pub status: SubscriptionStatus,
    pub amount: i64,
    pub platform_fee: i64,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creator withdrawal record. A non-failed payout permanently reduces the
/// creator's computed balance.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct Payout {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub method: PayoutMethod,
    pub status: PayoutStatus,
    pub provider_transfer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-creator payout and subscription preferences
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct CreatorSettings {
    pub user_id: Uuid,
    pub provider_account_id: Option<String>,
    pub subscriptions_enabled: bool,
    pub auto_withdraw_enabled: bool,
    pub auto_withdraw_threshold: Option<i64>,
    pub payout_method: PayoutMethod,
    pub payout_destination: Option<String>,
}

// ============================================================================
// INSERT PAYLOADS (store inputs)
// ============================================================================

/// Fields for a new pending purchase row
#[derive(Debug, Clone)]
pub struct NewPurchase {
    pub user_id: Uuid,
    pub creator_id: Uuid,
    pub item_id: Uuid,
    pub amount: i64,
    pub platform_fee: i64,
    pub creator_earnings: i64,
    pub provider_payment_id: String,
    pub payment_method: Option<String>,
}

/// Fields for a new ledger entry
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub provider_reference_id: Option<String>,
    pub reference_id: Option<Uuid>,
    pub description: String,
    pub metadata: Option<JsonValue>,
}

/// Fields for a new pending subscription row
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub subscriber_id: Uuid,
    pub creator_id: Uuid,
    pub provider_subscription_id: String,
    pub amount: i64,
    pub platform_fee: i64,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
}

/// Fields for a new pending payout row
#[derive(Debug, Clone)]
pub struct NewPayout {
    pub user_id: Uuid,
    pub amount: i64,
    pub method: PayoutMethod,
}

// ============================================================================
// DERIVED / API MODELS
// ============================================================================

/// Fee split for one amount. Invariant: platform_fee + creator_earnings
/// always equals the original amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct FeeBreakdown {
    pub platform_fee: i64,
    pub creator_earnings: i64,
}

/// Result of a price range check. Expected-invalid input is reported here,
/// never as an error.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PriceValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PriceValidation {
    pub fn ok() -> Self {
        Self { valid: true, reason: None }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self { valid: false, reason: Some(reason.into()) }
    }
}

/// Derived subscription statistics for one creator
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CreatorStats {
    pub active_subscribers: i64,
    pub monthly_recurring_revenue: i64,
    pub churn_rate: f64,
    pub average_subscription_value: i64,
}

/// Request body for initiating a pick purchase
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePurchaseRequest {
    pub user_id: Uuid,
    pub creator_id: Uuid,
    pub item_id: Uuid,
    pub amount: i64,
    pub payment_method: Option<String>,
}

/// Request body for creating a subscription
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSubscriptionRequest {
    pub subscriber_id: Uuid,
    pub creator_id: Uuid,
    pub amount: i64,
}

/// Request body for canceling a subscription
#[derive(Debug, Deserialize, ToSchema)]
pub struct CancelSubscriptionRequest {
    pub subscriber_id: Uuid,
    pub creator_id: Uuid,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

/// Request body for a manual payout
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePayoutRequest {
    pub user_id: Uuid,
    pub amount: i64,
}

/// Request body for a refund
#[derive(Debug, Deserialize, ToSchema)]
pub struct RefundRequest {
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

/// Request body for updating creator payout settings
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateCreatorSettingsRequest {
    pub provider_account_id: Option<String>,
    #[serde(default = "default_true")]
    pub subscriptions_enabled: bool,
    #[serde(default)]
    pub auto_withdraw_enabled: bool,
    pub auto_withdraw_threshold: Option<i64>,
    pub payout_method: PayoutMethod,
    pub payout_destination: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Balance response for a creator
#[derive(Debug, Serialize, ToSchema)]
pub struct BalanceResponse {
    pub user_id: Uuid,
    pub balance: i64,
}

/// Query parameters for listing a user's transactions
#[derive(Debug, Default, Deserialize)]
pub struct TransactionListQuery {
    pub transaction_type: Option<TransactionType>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Admin filter for listing transactions across users
#[derive(Debug, Default, Deserialize)]
pub struct AdminTransactionQuery {
    pub user_id: Option<Uuid>,
    pub transaction_type: Option<TransactionType>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Admin filter for listing payouts across users
#[derive(Debug, Default, Deserialize)]
pub struct AdminPayoutQuery {
    pub user_id: Option<Uuid>,
    pub status: Option<PayoutStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Standard error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }
}
