pub mod config_service;
pub mod payouts;
pub mod settlement;
pub mod subscriptions;

pub use config_service::{calculate_fees, ConfigService};
pub use payouts::{AutoWithdrawalOutcome, PayoutEngine, PayoutRequestOutcome};
pub use settlement::{RefundOutcome, SettlementEngine};
pub use subscriptions::{BillingOutcome, SubscriptionEngine};
