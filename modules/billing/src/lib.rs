pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod whop;

pub use config::{Config, GatewayType, StoreType};
pub use error::{BillingError, BillingResult};
pub use metrics::Metrics;
pub use routes::{billing_router, AppState};
pub use services::{
    calculate_fees, AutoWithdrawalOutcome, BillingOutcome, ConfigService, PayoutEngine,
    PayoutRequestOutcome, RefundOutcome, SettlementEngine, SubscriptionEngine,
};
pub use store::{BillingStore, CompletionOutcome, MemoryStore, PgStore};
pub use whop::{mock::MockGateway, PaymentGateway, WhopClient, WhopConfig};
