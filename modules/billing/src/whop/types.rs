use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Common metadata type
pub type Metadata = HashMap<String, String>;

/// Charge response from the Whop API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeResponse {
    pub id: String,
    pub status: String,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

/// Subscription response from the Whop API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    pub id: String,
    pub status: String,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: Option<bool>,
}

/// Transfer response from the Whop API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResponse {
    pub id: String,
    pub status: String,
}

/// Refund response from the Whop API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundResponse {
    pub id: String,
    pub status: String,
    pub amount: Option<i64>,
}

/// Webhook event delivered by Whop. The `data` payload shape depends on the
/// event type; handlers pull the fields they need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: JsonValue,
}
