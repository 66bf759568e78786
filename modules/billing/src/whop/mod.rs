pub mod error;
pub mod mock;
pub mod types;
pub mod webhook;

use async_trait::async_trait;
use error::WhopError;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use types::{ChargeResponse, Metadata, RefundResponse, SubscriptionResponse, TransferResponse};
use uuid::Uuid;

use crate::models::PayoutMethod;

/// Provider operations the billing engines depend on. `WhopClient` is the
/// production implementation; `mock::MockGateway` substitutes in tests and
/// local development.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(
        &self,
        user_id: Uuid,
        amount: i64,
        currency: &str,
        description: &str,
        metadata: Option<Metadata>,
    ) -> Result<ChargeResponse, WhopError>;

    async fn create_subscription(
        &self,
        user_id: Uuid,
        plan_id: &str,
        amount: i64,
        trial_days: Option<i64>,
        metadata: Option<Metadata>,
    ) -> Result<SubscriptionResponse, WhopError>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<SubscriptionResponse, WhopError>;

    async fn transfer(
        &self,
        destination_user_id: Uuid,
        amount: i64,
        currency: &str,
        method: PayoutMethod,
        destination_account: &str,
        description: &str,
    ) -> Result<TransferResponse, WhopError>;

    async fn refund(
        &self,
        payment_id: &str,
        amount: Option<i64>,
        reason: Option<&str>,
    ) -> Result<RefundResponse, WhopError>;
}

/// Configuration for the Whop API client
#[derive(Debug, Clone)]
pub struct WhopConfig {
    pub api_key: String,
    pub company_id: String,
    pub webhook_secret: String,
    pub sandbox: bool,
    pub base_path: String,
}

impl WhopConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, WhopError> {
        let api_key = std::env::var("WHOP_API_KEY")
            .map_err(|_| WhopError::ConfigError("Missing WHOP_API_KEY".to_string()))?;
        let company_id = std::env::var("WHOP_COMPANY_ID")
            .map_err(|_| WhopError::ConfigError("Missing WHOP_COMPANY_ID".to_string()))?;
        let webhook_secret = std::env::var("WHOP_WEBHOOK_SECRET")
            .map_err(|_| WhopError::ConfigError("Missing WHOP_WEBHOOK_SECRET".to_string()))?;

        let sandbox = std::env::var("WHOP_SANDBOX")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let base_path = if sandbox {
            "https://sandbox-api.whop.com".to_string()
        } else {
            "https://api.whop.com".to_string()
        };

        Ok(WhopConfig {
            api_key,
            company_id,
            webhook_secret,
            sandbox,
            base_path,
        })
    }
}

/// Main Whop API client
#[derive(Clone)]
pub struct WhopClient {
    config: Arc<WhopConfig>,
    http_client: Client,
}

#[derive(Debug, Serialize)]
struct CreateChargeRequest {
    user_id: String,
    amount: i64,
    currency: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
}

#[derive(Debug, Serialize)]
struct CreateSubscriptionRequest {
    user_id: String,
    plan_id: String,
    price: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    trial_days: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
}

#[derive(Debug, Serialize)]
struct CancelSubscriptionRequest {
    cancel_at_period_end: bool,
}

#[derive(Debug, Serialize)]
struct CreateTransferRequest {
    destination_user_id: String,
    amount: i64,
    currency: String,
    method: String,
    destination_account: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct CreateRefundRequest {
    payment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl WhopClient {
    /// Create a new Whop client with the given configuration
    pub fn new(config: WhopConfig) -> Result<Self, WhopError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| WhopError::HttpError(e.to_string()))?;

        Ok(WhopClient {
            config: Arc::new(config),
            http_client,
        })
    }

    /// Create a new Whop client from environment variables
    pub fn from_env() -> Result<Self, WhopError> {
        let config = WhopConfig::from_env()?;
        Self::new(config)
    }

    /// Make a POST request to the Whop API
    async fn post<T: serde::de::DeserializeOwned, B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, WhopError> {
        let url = format!("{}{}", self.config.base_path, path);
        let response = self.http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("whop-company", &self.config.company_id)
            .json(body)
            .send()
            .await
            .map_err(|e| WhopError::HttpError(e.to_string()))?;

        self.handle_response(response).await
    }

    /// Handle HTTP response and convert to appropriate type or error
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, WhopError> {
        let status = response.status();

        if status.is_success() {
            response.json::<T>().await
                .map_err(|e| WhopError::ParseError(e.to_string()))
        } else {
            let error_body = response.text().await
                .unwrap_or_else(|_| "Unable to read error response".to_string());

            Err(WhopError::ApiError {
                status_code: status.as_u16(),
                message: error_body,
            })
        }
    }

    /// Get the config for webhook verification
    pub fn config(&self) -> &WhopConfig {
        &self.config
    }
}

#[async_trait]
impl PaymentGateway for WhopClient {
    async fn charge(
        &self,
        user_id: Uuid,
        amount: i64,
        currency: &str,
        description: &str,
        metadata: Option<Metadata>,
    ) -> Result<ChargeResponse, WhopError> {
        let request = CreateChargeRequest {
            user_id: user_id.to_string(),
            amount,
            currency: currency.to_string(),
            description: description.to_string(),
            metadata,
        };

        self.post("/v2/charges", &request).await
    }

    async fn create_subscription(
        &self,
        user_id: Uuid,
        plan_id: &str,
        amount: i64,
        trial_days: Option<i64>,
        metadata: Option<Metadata>,
    ) -> Result<SubscriptionResponse, WhopError> {
        let request = CreateSubscriptionRequest {
            user_id: user_id.to_string(),
            plan_id: plan_id.to_string(),
            price: amount,
            trial_days,
            metadata,
        };

        self.post("/v2/subscriptions", &request).await
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<SubscriptionResponse, WhopError> {
        let path = format!("/v2/subscriptions/{}/cancel", subscription_id);
        let request = CancelSubscriptionRequest { cancel_at_period_end };

        self.post(&path, &request).await
    }

    async fn transfer(
        &self,
        destination_user_id: Uuid,
        amount: i64,
        currency: &str,
        method: PayoutMethod,
        destination_account: &str,
        description: &str,
    ) -> Result<TransferResponse, WhopError> {
        let method = match method {
            PayoutMethod::Bank => "bank",
            PayoutMethod::Crypto => "crypto",
            PayoutMethod::WhopBalance => "whop_balance",
        };

        let request = CreateTransferRequest {
            destination_user_id: destination_user_id.to_string(),
            amount,
            currency: currency.to_string(),
            method: method.to_string(),
            destination_account: destination_account.to_string(),
            description: description.to_string(),
        };

        self.post("/v2/transfers", &request).await
    }

    async fn refund(
        &self,
        payment_id: &str,
        amount: Option<i64>,
        reason: Option<&str>,
    ) -> Result<RefundResponse, WhopError> {
        let request = CreateRefundRequest {
            payment_id: payment_id.to_string(),
            amount,
            reason: reason.map(|r| r.to_string()),
        };

        self.post("/v2/refunds", &request).await
    }
}
