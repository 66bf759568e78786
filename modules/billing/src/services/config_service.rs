//! Platform configuration and fee math.
//!
//! The configuration row is a lazily created singleton; fee calculation and
//! price validation read it on every call so admin changes take effect
//! without restarts.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::models::{FeeBreakdown, PaymentConfiguration, PriceValidation};
use crate::store::BillingStore;

/// Compute the platform fee split for an amount in minor units.
///
/// Rounding is half-up on minor units and `creator_earnings` is derived by
/// subtraction, so `platform_fee + creator_earnings == amount` holds for
/// every valid input. That split is a checked invariant, not a convention.
pub fn calculate_fees(amount: i64, fee_percent: i64) -> BillingResult<FeeBreakdown> {
    if amount <= 0 {
        return Err(BillingError::Validation(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    if !(0..=100).contains(&fee_percent) {
        return Err(BillingError::Validation(format!(
            "fee percent must be within 0-100, got {}",
            fee_percent
        )));
    }

    // Integer round-half-up of amount * percent / 100.
    let platform_fee = (amount * fee_percent + 50) / 100;
    let creator_earnings = amount - platform_fee;

    if platform_fee + creator_earnings != amount || platform_fee < 0 || creator_earnings < 0 {
        return Err(BillingError::Invariant(format!(
            "fee split {} + {} does not sum to {}",
            platform_fee, creator_earnings, amount
        )));
    }

    Ok(FeeBreakdown {
        platform_fee,
        creator_earnings,
    })
}

/// Range check for a one-time pick price.
pub fn validate_pick_price(config: &PaymentConfiguration, price: i64) -> PriceValidation {
    if price < config.min_pick_price {
        return PriceValidation::invalid(format!(
            "pick price {} is below the minimum of {} cents",
            price, config.min_pick_price
        ));
    }
    if price > config.max_pick_price {
        return PriceValidation::invalid(format!(
            "pick price {} is above the maximum of {} cents",
            price, config.max_pick_price
        ));
    }
    PriceValidation::ok()
}

/// Range check for a monthly subscription price.
pub fn validate_subscription_price(config: &PaymentConfiguration, price: i64) -> PriceValidation {
    if price < config.min_subscription_price {
        return PriceValidation::invalid(format!(
            "subscription price {} is below the minimum of {} cents",
            price, config.min_subscription_price
        ));
    }
    if price > config.max_subscription_price {
        return PriceValidation::invalid(format!(
            "subscription price {} is above the maximum of {} cents",
            price, config.max_subscription_price
        ));
    }
    PriceValidation::ok()
}

/// Read access to the singleton payment configuration.
#[derive(Clone)]
pub struct ConfigService {
    store: Arc<dyn BillingStore>,
}

impl ConfigService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Fetch the platform configuration, creating it with the documented
    /// defaults on first access.
    pub async fn get_configuration(&self) -> BillingResult<PaymentConfiguration> {
        self.store
            .get_or_create_configuration(&PaymentConfiguration::platform_defaults())
            .await
    }

    pub async fn validate_pick_price(&self, price: i64) -> BillingResult<PriceValidation> {
        let config = self.get_configuration().await?;
        Ok(validate_pick_price(&config, price))
    }

    pub async fn validate_subscription_price(&self, price: i64) -> BillingResult<PriceValidation> {
        let config = self.get_configuration().await?;
        Ok(validate_subscription_price(&config, price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_split_basic() {
        // $5.00 at 15% -> 75 cent fee, 425 cent earnings
        let fees = calculate_fees(500, 15).unwrap();
        assert_eq!(fees.platform_fee, 75);
        assert_eq!(fees.creator_earnings, 425);
    }

    #[test]
    fn fee_split_rounds_half_up() {
        // 999 * 15% = 149.85 -> 150
        let fees = calculate_fees(999, 15).unwrap();
        assert_eq!(fees.platform_fee, 150);
        assert_eq!(fees.creator_earnings, 849);

        // 30 * 15% = 4.5 -> 5
        let fees = calculate_fees(30, 15).unwrap();
        assert_eq!(fees.platform_fee, 5);
    }

    #[test]
    fn fee_split_always_sums_to_amount() {
        for pct in 0..=100 {
            for amount in [1, 49, 50, 99, 100, 101, 499, 999, 12_345, 1_000_000] {
                let fees = calculate_fees(amount, pct).unwrap();
                assert_eq!(
                    fees.platform_fee + fees.creator_earnings,
                    amount,
                    "split broke for amount {} at {}%",
                    amount,
                    pct
                );
                assert!(fees.platform_fee >= 0);
                assert!(fees.creator_earnings >= 0);
            }
        }
    }

    #[test]
    fn fee_split_boundary_percents() {
        let fees = calculate_fees(1000, 0).unwrap();
        assert_eq!(fees.platform_fee, 0);
        assert_eq!(fees.creator_earnings, 1000);

        let fees = calculate_fees(1000, 100).unwrap();
        assert_eq!(fees.platform_fee, 1000);
        assert_eq!(fees.creator_earnings, 0);
    }

    #[test]
    fn fee_split_rejects_bad_input() {
        assert!(calculate_fees(0, 15).is_err());
        assert!(calculate_fees(-100, 15).is_err());
        assert!(calculate_fees(500, -1).is_err());
        assert!(calculate_fees(500, 101).is_err());
    }

    #[test]
    fn pick_price_range() {
        let config = PaymentConfiguration::platform_defaults();
        assert!(validate_pick_price(&config, 50).valid);
        assert!(validate_pick_price(&config, 1_000_000).valid);
        assert!(!validate_pick_price(&config, 49).valid);
        assert!(!validate_pick_price(&config, 1_000_001).valid);
    }

    #[test]
    fn subscription_price_range() {
        let config = PaymentConfiguration::platform_defaults();
        assert!(validate_subscription_price(&config, 499).valid);
        assert!(validate_subscription_price(&config, 99_999).valid);
        assert!(!validate_subscription_price(&config, 498).valid);
        assert!(!validate_subscription_price(&config, 100_000).valid);
    }
}
