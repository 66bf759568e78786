use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub billing_purchases_total: IntCounterVec,
    pub billing_subscriptions_total: IntCounterVec,
    pub billing_payouts_total: IntCounterVec,
    pub billing_webhook_events_total: IntCounterVec,
    pub billing_idempotent_skips_total: IntCounterVec,

    // Histograms
    pub http_request_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let billing_purchases_total = IntCounterVec::new(
            Opts::new("billing_purchases_total", "Pick purchase settlements"),
            &["result"], // created|completed|failed|refunded|rejected
        )
        .expect("metric");

        let billing_subscriptions_total = IntCounterVec::new(
            Opts::new("billing_subscriptions_total", "Subscription lifecycle events"),
            &["action", "result"], // action: create|activate|renew|cancel|deactivate
        )
        .expect("metric");

        let billing_payouts_total = IntCounterVec::new(
            Opts::new("billing_payouts_total", "Payout requests"),
            &["result"], // created|in_flight|failed|rejected
        )
        .expect("metric");

        let billing_webhook_events_total = IntCounterVec::new(
            Opts::new("billing_webhook_events_total", "Provider webhook deliveries"),
            &["event_type", "result"], // result: processed|skipped|rejected|error
        )
        .expect("metric");

        let billing_idempotent_skips_total = IntCounterVec::new(
            Opts::new(
                "billing_idempotent_skips_total",
                "Writes suppressed because the effect was already recorded",
            ),
            &["operation"], // purchase_completion|billing_period|payout|refund
        )
        .expect("metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request duration seconds"),
            &["path", "method", "status"],
        )
        .expect("metric");

        registry
            .register(Box::new(billing_purchases_total.clone()))
            .unwrap();
        registry
            .register(Box::new(billing_subscriptions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(billing_payouts_total.clone()))
            .unwrap();
        registry
            .register(Box::new(billing_webhook_events_total.clone()))
            .unwrap();
        registry
            .register(Box::new(billing_idempotent_skips_total.clone()))
            .unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();

        Self {
            registry,
            billing_purchases_total,
            billing_subscriptions_total,
            billing_payouts_total,
            billing_webhook_events_total,
            billing_idempotent_skips_total,
            http_request_duration_seconds,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&mf, &mut buf)
            .map_err(|e| format!("encode metrics: {}", e))?;
        String::from_utf8(buf).map_err(|e| format!("metrics utf8: {}", e))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
