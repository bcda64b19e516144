//! Request pacing for completion gateways.
//!
//! Uses the governor crate (GCRA) to hold each call until the configured
//! requests-per-minute quota allows it. Pacing never fails a call and knows
//! nothing about retries; a limiter can be shared by several gateways so
//! they draw from one quota.

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use novelize_core::{CompletionGateway, CompletionOptions, GatewayError, RateLimitConfig};

/// Unkeyed in-memory GCRA limiter
pub type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Build a limiter from config; `None` when pacing is disabled
pub fn limiter_from_config(config: &RateLimitConfig) -> Option<Arc<DirectRateLimiter>> {
    let rpm = NonZeroU32::new(config.requests_per_minute?)?;
    let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
    Some(Arc::new(RateLimiter::direct(
        Quota::per_minute(rpm).allow_burst(burst),
    )))
}

/// Gateway decorator that waits for the limiter before every call
pub struct RateLimitedGateway<G> {
    inner: G,
    limiter: Arc<DirectRateLimiter>,
}

impl<G: CompletionGateway> RateLimitedGateway<G> {
    /// Share an existing limiter
    pub fn new(inner: G, limiter: Arc<DirectRateLimiter>) -> Self {
        Self { inner, limiter }
    }

    /// Wrap `inner` when pacing is configured
    pub fn from_config(inner: G, config: &RateLimitConfig) -> Option<Self> {
        limiter_from_config(config).map(|limiter| Self::new(inner, limiter))
    }

    pub fn limiter(&self) -> &Arc<DirectRateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl<G: CompletionGateway> CompletionGateway for RateLimitedGateway<G> {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, GatewayError> {
        self.limiter.until_ready().await;
        self.inner.complete(prompt, options).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingGateway(AtomicU32);

    #[async_trait]
    impl CompletionGateway for CountingGateway {
        async fn complete(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
        ) -> Result<String, GatewayError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok("ok".to_string())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn test_disabled_pacing() {
        assert!(limiter_from_config(&RateLimitConfig::default()).is_none());
        let zero = RateLimitConfig {
            requests_per_minute: Some(0),
            burst: 1,
        };
        assert!(limiter_from_config(&zero).is_none());
    }

    #[tokio::test]
    async fn test_burst_passes_then_quota_is_spent() {
        let config = RateLimitConfig {
            requests_per_minute: Some(1),
            burst: 2,
        };
        let gateway = RateLimitedGateway::from_config(CountingGateway(AtomicU32::new(0)), &config)
            .unwrap();

        for _ in 0..2 {
            let out = tokio::time::timeout(
                Duration::from_secs(1),
                gateway.complete("p", &CompletionOptions::default()),
            )
            .await
            .expect("burst calls should not wait")
            .unwrap();
            assert_eq!(out, "ok");
        }

        assert_eq!(gateway.inner.0.load(Ordering::SeqCst), 2);
        assert!(gateway.limiter().check().is_err());
    }

    #[tokio::test]
    async fn test_shared_limiter_spans_gateways() {
        let config = RateLimitConfig {
            requests_per_minute: Some(1),
            burst: 1,
        };
        let limiter = limiter_from_config(&config).unwrap();
        let first = RateLimitedGateway::new(CountingGateway(AtomicU32::new(0)), limiter.clone());
        let _second = RateLimitedGateway::new(CountingGateway(AtomicU32::new(0)), limiter.clone());

        first
            .complete("p", &CompletionOptions::default())
            .await
            .unwrap();
        assert!(limiter.check().is_err());
    }
}
