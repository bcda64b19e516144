//! Retry layer for completion gateways.
//!
//! [`RetryingGateway`] wraps any gateway and retries throttled or transient
//! failures with exponential backoff:
//! - each attempt may run under a timeout; a timed-out attempt counts as transient.
//!   When pacing sits below this layer, use [`TimeoutGateway`] under the pacing
//!   instead, so waiting for a slot is not mistaken for a slow provider
//! - `Fatal` failures return immediately, never retried
//! - once `max_attempts` attempts have failed the call reports `Exhausted`
//!
//! Pacing is a separate concern handled by [`crate::RateLimitedGateway`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use novelize_core::{CompletionGateway, CompletionOptions, GatewayError, RetryConfig};
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};
use tracing::warn;

/// Backoff and attempt-cap parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay unit; retry n (counting from 1) waits `base_delay * multiplier^n`
    pub base_delay: Duration,
    pub multiplier: u64,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Per-attempt timeout
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), 60)
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig, timeout_secs: u64) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }

    /// Policy that retries without sleeping
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            multiplier: 1,
            max_delay: Duration::ZERO,
            jitter: false,
            timeout: None,
        }
    }

    /// Set the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Waits between consecutive attempts
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let retries = self.max_attempts.saturating_sub(1) as usize;
        let backoff = ExponentialBackoff::from_millis(self.multiplier.max(1))
            .factor(self.base_delay.as_millis() as u64)
            .max_delay(self.max_delay);

        if self.jitter {
            Box::new(backoff.map(jitter).take(retries))
        } else {
            Box::new(backoff.take(retries))
        }
    }
}

/// Gateway decorator adding timeouts and bounded exponential retry
pub struct RetryingGateway<G> {
    inner: G,
    policy: RetryPolicy,
    retries: AtomicU64,
    exhausted: AtomicU64,
}

impl<G: CompletionGateway> RetryingGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Total retries performed across all calls
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Calls that ran out of attempts
    pub fn exhausted_calls(&self) -> u64 {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

async fn attempt<G: CompletionGateway>(
    inner: &G,
    timeout: Option<Duration>,
    prompt: &str,
    options: &CompletionOptions,
) -> Result<String, GatewayError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, inner.complete(prompt, options))
            .await
            .map_err(|_| {
                GatewayError::Transient(format!("timed out after {}ms", limit.as_millis()))
            })?,
        None => inner.complete(prompt, options).await,
    }
}

/// Per-call deadline as a layer of its own.
///
/// Placed directly around the provider so that time spent waiting for a
/// pacing slot above it never counts against the deadline.
pub struct TimeoutGateway<G> {
    inner: G,
    timeout: Duration,
}

impl<G: CompletionGateway> TimeoutGateway<G> {
    pub fn new(inner: G, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl<G: CompletionGateway> CompletionGateway for TimeoutGateway<G> {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, GatewayError> {
        attempt(&self.inner, Some(self.timeout), prompt, options).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[async_trait]
impl<G: CompletionGateway> CompletionGateway for RetryingGateway<G> {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, GatewayError> {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let inner = &self.inner;
        let timeout = self.policy.timeout;

        let result = Retry::spawn(self.policy.delays(), move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            match attempt(inner, timeout, prompt, options).await {
                Ok(text) => Ok(text),
                Err(e) if e.is_retryable() => {
                    warn!(gateway = inner.name(), attempt = n, error = %e, "Retryable gateway failure");
                    Err(RetryError::Transient {
                        err: e,
                        retry_after: None,
                    })
                }
                Err(e) => Err(RetryError::Permanent(e)),
            }
        })
        .await;

        let made = attempts.load(Ordering::SeqCst);
        if made > 1 {
            self.retries
                .fetch_add(u64::from(made - 1), Ordering::SeqCst);
        }

        match result {
            Ok(text) => Ok(text),
            Err(e) if e.is_retryable() => {
                self.exhausted.fetch_add(1, Ordering::SeqCst);
                warn!(gateway = self.inner.name(), attempts = made, "Gateway retries exhausted");
                Err(GatewayError::Exhausted {
                    attempts: made,
                    message: e.message().to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fails with the scripted errors in order, then succeeds
    struct FlakyGateway {
        failures: Mutex<Vec<GatewayError>>,
        calls: AtomicU32,
    }

    impl FlakyGateway {
        fn new(mut failures: Vec<GatewayError>) -> Self {
            failures.reverse();
            Self {
                failures: Mutex::new(failures),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionGateway for FlakyGateway {
        async fn complete(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
        ) -> Result<String, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failures.lock().unwrap().pop() {
                Some(err) => Err(err),
                None => Ok("ok".to_string()),
            }
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    struct SlowGateway;

    #[async_trait]
    impl CompletionGateway for SlowGateway {
        async fn complete(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
        ) -> Result<String, GatewayError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn throttled(n: usize) -> Vec<GatewayError> {
        (0..n)
            .map(|_| GatewayError::Throttled("Too many requests".to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_succeeds_after_three_throttles_with_cap_five() {
        let gateway = RetryingGateway::new(FlakyGateway::new(throttled(3)), RetryPolicy::immediate(5));

        let text = gateway
            .complete("p", &CompletionOptions::default())
            .await
            .unwrap();

        assert_eq!(text, "ok");
        assert_eq!(gateway.retries(), 3);
        assert_eq!(gateway.inner().calls(), 4);
        assert_eq!(gateway.exhausted_calls(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_with_cap_two() {
        let gateway = RetryingGateway::new(FlakyGateway::new(throttled(3)), RetryPolicy::immediate(2));

        let err = gateway
            .complete("p", &CompletionOptions::default())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            GatewayError::Exhausted {
                attempts: 2,
                message: "Too many requests".to_string()
            }
        );
        assert_eq!(gateway.inner().calls(), 2);
        assert_eq!(gateway.retries(), 1);
        assert_eq!(gateway.exhausted_calls(), 1);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let gateway = RetryingGateway::new(
            FlakyGateway::new(vec![GatewayError::Fatal("invalid api key".to_string())]),
            RetryPolicy::immediate(5),
        );

        let err = gateway
            .complete("p", &CompletionOptions::default())
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(gateway.inner().calls(), 1);
        assert_eq!(gateway.retries(), 0);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let gateway = RetryingGateway::new(
            FlakyGateway::new(vec![GatewayError::Transient("503".to_string())]),
            RetryPolicy::immediate(3),
        );

        assert!(gateway
            .complete("p", &CompletionOptions::default())
            .await
            .is_ok());
        assert_eq!(gateway.retries(), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_attempt() {
        let policy = RetryPolicy::immediate(2).with_timeout(Duration::from_millis(10));
        let gateway = RetryingGateway::new(SlowGateway, policy);

        let err = gateway
            .complete("p", &CompletionOptions::default())
            .await
            .unwrap_err();

        match err {
            GatewayError::Exhausted { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_delays_grow_and_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            multiplier: 2,
            max_delay: Duration::from_millis(5000),
            jitter: false,
            timeout: None,
        };

        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(5000),
                Duration::from_millis(5000),
            ]
        );
    }

    #[test]
    fn test_first_retry_waits_base_times_multiplier() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        let delays: Vec<_> = RetryPolicy::from_config(&config, 60).delays().collect();

        // base_delay_ms * multiplier^n for retry n = 1, 2, ...
        assert_eq!(delays.len(), 4);
        assert_eq!(delays[0], Duration::from_millis(2000));
        assert_eq!(delays[1], Duration::from_millis(4000));
        assert_eq!(delays[3], Duration::from_millis(16_000));
    }

    #[tokio::test]
    async fn test_timeout_layer_reports_transient() {
        let gateway = TimeoutGateway::new(SlowGateway, Duration::from_millis(10));
        let err = gateway
            .complete("p", &CompletionOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Transient(ref m) if m.contains("timed out")));
        assert_eq!(gateway.name(), "slow");
    }

    #[test]
    fn test_single_attempt_has_no_delays() {
        assert_eq!(RetryPolicy::immediate(1).delays().count(), 0);
    }
}
