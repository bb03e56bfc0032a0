//! Retry utilities for operations that fail transiently.
//!
//! Two policies are in use:
//!
//! - Exponential backoff with jitter for ordinary external calls.
//! - Fixed-interval polling for the two readiness loops (API reachability,
//!   cloud role propagation), where the overall budget is simply
//!   `attempts x delay`. The interval is a tunable, not a contract.
//!
//! # Example
//!
//! ```ignore
//! use stratus::retry::{retry_with_backoff, RetryConfig};
//!
//! let result = retry_with_backoff(
//!     &RetryConfig::fixed(30, Duration::from_secs(5)),
//!     "wait_for_api",
//!     || async { client.get(&ready_url).send().await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 = fixed interval)
    pub backoff_multiplier: f64,
    /// Whether to apply 0.5x-1.5x jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a fixed-interval config: `attempts` tries, `delay` between each,
    /// no backoff, no jitter. Overall budget is `attempts x delay`.
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Execute an async operation under the given retry policy.
///
/// Retries until success, or until `max_attempts` is exhausted (when set).
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
///
/// # Returns
/// The result of the operation, or the last error if max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let sleep_for = if config.jitter {
                    // 0.5x to 1.5x of the delay
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
                } else {
                    delay
                };

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = sleep_for.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(sleep_for).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
