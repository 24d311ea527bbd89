//! Retry utilities with exponential backoff and jitter.
//!
//! Transient failures — an SSH dial racing the guest's sshd, the kubeadm
//! addon phase racing old-pod shutdown — are retried with exponential
//! backoff and jitter. Retries are always bounded here; unbounded polling
//! against a deadline lives in the verifier instead.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// SSH session dial policy: base 250 ms, cap 2 s, 5 attempts.
    pub fn ssh_dial() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }

    /// Kubeadm addon-phase policy: base 1 s, cap 30 s, 8 attempts.
    pub fn kubeadm_addon() -> RetryConfig {
        RetryConfig {
            max_attempts: 8,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter until it
/// succeeds or `max_attempts` is exhausted.
///
/// Jitter spreads concurrent retries (0.5x to 1.5x of the delay) so
/// parallel starts on one workstation don't hammer in lockstep.
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
                if attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "operation failed after max retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_immediately() {
        let result: Result<i32, &str> =
            retry_with_backoff(&fast(3), "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn named_policies_match_their_contracts() {
        let ssh = RetryConfig::ssh_dial();
        assert_eq!(ssh.max_attempts, 5);
        assert_eq!(ssh.initial_delay, Duration::from_millis(250));
        assert_eq!(ssh.max_delay, Duration::from_secs(2));

        let addon = RetryConfig::kubeadm_addon();
        assert_eq!(addon.initial_delay, Duration::from_secs(1));
        assert_eq!(addon.max_delay, Duration::from_secs(30));
    }
}
