// src/utils.rs

use std::future::Future;
use std::time::Duration;

use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config;

/// Retry policy with exponential backoff and jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Add ±30% random jitter to every wait
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: config::RETRY_MAX_RETRIES,
            initial_backoff_ms: config::RETRY_INITIAL_BACKOFF_MS,
            max_backoff_ms: config::RETRY_MAX_BACKOFF_MS,
            backoff_multiplier: config::RETRY_BACKOFF_MULTIPLIER,
            jitter: true,
        }
    }
}

/// Runs `f` until it succeeds, fails with an error `should_retry` rejects,
/// or `max_retries` retries are used up. The last error is returned.
pub async fn with_retry<F, Fut, T, E, P>(config: &RetryConfig, should_retry: P, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    let mut backoff = Duration::from_millis(config.initial_backoff_ms);
    let cap = Duration::from_millis(config.max_backoff_ms);

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }
                attempt += 1;
                if attempt > config.max_retries {
                    warn!("Giving up after {} retries: {}", config.max_retries, e);
                    return Err(e);
                }

                let delay = calculate_backoff(backoff, config.jitter);
                warn!(
                    "Retry attempt {}/{} in {:?} after: {}",
                    attempt, config.max_retries, delay, e
                );
                tokio::time::sleep(delay).await;

                backoff = Duration::from_millis(
                    ((backoff.as_millis() as f64 * config.backoff_multiplier)
                        .min(cap.as_millis() as f64)) as u64,
                );
            }
        }
    }
}

fn calculate_backoff(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    } else {
        base
    }
}

/// 64-bit FNV-1a. Stable across builds and platforms, unlike `DefaultHasher`.
pub fn fnv1a(bytes: impl IntoIterator<Item = u8>) -> u64 {
    bytes.into_iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FetchError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = with_retry(&fast(), FetchError::is_transient, move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FetchError::Transient("timeout".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_stop_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), FetchError> = with_retry(&fast(), FetchError::is_transient, move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Permanent("no such course".into())) }
        })
        .await;
        assert!(matches!(result, Err(FetchError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), FetchError> = with_retry(&fast(), FetchError::is_transient, move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Transient("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn fnv1a_matches_reference_values() {
        assert_eq!(fnv1a(Vec::new()), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(*b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
