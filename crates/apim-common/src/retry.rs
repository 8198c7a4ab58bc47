//! Bounded exponential backoff for Kubernetes API reads
//!
//! A restarting API server or a throttled request should not fail the HTTP
//! call that triggered it. Only errors the caller classifies as transient
//! are retried; everything else is returned on the attempt it occurs.
//!
//! ```ignore
//! use apim_common::error::is_transient_kube_error;
//! use apim_common::retry::{retry_transient, Backoff};
//!
//! let page = retry_transient(&Backoff::default(), "list_policies", is_transient_kube_error, || {
//!     api.list(&params)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff schedule for a retried call
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Total attempts, including the first; never less than one
    pub attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound of any single delay
    pub max_delay: Duration,
    /// Growth factor between delays
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Default schedule with a different attempt count
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts,
            ..Default::default()
        }
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `operation`, retrying errors for which `is_transient` holds
pub async fn retry_transient<F, Fut, T, E, P>(
    backoff: &Backoff,
    operation_name: &str,
    is_transient: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let attempts = backoff.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_transient(&err) {
            return Err(err);
        }
        if attempt >= attempts {
            error!(operation = %operation_name, attempt, error = %err, "Giving up after transient failures");
            return Err(err);
        }

        let delay = backoff
            .delay_after(attempt)
            .mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
