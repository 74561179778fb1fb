//! Bounded polling with exponential backoff
//!
//! Used for long-running remote jobs (annotation export). A probe reporting
//! `Pending` is called again after a growing delay until it reports `Ready`
//! or the overall deadline passes. A probe error ends polling immediately;
//! failed calls are never retried.

use segloop_common::config::PollConfig;
use segloop_common::{Error, Result};
use std::time::{Duration, Instant};

/// Backoff schedule and overall deadline
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from(&PollConfig::default())
    }
}

impl From<&PollConfig> for PollPolicy {
    fn from(config: &PollConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
            deadline: Duration::from_secs(config.deadline_secs),
        }
    }
}

impl PollPolicy {
    /// Delay before attempt `attempt + 1` (attempt counted from 1)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Probe result
#[derive(Debug)]
pub enum PollStatus<T> {
    Ready(T),
    Pending,
}

/// Call `probe` until it is ready.
///
/// Returns `Error::Timeout` when the next sleep would cross the deadline.
pub async fn poll_until<F, Fut, T>(operation_name: &str, policy: PollPolicy, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<PollStatus<T>>>,
{
    let start_time = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match probe().await? {
            PollStatus::Ready(value) => {
                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    elapsed_ms = start_time.elapsed().as_millis() as u64,
                    "Poll finished"
                );
                return Ok(value);
            }
            PollStatus::Pending => {
                let delay = policy.delay_after(attempt);
                let elapsed = start_time.elapsed();

                if elapsed + delay > policy.deadline {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        deadline_ms = policy.deadline.as_millis() as u64,
                        "Polling deadline exceeded"
                    );
                    return Err(Error::Timeout(format!(
                        "{} not finished after {} attempts ({} ms elapsed, deadline {} ms)",
                        operation_name,
                        attempt,
                        elapsed.as_millis(),
                        policy.deadline.as_millis()
                    )));
                }

                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    "Still pending, polling again after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
