// Retry execution: until/retries/delay loop around task attempts
//
// Delay strategies:
// - fixed
// - exponential with optional jitter
// - linear

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use super::context::ExecutionContext;
use super::evaluator::Outcome;
use super::failure::AbortHandle;
use super::ledger::{FailureKind, TaskStatus};
use crate::parser::ast::{DelayStrategy, Task};
use crate::runtime::evaluate_condition;

/// Calculate the delay before retry number `retry` (0-based)
pub fn calculate_delay(strategy: &DelayStrategy, retry: u32) -> Duration {
    match strategy {
        DelayStrategy::Fixed(duration) => *duration,
        DelayStrategy::Exponential { base, max, jitter } => {
            // delay = base * 2^retry
            let multiplier = 2u64.saturating_pow(retry);
            let delay = (base.as_millis() as u64).saturating_mul(multiplier);
            let delay = Duration::from_millis(delay.min(max.as_millis() as u64));

            if *jitter {
                // Add 0-25% jitter
                let jitter_ms = rand::thread_rng().gen_range(0..=(delay.as_millis() as u64 / 4));
                delay + Duration::from_millis(jitter_ms)
            } else {
                delay
            }
        }
        DelayStrategy::Linear {
            base,
            increment,
            max,
        } => {
            // delay = base + (increment * retry)
            let delay_ms = (base.as_millis() as u64)
                .saturating_add((increment.as_millis() as u64).saturating_mul(retry as u64));
            Duration::from_millis(delay_ms.min(max.as_millis() as u64))
        }
    }
}

/// Drives the attempts of one (host, task) pair.
///
/// Attempts run strictly in sequence. The delay between attempts is an
/// async sleep, so a waiting host holds no fork slot and does not hold up
/// other hosts.
pub struct RetryController {
    abort: AbortHandle,
}

impl RetryController {
    pub fn new(abort: AbortHandle) -> Self {
        RetryController { abort }
    }

    /// Run `attempt` until the task's `until` holds or its attempts run out.
    ///
    /// Without a retry config this is a single attempt. `attempt` receives
    /// the 1-based attempt number and returns `None` if the play was
    /// aborted before the attempt could start.
    pub async fn run_until<F, Fut>(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        mut attempt: F,
    ) -> Option<Outcome>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<Outcome>>,
    {
        let (max_attempts, until, retry_unreachable) = match &task.retry {
            Some(retry) => (
                retry.attempts.max(1),
                retry.until.as_ref(),
                retry.retry_unreachable,
            ),
            None => (1, None, false),
        };

        let mut last: Option<Outcome> = None;
        for n in 1..=max_attempts {
            if n > 1 {
                if self.abort.is_aborted() {
                    break;
                }
                if let Some(retry) = &task.retry {
                    let delay = calculate_delay(&retry.delay, n - 2);
                    debug!(
                        host = ctx.host_name(),
                        task = %task.name,
                        attempt = n,
                        ?delay,
                        "waiting before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                if self.abort.is_aborted() {
                    break;
                }
            }

            let Some(mut outcome) = attempt(n).await else {
                break;
            };
            outcome.set_attempts(n);

            if outcome.status == TaskStatus::Unreachable && !retry_unreachable {
                return Some(outcome);
            }

            let satisfied = match until {
                Some(cond) => {
                    let scope = outcome.scope(ctx, task.register.as_deref());
                    match evaluate_condition(cond, &scope) {
                        Ok(satisfied) => satisfied,
                        Err(e) => return Some(outcome.into_evaluation_failure(&e)),
                    }
                }
                None => !outcome.status.is_failure(),
            };

            if satisfied {
                return Some(outcome);
            }
            if n < max_attempts {
                info!(
                    host = ctx.host_name(),
                    task = %task.name,
                    attempt = n,
                    max_attempts,
                    "attempt did not succeed, retrying"
                );
            }
            last = Some(outcome);
        }

        let outcome = last?;
        if task.retry.is_none() {
            return Some(outcome);
        }

        let attempts = outcome.attempts;
        let msg = if attempts < max_attempts {
            format!("play aborted after {} of {} attempts", attempts, max_attempts)
        } else {
            match until {
                Some(cond) => format!("until '{}' not satisfied after {} attempts", cond, attempts),
                None => format!("still failing after {} attempts", attempts),
            }
        };
        Some(outcome.fail(FailureKind::ActionFailure, msg))
    }
}
