//! Exponential backoff for reaching a relay or enclave that may still be
//! starting up.
use std::future::Future;
use std::time::Duration;

use tracing::warn;

pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    current_delay: Duration,
    /// Attempts made so far.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Returns the current delay and grows it for the next call, up to `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * self.multiplier).min(self.max_delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }
}

/// Runs `op` until it succeeds or `max_attempts` attempts have failed,
/// sleeping between attempts. The last error is returned.
pub async fn retry<T, E, F, Fut>(
    backoff: &mut Backoff,
    max_attempts: u32,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    loop {
        match op().await {
            Ok(value) => {
                backoff.reset();
                return Ok(value);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                if backoff.attempt >= max_attempts {
                    return Err(e);
                }
                warn!(
                    "{what} failed (attempt {}/{max_attempts}): {e}; retrying in {delay:?}",
                    backoff.attempt
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
