use std::time::Duration;

/// Delay before the attempt following failed attempt `attempt` (1-based).
pub trait RetryPolicy: Send + Sync {
    fn backoff(&self, attempt: u32) -> Duration;
}

/// The same delay after every failure.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl RetryPolicy for FixedBackoff {
    fn backoff(&self, _attempt: u32) -> Duration {
        self.0
    }
}
