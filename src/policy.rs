use exp_backoff::BackoffBuilder;
use std::time::Duration;

pub const DEFAULT_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Shortest pause the pacer hands out, whatever the configured interval.
pub const MIN_PAUSE: Duration = Duration::from_millis(1);

/// Pause between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Always the retry interval.
    #[default]
    Fixed,
    /// Randomized pauses growing from the retry interval up to `max`.
    Jittered { max: Duration },
}

/// How long to keep polling and how to pace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub wait: Duration,
    pub retry_interval: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            wait: DEFAULT_WAIT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn new(wait: Duration, retry_interval: Duration) -> Self {
        RetryPolicy {
            wait,
            retry_interval,
            backoff: Backoff::Fixed,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Produces the successive pauses for one acquisition.
    pub(crate) fn pacer(&self) -> impl FnMut() -> Duration + use<> {
        let interval = self.retry_interval.max(MIN_PAUSE);
        let mut jitter = match self.backoff {
            Backoff::Fixed => None,
            Backoff::Jittered { max } => {
                let min = interval.as_nanos() as u64;
                let max = (max.as_nanos() as u64).max(min);
                Some((
                    min,
                    BackoffBuilder::new().initial_ns(min).max_ns(max).build(),
                ))
            }
        };

        move || match jitter.as_mut() {
            None => interval,
            Some((min, bo)) => {
                // Jitter may undershoot; never pause below the retry interval.
                let pause = bo.pause().max(*min);
                Duration::from_nanos(pause)
            }
        }
    }
}
