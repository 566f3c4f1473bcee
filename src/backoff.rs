//! # Producer-side backoff for saturated queues.
//!
//! The bounded input queue is the conveyor's only back-pressure point: a
//! producer that hits [`SubmitError::Full`](crate::SubmitError::Full) backs
//! off and retries. [`BackoffPolicy`] computes the delay sequence;
//! [`Jitter`] randomizes it to keep concurrent producers from retrying in
//! lockstep.

use std::time::Duration;

use rand::Rng;

/// Randomization applied to backoff delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter: use the exact backoff delay.
    #[default]
    None,

    /// Full jitter: random delay in `[0, delay]`. Most aggressive load
    /// spreading.
    Full,

    /// Equal jitter: `delay/2 + random[0, delay/2]`. Preserves most of the
    /// backoff while still decorrelating producers.
    Equal,
}

impl Jitter {
    /// Applies this jitter to `delay`.
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=ms)),
            Jitter::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rng.random_range(0..=ms - half))
            }
        }
    }
}

/// Delay sequence for retrying a saturated submit.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Multiplier applied to the previous delay.
    pub factor: f64,
    /// Randomization of the computed delay.
    pub jitter: Jitter,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(1),
            max: Duration::from_millis(250),
            factor: 2.0,
            jitter: Jitter::Equal,
        }
    }
}

impl BackoffPolicy {
    /// Returns the delay that follows `prev` (`None` for the first retry),
    /// jitter applied.
    pub fn next(&self, prev: Option<Duration>) -> Duration {
        let base = match prev {
            None => self.first,
            Some(d) => {
                let next = (d.as_secs_f64() * self.factor).min(self.max.as_secs_f64());
                Duration::from_secs_f64(next)
            }
        };
        self.jitter.apply(base.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_up_to_max() {
        let policy = BackoffPolicy {
            jitter: Jitter::None,
            ..Default::default()
        };
        let first = policy.next(None);
        let second = policy.next(Some(first));
        assert_eq!(first, Duration::from_millis(1));
        assert_eq!(second, Duration::from_millis(2));

        let capped = policy.next(Some(Duration::from_secs(10)));
        assert_eq!(capped, Duration::from_millis(250));
    }

    #[test]
    fn full_jitter_stays_within_bound() {
        let delay = Duration::from_millis(100);
        for _ in 0..32 {
            assert!(Jitter::Full.apply(delay) <= delay);
        }
    }

    #[test]
    fn equal_jitter_keeps_half() {
        let delay = Duration::from_millis(100);
        for _ in 0..32 {
            let jittered = Jitter::Equal.apply(delay);
            assert!(jittered >= Duration::from_millis(50));
            assert!(jittered <= delay);
        }
    }
}
