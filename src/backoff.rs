// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use crate::config::QueueSettings;

/// Delay schedule for the polling loops that back up every pulse.
///
/// Starts at `initial`, grows by `step` after each poll and never exceeds
/// `max`.
#[derive(Clone, Debug)]
pub struct LinearBackoff {
    initial: Duration,
    step: Duration,
    max: Duration,
    next: Duration,
}

impl LinearBackoff {
    pub fn new(initial: Duration, step: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        LinearBackoff {
            initial,
            step,
            max,
            next: initial,
        }
    }

    pub fn from_settings(settings: &QueueSettings) -> Self {
        LinearBackoff::new(
            settings.poll_initial_delay,
            settings.poll_step,
            settings.poll_max_delay,
        )
    }

    /// The delay to wait before the next poll.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next + self.step).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::quickcheck;

    #[test]
    fn grows_linearly_up_to_the_cap() {
        let mut backoff = LinearBackoff::new(
            Duration::from_secs(15),
            Duration::from_secs(15),
            Duration::from_secs(120),
        );
        let delays: Vec<u64> =
            (0..10).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![15, 30, 45, 60, 75, 90, 105, 120, 120, 120]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(15));
    }

    quickcheck! {
        fn delays_never_decrease_or_exceed_cap(
            initial: u16,
            step: u16,
            max: u16,
            polls: u8
        ) -> bool {
            let max = Duration::from_millis(u64::from(max));
            let mut backoff = LinearBackoff::new(
                Duration::from_millis(u64::from(initial)),
                Duration::from_millis(u64::from(step)),
                max,
            );
            let mut last = Duration::from_millis(0);
            for _ in 0..polls {
                let delay = backoff.next_delay();
                if delay < last || delay > max {
                    return false;
                }
                last = delay;
            }
            true
        }
    }
}
