// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

//! Upload timing: geometric jitter and exponential backoff.
//!
//! The scheduler is a pure two-state machine (idle / waiting) that only
//! computes delays; the service task owns the actual timer. Because
//! [`Scheduler::upload_finished`] is the sole re-arming trigger, at most
//! one upload attempt is ever in flight.
//!
//! When randomization is on, successful attempts are spaced by draws
//! from a geometric distribution with the configured mean. The
//! distribution is memoryless, so an observer watching only upload
//! timing cannot distinguish "had data to send" from a routine
//! check-in.

use std::cmp::min;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Waiting,
}

pub struct Scheduler {
    average_interval: Duration,
    randomize: bool,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff: Duration,
    state: State,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(
        average_interval: Duration,
        randomize: bool,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self::with_rng(
            average_interval,
            randomize,
            initial_backoff,
            max_backoff,
            StdRng::from_entropy(),
        )
    }

    /// Seeded constructor so tests can pin the jitter stream.
    pub fn with_rng(
        average_interval: Duration,
        randomize: bool,
        initial_backoff: Duration,
        max_backoff: Duration,
        rng: StdRng,
    ) -> Self {
        Self {
            average_interval,
            randomize,
            initial_backoff,
            max_backoff,
            backoff: initial_backoff,
            state: State::Idle,
            rng,
        }
    }

    /// Arms the first attempt; returns the delay until it should run.
    pub fn start(&mut self) -> Duration {
        self.state = State::Waiting;
        self.next_interval()
    }

    pub fn is_waiting(&self) -> bool {
        self.state == State::Waiting
    }

    /// Re-arms after an attempt completed; returns the next delay.
    ///
    /// Success resets the backoff and samples a fresh interval. Failure
    /// doubles the backoff, capped at the maximum: after `k` consecutive
    /// failures the delay is `min(initial_backoff * 2^k, max_backoff)`.
    pub fn upload_finished(&mut self, ok: bool) -> Duration {
        self.state = State::Waiting;
        if ok {
            self.backoff = self.initial_backoff;
            self.next_interval()
        } else {
            self.backoff = min(self.backoff.saturating_mul(2), self.max_backoff);
            debug!("Upload failed; backing off for {:?}", self.backoff);
            self.backoff
        }
    }

    fn next_interval(&mut self) -> Duration {
        if self.randomize {
            Duration::from_secs(self.sample_geometric_seconds())
        } else {
            self.average_interval
        }
    }

    /// Draws whole seconds from a geometric distribution whose mean is
    /// the configured average interval. Inverse-CDF sampling: for
    /// success probability `p = 1/mean`, `X = ceil(ln U / ln(1 - p))`.
    fn sample_geometric_seconds(&mut self) -> u64 {
        let mean = self.average_interval.as_secs_f64().max(1.0);
        let p = 1.0 / mean;
        if p >= 1.0 {
            return 1;
        }
        let u: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        let sample = (u.ln() / (1.0 - p).ln()).ceil();
        if sample < 1.0 {
            1
        } else {
            sample as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(randomize: bool) -> Scheduler {
        Scheduler::with_rng(
            Duration::from_secs(3600),
            randomize,
            Duration::from_secs(60),
            Duration::from_secs(3600),
            StdRng::seed_from_u64(7),
        )
    }

    #[test]
    fn backoff_law() {
        let mut s = scheduler(false);
        s.start();
        let initial = Duration::from_secs(60);
        let max = Duration::from_secs(3600);
        for k in 1..=10u32 {
            let delay = s.upload_finished(false);
            let expected = min(initial.saturating_mul(2u32.saturating_pow(k)), max);
            assert_eq!(delay, expected, "after {k} consecutive failures");
        }
    }

    #[test]
    fn success_resets_backoff() {
        let mut s = scheduler(false);
        s.start();
        s.upload_finished(false);
        s.upload_finished(false);
        assert_eq!(s.upload_finished(true), Duration::from_secs(3600));
        // The next failure starts over from the initial backoff.
        assert_eq!(s.upload_finished(false), Duration::from_secs(120));
    }

    #[test]
    fn fixed_interval_when_randomization_is_off() {
        let mut s = scheduler(false);
        assert_eq!(s.start(), Duration::from_secs(3600));
        assert_eq!(s.upload_finished(true), Duration::from_secs(3600));
    }

    #[test]
    fn randomized_intervals_vary_and_stay_positive() {
        let mut s = scheduler(true);
        let mut samples = Vec::new();
        s.start();
        for _ in 0..50 {
            samples.push(s.upload_finished(true));
        }
        assert!(samples.iter().all(|d| *d >= Duration::from_secs(1)));
        let first = samples[0];
        assert!(
            samples.iter().any(|d| *d != first),
            "jittered intervals should not be constant"
        );
    }

    #[test]
    fn state_machine_reaches_waiting() {
        let mut s = scheduler(false);
        assert!(!s.is_waiting());
        s.start();
        assert!(s.is_waiting());
    }
}
