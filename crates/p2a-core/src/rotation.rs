// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

//! Rotation timing.
//!
//! A rotation starts a new reporting epoch by clearing every "already
//! sent" flag. The default cadence is calendar-week aligned: each epoch
//! ends at the next Monday, 00:00 UTC. A fixed interval can be
//! configured instead.

use std::time::Duration;

use time::{OffsetDateTime, Time};

/// Time remaining until the next Monday, 00:00 UTC.
///
/// On a Monday this is the *following* Monday: the current epoch runs a
/// full week from its rotation.
pub fn time_until_next_monday(now: OffsetDateTime) -> Duration {
    let days_ahead = 7 - i64::from(now.date().weekday().number_days_from_monday());
    let next_monday = now
        .date()
        .checked_add(time::Duration::days(days_ahead))
        .unwrap_or(now.date())
        .with_time(Time::MIDNIGHT)
        .assume_utc();
    clamp_non_negative(next_monday - now)
}

/// Delay until the rotation that follows one performed at `rotated_at`.
pub fn next_rotation_delay(
    now: OffsetDateTime,
    rotated_at: OffsetDateTime,
    interval: Option<Duration>,
) -> Duration {
    match interval {
        Some(interval) => {
            let due = rotated_at + interval;
            clamp_non_negative(due - now)
        }
        None => time_until_next_monday(rotated_at).saturating_sub(clamp_non_negative(now - rotated_at)),
    }
}

/// Startup decision: `None` means a rotation is due right now, otherwise
/// the remaining delay until the next one.
pub fn startup_rotation_delay(
    now: OffsetDateTime,
    last_rotation: Option<i64>,
    interval: Option<Duration>,
) -> Option<Duration> {
    let last_unix = last_rotation?;
    let rotated_at = OffsetDateTime::from_unix_timestamp(last_unix).ok()?;
    if rotated_at > now {
        // A rotation stamp from the future means a broken clock; start a
        // fresh epoch rather than trusting it.
        return None;
    }
    let remaining = next_rotation_delay(now, rotated_at, interval);
    if remaining.is_zero() {
        None
    } else {
        Some(remaining)
    }
}

fn clamp_non_negative(delta: time::Duration) -> Duration {
    Duration::try_from(delta).unwrap_or(Duration::ZERO)
}
