// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.
//!
//! Only "is the agent up yet?" style probing retries. Filesystem and upgrade
//! operations are never retried here: a failed phase is retried by the
//! operator re-running the whole section.

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Return a backoff policy for waiting on agents that were just started and
/// may take a few seconds to bind their listening socket.
///
/// Gives up after `max_elapsed`, so a host whose agent was never started
/// surfaces as an error instead of hanging the hub.
pub fn agent_startup_policy(max_elapsed: Duration) -> ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(250);
    const MAX_INTERVAL: Duration = Duration::from_secs(5);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL, Some(max_elapsed))
}

/// Return a backoff policy suitable for tests: short intervals and a short
/// overall deadline.
pub fn agent_startup_policy_short() -> ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(10);
    const MAX_INTERVAL: Duration = Duration::from_millis(100);
    policy_with_max(
        INITIAL_INTERVAL,
        MAX_INTERVAL,
        Some(Duration::from_millis(500)),
    )
}

fn policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
    max_elapsed_time: Option<Duration>,
) -> ExponentialBackoff {
    let current_interval = initial_interval;
    ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time,
        ..ExponentialBackoff::default()
    }
}
