// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide timestamp source for capture frames.
//!
//! The first call to [`init`] probes the clocks below in order and latches
//! the first one the kernel can read. Every later timestamp comes from that
//! clock, so all frames written by a process share one time base.

use nix::time::{clock_gettime, ClockId};
use std::sync::OnceLock;

static CLOCK: OnceLock<ClockId> = OnceLock::new();

#[cfg(any(target_os = "linux", target_os = "android"))]
const CANDIDATES: &[ClockId] = &[
    ClockId::CLOCK_MONOTONIC_RAW,
    ClockId::CLOCK_MONOTONIC_COARSE,
    ClockId::CLOCK_MONOTONIC,
    ClockId::CLOCK_REALTIME_COARSE,
    ClockId::CLOCK_REALTIME,
];

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const CANDIDATES: &[ClockId] = &[ClockId::CLOCK_MONOTONIC, ClockId::CLOCK_REALTIME];

fn probe() -> Option<ClockId> {
    CANDIDATES
        .iter()
        .copied()
        .find(|clock| clock_gettime(*clock).is_ok())
}

/// Selects the clock used for timestamps. Calling it again after a clock has
/// been latched is a no-op that returns the latched clock.
///
/// Returns `None` when none of the candidate clocks can be read.
pub fn init() -> Option<ClockId> {
    if let Some(clock) = CLOCK.get() {
        return Some(*clock);
    }
    let clock = probe()?;
    Some(*CLOCK.get_or_init(|| clock))
}

/// Nanoseconds since an unspecified epoch, read from the latched clock.
///
/// # Panics
/// Panics when no clock can be read at all. There is no meaningful way to
/// produce a capture without timestamps.
pub fn current_time() -> i64 {
    #[allow(clippy::panic)]
    let clock = init().unwrap_or_else(|| panic!("no usable clock for capture timestamps"));
    match clock_gettime(clock) {
        Ok(ts) => ts.tv_sec() as i64 * 1_000_000_000 + ts.tv_nsec() as i64,
        // The clock was readable when it was latched.
        Err(_) => 0,
    }
}

/// Signed nanoseconds elapsed since `epoch`, a prior [`current_time`].
#[inline]
pub fn relative_time(epoch: i64) -> i64 {
    current_time() - epoch
}
