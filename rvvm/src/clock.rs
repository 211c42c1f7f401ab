// SPDX-License-Identifier: Apache-2.0

//! Guest clocksource and per-hart timers.
//!
//! The host monotonic clock is calibrated once per process and rescaled to
//! the configured guest frequency. Each hart carries a rebaseable [`Timer`]
//! plus two [`Timecmp`] comparators (CLINT mtimecmp and the Sstc stimecmp);
//! a comparator is pending once `timer.now() >= timecmp`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use lazy_static::lazy_static;

/// Guest timebase frequency: 10 MHz, the usual SoC value for RISC-V
/// firmware expecting `timebase-frequency` in the device tree.
pub const TIMER_FREQ: u64 = 10_000_000;

lazy_static! {
    static ref CLOCK_EPOCH: Instant = Instant::now();
}

/// Nanoseconds since the process-wide clock epoch.
pub fn now_ns() -> u64 {
    CLOCK_EPOCH.elapsed().as_nanos() as u64
}

/// Rescale a nanosecond timestamp to ticks of `freq`.
fn ns_to_ticks(ns: u64, freq: u64) -> u64 {
    ((ns as u128 * freq as u128) / 1_000_000_000) as u64
}

/// Ticks until `ticks` elapse at `freq`, in nanoseconds, rounded up.
pub fn ticks_to_ns(ticks: u64, freq: u64) -> u64 {
    ((ticks as u128 * 1_000_000_000 + freq as u128 - 1) / freq as u128) as u64
}

/// A monotonic guest timer: host clock rescaled to `freq`, minus a rebase
/// offset. `begin` is atomic so CLINT MTIME writes can rebase a timer that
/// another thread is reading.
pub struct Timer {
    freq: u64,
    begin: AtomicU64,
}

impl Timer {
    pub fn new(freq: u64) -> Timer {
        Timer { freq, begin: AtomicU64::new(ns_to_ticks(now_ns(), freq)) }
    }

    pub fn freq(&self) -> u64 { self.freq }

    /// Current guest time in ticks.
    pub fn now(&self) -> u64 {
        ns_to_ticks(now_ns(), self.freq).wrapping_sub(self.begin.load(Ordering::Relaxed))
    }

    /// Rebase so that `now()` reads `time` from here on.
    pub fn rebase(&self, time: u64) {
        self.begin
            .store(ns_to_ticks(now_ns(), self.freq).wrapping_sub(time), Ordering::Relaxed);
    }
}

/// A 64-bit timer comparator with atomic set/get.
///
/// Readers that merely poll use relaxed ordering; the interrupt-gating read
/// in the hart loop uses acquire to pair with the device-side release store.
pub struct Timecmp {
    timecmp: AtomicU64,
}

impl Timecmp {
    /// Starts disarmed: no guest reaches an all-ones time.
    pub fn new() -> Timecmp {
        Timecmp { timecmp: AtomicU64::new(u64::MAX) }
    }

    pub fn get(&self) -> u64 {
        self.timecmp.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) {
        self.timecmp.store(value, Ordering::Release);
    }

    /// True once the timer has swept past the comparator.
    pub fn pending(&self, timer: &Timer) -> bool {
        timer.now() >= self.timecmp.load(Ordering::Acquire)
    }

    /// Nanoseconds until this comparator fires, `None` if already pending.
    pub fn ns_until(&self, timer: &Timer) -> Option<u64> {
        let cmp = self.timecmp.load(Ordering::Acquire);
        let now = timer.now();
        if now >= cmp {
            None
        } else {
            Some(ticks_to_ns(cmp - now, timer.freq()))
        }
    }
}

impl Default for Timecmp {
    fn default() -> Timecmp { Timecmp::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_is_monotonic() {
        let timer = Timer::new(TIMER_FREQ);
        let a = timer.now();
        let b = timer.now();
        assert!(b >= a);
    }

    #[test]
    fn timer_rebase() {
        let timer = Timer::new(TIMER_FREQ);
        timer.rebase(1_000_000);
        let t = timer.now();
        assert!(t >= 1_000_000 && t < 1_000_000 + TIMER_FREQ, "t = {}", t);
        timer.rebase(0);
        assert!(timer.now() < TIMER_FREQ);
    }

    #[test]
    fn timecmp_edge() {
        let timer = Timer::new(TIMER_FREQ);
        let cmp = Timecmp::new();
        assert!(!cmp.pending(&timer));
        cmp.set(0);
        assert!(cmp.pending(&timer));
        assert_eq!(cmp.ns_until(&timer), None);
        timer.rebase(0);
        cmp.set(timer.now() + TIMER_FREQ * 3600);
        assert!(!cmp.pending(&timer));
        assert!(cmp.ns_until(&timer).is_some());
    }

    #[test]
    fn tick_rescaling_round_trip() {
        // 1 ms at 10 MHz is 10_000 ticks.
        assert_eq!(ns_to_ticks(1_000_000, TIMER_FREQ), 10_000);
        assert_eq!(ticks_to_ns(10_000, TIMER_FREQ), 1_000_000);
    }
}
