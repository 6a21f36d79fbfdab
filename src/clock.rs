//! Clock Domain
//!
//! All timestamps in the framework are expressed in ticks of a 27 MHz
//! clock, the highest-resolution clock found in MPEG systems (PCR
//! extension granularity). PTS/DTS live on a 90 kHz grid, i.e. every
//! 300th tick.
//!
//! Two time bases coexist:
//!
//! - **system time** (`*_sys`): monotonic local time, used for scheduling;
//! - **program time** (`*_prog`): the sender's clock recovered from the
//!   stream, used for PCR/PTS/DTS arithmetic.
//!
//! Translation between the two is per-packet state carried by
//! [`crate::packet::Packet`].

use std::time::Instant;

/// Ticks per second of the reference clock (27 MHz)
pub const FREQ: u64 = 27_000_000;

/// Ticks per second of the PTS/DTS grid (90 kHz)
pub const FREQ_90K: u64 = FREQ / 300;

/// 2^33, the wrap modulus of PCR base, PTS and DTS
pub const MAX_33BITS: u64 = 1 << 33;

/// A source of system-time ticks
///
/// Implementations must be monotonic; pipes compare values from one clock
/// instance only.
pub trait Clock: Send + Sync {
    /// Current system time in 27 MHz ticks
    fn now(&self) -> u64;
}

/// Monotonic wall clock
///
/// Ticks count from the instant the clock was created, so values are small
/// and never wrap in practice.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock with its origin at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_secs() * FREQ + u64::from(elapsed.subsec_nanos()) * FREQ / 1_000_000_000
    }
}

/// Manually stepped clock for tests and pull-mode (non-realtime) muxing
pub struct FakeClock {
    now: std::sync::atomic::AtomicU64,
}

impl FakeClock {
    /// Create a clock stuck at `start` ticks
    pub fn new(start: u64) -> Self {
        Self {
            now: std::sync::atomic::AtomicU64::new(start),
        }
    }

    /// Advance the clock by `ticks`
    pub fn advance(&self, ticks: u64) {
        self.now
            .fetch_add(ticks, std::sync::atomic::Ordering::Relaxed);
    }

    /// Jump to an absolute time; must not move backwards
    pub fn set(&self, ticks: u64) {
        self.now.store(ticks, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> u64 {
        self.now.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn fake_clock_steps() {
        let clock = FakeClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(FREQ);
        assert_eq!(clock.now(), 100 + FREQ);
    }

    #[test]
    fn tick_constants() {
        assert_eq!(FREQ_90K * 300, FREQ);
        assert_eq!(MAX_33BITS, 8_589_934_592);
    }
}
