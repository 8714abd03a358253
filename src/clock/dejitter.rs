//! Virtual time base for the audio thread
//!
//! Audio callbacks are scheduled in bursts: two blocks may be computed a
//! fraction of a millisecond apart and then nothing happens for two block
//! periods. Reading the wall clock in each callback therefore produces a
//! very jittery time line. The dejitter clock trusts the block schedule for
//! ticks that arrive too early and falls back to the wall clock once the
//! callback catches up.

use crate::config::DejitterConfig;
use crate::time::TimeTag;

/// Smoothed, monotonic block clock
#[derive(Debug, Clone)]
pub struct DejitterClock {
    /// Nominal block period in seconds
    period: f64,
    threshold: f64,
    max_offset: f64,
    last_raw: Option<TimeTag>,
    adjusted: TimeTag,
    /// Accumulated difference between the schedule and the wall clock
    jitter_offset: f64,
    ticks: u64,
    resyncs: u64,
}

impl DejitterClock {
    pub fn new(sample_rate: u32, block_size: u32, config: &DejitterConfig) -> Self {
        let period = block_size as f64 / sample_rate.max(1) as f64;
        Self {
            period,
            threshold: config.threshold,
            max_offset: config.max_offset_periods * period,
            last_raw: None,
            adjusted: TimeTag::default(),
            jitter_offset: 0.0,
            ticks: 0,
            resyncs: 0,
        }
    }

    /// Change the block period, e.g. after the host changed its buffer size
    pub fn set_period(&mut self, sample_rate: u32, block_size: u32, config: &DejitterConfig) {
        let last_raw = self.last_raw;
        let adjusted = self.adjusted;
        *self = Self::new(sample_rate, block_size, config);
        self.last_raw = last_raw;
        self.adjusted = adjusted;
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    /// Advance with a fresh wall clock reading
    pub fn tick_now(&mut self) -> TimeTag {
        self.tick(TimeTag::now())
    }

    /// Advance with the wall clock reading `now`; call exactly once per block
    pub fn tick(&mut self, now: TimeTag) -> TimeTag {
        self.ticks += 1;
        match self.last_raw {
            None => self.adjusted = now,
            Some(last) => {
                let previous = self.adjusted;
                let elapsed = TimeTag::duration(last, now);

                if elapsed / self.period < self.threshold {
                    // Too early: advance by the nominal period instead
                    self.jitter_offset += self.period - elapsed;
                    if self.jitter_offset > self.max_offset {
                        self.resyncs += 1;
                        tracing::debug!(
                            "Dejitter offset {:.1} ms exceeds limit, resyncing",
                            self.jitter_offset * 1000.0
                        );
                        self.jitter_offset = 0.0;
                        self.adjusted = now;
                    } else {
                        self.adjusted = now.add_seconds(self.jitter_offset);
                    }
                } else {
                    self.jitter_offset = 0.0;
                    self.adjusted = now;
                }

                if self.adjusted < previous {
                    self.adjusted = previous;
                }
            }
        }
        self.last_raw = Some(now);
        self.adjusted
    }

    /// Last value returned by [`tick`](Self::tick)
    pub fn current(&self) -> TimeTag {
        self.adjusted
    }

    pub fn jitter_offset(&self) -> f64 {
        self.jitter_offset
    }

    pub fn stats(&self) -> DejitterStats {
        DejitterStats {
            ticks: self.ticks,
            resyncs: self.resyncs,
            jitter_offset_ms: self.jitter_offset * 1000.0,
        }
    }

    pub fn reset(&mut self) {
        self.last_raw = None;
        self.jitter_offset = 0.0;
    }
}

#[derive(Debug, Clone)]
pub struct DejitterStats {
    pub ticks: u64,
    pub resyncs: u64,
    pub jitter_offset_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn clock() -> DejitterClock {
        // 10 ms blocks
        DejitterClock::new(48000, 480, &DejitterConfig::default())
    }

    #[test]
    fn test_bunched_ticks_follow_schedule() {
        let mut clock = clock();
        let start = TimeTag::from_seconds(1000.0);
        assert_eq!(clock.tick(start), start);

        // Three callbacks in a burst, then a long gap
        let t1 = clock.tick(start.add_seconds(0.0001));
        let t2 = clock.tick(start.add_seconds(0.0002));
        assert!((TimeTag::duration(start, t1) - 0.010).abs() < 1e-6);
        assert!((TimeTag::duration(start, t2) - 0.020).abs() < 1e-6);

        // The callback catches up: wall clock is trusted again
        let late = start.add_seconds(0.030);
        assert_eq!(clock.tick(late), late);
        assert_eq!(clock.jitter_offset(), 0.0);
    }

    #[test]
    fn test_regular_ticks_track_wall_clock() {
        let mut clock = clock();
        let mut now = TimeTag::from_seconds(50.0);
        for _ in 0..100 {
            now = now.add_seconds(0.010);
            assert_eq!(clock.tick(now), now);
        }
    }

    #[test]
    fn test_never_goes_backwards() {
        let mut clock = clock();
        let start = TimeTag::from_seconds(10.0);
        clock.tick(start);
        let ahead = clock.tick(start.add_seconds(0.001));
        // Wall clock steps back (e.g. NTP adjustment)
        let back = clock.tick(start.add_seconds(-1.0));
        assert!(back >= ahead);
    }

    #[test]
    fn test_runaway_offset_resyncs() {
        let mut clock = clock();
        let start = TimeTag::from_seconds(10.0);
        clock.tick(start);
        // A stuck wall clock would otherwise let the offset grow forever
        for _ in 0..40 {
            clock.tick(start);
        }
        assert!(clock.stats().resyncs > 0);
        assert!(clock.jitter_offset() <= 16.0 * clock.period());
    }

    proptest! {
        #[test]
        fn prop_monotonic(steps in proptest::collection::vec(-0.02f64..0.05, 1..200)) {
            let mut clock = clock();
            let mut now = TimeTag::from_seconds(5000.0);
            let mut last = clock.tick(now);
            for step in steps {
                now = now.add_seconds(step);
                let t = clock.tick(now);
                prop_assert!(t >= last);
                last = t;
            }
        }
    }
}
