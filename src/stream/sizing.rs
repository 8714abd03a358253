//! Adaptive jitter buffer sizing
//!
//! Growth follows the drop rate: once drops keep coming at more than one
//! per 30 s, the buffer grows by [`STEP_MS`], re-evaluated at most every
//! [`ADJUST_LIMIT`] seconds. A drop also grows the buffer to cover the
//! largest arrival gap seen recently, so a single long stall is absorbed at
//! once instead of in small steps.
//!
//! In [`BufferMode::AutoFull`] the buffer shrinks by one step after
//! [`SHRINK_QUIET`] seconds without drops, never below the baseline or the
//! measured arrival jitter. A drop shortly after a shrink means the previous
//! size was needed, so it becomes the new baseline.

use crate::config::BufferMode;

/// Size change per adjustment
pub const STEP_MS: f64 = 2.0;
/// Minimum seconds between two growth decisions
pub const ADJUST_LIMIT: f64 = 0.5;
/// Drops per second above which the buffer grows
pub const MIN_DROP_RATE: f64 = 1.0 / 30.0;
/// Drop-free seconds before shrinking
pub const SHRINK_QUIET: f64 = 10.0;
/// A drop this soon after a shrink raises the baseline
pub const BASELINE_WINDOW: f64 = 2.0;
/// Seconds an `InitAuto` buffer keeps adapting
pub const INIT_PERIOD: f64 = 5.0;

const JITTER_SMOOTHING: f64 = 0.02;
/// Seconds for the peak gap to decay by 1/e
const PEAK_DECAY: f64 = 5.0;

/// Arrival-time statistics of complete blocks
#[derive(Debug, Clone, Default)]
pub struct ArrivalStats {
    last: Option<f64>,
    mean: f64,
    var: f64,
    peak_gap: f64,
    count: u64,
}

impl ArrivalStats {
    /// Record an arrival at `now` for blocks of `period` seconds
    pub fn record(&mut self, now: f64, period: f64) {
        if let Some(last) = self.last {
            let gap = (now - last).max(0.0);
            let deviation = gap - period;
            if self.count == 0 {
                self.mean = deviation;
            } else {
                let delta = deviation - self.mean;
                self.mean += JITTER_SMOOTHING * delta;
                self.var = (1.0 - JITTER_SMOOTHING) * (self.var + JITTER_SMOOTHING * delta * delta);
            }
            self.peak_gap = gap.max(self.peak_gap * (-gap / PEAK_DECAY).exp());
            self.count += 1;
        }
        self.last = Some(now);
    }

    /// Standard deviation of the arrival interval in seconds
    pub fn jitter(&self) -> f64 {
        self.var.sqrt()
    }

    /// Largest recent gap between two arrivals in seconds
    pub fn peak_gap(&self) -> f64 {
        self.peak_gap
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone)]
pub struct BufferSizer {
    mode: BufferMode,
    size_ms: f64,
    min_ms: f64,
    max_ms: f64,
    baseline_ms: f64,
    drops: u64,
    handled_drops: u64,
    last_drop_time: Option<f64>,
    last_drop_count: u64,
    last_decrease: Option<f64>,
    started: Option<f64>,
    frozen: bool,
    arrivals: ArrivalStats,
}

impl BufferSizer {
    pub fn new(mode: BufferMode, size_ms: f64, max_ms: f64) -> Self {
        let max_ms = max_ms.max(size_ms);
        Self {
            mode,
            size_ms,
            min_ms: 0.0,
            max_ms,
            baseline_ms: if mode == BufferMode::AutoFull { 0.0 } else { size_ms },
            drops: 0,
            handled_drops: 0,
            last_drop_time: None,
            last_drop_count: 0,
            last_decrease: None,
            started: None,
            frozen: false,
            arrivals: ArrivalStats::default(),
        }
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    pub fn size_ms(&self) -> f64 {
        self.size_ms
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn arrivals(&self) -> &ArrivalStats {
        &self.arrivals
    }

    /// Switch policy; an `InitAuto` buffer starts measuring again
    pub fn set_mode(&mut self, mode: BufferMode) {
        self.mode = mode;
        self.frozen = false;
        self.started = None;
        self.last_decrease = None;
        self.baseline_ms = if mode == BufferMode::AutoFull { self.min_ms } else { self.size_ms };
    }

    /// Manual size; also the new floor for the increase-only modes
    pub fn set_size(&mut self, size_ms: f64) {
        self.size_ms = size_ms.clamp(self.min_ms, self.max_ms.max(size_ms));
        if self.mode != BufferMode::AutoFull {
            self.baseline_ms = self.size_ms;
        }
    }

    /// Bounds for automatic sizing. `min_ms` usually covers two blocks.
    pub fn set_limits(&mut self, min_ms: f64, max_ms: f64) {
        self.min_ms = min_ms;
        self.max_ms = max_ms.max(min_ms);
        self.baseline_ms = self.baseline_ms.max(min_ms);
        self.size_ms = self.size_ms.clamp(self.min_ms, self.max_ms);
    }

    pub fn record_arrival(&mut self, now: f64, period: f64) {
        self.arrivals.record(now, period);
    }

    /// Blocks lost, evicted or underrun
    pub fn record_drops(&mut self, count: u32, now: f64) {
        if count == 0 {
            return;
        }
        self.drops += count as u64;
        if self.last_drop_time.is_none() {
            self.last_drop_time = Some(now);
            self.last_drop_count = self.drops - count as u64;
        }
    }

    /// Stream restarted: forget the arrival history but keep the size
    pub fn restart(&mut self) {
        self.arrivals.reset();
    }

    /// Re-evaluate the size at `now`; returns `(old, new)` on change
    pub fn update(&mut self, now: f64) -> Option<(f64, f64)> {
        if self.mode == BufferMode::Off || self.frozen {
            return None;
        }
        let old = self.size_ms;
        let started = *self.started.get_or_insert(now);

        if self.drops > self.handled_drops {
            self.grow(now);
            self.handled_drops = self.drops;
        }

        match self.mode {
            BufferMode::AutoFull => self.shrink(now),
            BufferMode::InitAuto => {
                let quiet_since = self.last_drop_time.unwrap_or(started);
                if now - started >= INIT_PERIOD && now - quiet_since >= BASELINE_WINDOW {
                    self.size_ms = self.size_ms.max(self.jitter_floor()).min(self.max_ms);
                    self.frozen = true;
                    tracing::debug!("Jitter buffer size settled at {:.1} ms", self.size_ms);
                }
            }
            _ => {}
        }

        (self.size_ms != old).then_some((old, self.size_ms))
    }

    fn grow(&mut self, now: f64) {
        let mut target = self.size_ms;

        if let Some(last) = self.last_drop_time {
            let elapsed = now - last;
            if elapsed > ADJUST_LIMIT {
                let rate = (self.drops - self.last_drop_count) as f64 / elapsed;
                if rate > MIN_DROP_RATE {
                    target += STEP_MS;
                    if self.mode == BufferMode::AutoFull
                        && self.last_decrease.is_some_and(|t| now - t < BASELINE_WINDOW)
                    {
                        self.baseline_ms = target;
                    }
                }
                self.last_drop_time = Some(now);
                self.last_drop_count = self.drops;
            }
        }

        target = target.max(self.arrivals.peak_gap() * 1000.0);
        let target = target.min(self.max_ms);
        if target > self.size_ms {
            tracing::debug!("Growing jitter buffer {:.1} -> {:.1} ms", self.size_ms, target);
            self.size_ms = target;
        }
    }

    /// Smallest size that covers the baseline and three standard deviations
    /// of arrival jitter
    fn jitter_floor(&self) -> f64 {
        self.baseline_ms.max(self.min_ms).max(3.0 * self.arrivals.jitter() * 1000.0)
    }

    fn shrink(&mut self, now: f64) {
        let Some(last) = self.last_decrease else {
            self.last_decrease = Some(now);
            return;
        };
        let floor = self.jitter_floor();
        let quiet = self.last_drop_time.map_or(true, |t| now - t > SHRINK_QUIET);
        if self.size_ms > floor && quiet && now - last > SHRINK_QUIET {
            self.size_ms = (self.size_ms - STEP_MS).max(floor);
            self.last_decrease = Some(now);
            tracing::debug!("Shrinking jitter buffer to {:.1} ms", self.size_ms);
        }
    }
}
