//! Delay-locked loop for measuring the real sample rate
//!
//! Second order loop after Fons Adriaensen, "Using a DLL to filter time".
//! Fed with the time of every block, it converges on the actual block
//! period and thereby on the sample rate the audio device really runs at.

use std::f64::consts::PI;

#[derive(Debug, Clone, Default)]
pub struct TimeDll {
    b: f64,
    c: f64,
    t0: f64,
    t1: f64,
    e2: f64,
    nper: u32,
}

impl TimeDll {
    /// Start the loop at time `t` (seconds) for blocks of `nper` samples
    pub fn new(sample_rate: f64, nper: u32, bandwidth: f64, t: f64) -> Self {
        let mut dll = Self::default();
        dll.setup(sample_rate, nper, bandwidth, t);
        dll
    }

    pub fn setup(&mut self, sample_rate: f64, nper: u32, bandwidth: f64, t: f64) {
        let tper = nper as f64 / sample_rate;
        let omega = 2.0 * PI * bandwidth * tper;
        self.b = omega * std::f64::consts::SQRT_2;
        self.c = omega * omega;
        self.e2 = tper;
        self.t0 = t;
        self.t1 = t + tper;
        self.nper = nper;
    }

    /// Feed the time of the next block
    pub fn update(&mut self, t: f64) {
        let e = t - self.t1;
        self.t0 = self.t1;
        self.t1 += self.b * e + self.e2;
        self.e2 += self.c * e;
        if self.e2.abs() < f64::MIN_POSITIVE {
            self.e2 = 0.0;
        }
    }

    /// Filtered block period in seconds
    pub fn period(&self) -> f64 {
        self.t1 - self.t0
    }

    pub fn sample_rate(&self) -> f64 {
        let period = self.period();
        if period > 0.0 {
            self.nper as f64 / period
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_rate() {
        let mut dll = TimeDll::new(48000.0, 480, 0.012, 0.0);
        for i in 1..1000 {
            dll.update(i as f64 * 0.010);
        }
        assert!((dll.sample_rate() - 48000.0).abs() < 1.0);
    }

    #[test]
    fn test_converges_on_drifting_clock() {
        // Device actually runs at 48048 Hz
        let real_period = 480.0 / 48048.0;
        let mut dll = TimeDll::new(48000.0, 480, 0.1, 0.0);
        for i in 1..5000 {
            // Add some scheduler noise
            let noise = if i % 2 == 0 { 0.00001 } else { -0.00001 };
            dll.update(i as f64 * real_period + noise);
        }
        assert!((dll.sample_rate() - 48048.0).abs() < 5.0, "{}", dll.sample_rate());
    }
}
