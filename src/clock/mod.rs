//! Clocks driven by the audio callback

pub mod dejitter;
pub mod dll;

pub use dejitter::{DejitterClock, DejitterStats};
pub use dll::TimeDll;
