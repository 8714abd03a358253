//! Audio block buffering

pub mod buffer;

pub use buffer::{
    AudioBlock, HistoryBuffer, HistoryEntry, InsertResult, InsertStatus, JitterBuffer, JitterBufferStats,
    PopResult, SampleFifo,
};
