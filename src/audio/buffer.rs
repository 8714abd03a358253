//! Block buffers
//!
//! - [`JitterBuffer`]: sink side, reorders incoming blocks by sequence number
//!   and reassembles fragmented blocks
//! - [`HistoryBuffer`]: source side, keeps recently sent packets for resends
//! - [`SampleFifo`]: adapts the host block size to the stream block size

use std::collections::VecDeque;

use bytes::Bytes;

use crate::protocol::DataFrame;
use crate::time::TimeTag;

/// One stream block, possibly still missing some of its frames
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub sequence: u32,
    pub timestamp: TimeTag,
    pub sample_rate: f64,
    pub channel_onset: u16,
    /// Encoded payload, `total_size` bytes once complete
    pub data: Vec<u8>,
    frame_count: u16,
    frames_received: u16,
    received: Vec<bool>,
}

impl AudioBlock {
    fn from_frame(frame: &DataFrame) -> Self {
        let count = frame.frame_count.max(1);
        Self {
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            sample_rate: frame.sample_rate,
            channel_onset: frame.channel_onset,
            data: vec![0u8; frame.total_size as usize],
            frame_count: count,
            frames_received: 0,
            received: vec![false; count as usize],
        }
    }

    /// Copy one frame into place. Returns false for a duplicate or a frame
    /// that does not fit this block.
    fn add_frame(&mut self, frame: &DataFrame) -> bool {
        let index = frame.frame_index as usize;
        if frame.frame_count != self.frame_count
            || frame.total_size as usize != self.data.len()
            || index >= self.received.len()
            || self.received[index]
        {
            return false;
        }
        let offset = index * frame_chunk_size(self.data.len(), self.frame_count);
        let end = offset + frame.payload.len();
        if end > self.data.len() {
            return false;
        }
        self.data[offset..end].copy_from_slice(&frame.payload);
        self.received[index] = true;
        self.frames_received += 1;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.frames_received == self.frame_count
    }
}

/// Payload bytes per frame when a block of `total` bytes is split in `count`
pub fn frame_chunk_size(total: usize, count: u16) -> usize {
    let count = count.max(1) as usize;
    total.div_ceil(count).max(1)
}

/// Number of frames needed for `total` bytes with at most `max_payload` per frame
pub fn frame_count_for(total: usize, max_payload: usize) -> u16 {
    total.div_ceil(max_payload.max(1)).clamp(1, u16::MAX as usize) as u16
}

/// What happened to an inserted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    /// Stored; `complete` once all frames of the block are in
    Stored { complete: bool },
    /// Already received, or older than the read position
    Duplicate,
    /// Sequence jumped so far ahead that the buffer restarted at it;
    /// `skipped` blocks will never be played
    Reset { skipped: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    pub status: InsertStatus,
    /// Oldest blocks dropped to make room
    pub evicted: u32,
    /// The block is older than the newest one seen so far
    pub out_of_order: bool,
}

/// Result of taking the next block for playback
#[derive(Debug)]
pub enum PopResult {
    /// Still filling up to the playout threshold
    Buffering,
    Block(AudioBlock),
    /// The block at the read position never (completely) arrived
    Missing(u32),
    /// Nothing left to play; the buffer goes back to buffering
    Underrun,
}

/// Sequence-indexed jitter buffer.
///
/// Slot `i` holds sequence `next + i`. The span between the read position
/// and the newest block never exceeds the capacity.
pub struct JitterBuffer {
    slots: VecDeque<Option<AudioBlock>>,
    capacity: usize,
    /// Sequence number at the read position
    next: Option<u32>,
    newest: Option<u32>,
    started: bool,
    received: u64,
    lost: u64,
    late: u64,
    reordered: u64,
    underruns: u64,
}

impl JitterBuffer {
    /// Create a buffer holding at most `capacity` blocks
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
            next: None,
            newest: None,
            started: false,
            received: 0,
            lost: 0,
            late: 0,
            reordered: 0,
            underruns: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks that must be buffered before playback starts
    pub fn prefill(&self) -> usize {
        self.capacity.div_ceil(2).max(1)
    }

    /// Occupied span in blocks, including holes
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn next_sequence(&self) -> Option<u32> {
        self.next
    }

    pub fn newest_sequence(&self) -> Option<u32> {
        self.newest
    }

    /// `len / capacity`
    pub fn fill_ratio(&self) -> f64 {
        self.slots.len() as f64 / self.capacity as f64
    }

    /// Sequence numbers between the read position and the newest block that
    /// have not arrived completely
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        let base = self.next.unwrap_or(0);
        self.slots.iter().enumerate().filter_map(move |(i, slot)| match slot {
            Some(block) if block.is_complete() => None,
            _ => Some(base.wrapping_add(i as u32)),
        })
    }

    pub fn contains(&self, sequence: u32) -> bool {
        self.slot_index(sequence)
            .and_then(|i| self.slots.get(i))
            .map(|slot| matches!(slot, Some(block) if block.is_complete()))
            .unwrap_or(false)
    }

    fn slot_index(&self, sequence: u32) -> Option<usize> {
        let next = self.next?;
        let diff = sequence.wrapping_sub(next) as i32;
        (diff >= 0).then_some(diff as usize)
    }

    /// Insert one frame
    pub fn insert(&mut self, frame: &DataFrame) -> InsertResult {
        let seq = frame.sequence;
        let next = *self.next.get_or_insert(seq);
        let diff = seq.wrapping_sub(next) as i32;
        let out_of_order = self.newest.map(|n| (seq.wrapping_sub(n) as i32) < 0).unwrap_or(false);

        if diff < 0 {
            self.late += 1;
            return InsertResult { status: InsertStatus::Duplicate, evicted: 0, out_of_order };
        }
        let diff = diff as usize;

        // Far beyond the window: the stream skipped ahead, start over
        if diff >= self.capacity * 2 {
            self.slots.clear();
            self.started = false;
            self.next = Some(seq);
            self.newest = Some(seq);
            self.lost += diff as u64;
            self.store(0, frame);
            return InsertResult {
                status: InsertStatus::Reset { skipped: diff as u32 },
                evicted: 0,
                out_of_order: false,
            };
        }

        let mut evicted = 0;
        let mut diff = diff;
        while diff >= self.capacity {
            self.slots.pop_front();
            self.next = Some(self.next.unwrap_or(seq).wrapping_add(1));
            self.lost += 1;
            evicted += 1;
            diff -= 1;
        }

        let status = self.store(diff, frame);
        if status != InsertStatus::Duplicate {
            if out_of_order {
                self.reordered += 1;
            } else {
                self.newest = Some(seq);
            }
        }
        InsertResult { status, evicted, out_of_order }
    }

    fn store(&mut self, index: usize, frame: &DataFrame) -> InsertStatus {
        while self.slots.len() <= index {
            self.slots.push_back(None);
        }
        let slot = &mut self.slots[index];
        let block = slot.get_or_insert_with(|| AudioBlock::from_frame(frame));
        if !block.add_frame(frame) {
            self.late += 1;
            return InsertStatus::Duplicate;
        }
        let complete = block.is_complete();
        if complete {
            self.received += 1;
        }
        InsertStatus::Stored { complete }
    }

    /// Take the block at the read position
    pub fn pop(&mut self) -> PopResult {
        if !self.started {
            if self.slots.len() < self.prefill() {
                return PopResult::Buffering;
            }
            self.started = true;
        }

        let Some(slot) = self.slots.pop_front() else {
            self.started = false;
            self.underruns += 1;
            return PopResult::Underrun;
        };
        let seq = self.next.unwrap_or(0);
        self.next = Some(seq.wrapping_add(1));

        match slot {
            Some(block) if block.is_complete() => PopResult::Block(block),
            _ => {
                self.lost += 1;
                PopResult::Missing(seq)
            }
        }
    }

    /// Change the capacity, dropping the oldest blocks if they no longer fit.
    /// Returns the number of dropped blocks.
    pub fn resize(&mut self, capacity: usize) -> u32 {
        self.capacity = capacity.max(1);
        let mut dropped = 0;
        while self.slots.len() > self.capacity {
            self.slots.pop_front();
            if let Some(next) = self.next.as_mut() {
                *next = next.wrapping_add(1);
            }
            dropped += 1;
        }
        self.lost += dropped as u64;
        dropped
    }

    /// Forget everything, e.g. after a format change
    pub fn reset(&mut self) {
        self.slots.clear();
        self.next = None;
        self.newest = None;
        self.started = false;
    }

    /// Get statistics
    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            level: self.slots.len(),
            capacity: self.capacity,
            received: self.received,
            lost: self.lost,
            late: self.late,
            reordered: self.reordered,
            underruns: self.underruns,
        }
    }

    /// Reset statistics
    pub fn reset_stats(&mut self) {
        self.received = 0;
        self.lost = 0;
        self.late = 0;
        self.reordered = 0;
        self.underruns = 0;
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JitterBufferStats {
    pub level: usize,
    pub capacity: usize,
    pub received: u64,
    pub lost: u64,
    pub late: u64,
    pub reordered: u64,
    pub underruns: u64,
}

impl JitterBufferStats {
    pub fn loss_rate(&self) -> f32 {
        if self.received + self.lost == 0 {
            0.0
        } else {
            self.lost as f32 / (self.received + self.lost) as f32
        }
    }
}

/// Packets of one sent block, kept for resends
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub sequence: u32,
    pub stream_id: i32,
    /// Encoded data messages, one per frame; recipient fields are patched per sink
    pub packets: Vec<Bytes>,
}

/// Ring of the most recently sent blocks
#[derive(Debug)]
pub struct HistoryBuffer {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Look up a block; `None` once it aged out
    pub fn find(&self, stream_id: i32, sequence: u32) -> Option<&HistoryEntry> {
        let front = self.entries.front()?;
        let offset = sequence.wrapping_sub(front.sequence) as usize;
        // Sequences are consecutive, so try the direct index first
        match self.entries.get(offset) {
            Some(entry) if entry.sequence == sequence && entry.stream_id == stream_id => Some(entry),
            _ => self
                .entries
                .iter()
                .find(|entry| entry.sequence == sequence && entry.stream_id == stream_id),
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Interleaved sample FIFO
#[derive(Debug)]
pub struct SampleFifo {
    samples: VecDeque<f32>,
    channels: usize,
}

impl SampleFifo {
    pub fn new(channels: usize) -> Self {
        Self { samples: VecDeque::new(), channels: channels.max(1) }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames (samples per channel) available
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    /// Append planar input, one slice per channel (missing channels are silent)
    pub fn push_planar(&mut self, input: &[&[f32]], frames: usize) {
        for i in 0..frames {
            for ch in 0..self.channels {
                let sample = input.get(ch).and_then(|c| c.get(i)).copied().unwrap_or(0.0);
                self.samples.push_back(sample);
            }
        }
    }

    pub fn push_interleaved(&mut self, samples: &[f32]) {
        self.samples.extend(samples.iter().copied());
    }

    /// Move exactly `out.len() / channels` frames out, if available
    pub fn pop_interleaved(&mut self, out: &mut [f32]) -> bool {
        let n = out.len();
        if self.samples.len() < n {
            return false;
        }
        for (o, s) in out.iter_mut().zip(self.samples.drain(..n)) {
            *o = s;
        }
        true
    }

    /// Deinterleave up to `frames` frames and mix them into `outputs`,
    /// starting at channel `onset`. Returns the number of frames taken.
    pub fn pop_planar(&mut self, outputs: &mut [&mut [f32]], onset: usize, frames: usize) -> usize {
        let available = self.frames().min(frames);
        for i in 0..available {
            for ch in 0..self.channels {
                let sample = self.samples.pop_front().unwrap_or(0.0);
                if let Some(out) = outputs.get_mut(onset + ch) {
                    if let Some(o) = out.get_mut(i) {
                        *o += sample;
                    }
                }
            }
        }
        available
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u32) -> DataFrame {
        DataFrame {
            source_id: 0,
            stream_id: 1,
            sequence,
            timestamp: TimeTag::default(),
            sample_rate: 48000.0,
            channel_onset: 0,
            total_size: 4,
            frame_count: 1,
            frame_index: 0,
            payload: Bytes::from(sequence.to_be_bytes().to_vec()),
        }
    }

    fn popped_sequence(result: PopResult) -> Option<u32> {
        match result {
            PopResult::Block(block) => Some(block.sequence),
            _ => None,
        }
    }

    #[test]
    fn test_reorders_and_prefills() {
        let mut jitter = JitterBuffer::new(4);
        assert_eq!(jitter.prefill(), 2);

        jitter.insert(&frame(0));
        assert!(matches!(jitter.pop(), PopResult::Buffering));

        let r = jitter.insert(&frame(2));
        assert!(!r.out_of_order);
        let r = jitter.insert(&frame(1));
        assert!(r.out_of_order);
        assert_eq!(r.status, InsertStatus::Stored { complete: true });

        assert_eq!(popped_sequence(jitter.pop()), Some(0));
        assert_eq!(popped_sequence(jitter.pop()), Some(1));
        assert_eq!(popped_sequence(jitter.pop()), Some(2));
        assert!(matches!(jitter.pop(), PopResult::Underrun));
        assert!(matches!(jitter.pop(), PopResult::Buffering));
    }

    #[test]
    fn test_duplicates_and_late_blocks() {
        let mut jitter = JitterBuffer::new(4);
        jitter.insert(&frame(5));
        assert_eq!(jitter.insert(&frame(5)).status, InsertStatus::Duplicate);
        jitter.insert(&frame(6));
        assert_eq!(popped_sequence(jitter.pop()), Some(5));
        // Older than the read position
        assert_eq!(jitter.insert(&frame(5)).status, InsertStatus::Duplicate);
        assert_eq!(jitter.stats().late, 2);
    }

    #[test]
    fn test_missing_block_is_reported() {
        let mut jitter = JitterBuffer::new(4);
        jitter.insert(&frame(0));
        jitter.insert(&frame(2));
        assert_eq!(jitter.missing().collect::<Vec<_>>(), vec![1]);
        assert_eq!(popped_sequence(jitter.pop()), Some(0));
        assert!(matches!(jitter.pop(), PopResult::Missing(1)));
        assert_eq!(popped_sequence(jitter.pop()), Some(2));
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut jitter = JitterBuffer::new(4);
        for seq in 0..4 {
            assert_eq!(jitter.insert(&frame(seq)).evicted, 0);
        }
        let r = jitter.insert(&frame(5));
        assert_eq!(r.evicted, 2);
        assert_eq!(jitter.len(), 4);
        assert_eq!(jitter.next_sequence(), Some(2));
    }

    #[test]
    fn test_large_jump_resets() {
        let mut jitter = JitterBuffer::new(4);
        jitter.insert(&frame(0));
        jitter.insert(&frame(1));
        let r = jitter.insert(&frame(100));
        assert!(matches!(r.status, InsertStatus::Reset { .. }));
        assert_eq!(jitter.len(), 1);
        assert_eq!(jitter.next_sequence(), Some(100));
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut jitter = JitterBuffer::new(4);
        jitter.insert(&frame(u32::MAX));
        jitter.insert(&frame(0));
        assert_eq!(popped_sequence(jitter.pop()), Some(u32::MAX));
        assert_eq!(popped_sequence(jitter.pop()), Some(0));
    }

    #[test]
    fn test_fragment_reassembly() {
        let payload: Vec<u8> = (0..10).collect();
        let count = frame_count_for(payload.len(), 4);
        assert_eq!(count, 3);
        let chunk = frame_chunk_size(payload.len(), count);

        let mut jitter = JitterBuffer::new(4);
        // Deliver the frames back to front
        for index in (0..count).rev() {
            let start = index as usize * chunk;
            let end = (start + chunk).min(payload.len());
            let r = jitter.insert(&DataFrame {
                total_size: payload.len() as u32,
                frame_count: count,
                frame_index: index,
                payload: Bytes::copy_from_slice(&payload[start..end]),
                ..frame(7)
            });
            assert_eq!(r.status, InsertStatus::Stored { complete: index == 0 });
        }
        jitter.insert(&frame(8));
        match jitter.pop() {
            PopResult::Block(block) => assert_eq!(block.data, payload),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resize_drops_oldest() {
        let mut jitter = JitterBuffer::new(8);
        for seq in 0..6 {
            jitter.insert(&frame(seq));
        }
        assert_eq!(jitter.resize(4), 2);
        assert_eq!(jitter.next_sequence(), Some(2));
        assert!(jitter.fill_ratio() <= 1.0);
    }

    #[test]
    fn test_history_lookup() {
        let mut history = HistoryBuffer::new(3);
        for seq in 10..15 {
            history.push(HistoryEntry { sequence: seq, stream_id: 1, packets: vec![] });
        }
        assert_eq!(history.len(), 3);
        assert!(history.find(1, 11).is_none());
        assert_eq!(history.find(1, 13).unwrap().sequence, 13);
        assert!(history.find(2, 13).is_none());
    }

    #[test]
    fn test_fifo_interleaved_keeps_order() {
        let mut fifo = SampleFifo::new(2);
        fifo.push_interleaved(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let mut block = [0.0f32; 4];
        assert!(fifo.pop_interleaved(&mut block));
        assert_eq!(block, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(fifo.frames(), 1);
        assert!(!fifo.pop_interleaved(&mut block));
        assert_eq!(block, [1.0, 2.0, 3.0, 4.0]);

        fifo.push_interleaved(&[7.0, 8.0]);
        assert!(fifo.pop_interleaved(&mut block));
        assert_eq!(block, [5.0, 6.0, 7.0, 8.0]);
        assert_eq!(fifo.frames(), 0);
    }

    #[test]
    fn test_fifo_block_adaptation() {
        let mut fifo = SampleFifo::new(2);
        let left = [1.0f32; 3];
        let right = [2.0f32; 3];
        fifo.push_planar(&[&left, &right], 3);
        assert_eq!(fifo.frames(), 3);

        let mut block = [0.0f32; 4];
        assert!(fifo.pop_interleaved(&mut block));
        assert_eq!(block, [1.0, 2.0, 1.0, 2.0]);
        assert!(!fifo.pop_interleaved(&mut block));

        let mut a = [0.0f32; 2];
        let mut b = [0.0f32; 2];
        let mut c = [0.0f32; 2];
        let mut outputs: [&mut [f32]; 3] = [&mut a, &mut b, &mut c];
        assert_eq!(fifo.pop_planar(&mut outputs, 1, 2), 1);
        assert_eq!(b[0], 1.0);
        assert_eq!(c[0], 2.0);
    }
}
