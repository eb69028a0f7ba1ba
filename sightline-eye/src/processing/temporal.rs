//! Sliding window of preprocessed frames for the action model

use crate::config::WindowLayout;
use crate::error::VisionError;
use crate::tensor::{ModelInput, Tensor};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// One buffered action-path tensor with the capture time of its frame
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalEntry {
    pub tensor: Tensor,
    pub captured_at: DateTime<Utc>,
}

/// Fixed-capacity FIFO of the last `N` action tensors.
///
/// Holds copies independent of the frames they came from. The oldest entry is
/// evicted when a push would exceed capacity.
#[derive(Debug)]
pub struct TemporalBuffer {
    entries: VecDeque<TemporalEntry>,
    capacity: usize,
}

impl TemporalBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
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

    pub fn push(&mut self, tensor: Tensor, captured_at: DateTime<Utc>) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TemporalEntry { tensor, captured_at });
    }

    /// True iff exactly `capacity` entries are held
    pub fn is_ready(&self) -> bool {
        self.entries.len() == self.capacity
    }

    /// Ordered copy of the buffer, oldest first. `None` until ready.
    pub fn snapshot(&self) -> Option<TemporalWindow> {
        if !self.is_ready() {
            return None;
        }
        Some(TemporalWindow {
            entries: self.entries.iter().cloned().collect(),
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &TemporalEntry> {
        self.entries.iter()
    }
}

/// A full window of `N` tensors, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalWindow {
    entries: Vec<TemporalEntry>,
}

impl TemporalWindow {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TemporalEntry] {
        &self.entries
    }

    /// Capture time of the newest frame in the window
    pub fn last_captured_at(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|e| e.captured_at)
    }

    /// Stack the window into one batched model input.
    pub fn to_model_input(&self, layout: WindowLayout) -> Result<ModelInput, VisionError> {
        let first = self
            .entries
            .first()
            .ok_or_else(|| VisionError::InvalidFrame("empty temporal window".to_string()))?;
        let [channels, height, width] = first.tensor.shape();
        if self.entries.iter().any(|e| e.tensor.shape() != first.tensor.shape()) {
            return Err(VisionError::InvalidFrame(
                "temporal window mixes tensor shapes".to_string(),
            ));
        }

        let n = self.entries.len();
        let mut data = Vec::with_capacity(n * first.tensor.len());
        let shape = match layout {
            WindowLayout::FrameMajor => {
                for entry in &self.entries {
                    data.extend_from_slice(entry.tensor.data());
                }
                vec![1, n, channels, height, width]
            }
            WindowLayout::ChannelMajor => {
                for c in 0..channels {
                    for entry in &self.entries {
                        data.extend_from_slice(entry.tensor.plane(c));
                    }
                }
                vec![1, channels, n, height, width]
            }
        };

        Ok(ModelInput { shape, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tensor(tag: f32) -> Tensor {
        Tensor::new(vec![tag; 3 * 2 * 2], 3, 2, 2).unwrap()
    }

    fn tag_of(entry: &TemporalEntry) -> f32 {
        entry.tensor.data()[0]
    }

    #[test]
    fn test_push_ten_into_eight() {
        let start = Utc::now();
        let mut buffer = TemporalBuffer::new(8);
        for i in 1..=10 {
            buffer.push(tensor(i as f32), start + Duration::milliseconds(i));
        }

        assert_eq!(buffer.len(), 8);
        assert!(buffer.is_ready());
        let window = buffer.snapshot().unwrap();
        let tags: Vec<f32> = window.entries().iter().map(tag_of).collect();
        assert_eq!(tags, vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        assert_eq!(window.last_captured_at(), Some(start + Duration::milliseconds(10)));
    }

    #[test]
    fn test_not_ready_until_full() {
        let mut buffer = TemporalBuffer::new(3);
        buffer.push(tensor(1.0), Utc::now());
        buffer.push(tensor(2.0), Utc::now());
        assert!(!buffer.is_ready());
        assert!(buffer.snapshot().is_none());
        buffer.push(tensor(3.0), Utc::now());
        assert!(buffer.is_ready());
    }

    #[test]
    fn test_clear() {
        let mut buffer = TemporalBuffer::new(2);
        buffer.push(tensor(1.0), Utc::now());
        buffer.push(tensor(2.0), Utc::now());
        buffer.clear();
        assert_eq!(buffer.len(), 0);
        assert!(!buffer.is_ready());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut buffer = TemporalBuffer::new(2);
        buffer.push(tensor(1.0), Utc::now());
        buffer.push(tensor(2.0), Utc::now());
        let window = buffer.snapshot().unwrap();
        buffer.push(tensor(3.0), Utc::now());
        buffer.clear();
        assert_eq!(window.entries().iter().map(tag_of).collect::<Vec<_>>(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_frame_major_stacking() {
        let mut buffer = TemporalBuffer::new(2);
        buffer.push(tensor(1.0), Utc::now());
        buffer.push(tensor(2.0), Utc::now());
        let input = buffer.snapshot().unwrap().to_model_input(WindowLayout::FrameMajor).unwrap();
        assert_eq!(input.shape, vec![1, 2, 3, 2, 2]);
        assert_eq!(input.data.len(), 24);
        assert!(input.data[..12].iter().all(|v| *v == 1.0));
        assert!(input.data[12..].iter().all(|v| *v == 2.0));
    }

    #[test]
    fn test_channel_major_stacking() {
        let frame = |base: f32| {
            let data: Vec<f32> = (0..12).map(|i| base + (i / 4) as f32).collect();
            Tensor::new(data, 3, 2, 2).unwrap()
        };
        let mut buffer = TemporalBuffer::new(2);
        buffer.push(frame(10.0), Utc::now());
        buffer.push(frame(20.0), Utc::now());
        let input = buffer.snapshot().unwrap().to_model_input(WindowLayout::ChannelMajor).unwrap();
        assert_eq!(input.shape, vec![1, 3, 2, 2, 2]);
        // channel 0 of frame 0, then channel 0 of frame 1
        assert_eq!(&input.data[0..4], &[10.0; 4]);
        assert_eq!(&input.data[4..8], &[20.0; 4]);
        assert_eq!(&input.data[8..12], &[11.0; 4]);
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let mut buffer = TemporalBuffer::new(0);
        buffer.push(tensor(1.0), Utc::now());
        buffer.push(tensor(2.0), Utc::now());
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.len(), 1);
    }
}
