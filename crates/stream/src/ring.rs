//! Bounded frame ring shared between the capture thread and the reader.

use std::collections::VecDeque;
use std::sync::Mutex;
use video_analytics_common::Frame;

/// Why the capture thread stopped producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureEnd {
    /// Livestream broke or the source became unreachable.
    ConnectionLost,
    /// File source reached its last frame.
    EndOfVideo,
}

struct RingState {
    frames: VecDeque<Frame>,
    end: Option<CaptureEnd>,
}

/// Fixed-capacity FIFO of captured frames.
///
/// New frames evict the oldest when full, so a slow consumer always reads
/// the freshest window of the stream. This is the analyzer's only
/// back-pressure mechanism.
pub(crate) struct FrameRing {
    capacity: usize,
    state: Mutex<RingState>,
}

impl FrameRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(RingState {
                frames: VecDeque::new(),
                end: None,
            }),
        }
    }

    /// Append a frame, dropping the oldest on overflow.
    pub(crate) fn push(&self, frame: Frame) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.frames.len() == self.capacity {
            state.frames.pop_front();
        }
        state.frames.push_back(frame);
    }

    pub(crate) fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.frames.len()
    }

    /// Remove and return up to `n` frames, oldest first.
    pub(crate) fn pop(&self, n: usize) -> Vec<Frame> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let take = n.min(state.frames.len());
        state.frames.drain(..take).collect()
    }

    /// Remove and return everything, oldest first.
    pub(crate) fn drain(&self) -> Vec<Frame> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.frames.drain(..).collect()
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.frames.clear();
    }

    /// Record why capture ended. The first cause wins.
    pub(crate) fn set_end(&self, end: CaptureEnd) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.end.get_or_insert(end);
    }

    pub(crate) fn end(&self) -> Option<CaptureEnd> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frame(ts: f64) -> Frame {
        Frame::new(RgbImage::new(2, 2), ts)
    }

    #[test]
    fn test_fifo_order() {
        let ring = FrameRing::new(8);
        for i in 0..3 {
            ring.push(frame(f64::from(i)));
        }
        let out = ring.pop(2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp, 0.0);
        assert_eq!(out[1].timestamp, 1.0);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let ring = FrameRing::new(4);
        for i in 0..10 {
            ring.push(frame(f64::from(i)));
        }
        // Only the 4 most recent captures survive.
        let out = ring.drain();
        let stamps: Vec<f64> = out.iter().map(|f| f.timestamp).collect();
        assert_eq!(stamps, vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_never_returns_frames_older_than_capacity_window() {
        let capacity = 8;
        let ring = FrameRing::new(capacity);
        for i in 0..100 {
            ring.push(frame(f64::from(i)));
        }
        let newest = 99.0;
        for f in ring.drain() {
            assert!(f.timestamp > newest - capacity as f64);
        }
    }

    #[test]
    fn test_first_end_cause_wins() {
        let ring = FrameRing::new(2);
        ring.set_end(CaptureEnd::EndOfVideo);
        ring.set_end(CaptureEnd::ConnectionLost);
        assert_eq!(ring.end(), Some(CaptureEnd::EndOfVideo));
    }

    #[test]
    fn test_pop_more_than_available() {
        let ring = FrameRing::new(4);
        ring.push(frame(0.0));
        assert_eq!(ring.pop(5).len(), 1);
        assert_eq!(ring.len(), 0);
    }
}
