//! High-resolution frame payloads and matched pairs.
//!
//! A [`SequencedFrame`] owns its pixel buffer for its whole life: the frame
//! source creates it, the synchronizer's frame index holds it, and the
//! extractor reads it. Extraction never mutates the buffer; crops are copies.
//! Because several tracker batches resolve to the same high-resolution frame
//! (one frame per `R` low-res cycles), matched pairs share the frame behind
//! an `Arc` instead of moving it.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use crate::track::TrackedDetection;

/// Bytes per pixel; frames are packed RGB8.
pub const FRAME_CHANNELS: usize = 3;

/// One high-resolution frame tagged with its stream sequence number.
pub struct SequencedFrame {
    /// Position in the frame stream's own counter (independent of the
    /// tracker stream's counter).
    pub sequence: u64,
    /// Capture timestamp assigned by the producer.
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    /// Packed RGB8 pixel data, immutable once created.
    pixels: Vec<u8>,
}

impl SequencedFrame {
    /// Create a frame, checking that the buffer matches the dimensions.
    pub fn new(
        sequence: u64,
        timestamp: DateTime<Utc>,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Result<Self> {
        let expected = width as usize * height as usize * FRAME_CHANNELS;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame {} pixel buffer is {} bytes, expected {} for {}x{} rgb8",
                sequence,
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            sequence,
            timestamp,
            width,
            height,
            pixels,
        })
    }

    /// Read-only view of the packed RGB8 pixel data.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

impl std::fmt::Debug for SequencedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Skip the pixel buffer; frames can be multiple megabytes.
        f.debug_struct("SequencedFrame")
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// A tracker batch matched to the high-resolution frame it was inferred from.
///
/// `resolved_sequence` is the frame-stream sequence number both sides agreed
/// on; the synchronizer emits pairs in non-decreasing `resolved_sequence`
/// order regardless of arrival interleaving.
#[derive(Debug)]
pub struct SyncedPair {
    pub frame: Arc<SequencedFrame>,
    /// Detections in tracker output order. May be empty.
    pub detections: Vec<TrackedDetection>,
    pub resolved_sequence: u64,
    /// Capture timestamp of the tracker batch; used for record naming.
    pub batch_timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer_length() {
        let err = SequencedFrame::new(0, Utc::now(), 4, 4, vec![0u8; 10]);
        assert!(err.is_err());
    }

    #[test]
    fn accepts_exact_buffer_length() {
        let frame = SequencedFrame::new(7, Utc::now(), 4, 2, vec![0u8; 4 * 2 * 3]).unwrap();
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.byte_len(), 24);
    }
}
