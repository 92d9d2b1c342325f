//! Frame and tracker producer boundary.
//!
//! The camera pipeline that actually produces both streams lives outside
//! this crate; the pipeline only needs something that yields sequenced
//! payloads. The synthetic sources replay the device cadence — a tracker
//! batch every low-resolution cycle, a high-resolution frame every `R`-th
//! cycle — deterministically, so the pipeline runs end to end in tests and
//! on machines without camera hardware.
//!
//! Sources return `Ok(None)` when their stream ends; the pipeline treats
//! that as a normal drain, not a failure.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::info;

use crate::config::SourceSettings;
use crate::frame::{SequencedFrame, FRAME_CHANNELS};
use crate::track::{BoundingBox, TrackStatus, TrackedDetection, TrackerBatch};

/// Yields high-resolution frames tagged with the frame-stream sequence.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<SequencedFrame>>;
}

/// Yields tracker batches tagged with the low-res cycle sequence.
pub trait TrackerSource {
    fn next_batch(&mut self) -> Result<Option<TrackerBatch>>;
}

fn ensure_stub(uri: &str) -> Result<()> {
    if !uri.starts_with("stub://") {
        return Err(anyhow!(
            "only stub:// sources are built in; camera delivery is an external producer boundary"
        ));
    }
    Ok(())
}

/// Capture timestamps advance by the cycle interval per sequence number, so
/// every payload gets a distinct, reproducible stamp even when pacing is
/// disabled.
fn stamp_for(start: DateTime<Utc>, sequence: u64, cycle_ms: u64) -> DateTime<Utc> {
    let step_ms = cycle_ms.max(1);
    start + chrono::Duration::milliseconds((sequence * step_ms) as i64)
}

// ----------------------------------------------------------------------------
// Synthetic frame source
// ----------------------------------------------------------------------------

/// Deterministic high-resolution frame generator.
pub struct SyntheticFrameSource {
    width: u32,
    height: u32,
    /// Frame sequences still to produce (one per `ratio` cycles).
    remaining: u64,
    next_sequence: u64,
    pacing: Duration,
    started: DateTime<Utc>,
    cycle_ms: u64,
    ratio: u64,
}

impl SyntheticFrameSource {
    pub fn new(settings: &SourceSettings, ratio: u64) -> Result<Self> {
        ensure_stub(&settings.uri)?;
        let cycles = settings.cycles.unwrap_or(u64::MAX);
        // One frame per started group of `ratio` cycles.
        let frames = if cycles == u64::MAX {
            u64::MAX
        } else {
            cycles.div_ceil(ratio)
        };
        info!(
            "frame source: {} {}x{} (synthetic)",
            settings.uri, settings.width, settings.height
        );
        Ok(Self {
            width: settings.width,
            height: settings.height,
            remaining: frames,
            next_sequence: 0,
            pacing: Duration::from_millis(settings.cycle_ms.saturating_mul(ratio)),
            started: Utc::now(),
            cycle_ms: settings.cycle_ms,
            ratio,
        })
    }

    pub fn produced(&self) -> u64 {
        self.next_sequence
    }

    fn generate_pixels(&self, sequence: u64) -> Vec<u8> {
        let len = self.width as usize * self.height as usize * FRAME_CHANNELS;
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64).wrapping_add(sequence.wrapping_mul(31)) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticFrameSource {
    fn next_frame(&mut self) -> Result<Option<SequencedFrame>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if !self.pacing.is_zero() {
            thread::sleep(self.pacing);
        }
        self.remaining -= 1;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let pixels = self.generate_pixels(sequence);
        let timestamp = stamp_for(self.started, sequence * self.ratio, self.cycle_ms);
        let frame = SequencedFrame::new(sequence, timestamp, self.width, self.height, pixels)?;
        Ok(Some(frame))
    }
}

// ----------------------------------------------------------------------------
// Synthetic tracker source
// ----------------------------------------------------------------------------

/// Deterministic tracker batch generator: two tracks drifting across the
/// field of view, one of them periodically reported lost.
pub struct SyntheticTrackerSource {
    remaining: u64,
    next_sequence: u64,
    pacing: Duration,
    started: DateTime<Utc>,
    cycle_ms: u64,
}

impl SyntheticTrackerSource {
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        ensure_stub(&settings.uri)?;
        info!("tracker source: {} (synthetic)", settings.uri);
        Ok(Self {
            remaining: settings.cycles.unwrap_or(u64::MAX),
            next_sequence: 0,
            pacing: Duration::from_millis(settings.cycle_ms),
            started: Utc::now(),
            cycle_ms: settings.cycle_ms,
        })
    }

    pub fn produced(&self) -> u64 {
        self.next_sequence
    }

    fn detections_for(sequence: u64) -> Vec<TrackedDetection> {
        // Drift 1% of the frame per cycle, wrapping every 60 cycles.
        let drift = (sequence % 60) as f32 * 0.01;
        let first = TrackedDetection {
            tracking_id: 1,
            class_index: 0,
            confidence: 0.82,
            bbox: BoundingBox::new(0.1 + drift * 0.5, 0.2, 0.25 + drift * 0.5, 0.38),
            status: if sequence == 0 {
                TrackStatus::New
            } else {
                TrackStatus::Tracked
            },
        };
        let second = TrackedDetection {
            tracking_id: 2,
            class_index: 0,
            confidence: 0.67,
            bbox: BoundingBox::new(0.55, 0.4 + drift * 0.3, 0.7, 0.55 + drift * 0.3),
            // Re-identification fails every 7th cycle.
            status: if sequence % 7 == 6 {
                TrackStatus::Lost
            } else {
                TrackStatus::Tracked
            },
        };
        vec![first, second]
    }
}

impl TrackerSource for SyntheticTrackerSource {
    fn next_batch(&mut self) -> Result<Option<TrackerBatch>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if !self.pacing.is_zero() {
            thread::sleep(self.pacing);
        }
        self.remaining -= 1;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(Some(TrackerBatch {
            sequence,
            timestamp: stamp_for(self.started, sequence, self.cycle_ms),
            detections: Self::detections_for(sequence),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(cycles: u64) -> SourceSettings {
        SourceSettings {
            uri: "stub://trap_camera".into(),
            width: 64,
            height: 48,
            cycles: Some(cycles),
            cycle_ms: 0,
        }
    }

    #[test]
    fn non_stub_uri_is_rejected() {
        let mut bad = settings(10);
        bad.uri = "rtsp://camera-1".into();
        assert!(SyntheticFrameSource::new(&bad, 4).is_err());
        assert!(SyntheticTrackerSource::new(&bad).is_err());
    }

    #[test]
    fn frame_source_covers_every_cycle_group() {
        // 10 cycles at ratio 4 need frames 0, 1, 2.
        let mut source = SyntheticFrameSource::new(&settings(10), 4).unwrap();
        let mut sequences = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            sequences.push(frame.sequence);
        }
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn tracker_source_counts_cycles() {
        let mut source = SyntheticTrackerSource::new(&settings(5)).unwrap();
        let mut sequences = Vec::new();
        while let Some(batch) = source.next_batch().unwrap() {
            assert_eq!(batch.detections.len(), 2);
            sequences.push(batch.sequence);
        }
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn batches_are_deterministic_per_sequence() {
        let a = SyntheticTrackerSource::detections_for(13);
        let b = SyntheticTrackerSource::detections_for(13);
        assert_eq!(a[0].bbox, b[0].bbox);
        assert_eq!(a[1].status, TrackStatus::Lost);
    }
}
