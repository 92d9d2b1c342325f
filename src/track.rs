//! Tracker-stream data model.
//!
//! The tracker runs on the low-resolution stream and emits one batch per
//! low-res frame: zero or more detections, each carrying the tracker's
//! identity assignment and a bounding box in normalized 0..1 coordinates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tracker-assigned lifecycle state of a detection.
///
/// `Lost` means the object was not re-identified this cycle; the box is a
/// carry-over with no new spatial information and must never be cropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackStatus {
    New,
    Tracked,
    Lost,
}

impl TrackStatus {
    /// Whether a detection with this status carries usable spatial data.
    pub fn croppable(self) -> bool {
        !matches!(self, TrackStatus::Lost)
    }
}

/// Bounding box in coordinates relative to the inference frame, each
/// component nominally in [0, 1]. Values outside that range are clamped at
/// extraction time, not rejected here.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BoundingBox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Clamp all components into [0, 1].
    pub fn clamped(self) -> Self {
        Self {
            xmin: self.xmin.clamp(0.0, 1.0),
            ymin: self.ymin.clamp(0.0, 1.0),
            xmax: self.xmax.clamp(0.0, 1.0),
            ymax: self.ymax.clamp(0.0, 1.0),
        }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }
}

/// One tracked detection from a tracker batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackedDetection {
    /// Tracker identity, stable across cycles while the object is followed.
    pub tracking_id: i64,
    /// Model class index; resolved to a label name at record time.
    pub class_index: usize,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub status: TrackStatus,
}

/// All detections inferred from one low-resolution frame.
///
/// `sequence` counts low-resolution cycles, not high-resolution frames; the
/// synchronizer maps it onto the frame stream via the cadence ratio.
#[derive(Clone, Debug)]
pub struct TrackerBatch {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<TrackedDetection>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_is_not_croppable() {
        assert!(TrackStatus::New.croppable());
        assert!(TrackStatus::Tracked.croppable());
        assert!(!TrackStatus::Lost.croppable());
    }

    #[test]
    fn clamp_pulls_components_into_unit_range() {
        let bbox = BoundingBox::new(-0.2, 0.1, 1.4, 0.9).clamped();
        assert_eq!(bbox.xmin, 0.0);
        assert_eq!(bbox.ymin, 0.1);
        assert_eq!(bbox.xmax, 1.0);
        assert_eq!(bbox.ymax, 0.9);
    }
}
