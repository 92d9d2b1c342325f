//! Crop extraction.
//!
//! Turns each croppable detection of a matched pair into an independent
//! image buffer. Bounding boxes arrive in coordinates relative to the
//! low-resolution inference frame; because both frames show the same field
//! of view, the same relative coordinates address the high-resolution frame.
//! Coordinates are clamped to the unit range before scaling, the configured
//! margin widens the box, and the resulting pixel rectangle is clamped to
//! the frame. Rectangles with no remaining area are skipped and counted.
//!
//! Extraction is read-only on the source frame and deterministic: running it
//! twice on the same pair produces bit-identical crops.

use std::sync::Arc;

use image::RgbImage;
use log::debug;

use crate::frame::{SequencedFrame, SyncedPair, FRAME_CHANNELS};
use crate::track::{BoundingBox, TrackedDetection};
use crate::{bump, PipelineStats};

/// Absolute pixel rectangle in the high-resolution frame, half-open on the
/// right/bottom edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }
}

/// One extracted crop together with the detection it came from.
#[derive(Debug)]
pub struct Crop {
    pub detection: TrackedDetection,
    pub rect: PixelRect,
    pub image: RgbImage,
}

/// Convert a relative bounding box into an absolute pixel rectangle.
///
/// `margin` widens the box by that fraction of its own width/height on each
/// side before clamping. Returns `None` when the clamped rectangle has zero
/// or negative area.
pub fn to_pixel_rect(
    bbox: BoundingBox,
    width: u32,
    height: u32,
    margin: f32,
) -> Option<PixelRect> {
    let bbox = bbox.clamped();
    let mx = margin * bbox.width();
    let my = margin * bbox.height();
    let widened = BoundingBox::new(
        bbox.xmin - mx,
        bbox.ymin - my,
        bbox.xmax + mx,
        bbox.ymax + my,
    )
    .clamped();

    let x0 = ((widened.xmin * width as f32).round() as u32).min(width);
    let x1 = ((widened.xmax * width as f32).round() as u32).min(width);
    let y0 = ((widened.ymin * height as f32).round() as u32).min(height);
    let y1 = ((widened.ymax * height as f32).round() as u32).min(height);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(PixelRect { x0, y0, x1, y1 })
}

pub struct Extractor {
    margin: f32,
    stats: Arc<PipelineStats>,
}

impl Extractor {
    pub fn new(margin: f32, stats: Arc<PipelineStats>) -> Self {
        Self { margin, stats }
    }

    /// Extract one crop per croppable detection, in detection order.
    ///
    /// `Lost` detections carry no new spatial data and are passed over
    /// without comment; degenerate rectangles are skipped and counted.
    pub fn extract(&self, pair: &SyncedPair) -> Vec<Crop> {
        let frame = &pair.frame;
        let mut crops = Vec::new();
        for detection in &pair.detections {
            if !detection.status.croppable() {
                continue;
            }
            let Some(rect) = to_pixel_rect(detection.bbox, frame.width, frame.height, self.margin)
            else {
                debug!(
                    "skipping degenerate box for track {} in frame {}",
                    detection.tracking_id, pair.resolved_sequence
                );
                bump(&self.stats.degenerate_skips);
                continue;
            };
            crops.push(Crop {
                detection: detection.clone(),
                rect,
                image: crop_region(frame, rect),
            });
        }
        crops
    }
}

/// Copy the rectangle out of the frame's packed RGB buffer.
fn crop_region(frame: &SequencedFrame, rect: PixelRect) -> RgbImage {
    let mut out = RgbImage::new(rect.width(), rect.height());
    let src_stride = frame.width as usize * FRAME_CHANNELS;
    let dst_stride = rect.width() as usize * FRAME_CHANNELS;
    let pixels = frame.pixels();
    let dst: &mut [u8] = &mut out;
    for (row, y) in (rect.y0..rect.y1).enumerate() {
        let src_start = y as usize * src_stride + rect.x0 as usize * FRAME_CHANNELS;
        let dst_start = row * dst_stride;
        dst[dst_start..dst_start + dst_stride]
            .copy_from_slice(&pixels[src_start..src_start + dst_stride]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{TrackStatus, TrackedDetection};
    use chrono::Utc;

    fn gradient_frame(seq: u64, width: u32, height: u32) -> SequencedFrame {
        let mut pixels = Vec::with_capacity((width * height) as usize * FRAME_CHANNELS);
        for y in 0..height {
            for x in 0..width {
                pixels.push(x as u8);
                pixels.push(y as u8);
                pixels.push((x ^ y) as u8);
            }
        }
        SequencedFrame::new(seq, Utc::now(), width, height, pixels).unwrap()
    }

    fn detection(bbox: BoundingBox, status: TrackStatus) -> TrackedDetection {
        TrackedDetection {
            tracking_id: 1,
            class_index: 0,
            confidence: 0.8,
            bbox,
            status,
        }
    }

    fn pair_with(frame: SequencedFrame, detections: Vec<TrackedDetection>) -> SyncedPair {
        SyncedPair {
            frame: Arc::new(frame),
            detections,
            resolved_sequence: 0,
            batch_timestamp: Utc::now(),
        }
    }

    #[test]
    fn relative_box_scales_by_rounding_and_clamping() {
        let rect = to_pixel_rect(BoundingBox::new(0.1, 0.25, 0.5, 0.75), 100, 80, 0.0).unwrap();
        assert_eq!(rect, PixelRect { x0: 10, y0: 20, x1: 50, y1: 60 });
    }

    #[test]
    fn out_of_range_coordinates_clamp_to_frame_bounds() {
        let rect = to_pixel_rect(BoundingBox::new(-0.3, 0.0, 1.2, 1.5), 100, 80, 0.0).unwrap();
        assert_eq!(rect, PixelRect { x0: 0, y0: 0, x1: 100, y1: 80 });
    }

    #[test]
    fn zero_area_box_is_degenerate() {
        assert!(to_pixel_rect(BoundingBox::new(0.5, 0.5, 0.5, 0.9), 100, 80, 0.0).is_none());
        // Inverted box collapses to nothing once clamped and scaled.
        assert!(to_pixel_rect(BoundingBox::new(0.6, 0.2, 0.4, 0.1), 100, 80, 0.0).is_none());
    }

    #[test]
    fn margin_widens_the_box_proportionally() {
        // Box is 20px wide, 16px tall; margin 0.25 adds 5px / 4px per side.
        let rect = to_pixel_rect(BoundingBox::new(0.4, 0.4, 0.6, 0.6), 100, 80, 0.25).unwrap();
        assert_eq!(rect, PixelRect { x0: 35, y0: 28, x1: 65, y1: 52 });
    }

    #[test]
    fn lost_detections_are_never_cropped() {
        let stats = Arc::new(PipelineStats::default());
        let extractor = Extractor::new(0.0, Arc::clone(&stats));
        let pair = pair_with(
            gradient_frame(0, 32, 32),
            vec![
                detection(BoundingBox::new(0.0, 0.0, 0.5, 0.5), TrackStatus::Tracked),
                detection(BoundingBox::new(0.1, 0.1, 0.6, 0.6), TrackStatus::Lost),
                detection(BoundingBox::new(0.2, 0.2, 0.7, 0.7), TrackStatus::New),
            ],
        );
        let crops = extractor.extract(&pair);
        assert_eq!(crops.len(), 2);
        // Output order matches input detection order.
        assert_eq!(crops[0].rect.x0, 0);
        assert_eq!(crops[1].rect.x0, 6);
        assert_eq!(stats.snapshot().degenerate_skips, 0);
    }

    #[test]
    fn degenerate_box_is_skipped_and_counted() {
        let stats = Arc::new(PipelineStats::default());
        let extractor = Extractor::new(0.0, Arc::clone(&stats));
        let pair = pair_with(
            gradient_frame(0, 32, 32),
            vec![detection(
                BoundingBox::new(0.5, 0.5, 0.5, 0.5),
                TrackStatus::Tracked,
            )],
        );
        assert!(extractor.extract(&pair).is_empty());
        assert_eq!(stats.snapshot().degenerate_skips, 1);
    }

    #[test]
    fn crop_copies_the_exact_region() {
        let stats = Arc::new(PipelineStats::default());
        let extractor = Extractor::new(0.0, stats);
        let pair = pair_with(
            gradient_frame(0, 64, 64),
            vec![detection(
                BoundingBox::new(0.25, 0.5, 0.75, 0.75),
                TrackStatus::Tracked,
            )],
        );
        let crops = extractor.extract(&pair);
        let crop = &crops[0];
        assert_eq!(crop.rect, PixelRect { x0: 16, y0: 32, x1: 48, y1: 48 });
        for y in 0..crop.rect.height() {
            for x in 0..crop.rect.width() {
                let px = crop.image.get_pixel(x, y);
                let (sx, sy) = (x + crop.rect.x0, y + crop.rect.y0);
                assert_eq!(px.0, [sx as u8, sy as u8, (sx ^ sy) as u8]);
            }
        }
    }

    #[test]
    fn extraction_is_deterministic() {
        let stats = Arc::new(PipelineStats::default());
        let extractor = Extractor::new(0.1, stats);
        let pair = pair_with(
            gradient_frame(3, 48, 48),
            vec![detection(
                BoundingBox::new(0.2, 0.3, 0.8, 0.9),
                TrackStatus::Tracked,
            )],
        );
        let first = extractor.extract(&pair);
        let second = extractor.extract(&pair);
        assert_eq!(first[0].image.as_raw(), second[0].image.as_raw());
        assert_eq!(first[0].rect, second[0].rect);
    }
}
