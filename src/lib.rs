//! trapsync — stream synchronization + crop extraction kernel
//!
//! This crate correlates the two output streams of an onboard camera-trap
//! vision pipeline and turns them into per-detection image crops plus
//! metadata rows:
//!
//! - a **tracker stream**: high-rate batches of tracked detections, inferred
//!   from low-resolution frames and tagged with the low-resolution sequence
//!   number
//! - a **frame stream**: low-rate, high-resolution raw frames tagged with
//!   their own, independent sequence number
//!
//! The two streams run at a fixed integral cadence: one high-resolution frame
//! is produced every `R`-th low-resolution cycle, so a tracker batch with
//! low-res sequence `L` belongs to the high-res frame `L / R`.
//!
//! # Module structure
//!
//! - `index`: bounded sequence-keyed buffer shared by both stream sides
//! - `frame` / `track`: the data model for both streams
//! - `sync`: matches tracker batches to their high-resolution frame
//! - `extract`: relative bbox -> absolute pixel crop
//! - `record`: persists crops and appends the session metadata file
//! - `source`: frame/tracker producer boundary (traits + synthetic sources)
//! - `pipeline`: producer threads, channels, and the consumer loop
//! - `config`: validated configuration surface
//!
//! # Loss model
//!
//! The pipeline is best-effort by design. Bounded buffers evict under
//! pressure, a tracker batch whose frame was already evicted is a sync miss,
//! and degenerate crop rectangles are skipped. All of these are counted in
//! [`PipelineStats`] and logged; none of them stop the pipeline. Only
//! persistence failures and resource exhaustion surface as errors.

use std::sync::atomic::{AtomicU64, Ordering};

pub mod config;
pub mod extract;
pub mod frame;
pub mod index;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod sync;
pub mod track;

pub use config::{PipelineConfig, SourceSettings};
pub use extract::{Crop, Extractor, PixelRect};
pub use frame::{SequencedFrame, SyncedPair};
pub use index::{PutResult, SequenceIndex};
pub use pipeline::{run_pipeline, PipelineSummary};
pub use record::{CropRecord, RecordError, Recorder};
pub use source::{FrameSource, SyntheticFrameSource, SyntheticTrackerSource, TrackerSource};
pub use sync::Synchronizer;
pub use track::{BoundingBox, TrackStatus, TrackedDetection, TrackerBatch};

// -------------------- Pipeline counters --------------------

/// Shared counters for everything the pipeline drops, skips, or emits.
///
/// Recoverable conditions are never silent: each one increments a counter
/// here and is logged at the point it happens. The daemon snapshots these
/// periodically; tests assert on them.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Frames accepted from the frame stream.
    pub frames_in: AtomicU64,
    /// Tracker batches accepted from the tracker stream.
    pub batches_in: AtomicU64,
    /// Matched (frame, detections) pairs emitted by the synchronizer.
    pub pairs_emitted: AtomicU64,
    /// Tracker batches whose frame was already gone when they resolved.
    pub sync_misses: AtomicU64,
    /// Entries evicted from a sequence index under capacity pressure.
    pub index_evictions: AtomicU64,
    /// Duplicate or non-monotonic sequence numbers dropped at the boundary.
    pub contract_violations: AtomicU64,
    /// Items dropped because a stage channel was full.
    pub channel_drops: AtomicU64,
    /// Crops written to disk with a matching metadata row.
    pub crops_written: AtomicU64,
    /// Detections skipped because the clamped crop rectangle had no area.
    pub degenerate_skips: AtomicU64,
    /// Persistence failures surfaced while recording crops.
    pub record_failures: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            batches_in: self.batches_in.load(Ordering::Relaxed),
            pairs_emitted: self.pairs_emitted.load(Ordering::Relaxed),
            sync_misses: self.sync_misses.load(Ordering::Relaxed),
            index_evictions: self.index_evictions.load(Ordering::Relaxed),
            contract_violations: self.contract_violations.load(Ordering::Relaxed),
            channel_drops: self.channel_drops.load(Ordering::Relaxed),
            crops_written: self.crops_written.load(Ordering::Relaxed),
            degenerate_skips: self.degenerate_skips.load(Ordering::Relaxed),
            record_failures: self.record_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`], cheap to log and compare.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_in: u64,
    pub batches_in: u64,
    pub pairs_emitted: u64,
    pub sync_misses: u64,
    pub index_evictions: u64,
    pub contract_violations: u64,
    pub channel_drops: u64,
    pub crops_written: u64,
    pub degenerate_skips: u64,
    pub record_failures: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn bump_by(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
