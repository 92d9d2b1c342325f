//! Stream synchronizer.
//!
//! Matches each tracker batch (low-res sequence `L`) to the high-resolution
//! frame it was inferred from (frame sequence `H = L / R`, where `R` is the
//! fixed cadence ratio: one high-res frame per `R` low-res cycles).
//!
//! Both streams land in bounded [`SequenceIndex`] buffers, so out-of-order
//! arrival within the retention window resolves naturally and memory stays
//! bounded no matter how the producers behave. Matched pairs come out in
//! non-decreasing frame-sequence order; anything that cannot be matched in
//! order anymore is dropped as a sync miss and counted, never silently.
//!
//! Invariants kept here:
//! - emitting at `H` evicts frames keyed `< H` (low-res sequence numbers
//!   only increase, so those frames can never match again) and flushes
//!   buffered batches keyed below `H * R` as misses
//! - a frame stays resident after its first match: up to `R` batches
//!   resolve to the same frame
//! - per-stream sequence violations (duplicates, regressions) drop the
//!   offending item and count it; they never stop the pipeline

use std::sync::Arc;

use log::{debug, warn};

use crate::frame::{SequencedFrame, SyncedPair};
use crate::index::SequenceIndex;
use crate::track::TrackerBatch;
use crate::{bump, bump_by, PipelineStats};

pub struct Synchronizer {
    /// High-res frames per low-res cycle denominator: `H = L / ratio`.
    ratio: u64,
    /// Frames waiting for their tracker batches, keyed by frame sequence.
    frames: SequenceIndex<Arc<SequencedFrame>>,
    /// Batches that arrived ahead of their frame, keyed by low-res sequence.
    pending: SequenceIndex<TrackerBatch>,
    /// Frame sequences below this can never be matched again.
    evicted_below: u64,
    /// Highest tracker sequence accepted; the tracker stream must increase.
    last_batch_seq: Option<u64>,
    /// Resolved sequence of the most recent emitted pair.
    last_emitted: Option<u64>,
    stats: Arc<PipelineStats>,
}

impl Synchronizer {
    pub fn new(
        ratio: u64,
        frame_capacity: usize,
        tracker_capacity: usize,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            ratio,
            frames: SequenceIndex::new(frame_capacity),
            pending: SequenceIndex::new(tracker_capacity),
            evicted_below: 0,
            last_batch_seq: None,
            last_emitted: None,
            stats,
        }
    }

    /// Accept a high-resolution frame and resolve any batches that were
    /// waiting for it. Returns the resolved pairs in batch order.
    pub fn offer_frame(&mut self, frame: SequencedFrame) -> Vec<SyncedPair> {
        let seq = frame.sequence;

        // A frame below the eviction watermark or behind the emitted cursor
        // arrived outside the reorder tolerance; nothing can use it.
        if seq < self.evicted_below || self.last_emitted.is_some_and(|le| seq < le) {
            warn!(
                "frame stream violation: sequence {} arrived after its window closed",
                seq
            );
            bump(&self.stats.contract_violations);
            return Vec::new();
        }

        let result = self.frames.put(seq, Arc::new(frame));
        if result.replaced.is_some() {
            warn!("frame stream violation: duplicate sequence {} replaced", seq);
            bump(&self.stats.contract_violations);
        }
        if let Some((evicted_seq, _)) = result.evicted {
            debug!(
                "frame index full ({}), evicted unmatched frame {}",
                self.frames.capacity(),
                evicted_seq
            );
            bump(&self.stats.index_evictions);
            self.evicted_below = self.evicted_below.max(evicted_seq + 1);
            self.flush_misses_below(self.evicted_below);
        }
        bump(&self.stats.frames_in);

        // Resolve buffered batches whose computed frame sequence is `seq`.
        // With a tiny capacity the frame just inserted can itself be the
        // oldest entry and fall straight out; its batches were flushed above.
        let Some(frame) = self.frames.get(seq).cloned() else {
            return Vec::new();
        };
        let lo = seq * self.ratio;
        let hi = lo + self.ratio;
        let ready = self.pending.take_range(lo..hi);
        if ready.is_empty() {
            return Vec::new();
        }
        let pairs: Vec<SyncedPair> = ready
            .into_iter()
            .map(|(_, batch)| SyncedPair {
                frame: Arc::clone(&frame),
                detections: batch.detections,
                resolved_sequence: seq,
                batch_timestamp: batch.timestamp,
            })
            .collect();
        self.note_emission(seq, pairs.len() as u64);
        pairs
    }

    /// Accept a tracker batch. Returns the matched pair if its frame is
    /// resident, `None` if the batch was buffered or dropped.
    pub fn offer_batch(&mut self, batch: TrackerBatch) -> Option<SyncedPair> {
        let seq = batch.sequence;
        if self.last_batch_seq.is_some_and(|last| seq <= last) {
            warn!(
                "tracker stream violation: sequence {} after {} dropped",
                seq,
                self.last_batch_seq.unwrap_or_default()
            );
            bump(&self.stats.contract_violations);
            return None;
        }
        self.last_batch_seq = Some(seq);
        bump(&self.stats.batches_in);

        let target = seq / self.ratio;

        // Output order is monotonic in resolved sequence; a batch resolving
        // below the emitted cursor can never be paired anymore.
        if self.last_emitted.is_some_and(|le| target < le) {
            debug!("sync miss: batch {} resolves to consumed frame {}", seq, target);
            bump(&self.stats.sync_misses);
            return None;
        }

        if let Some(frame) = self.frames.get(target).cloned() {
            let pair = SyncedPair {
                frame,
                detections: batch.detections,
                resolved_sequence: target,
                batch_timestamp: batch.timestamp,
            };
            self.note_emission(target, 1);
            return Some(pair);
        }

        // Frame absent: gone for good if it is below everything retained,
        // otherwise it may still arrive and the batch waits for it.
        let already_gone = target < self.evicted_below
            || self.frames.oldest().is_some_and(|oldest| target < oldest);
        if already_gone {
            debug!("sync miss: frame {} for batch {} already evicted", target, seq);
            bump(&self.stats.sync_misses);
            return None;
        }

        let result = self.pending.put(seq, batch);
        if result.replaced.is_some() {
            warn!("tracker stream violation: duplicate sequence {} replaced", seq);
            bump(&self.stats.contract_violations);
        }
        if let Some((evicted_seq, _)) = result.evicted {
            debug!(
                "tracker index full ({}), evicted waiting batch {}",
                self.pending.capacity(),
                evicted_seq
            );
            bump(&self.stats.index_evictions);
            bump(&self.stats.sync_misses);
        }
        None
    }

    /// Drop all still-buffered batches as sync misses and release retained
    /// frames. Called on shutdown; new arrivals are not waited for.
    pub fn finish(&mut self) -> usize {
        let unmatched = self.pending.len();
        if unmatched > 0 {
            debug!("shutdown: {} buffered batches never matched", unmatched);
            bump_by(&self.stats.sync_misses, unmatched as u64);
            self.pending.evict_older_than(u64::MAX);
        }
        self.frames.evict_older_than(u64::MAX);
        unmatched
    }

    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    pub fn resident_frames(&self) -> usize {
        self.frames.len()
    }

    /// Bookkeeping after emitting `count` pairs resolved at `seq`: advance
    /// the cursor, retire frames that can no longer match, and flush batches
    /// stranded below the new watermark.
    fn note_emission(&mut self, seq: u64, count: u64) {
        bump_by(&self.stats.pairs_emitted, count);
        self.last_emitted = Some(seq);
        let retired = self.frames.evict_older_than(seq);
        if retired > 0 {
            debug!("retired {} frames below sequence {}", retired, seq);
        }
        self.evicted_below = self.evicted_below.max(seq);
        self.flush_misses_below(seq);
    }

    /// Drop buffered batches whose frame sequence is below `frame_seq`.
    fn flush_misses_below(&mut self, frame_seq: u64) {
        let cutoff = frame_seq * self.ratio;
        let stranded = self.pending.evict_older_than(cutoff);
        if stranded > 0 {
            debug!(
                "{} buffered batches below cycle {} can no longer match",
                stranded, cutoff
            );
            bump_by(&self.stats.sync_misses, stranded as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{BoundingBox, TrackStatus, TrackedDetection};
    use chrono::Utc;

    fn test_frame(seq: u64) -> SequencedFrame {
        SequencedFrame::new(seq, Utc::now(), 4, 4, vec![seq as u8; 4 * 4 * 3]).unwrap()
    }

    fn test_batch(seq: u64) -> TrackerBatch {
        TrackerBatch {
            sequence: seq,
            timestamp: Utc::now(),
            detections: vec![TrackedDetection {
                tracking_id: 1,
                class_index: 0,
                confidence: 0.9,
                bbox: BoundingBox::new(0.2, 0.2, 0.6, 0.6),
                status: TrackStatus::Tracked,
            }],
        }
    }

    fn synchronizer(ratio: u64, frame_cap: usize) -> (Synchronizer, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::default());
        (
            Synchronizer::new(ratio, frame_cap, 32, Arc::clone(&stats)),
            stats,
        )
    }

    #[test]
    fn fixed_ratio_cadence_resolves_every_batch() {
        // R=5, frames 0..3 resident, batches 0..10: H=0 for L=0..4, H=1 for L=5..9.
        let (mut sync, stats) = synchronizer(5, 8);
        for seq in 0..3 {
            assert!(sync.offer_frame(test_frame(seq)).is_empty());
        }
        let mut resolved = Vec::new();
        for seq in 0..10 {
            let pair = sync.offer_batch(test_batch(seq)).expect("frame resident");
            resolved.push(pair.resolved_sequence);
        }
        assert_eq!(resolved, vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1]);
        assert_eq!(stats.snapshot().pairs_emitted, 10);
        assert_eq!(stats.snapshot().sync_misses, 0);
    }

    #[test]
    fn early_batch_buffers_until_its_frame_arrives() {
        let (mut sync, stats) = synchronizer(5, 8);
        sync.offer_frame(test_frame(0));
        sync.offer_frame(test_frame(1));

        // L=12 maps to H=2, which has not arrived yet.
        assert!(sync.offer_batch(test_batch(12)).is_none());
        assert_eq!(sync.pending_batches(), 1);

        let pairs = sync.offer_frame(test_frame(2));
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].resolved_sequence, 2);
        assert_eq!(sync.pending_batches(), 0);
        assert_eq!(stats.snapshot().sync_misses, 0);
    }

    #[test]
    fn several_buffered_batches_resolve_together() {
        let (mut sync, _) = synchronizer(4, 8);
        for seq in 8..11 {
            assert!(sync.offer_batch(test_batch(seq)).is_none());
        }
        let pairs = sync.offer_frame(test_frame(2));
        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(|p| p.resolved_sequence == 2));
    }

    #[test]
    fn batch_for_evicted_frame_is_a_sync_miss() {
        // Frame capacity 2: frames 0,1,2 arrive, 0 is evicted, then a batch
        // resolving to frame 0 misses.
        let (mut sync, stats) = synchronizer(5, 2);
        for seq in 0..3 {
            sync.offer_frame(test_frame(seq));
        }
        assert_eq!(sync.resident_frames(), 2);
        assert_eq!(stats.snapshot().index_evictions, 1);

        assert!(sync.offer_batch(test_batch(3)).is_none());
        assert_eq!(stats.snapshot().sync_misses, 1);
        assert_eq!(stats.snapshot().pairs_emitted, 0);
    }

    #[test]
    fn output_sequence_is_monotonic_under_interleaving() {
        let (mut sync, _) = synchronizer(2, 8);
        let mut emitted = Vec::new();

        sync.offer_frame(test_frame(1));
        if let Some(p) = sync.offer_batch(test_batch(2)) {
            emitted.push(p.resolved_sequence);
        }
        if let Some(p) = sync.offer_batch(test_batch(3)) {
            emitted.push(p.resolved_sequence);
        }
        // Frame 0 arrives late, after pairs at sequence 1 were emitted; its
        // window has closed and it must not produce out-of-order output.
        for p in sync.offer_frame(test_frame(0)) {
            emitted.push(p.resolved_sequence);
        }
        if let Some(p) = sync.offer_batch(test_batch(4)) {
            emitted.push(p.resolved_sequence);
        }
        sync.offer_frame(test_frame(2));
        if let Some(p) = sync.offer_batch(test_batch(5)) {
            emitted.push(p.resolved_sequence);
        }

        let mut sorted = emitted.clone();
        sorted.sort_unstable();
        assert_eq!(emitted, sorted, "emission order must be non-decreasing");
    }

    #[test]
    fn tracker_regression_is_dropped_and_counted() {
        let (mut sync, stats) = synchronizer(5, 8);
        sync.offer_frame(test_frame(0));
        assert!(sync.offer_batch(test_batch(3)).is_some());
        assert!(sync.offer_batch(test_batch(2)).is_none());
        assert_eq!(stats.snapshot().contract_violations, 1);
        // The stream recovers with the next in-order batch.
        assert!(sync.offer_batch(test_batch(4)).is_some());
    }

    #[test]
    fn duplicate_frame_is_replaced_and_counted() {
        let (mut sync, stats) = synchronizer(5, 8);
        sync.offer_frame(test_frame(0));
        sync.offer_frame(test_frame(0));
        assert_eq!(stats.snapshot().contract_violations, 1);
        assert_eq!(sync.resident_frames(), 1);
        // Matching still works against the replacement.
        assert!(sync.offer_batch(test_batch(0)).is_some());
    }

    #[test]
    fn consumed_frames_are_retired_on_advance() {
        let (mut sync, _) = synchronizer(2, 8);
        for seq in 0..4 {
            sync.offer_frame(test_frame(seq));
        }
        sync.offer_batch(test_batch(6)); // resolves to frame 3
        assert_eq!(sync.resident_frames(), 1);
    }

    #[test]
    fn finish_counts_stranded_batches_as_misses() {
        let (mut sync, stats) = synchronizer(5, 8);
        assert!(sync.offer_batch(test_batch(7)).is_none());
        assert!(sync.offer_batch(test_batch(12)).is_none());
        assert_eq!(sync.finish(), 2);
        assert_eq!(stats.snapshot().sync_misses, 2);
        assert_eq!(sync.pending_batches(), 0);
        assert_eq!(sync.resident_frames(), 0);
    }

    #[test]
    fn empty_batch_still_resolves_to_a_pair() {
        let (mut sync, _) = synchronizer(5, 8);
        sync.offer_frame(test_frame(0));
        let mut batch = test_batch(0);
        batch.detections.clear();
        let pair = sync.offer_batch(batch).expect("empty batches still match");
        assert!(pair.detections.is_empty());
    }
}
