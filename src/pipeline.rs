//! Pipeline wiring and lifecycle.
//!
//! Two producer threads push frames and tracker batches into bounded
//! channels; a single consumer thread (the caller of [`run_pipeline`]) feeds
//! the synchronizer and runs extraction and recording inline. Bounded
//! channels plus the bounded sequence indexes are the only backpressure:
//! when the consumer falls behind, producers drop what will not fit and
//! count it instead of queueing without limit.
//!
//! Shutdown: when the flag flips, producers stop at their next iteration and
//! the consumer drains whatever already arrived — matched pairs in flight go
//! through extraction and recording, buffered-but-unmatched batches become
//! sync misses. Nothing waits for future arrivals.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Utc;
use crossbeam_channel::{never, select, TrySendError};
use log::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::extract::Extractor;
use crate::frame::{SequencedFrame, SyncedPair};
use crate::record::Recorder;
use crate::source::{FrameSource, TrackerSource};
use crate::sync::Synchronizer;
use crate::track::TrackerBatch;
use crate::{bump, PipelineStats, StatsSnapshot};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_POLL: Duration = Duration::from_millis(50);

/// What a finished run produced and dropped.
#[derive(Debug)]
pub struct PipelineSummary {
    pub stats: StatsSnapshot,
    pub session_dir: PathBuf,
    pub metadata_path: PathBuf,
}

/// Run the synchronization + extraction pipeline until both sources end or
/// `shutdown` flips.
///
/// Recoverable conditions (misses, evictions, skips, per-record persistence
/// failures) are counted in `stats` and logged; the run only returns an
/// error when the session cannot be set up or a producer thread dies.
pub fn run_pipeline(
    config: &PipelineConfig,
    frame_source: Box<dyn FrameSource + Send>,
    tracker_source: Box<dyn TrackerSource + Send>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
) -> Result<PipelineSummary> {
    let mut recorder = Recorder::create(
        &config.output_dir,
        Utc::now(),
        config.labels.clone(),
        config.jpeg_quality,
    )?;
    info!(
        "recording session {} -> {}",
        recorder.session(),
        recorder.session_dir().display()
    );

    let extractor = Extractor::new(config.crop_margin, Arc::clone(&stats));
    let mut sync = Synchronizer::new(
        config.ratio,
        config.frame_index_capacity,
        config.tracker_index_capacity,
        Arc::clone(&stats),
    );

    let (frame_tx, frame_rx) = crossbeam_channel::bounded::<SequencedFrame>(config.channel_capacity);
    let (batch_tx, batch_rx) = crossbeam_channel::bounded::<TrackerBatch>(config.channel_capacity);

    let frame_handle = {
        let shutdown = Arc::clone(&shutdown);
        let stats = Arc::clone(&stats);
        thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || {
                let mut source = frame_source;
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    match source.next_frame() {
                        Ok(Some(frame)) => match frame_tx.try_send(frame) {
                            Ok(()) => {}
                            Err(TrySendError::Full(frame)) => {
                                warn!(
                                    "frame channel full, dropping frame {}",
                                    frame.sequence
                                );
                                bump(&stats.channel_drops);
                            }
                            Err(TrySendError::Disconnected(_)) => break,
                        },
                        Ok(None) => break,
                        Err(e) => {
                            error!("frame source failed: {e:#}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| anyhow!("failed to spawn frame producer: {e}"))?
    };

    let batch_handle = {
        let shutdown = Arc::clone(&shutdown);
        let stats = Arc::clone(&stats);
        thread::Builder::new()
            .name("tracker-source".into())
            .spawn(move || {
                let mut source = tracker_source;
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    match source.next_batch() {
                        Ok(Some(batch)) => match batch_tx.try_send(batch) {
                            Ok(()) => {}
                            Err(TrySendError::Full(batch)) => {
                                warn!(
                                    "tracker channel full, dropping batch {}",
                                    batch.sequence
                                );
                                bump(&stats.channel_drops);
                            }
                            Err(TrySendError::Disconnected(_)) => break,
                        },
                        Ok(None) => break,
                        Err(e) => {
                            error!("tracker source failed: {e:#}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| anyhow!("failed to spawn tracker producer: {e}"))?
    };

    // Consumer loop. A closed channel is swapped for `never()` so the select
    // stops seeing it without spinning.
    let mut frame_rx = frame_rx;
    let mut batch_rx = batch_rx;
    let mut frames_open = true;
    let mut batches_open = true;
    let mut last_health_log = Instant::now();

    while frames_open || batches_open {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        select! {
            recv(frame_rx) -> msg => match msg {
                Ok(frame) => {
                    for pair in sync.offer_frame(frame) {
                        process_pair(&pair, &extractor, &mut recorder, &stats);
                    }
                }
                Err(_) => {
                    frames_open = false;
                    frame_rx = never();
                }
            },
            recv(batch_rx) -> msg => match msg {
                Ok(batch) => {
                    if let Some(pair) = sync.offer_batch(batch) {
                        process_pair(&pair, &extractor, &mut recorder, &stats);
                    }
                }
                Err(_) => {
                    batches_open = false;
                    batch_rx = never();
                }
            },
            default(IDLE_POLL) => {}
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let snapshot = stats.snapshot();
            info!(
                "health: pairs={} misses={} evictions={} crops={} pending_batches={} resident_frames={}",
                snapshot.pairs_emitted,
                snapshot.sync_misses,
                snapshot.index_evictions,
                snapshot.crops_written,
                sync.pending_batches(),
                sync.resident_frames(),
            );
            last_health_log = Instant::now();
        }
    }

    // Drain what already arrived; do not wait for more.
    while let Ok(frame) = frame_rx.try_recv() {
        for pair in sync.offer_frame(frame) {
            process_pair(&pair, &extractor, &mut recorder, &stats);
        }
    }
    while let Ok(batch) = batch_rx.try_recv() {
        if let Some(pair) = sync.offer_batch(batch) {
            process_pair(&pair, &extractor, &mut recorder, &stats);
        }
    }
    sync.finish();

    if frame_handle.join().is_err() {
        return Err(anyhow!("frame producer thread panicked"));
    }
    if batch_handle.join().is_err() {
        return Err(anyhow!("tracker producer thread panicked"));
    }

    let snapshot = stats.snapshot();
    info!(
        "session {} done: {} pairs, {} crops, {} misses",
        recorder.session(),
        snapshot.pairs_emitted,
        snapshot.crops_written,
        snapshot.sync_misses
    );
    Ok(PipelineSummary {
        stats: snapshot,
        session_dir: recorder.session_dir().to_path_buf(),
        metadata_path: recorder.metadata_path().to_path_buf(),
    })
}

/// Extract and persist one matched pair. Persistence failures are surfaced
/// per record: logged, counted, and the pipeline moves on — an image-write
/// failure records nothing for that detection, a metadata failure leaves
/// the image in place.
fn process_pair(
    pair: &SyncedPair,
    extractor: &Extractor,
    recorder: &mut Recorder,
    stats: &PipelineStats,
) {
    for crop in extractor.extract(pair) {
        match recorder.record(pair.batch_timestamp, &crop) {
            Ok(record) => {
                bump(&stats.crops_written);
                debug!(
                    "crop: frame={} track={} label={} -> {}",
                    pair.resolved_sequence,
                    record.tracking_id,
                    record.label,
                    record.image_path.display()
                );
            }
            Err(e) => {
                error!("record failed: {e}");
                bump(&stats.record_failures);
            }
        }
    }
}
