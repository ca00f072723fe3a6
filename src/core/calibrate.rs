//! Calibration loop driving forward passes through an instrumented model.

use super::{CaptureMode, LimRun};
use crate::model::ForwardArgs;
use crate::tracker::{LimAggregator, LimTracker};
use anyhow::{Context, Result};
use std::time::Instant;
use tracing::{debug, info};

/// Run every batch through the tracker's model and reduce to one LIM per layer.
///
/// Captures are cleared before each batch, so a layer's value only ever
/// reflects batches that actually executed it. Observers stay attached; the
/// caller detaches them with [`LimTracker::remove_hooks`].
pub fn run_calibration(
    tracker: &LimTracker<'_>,
    batches: &[ForwardArgs],
    mode: CaptureMode,
) -> Result<LimRun> {
    let start_time = Instant::now();
    let model = tracker.model();
    let mut aggregator = LimAggregator::new(tracker.layer_names().iter().cloned());

    for (i, batch) in batches.iter().enumerate() {
        tracker.clear();
        model
            .forward(batch)
            .with_context(|| format!("forward pass failed on batch {i}"))?;
        if mode == CaptureMode::Averaged {
            aggregator.record(&tracker.compute_lim()?);
        }
        debug!("calibration batch {}/{}", i + 1, batches.len());
    }

    let (results, samples_per_layer) = match mode {
        CaptureMode::LastBatch => {
            let results = tracker.compute_lim()?;
            let counts = results.names().map(|n| (n.to_string(), 1)).collect();
            (results, counts)
        }
        CaptureMode::Averaged => (aggregator.means(), aggregator.sample_counts()),
    };

    let total_time_seconds = start_time.elapsed().as_secs_f32();
    info!(
        "calibration done: {} batches, {} layers with LIM, {:.2}s",
        batches.len(),
        results.len(),
        total_time_seconds
    );

    Ok(LimRun {
        results,
        batches: batches.len(),
        samples_per_layer,
        total_time_seconds,
    })
}
