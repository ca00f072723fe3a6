//! Layer input-output mismatch (LIM) diagnostics for quantized models.

pub mod core;
pub mod model;
pub mod tracker;
pub mod utils;

// Re-export commonly used types
pub use self::core::{
    format_top_k, read_lim_text, run_calibration, write_lim_json, write_lim_text, CaptureMode,
    LimError, LimResults, LimRun,
};

pub use model::{
    load_linear_stack, ForwardArgs, HookHandle, Layer, LayerKind, LoaderConfig, Model,
};

pub use tracker::{
    block_means, top_k, CaptureRecord, LayerSelector, LimAggregator, LimTracker, TrackerConfig,
};

use anyhow::Result;
use std::path::Path;

/// Attach observers, run the calibration set and detach again.
pub fn measure_lim(
    model: &Model,
    batches: &[ForwardArgs],
    selector: LayerSelector,
    mode: CaptureMode,
) -> Result<LimRun> {
    let mut tracker = LimTracker::new(model, selector)?;
    let run = run_calibration(&tracker, batches, mode);
    tracker.remove_hooks();
    run
}

/// Load a checkpoint and calibration file, then measure LIM.
pub fn measure_lim_from_files(
    weights: &Path,
    calibration: &Path,
    loader: &LoaderConfig,
    selector: LayerSelector,
    mode: CaptureMode,
) -> Result<LimRun> {
    let model = load_linear_stack(weights, loader)?;
    let batches = self::core::load_calibration_batches(calibration, &loader.device)?;
    measure_lim(&model, &batches, selector, mode)
}
