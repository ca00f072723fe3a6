//! CLI: per-layer LIM report for a safetensors checkpoint.
//!
//! The checkpoint must be a sequential stack: each 2-D weight, in name order,
//! consumes the previous one's output. Full decoder checkpoints (attention
//! and gated MLP projections side by side) are rejected by the loader.

use anyhow::{Context, Result};
use lim_tracker::{
    block_means, format_top_k, measure_lim_from_files, top_k, write_lim_json, write_lim_text,
    CaptureMode, LayerSelector, LoaderConfig,
};
use regex::Regex;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: lim_report <weights.safetensors> <calib.safetensors> [output.txt]\n\
    weights must form a chained linear stack (no parallel q/k/v or gate/up projections)";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // Parse arguments
    let mut args = std::env::args().skip(1);
    let weights: PathBuf = args.next().context(USAGE)?.into();
    let calib: PathBuf = args.next().context(USAGE)?.into();
    let out_file: PathBuf = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("lim_results.txt"));

    // Configuration from environment
    let quantize = std::env::var("LIM_QUANTIZE")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let mode_name = std::env::var("LIM_MODE").unwrap_or_else(|_| "avg".to_string());
    let mode = match mode_name.as_str() {
        "last" => CaptureMode::LastBatch,
        _ => CaptureMode::Averaged,
    };

    let k: usize = match std::env::var("LIM_TOP_K") {
        Ok(v) => v.parse().with_context(|| format!("LIM_TOP_K={v} is not a number"))?,
        Err(_) => 5,
    };

    let selector = match std::env::var("LIM_LAYER_PATTERN") {
        Ok(p) => LayerSelector::Pattern(
            Regex::new(&p).with_context(|| format!("invalid LIM_LAYER_PATTERN {p:?}"))?,
        ),
        Err(_) => LayerSelector::default(),
    };

    let loader = LoaderConfig {
        quantize,
        ..Default::default()
    };

    println!("Weights : {}", weights.display());
    println!("Calib   : {}", calib.display());
    println!("Quantize: {}", if quantize { "on" } else { "off" });
    println!("Mode    : {:?}", mode);

    let run = measure_lim_from_files(&weights, &calib, &loader, selector, mode)?;

    println!(
        "Done in {:.2}s. Batches: {}, layers: {}",
        run.total_time_seconds,
        run.batches,
        run.results.len()
    );

    println!("\nTop-{k} layers by LIM:");
    print!("{}", format_top_k(&top_k(&run.results, k)));

    let blocks = block_means(&run.results);
    if !blocks.is_empty() {
        println!("\nMean LIM per block:");
        for (idx, mean) in blocks {
            println!("  block {idx:>3}: {mean:.4}");
        }
    }

    write_lim_text(&out_file, &run.results)?;
    let json_file = out_file.with_extension("json");
    write_lim_json(&json_file, &run.results)?;
    println!(
        "\nWrote {} and {}",
        out_file.display(),
        json_file.display()
    );

    Ok(())
}
