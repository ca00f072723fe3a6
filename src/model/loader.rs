//! Build a sequential linear stack from a safetensors checkpoint.

use super::layers::{Embedding, Linear};
use super::quant::QuantLinear;
use super::Model;
use crate::core::LimError;
use crate::utils::{is_target_weight, natural_cmp, view_to_tensor};
use anyhow::{Context, Result};
use candle_core::quantized::k_quants::QK_K;
use candle_core::Device;
use safetensors::SafeTensors;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Replace block-aligned linears with Q8K layers.
    pub quantize: bool,
    pub skip_patterns: Vec<String>,
    /// Substring identifying the token embedding table.
    pub embedding_pattern: String,
    pub device: Device,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            quantize: false,
            skip_patterns: vec!["norm".to_string(), "lm_head".to_string()],
            embedding_pattern: "embed_tokens".to_string(),
            device: Device::Cpu,
        }
    }
}

/// Load every 2-D `*.weight` tensor (minus skip patterns) as one layer.
///
/// Layers are ordered by name with numeric runs compared by value, and
/// adjacent layers must chain: each layer's input width equals the previous
/// layer's output width. Decoder checkpoints with parallel projections
/// (`q/k/v_proj`, `gate/up_proj`) do not chain and are rejected.
pub fn load_linear_stack(path: &Path, config: &LoaderConfig) -> Result<Model> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let st = SafeTensors::deserialize(&bytes)?;

    let mut names: Vec<&str> = st.names().into_iter().map(String::as_str).collect();
    names.sort_by(|a, b| natural_cmp(a, b));

    let mut model = Model::new();
    let mut width: Option<(String, usize)> = None;

    if let Some(name) = names
        .iter()
        .find(|n| n.contains(&config.embedding_pattern) && n.ends_with(".weight"))
    {
        let table = view_to_tensor(&st.tensor(name)?, &config.device)?;
        let embedding = Embedding::new(table).with_context(|| format!("loading {name}"))?;
        let layer_name = name.trim_end_matches(".weight");
        width = Some((layer_name.to_string(), embedding.hidden_size()));
        model.set_embedding(layer_name, embedding);
    }

    let mut quantized = 0usize;
    for name in names {
        if name.contains(&config.embedding_pattern) {
            continue;
        }
        let view = st.tensor(name)?;
        if view.shape().len() != 2 || !is_target_weight(name, &config.skip_patterns) {
            debug!("skip {name} {:?}", view.shape());
            continue;
        }

        let layer_name = name.trim_end_matches(".weight");
        let weight = view_to_tensor(&view, &config.device)?;
        let bias = match st.tensor(&format!("{layer_name}.bias")) {
            Ok(b) => Some(view_to_tensor(&b, &config.device)?),
            Err(_) => None,
        };
        let linear = Linear::new(weight, bias).with_context(|| format!("loading {name}"))?;

        if let Some((prev, out)) = &width {
            if *out != linear.in_features() {
                return Err(LimError::MalformedModel(format!(
                    "{layer_name} expects {} inputs but {prev} produces {out}",
                    linear.in_features()
                ))
                .into());
            }
        }
        width = Some((layer_name.to_string(), linear.out_features()));

        let (rows, k) = (linear.out_features(), linear.in_features());
        if config.quantize && k > 0 && k % QK_K == 0 {
            debug!("quantizing {layer_name} ({rows} x {k})");
            model.push(layer_name, QuantLinear::from_linear(&linear)?);
            quantized += 1;
        } else {
            if config.quantize {
                info!("keeping dense (k % {QK_K} != 0): {layer_name} [{rows} x {k}]");
            }
            model.push(layer_name, linear);
        }
    }

    info!(
        "loaded {} layers from {} ({} quantized)",
        model.len(),
        path.display(),
        quantized
    );
    Ok(model)
}
