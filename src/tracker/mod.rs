//! LIM tracker: captures layer inputs/outputs through forward observers.

pub mod aggregate;

pub use aggregate::{block_means, top_k, LimAggregator};

use crate::core::{metric, LimError, LimResults};
use crate::model::{HookHandle, LayerKind, Model};
use anyhow::Result;
use candle_core::{Device, Tensor};
use regex::Regex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Which layers get an observer.
#[derive(Debug, Clone)]
pub enum LayerSelector {
    Kinds(Vec<LayerKind>),
    Names(Vec<String>),
    Pattern(Regex),
}

impl Default for LayerSelector {
    fn default() -> Self {
        Self::Kinds(LayerKind::QUANTIZABLE.to_vec())
    }
}

impl LayerSelector {
    fn matches(&self, name: &str, kind: LayerKind) -> bool {
        match self {
            Self::Kinds(kinds) => kinds.contains(&kind),
            Self::Names(names) => names.iter().any(|n| n == name),
            Self::Pattern(re) => re.is_match(name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Where captured tensors are moved. `None` keeps them on the model's device.
    pub capture_device: Option<Device>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capture_device: Some(Device::Cpu),
        }
    }
}

/// Most recent input/output seen by one layer.
#[derive(Debug, Clone, Default)]
pub struct CaptureRecord {
    pub input: Option<Tensor>,
    pub output: Option<Tensor>,
}

type Records = Rc<RefCell<HashMap<String, CaptureRecord>>>;

/// Observes the selected layers of a model and reduces captures to LIM.
///
/// The set of observed layers is fixed at construction. Call
/// [`LimTracker::remove_hooks`] before dropping the tracker: dropping it does
/// not detach its observers, which then stay registered on the model.
pub struct LimTracker<'m> {
    model: &'m Model,
    layers: Vec<String>,
    records: Records,
    handles: Vec<HookHandle>,
}

impl<'m> LimTracker<'m> {
    pub fn new(model: &'m Model, selector: LayerSelector) -> Result<Self> {
        Self::with_config(model, selector, TrackerConfig::default())
    }

    pub fn with_config(
        model: &'m Model,
        selector: LayerSelector,
        config: TrackerConfig,
    ) -> Result<Self> {
        let named = model.named_layers()?;

        if let LayerSelector::Names(wanted) = &selector {
            for w in wanted {
                if !named.iter().any(|(n, _)| *n == w.as_str()) {
                    warn!("requested layer {w} not found in model");
                }
            }
        }

        let records: Records = Rc::new(RefCell::new(HashMap::new()));
        let mut layers = Vec::new();
        let mut handles = Vec::new();
        for (name, layer) in named {
            if !selector.matches(name, layer.kind()) {
                continue;
            }
            records
                .borrow_mut()
                .insert(name.to_string(), CaptureRecord::default());
            let hook = capture_hook(
                name.to_string(),
                Rc::clone(&records),
                config.capture_device.clone(),
            );
            handles.push(model.register_forward_hook(name, hook)?);
            layers.push(name.to_string());
        }
        debug!("attached LIM observers to {} layers", layers.len());

        Ok(Self {
            model,
            layers,
            records,
            handles,
        })
    }

    pub fn model(&self) -> &'m Model {
        self.model
    }

    /// Observed layer names in traversal order.
    pub fn layer_names(&self) -> &[String] {
        &self.layers
    }

    pub fn record(&self, name: &str) -> Option<CaptureRecord> {
        self.records.borrow().get(name).cloned()
    }

    /// Layers with both input and output captured.
    pub fn observed_count(&self) -> usize {
        self.records
            .borrow()
            .values()
            .filter(|r| r.input.is_some() && r.output.is_some())
            .count()
    }

    /// Drop every capture but keep observers attached.
    pub fn clear(&self) {
        for record in self.records.borrow_mut().values_mut() {
            *record = CaptureRecord::default();
        }
    }

    pub fn is_attached(&self) -> bool {
        !self.handles.is_empty()
    }

    /// LIM for every layer with a complete capture, in traversal order.
    ///
    /// Layers with mismatched input/output shapes are skipped with a warning.
    /// A zero-norm input maps to `NaN`.
    pub fn compute_lim(&self) -> Result<LimResults> {
        let records = self.records.borrow();
        let mut results = LimResults::new();
        for name in &self.layers {
            let Some(CaptureRecord {
                input: Some(input),
                output: Some(output),
            }) = records.get(name)
            else {
                continue;
            };
            match metric::lim(name, input, output) {
                Ok(v) => {
                    if v.is_nan() {
                        warn!("zero-norm input in {name}, LIM undefined");
                    }
                    results.insert(name.clone(), v);
                }
                Err(e) => match e.downcast_ref::<LimError>() {
                    Some(LimError::ShapeMismatch { .. }) => warn!("{e}, skipping layer"),
                    _ => return Err(e),
                },
            }
        }
        Ok(results)
    }

    /// Detach every observer. Safe to call more than once.
    pub fn remove_hooks(&mut self) {
        for handle in self.handles.drain(..) {
            self.model.remove_hook(handle);
        }
    }
}

fn capture_hook(
    layer: String,
    records: Records,
    device: Option<Device>,
) -> impl Fn(&Model, &Tensor, &Tensor) -> Result<()> + 'static {
    move |model, input, output| {
        let input = if input.dtype().is_int() {
            if !model.has_embedding() {
                return Err(LimError::MissingEmbedding {
                    layer: layer.clone(),
                }
                .into());
            }
            model.embed(input)?
        } else {
            input.clone()
        };
        let input = snapshot(&input, device.as_ref())?;
        let output = snapshot(output, device.as_ref())?;

        let mut records = records.borrow_mut();
        let record = records.entry(layer.clone()).or_default();
        record.input = Some(input);
        record.output = Some(output);
        Ok(())
    }
}

/// Deep copy cut off from the autograd graph.
fn snapshot(t: &Tensor, device: Option<&Device>) -> Result<Tensor> {
    let t = t.detach().copy()?;
    match device {
        Some(d) => Ok(t.to_device(d)?),
        None => Ok(t),
    }
}
