//! Averaging LIM across calibration batches and ranking layers.

use crate::core::LimResults;
use crate::utils::layer_index;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Per-layer LIM history owned by the caller.
#[derive(Debug, Clone, Default)]
pub struct LimAggregator {
    order: Vec<String>,
    samples: HashMap<String, Vec<f64>>,
}

impl LimAggregator {
    /// `order` fixes the report order, usually `tracker.layer_names()`.
    pub fn new<I, S>(order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            order: order.into_iter().map(Into::into).collect(),
            samples: HashMap::new(),
        }
    }

    pub fn record(&mut self, results: &LimResults) {
        for (name, value) in results.iter() {
            if !self.samples.contains_key(name) && !self.order.iter().any(|n| n == name) {
                self.order.push(name.to_string());
            }
            self.samples.entry(name.to_string()).or_default().push(value);
        }
    }

    pub fn samples(&self, name: &str) -> Option<&[f64]> {
        self.samples.get(name).map(Vec::as_slice)
    }

    pub fn sample_counts(&self) -> Vec<(String, usize)> {
        self.order
            .iter()
            .filter_map(|n| self.samples.get(n).map(|v| (n.clone(), v.len())))
            .collect()
    }

    /// Mean per layer. NaN samples are left out; all-NaN layers stay NaN.
    pub fn means(&self) -> LimResults {
        let mut out = LimResults::new();
        for name in &self.order {
            let Some(values) = self.samples.get(name) else {
                continue;
            };
            let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
            let mean = if finite.is_empty() {
                f64::NAN
            } else {
                finite.iter().sum::<f64>() / finite.len() as f64
            };
            out.insert(name.clone(), mean);
        }
        out
    }

    pub fn top_k(&self, k: usize) -> Vec<(String, f64)> {
        top_k(&self.means(), k)
    }
}

/// Highest LIM first; ties keep traversal order and NaN goes last.
pub fn top_k(results: &LimResults, k: usize) -> Vec<(String, f64)> {
    let mut ranked: Vec<(usize, &str, f64)> = results
        .iter()
        .enumerate()
        .map(|(i, (name, v))| (i, name, v))
        .collect();
    ranked.sort_by(|a, b| descending(a.2, b.2).then(a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(k)
        .map(|(_, name, v)| (name.to_string(), v))
        .collect()
}

fn descending(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

/// Mean finite LIM per transformer block, by block index.
pub fn block_means(results: &LimResults) -> Vec<(u32, f64)> {
    let mut sums: HashMap<u32, (f64, usize)> = HashMap::new();
    for (name, v) in results.iter() {
        if v.is_nan() {
            continue;
        }
        if let Some(idx) = layer_index(name) {
            let slot = sums.entry(idx).or_insert((0.0, 0));
            slot.0 += v;
            slot.1 += 1;
        }
    }
    let mut out: Vec<(u32, f64)> = sums
        .into_iter()
        .map(|(idx, (sum, n))| (idx, sum / n as f64))
        .collect();
    out.sort_by_key(|(idx, _)| *idx);
    out
}
