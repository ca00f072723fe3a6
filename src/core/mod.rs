//! Core LIM types and functionality.

pub mod calibrate;
pub mod error;
pub mod io;
pub mod metric;

pub use calibrate::run_calibration;
pub use error::LimError;
pub use io::{
    format_top_k, load_calibration_batches, read_lim_text, write_lim_json, write_lim_text,
};
pub use metric::{l2_norm, lim};

/// How per-batch captures are turned into one value per layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    /// Reduce once after the last batch; each layer reflects that batch only.
    LastBatch,
    /// Reduce after every batch and average across the calibration set.
    #[default]
    Averaged,
}

/// Layer name to LIM value, in model traversal order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimResults {
    entries: Vec<(String, f64)>,
}

impl LimResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the value for `name`, keeping its first position.
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }
}

impl FromIterator<(String, f64)> for LimResults {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        let mut out = Self::new();
        for (name, value) in iter {
            out.insert(name, value);
        }
        out
    }
}

#[derive(Debug)]
pub struct LimRun {
    pub results: LimResults,
    pub batches: usize,
    /// Number of LIM samples each layer contributed, keyed like `results`.
    pub samples_per_layer: Vec<(String, usize)>,
    pub total_time_seconds: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_first_position() {
        let mut r = LimResults::new();
        r.insert("a", 1.0);
        r.insert("b", 2.0);
        r.insert("a", 3.0);
        let got: Vec<_> = r.iter().collect();
        assert_eq!(got, vec![("a", 3.0), ("b", 2.0)]);
        assert!(!r.contains("c"));
    }
}
