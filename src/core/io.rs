//! LIM report export/import and calibration batch loading.

use super::{error::LimError, LimResults};
use crate::model::ForwardArgs;
use crate::utils::{natural_cmp, view_to_tensor};
use anyhow::{Context, Result};
use candle_core::Device;
use safetensors::SafeTensors;
use std::fmt::Write as _;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One `name: value` record per line, in traversal order.
pub fn write_lim_text(path: &Path, results: &LimResults) -> Result<()> {
    let mut w = BufWriter::new(
        fs::File::create(path).with_context(|| format!("creating {}", path.display()))?,
    );
    for (name, value) in results.iter() {
        writeln!(w, "{name}: {value}")?;
    }
    w.flush()?;
    Ok(())
}

pub fn read_lim_text(path: &Path) -> Result<LimResults> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut results = LimResults::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parse_err = |message: String| LimError::Parse {
            line: i + 1,
            message,
        };
        let (name, value) = line
            .rsplit_once(':')
            .ok_or_else(|| parse_err(format!("expected `name: value`, got {line:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(parse_err("empty layer name".into()).into());
        }
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|e| parse_err(format!("bad value for {name}: {e}")))?;
        results.insert(name, value);
    }
    Ok(results)
}

/// Pretty JSON object; NaN is written as `null`.
pub fn write_lim_json(path: &Path, results: &LimResults) -> Result<()> {
    let mut map = serde_json::Map::with_capacity(results.len());
    for (name, value) in results.iter() {
        map.insert(name.to_string(), serde_json::Value::from(value));
    }
    let w = BufWriter::new(
        fs::File::create(path).with_context(|| format!("creating {}", path.display()))?,
    );
    serde_json::to_writer_pretty(w, &serde_json::Value::Object(map))?;
    Ok(())
}

/// Each tensor of a safetensors file, ordered by name, is one batch.
pub fn load_calibration_batches(path: &Path, device: &Device) -> Result<Vec<ForwardArgs>> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let st = SafeTensors::deserialize(&bytes)?;
    let mut names: Vec<&str> = st.names().into_iter().map(String::as_str).collect();
    names.sort_by(|a, b| natural_cmp(a, b));

    names
        .into_iter()
        .map(|name| -> Result<ForwardArgs> {
            let t = view_to_tensor(&st.tensor(name)?, device)
                .with_context(|| format!("loading batch {name}"))?;
            Ok(ForwardArgs::Single(t))
        })
        .collect()
}

/// Console listing of a top-K report.
pub fn format_top_k(ranked: &[(String, f64)]) -> String {
    let mut out = String::new();
    for (name, value) in ranked {
        let _ = writeln!(out, "{name}: {value:.4}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_report_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lim.txt");
        let mut r = LimResults::new();
        r.insert("model.layers.0.self_attn.q_proj", 0.125);
        r.insert("model.layers.0.mlp.down_proj", f64::NAN);
        write_lim_text(&path, &r).unwrap();

        let back = read_lim_text(&path).unwrap();
        let names: Vec<&str> = back.names().collect();
        assert_eq!(
            names,
            vec!["model.layers.0.self_attn.q_proj", "model.layers.0.mlp.down_proj"]
        );
        assert_eq!(back.get("model.layers.0.self_attn.q_proj"), Some(0.125));
        assert!(back.get("model.layers.0.mlp.down_proj").unwrap().is_nan());
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# header").unwrap();
        writeln!(f, "a: 0.5").unwrap();
        writeln!(f, "b 0.7").unwrap();
        let err = read_lim_text(f.path()).unwrap_err();
        match err.downcast_ref::<LimError>() {
            Some(LimError::Parse { line, .. }) => assert_eq!(*line, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn json_writes_nan_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lim.json");
        let mut r = LimResults::new();
        r.insert("b", 0.5);
        r.insert("a", f64::NAN);
        write_lim_json(&path, &r).unwrap();
        let v: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["b"], serde_json::json!(0.5));
        assert!(v["a"].is_null());
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn top_k_formatting() {
        let s = format_top_k(&[("o_proj".into(), 0.14213), ("down_proj".into(), 0.1317)]);
        assert_eq!(s, "o_proj: 0.1421\ndown_proj: 0.1317\n");
    }
}
