//! Layer name helpers.

use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;

static BLOCK_INDEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\.)(?:layers|h|blocks)\.(\d+)\.").unwrap());

static CHUNK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+|\D+").unwrap());

/// Transformer block index of a fully qualified layer name, if any.
///
/// `model.layers.15.self_attn.o_proj` -> `Some(15)`.
pub fn layer_index(name: &str) -> Option<u32> {
    BLOCK_INDEX_RE
        .captures(name)
        .and_then(|caps| caps[1].parse().ok())
}

/// Compare names so that numeric runs sort by value (`layers.2` < `layers.10`).
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut xs = CHUNK_RE.find_iter(a).map(|m| m.as_str());
    let mut ys = CHUNK_RE.find_iter(b).map(|m| m.as_str());
    loop {
        match (xs.next(), ys.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny).then_with(|| x.len().cmp(&y.len())),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
