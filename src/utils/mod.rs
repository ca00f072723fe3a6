//! Utility functions shared by the loader and the reports.

pub mod naming;
pub mod tensor_ops;

pub use naming::{layer_index, natural_cmp};
pub use tensor_ops::{tensor_to_f32, view_to_tensor};

pub fn is_target_weight(name: &str, skip_patterns: &[String]) -> bool {
    if !name.ends_with(".weight") {
        return false;
    }
    !skip_patterns.iter().any(|pattern| name.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_patterns_and_non_weights() {
        let skip = vec!["norm".to_string()];
        assert!(is_target_weight("model.layers.0.mlp.up_proj.weight", &skip));
        assert!(!is_target_weight("model.layers.0.mlp.up_proj.bias", &skip));
        assert!(!is_target_weight("model.layers.0.input_layernorm.weight", &skip));
    }
}
