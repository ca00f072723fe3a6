//! Typed failure causes carried inside `anyhow::Error`.

/// Errors callers may want to match on with `anyhow::Error::downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum LimError {
    /// The model's layer list cannot be traversed.
    #[error("malformed model: {0}")]
    MalformedModel(String),

    /// A layer received token ids but the model has no embedding table.
    #[error("layer {layer} received integer input but the model has no token embedding")]
    MissingEmbedding { layer: String },

    /// Captured input and output of a layer differ in shape.
    #[error("shape mismatch in {layer}: input {input:?}, output {output:?}")]
    ShapeMismatch {
        layer: String,
        input: Vec<usize>,
        output: Vec<usize>,
    },

    /// A LIM text report line could not be parsed.
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}
