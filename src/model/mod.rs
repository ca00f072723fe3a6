//! Minimal sequential model graph with forward observers.
//!
//! Nodes are evaluated in insertion order. Every observer bound to a node is
//! called once per execution of that node, synchronously, with the node's
//! input and output, before the next node runs.

pub mod layers;
pub mod loader;
pub mod quant;

pub use layers::{Activation, Conv2d, Embedding, Layer, LayerKind, Linear, RmsNorm};
pub use loader::{load_linear_stack, LoaderConfig};
pub use quant::{QuantConv2d, QuantLinear};

use crate::core::LimError;
use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// Observer callback: `(model, input, output)`.
pub type ForwardHook = dyn Fn(&Model, &Tensor, &Tensor) -> Result<()>;

/// Handle returned by [`Model::register_forward_hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle {
    id: u64,
}

struct Binding {
    id: u64,
    layer: String,
    hook: Rc<ForwardHook>,
}

/// Positional arguments of one forward pass.
#[derive(Debug, Clone)]
pub enum ForwardArgs {
    Single(Tensor),
    /// e.g. `[input_ids, attention_mask]`; the first argument feeds the graph.
    Positional(Vec<Tensor>),
}

impl ForwardArgs {
    pub fn primary(&self) -> Result<&Tensor> {
        match self {
            Self::Single(t) => Ok(t),
            Self::Positional(args) => args.first().context("empty positional forward arguments"),
        }
    }
}

impl From<Tensor> for ForwardArgs {
    fn from(t: Tensor) -> Self {
        Self::Single(t)
    }
}

impl From<Vec<Tensor>> for ForwardArgs {
    fn from(args: Vec<Tensor>) -> Self {
        Self::Positional(args)
    }
}

struct Node {
    name: String,
    layer: Box<dyn Layer>,
}

#[derive(Default)]
pub struct Model {
    embedding: Option<(String, Embedding)>,
    nodes: Vec<Node>,
    bindings: RefCell<Vec<Binding>>,
    next_hook_id: Cell<u64>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node evaluated after every node pushed before it.
    pub fn push(&mut self, name: impl Into<String>, layer: impl Layer + 'static) -> &mut Self {
        self.nodes.push(Node {
            name: name.into(),
            layer: Box::new(layer),
        });
        self
    }

    /// Set the token embedding run ahead of the nodes for integer inputs.
    pub fn set_embedding(&mut self, name: impl Into<String>, embedding: Embedding) -> &mut Self {
        self.embedding = Some((name.into(), embedding));
        self
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    pub fn embedding(&self) -> Option<&Embedding> {
        self.embedding.as_ref().map(|(_, e)| e)
    }

    /// Embedding lookup for token ids.
    pub fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        let (_, emb) = self
            .embedding
            .as_ref()
            .context("model has no token embedding")?;
        emb.forward(ids)
    }

    /// All `(name, layer)` pairs in evaluation order.
    ///
    /// Fails when the graph has no layers or a name is empty or repeated.
    pub fn named_layers(&self) -> Result<Vec<(&str, &dyn Layer)>> {
        let mut out: Vec<(&str, &dyn Layer)> = Vec::with_capacity(self.nodes.len() + 1);
        if let Some((name, emb)) = &self.embedding {
            out.push((name.as_str(), emb as &dyn Layer));
        }
        for node in &self.nodes {
            out.push((node.name.as_str(), node.layer.as_ref()));
        }
        if out.is_empty() {
            return Err(LimError::MalformedModel("model has no layers".into()).into());
        }

        let mut seen = HashSet::with_capacity(out.len());
        for (name, _) in &out {
            if name.is_empty() {
                return Err(LimError::MalformedModel("empty layer name".into()).into());
            }
            if !seen.insert(*name) {
                return Err(
                    LimError::MalformedModel(format!("duplicate layer name {name}")).into(),
                );
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + usize::from(self.embedding.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, name: &str) -> bool {
        self.embedding.as_ref().is_some_and(|(n, _)| n == name)
            || self.nodes.iter().any(|n| n.name == name)
    }

    pub fn forward(&self, args: &ForwardArgs) -> Result<Tensor> {
        let mut xs = args.primary()?.clone();

        if xs.dtype().is_int() {
            let Some((name, emb)) = &self.embedding else {
                let layer = self
                    .nodes
                    .first()
                    .map(|n| n.name.clone())
                    .unwrap_or_default();
                return Err(LimError::MissingEmbedding { layer }.into());
            };
            let ys = emb.forward(&xs)?;
            self.notify(name, &xs, &ys)?;
            xs = ys;
        }

        for node in &self.nodes {
            let ys = node
                .layer
                .forward(&xs)
                .with_context(|| format!("forward failed at {}", node.name))?;
            self.notify(&node.name, &xs, &ys)?;
            xs = ys;
        }
        Ok(xs)
    }

    fn notify(&self, layer: &str, input: &Tensor, output: &Tensor) -> Result<()> {
        // collect first so hooks may register or remove hooks
        let hooks: Vec<Rc<ForwardHook>> = self
            .bindings
            .borrow()
            .iter()
            .filter(|b| b.layer == layer)
            .map(|b| Rc::clone(&b.hook))
            .collect();
        for hook in hooks {
            hook(self, input, output).with_context(|| format!("forward hook failed at {layer}"))?;
        }
        Ok(())
    }

    /// Bind `hook` to the layer called `layer`.
    pub fn register_forward_hook<F>(&self, layer: &str, hook: F) -> Result<HookHandle>
    where
        F: Fn(&Model, &Tensor, &Tensor) -> Result<()> + 'static,
    {
        if !self.contains(layer) {
            bail!("no layer named {layer}");
        }
        let id = self.next_hook_id.get();
        self.next_hook_id.set(id + 1);
        self.bindings.borrow_mut().push(Binding {
            id,
            layer: layer.to_string(),
            hook: Rc::new(hook),
        });
        Ok(HookHandle { id })
    }

    /// Returns `false` if the handle was already removed.
    pub fn remove_hook(&self, handle: HookHandle) -> bool {
        let mut bindings = self.bindings.borrow_mut();
        let before = bindings.len();
        bindings.retain(|b| b.id != handle.id);
        bindings.len() != before
    }

    pub fn active_hooks(&self) -> usize {
        self.bindings.borrow().len()
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        if let Some((name, _)) = &self.embedding {
            list.entry(&(name, LayerKind::Embedding));
        }
        for node in &self.nodes {
            list.entry(&(&node.name, node.layer.kind()));
        }
        list.finish()
    }
}
