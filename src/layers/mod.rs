//! Typed module tree of a base model.
//!
//! A base model exposes its weight-bearing submodules as a [`Container`] of
//! named [`Module`]s. Injection replaces leaves in place with adapter
//! wrappers, so the tree is the only place forward passes read layers from.

pub mod attention;

use std::fmt;

use candle_core::{Module as _, Tensor};
use candle_nn::{Conv2d, Embedding, Linear};

use crate::error::{PeftError, Result};
use crate::tuner::layer::TunerLayer;
use crate::tuner::modules_to_save::ModulesToSaveWrapper;

pub use attention::{Attention, KeyValue};

/// Per-call state threaded through every module's forward pass.
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    /// Dropout is only applied while training.
    pub training: bool,
    /// Optional adapter name per batch row (`__base__` for none).
    pub adapter_names: Option<Vec<String>>,
}

impl ForwardContext {
    /// Context for evaluation without per-sample routing.
    #[must_use]
    pub fn eval() -> Self {
        Self::default()
    }

    /// Context with a per-sample adapter routing list.
    #[must_use]
    pub fn with_adapter_names(mut self, names: Vec<String>) -> Self {
        self.adapter_names = Some(names);
        self
    }
}

/// Kind of a node in the module tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Linear projection.
    Linear,
    /// Lookup table.
    Embedding,
    /// 2D convolution.
    Conv2d,
    /// Multi-head self-attention.
    Attention,
    /// Named children.
    Container,
    /// Adapter-carrying wrapper.
    Adapted,
    /// Per-adapter trainable copy of a module.
    ModulesToSave,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linear => "Linear",
            Self::Embedding => "Embedding",
            Self::Conv2d => "Conv2d",
            Self::Attention => "Attention",
            Self::Container => "Container",
            Self::Adapted => "TunerLayer",
            Self::ModulesToSave => "ModulesToSaveWrapper",
        };
        f.write_str(name)
    }
}

/// The modules an adapter wrapper can sit in front of.
#[derive(Debug, Clone)]
pub enum BaseLayer {
    /// `y = x Wᵀ + b`, weight `[out, in]`.
    Linear(Linear),
    /// Row lookup, weight `[vocab, dim]`.
    Embedding(Embedding),
    /// Convolution, weight `[out, in, kh, kw]`.
    Conv2d(Conv2d),
    /// Self-attention with its own projection children.
    Attention(Box<Attention>),
}

impl BaseLayer {
    /// Kind of the wrapped module.
    #[must_use]
    pub fn kind(&self) -> ModuleKind {
        match self {
            Self::Linear(_) => ModuleKind::Linear,
            Self::Embedding(_) => ModuleKind::Embedding,
            Self::Conv2d(_) => ModuleKind::Conv2d,
            Self::Attention(_) => ModuleKind::Attention,
        }
    }

    /// The weight merges operate on; attention has none of its own.
    #[must_use]
    pub fn weight(&self) -> Option<&Tensor> {
        match self {
            Self::Linear(l) => Some(l.weight()),
            Self::Embedding(e) => Some(e.embeddings()),
            Self::Conv2d(c) => Some(c.weight()),
            Self::Attention(_) => None,
        }
    }

    /// Bias of the wrapped module, if any.
    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        match self {
            Self::Linear(l) => l.bias(),
            Self::Conv2d(c) => c.bias(),
            Self::Embedding(_) | Self::Attention(_) => None,
        }
    }

    /// Rebuild the layer around a new weight, keeping bias and geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape changes or the layer has no weight.
    pub fn with_weight(&self, weight: Tensor) -> Result<Self> {
        self.with_parameters(weight, self.bias().cloned())
    }

    /// Rebuild the layer around a new weight and bias, keeping geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape changes or the layer has no weight.
    pub fn with_parameters(&self, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let current = match self {
            Self::Linear(l) => l.weight(),
            Self::Embedding(e) => e.embeddings(),
            Self::Conv2d(c) => c.weight(),
            Self::Attention(_) => {
                return Err(PeftError::InvalidConfig(
                    "attention modules carry no single weight".into(),
                ))
            }
        };
        if current.dims() != weight.dims() {
            return Err(PeftError::ShapeMismatch {
                expected: current.dims().to_vec(),
                actual: weight.dims().to_vec(),
            });
        }
        Ok(match self {
            Self::Linear(_) => Self::Linear(Linear::new(weight, bias)),
            Self::Embedding(_) => {
                let dim = weight.dim(1)?;
                Self::Embedding(Embedding::new(weight, dim))
            }
            Self::Conv2d(c) => Self::Conv2d(Conv2d::new(weight, bias, *c.config())),
            Self::Attention(a) => Self::Attention(a.clone()),
        })
    }

    /// Plain forward pass of the wrapped module.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying tensor operations fail.
    pub fn forward(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        match self {
            Self::Linear(l) => Ok(l.forward(x)?),
            Self::Embedding(e) => Ok(e.forward(x)?),
            Self::Conv2d(c) => Ok(c.forward(x)?),
            Self::Attention(a) => a.forward(x, None, None, ctx),
        }
    }

    /// Turn the layer back into a plain tree node.
    #[must_use]
    pub fn into_module(self) -> Module {
        match self {
            Self::Linear(l) => Module::Linear(l),
            Self::Embedding(e) => Module::Embedding(e),
            Self::Conv2d(c) => Module::Conv2d(c),
            Self::Attention(a) => Module::Attention(a),
        }
    }

    pub(crate) fn named_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        if let Self::Attention(a) = self {
            a.named_parameters(prefix, out);
            return;
        }
        if let Some(w) = self.weight() {
            out.push(NamedParameter::new(join(prefix, "weight"), w, ParamRole::Weight));
        }
        if let Some(b) = self.bias() {
            out.push(NamedParameter::new(join(prefix, "bias"), b, ParamRole::Bias));
        }
    }
}

/// What a parameter belongs to, used for freezing and for adapter state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRole {
    /// Frozen base weight.
    Weight,
    /// Base bias; trainable depending on the bias policy.
    Bias,
    /// Bias of a module that carries adapters.
    AdaptedBias,
    /// Adapter parameter.
    Adapter {
        /// Owning adapter
        adapter: String,
        /// Whether the adapter is currently trainable
        trainable: bool,
    },
    /// Trainable copy kept for an adapter.
    ModulesToSave {
        /// Owning adapter
        adapter: String,
        /// Whether the copy is currently trainable
        trainable: bool,
    },
}

/// A parameter together with its qualified name.
#[derive(Debug, Clone)]
pub struct NamedParameter {
    /// Qualified name.
    pub name: String,
    /// Value.
    pub tensor: Tensor,
    /// Ownership.
    pub role: ParamRole,
}

impl NamedParameter {
    pub(crate) fn new(name: String, tensor: &Tensor, role: ParamRole) -> Self {
        Self {
            name,
            tensor: tensor.clone(),
            role,
        }
    }
}

/// A node of the module tree.
#[derive(Debug, Clone)]
pub enum Module {
    /// Linear projection.
    Linear(Linear),
    /// Lookup table.
    Embedding(Embedding),
    /// 2D convolution.
    Conv2d(Conv2d),
    /// Self-attention.
    Attention(Box<Attention>),
    /// Named children, run in order when called directly.
    Container(Container),
    /// Adapter wrapper around a base layer.
    Adapted(Box<TunerLayer>),
    /// Per-adapter trainable copies of a module.
    ModulesToSave(Box<ModulesToSaveWrapper>),
}

impl Default for Module {
    fn default() -> Self {
        Self::Container(Container::default())
    }
}

impl From<Linear> for Module {
    fn from(l: Linear) -> Self {
        Self::Linear(l)
    }
}

impl From<Embedding> for Module {
    fn from(e: Embedding) -> Self {
        Self::Embedding(e)
    }
}

impl From<Conv2d> for Module {
    fn from(c: Conv2d) -> Self {
        Self::Conv2d(c)
    }
}

impl From<Attention> for Module {
    fn from(a: Attention) -> Self {
        Self::Attention(Box::new(a))
    }
}

impl From<Container> for Module {
    fn from(c: Container) -> Self {
        Self::Container(c)
    }
}

impl Module {
    /// Kind of this node.
    #[must_use]
    pub fn kind(&self) -> ModuleKind {
        match self {
            Self::Linear(_) => ModuleKind::Linear,
            Self::Embedding(_) => ModuleKind::Embedding,
            Self::Conv2d(_) => ModuleKind::Conv2d,
            Self::Attention(_) => ModuleKind::Attention,
            Self::Container(_) => ModuleKind::Container,
            Self::Adapted(_) => ModuleKind::Adapted,
            Self::ModulesToSave(_) => ModuleKind::ModulesToSave,
        }
    }

    /// Kind of the layer computing this node, looking through wrappers.
    #[must_use]
    pub fn layer_kind(&self) -> ModuleKind {
        match self {
            Self::Adapted(t) => t.base_layer().kind(),
            Self::ModulesToSave(m) => m.original().kind(),
            other => other.kind(),
        }
    }

    /// Detach a wrappable layer, handing non-wrappable nodes back unchanged.
    ///
    /// # Errors
    ///
    /// Returns the module itself if it cannot carry adapters.
    pub fn into_base_layer(self) -> std::result::Result<BaseLayer, Self> {
        match self {
            Self::Linear(l) => Ok(BaseLayer::Linear(l)),
            Self::Embedding(e) => Ok(BaseLayer::Embedding(e)),
            Self::Conv2d(c) => Ok(BaseLayer::Conv2d(c)),
            Self::Attention(a) => Ok(BaseLayer::Attention(a)),
            other => Err(other),
        }
    }

    /// Adapter wrapper, if this node is one.
    #[must_use]
    pub fn as_tuner_layer(&self) -> Option<&TunerLayer> {
        match self {
            Self::Adapted(t) => Some(t),
            _ => None,
        }
    }

    /// Mutable adapter wrapper, if this node is one.
    pub fn as_tuner_layer_mut(&mut self) -> Option<&mut TunerLayer> {
        match self {
            Self::Adapted(t) => Some(t),
            _ => None,
        }
    }

    /// Direct child by single-segment name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Module> {
        match self {
            Self::Container(c) => c.child(name),
            Self::Attention(a) => a.child(name),
            Self::Adapted(t) => match t.base_layer() {
                BaseLayer::Attention(a) => a.child(name),
                _ => None,
            },
            _ => None,
        }
    }

    /// Mutable direct child by single-segment name.
    pub fn child_mut(&mut self, name: &str) -> Option<&mut Module> {
        match self {
            Self::Container(c) => c.child_mut(name),
            Self::Attention(a) => a.child_mut(name),
            Self::Adapted(t) => match t.base_layer_mut() {
                BaseLayer::Attention(a) => a.child_mut(name),
                _ => None,
            },
            _ => None,
        }
    }

    fn children(&self) -> Vec<(&str, &Module)> {
        match self {
            Self::Container(c) => c.iter().collect(),
            Self::Attention(a) => a.children(),
            Self::Adapted(t) => match t.base_layer() {
                BaseLayer::Attention(a) => a.children(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn walk<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Module)>) {
        for (name, child) in self.children() {
            let path = join(prefix, name);
            out.push((path.clone(), child));
            child.walk(&path, out);
        }
    }

    /// Every parameter below this node, with qualified names.
    #[must_use]
    pub fn named_parameters(&self, prefix: &str) -> Vec<NamedParameter> {
        let mut out = Vec::new();
        self.collect_parameters(prefix, &mut out);
        out
    }

    pub(crate) fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        match self {
            Self::Linear(l) => {
                out.push(NamedParameter::new(join(prefix, "weight"), l.weight(), ParamRole::Weight));
                if let Some(b) = l.bias() {
                    out.push(NamedParameter::new(join(prefix, "bias"), b, ParamRole::Bias));
                }
            }
            Self::Embedding(e) => {
                out.push(NamedParameter::new(
                    join(prefix, "weight"),
                    e.embeddings(),
                    ParamRole::Weight,
                ));
            }
            Self::Conv2d(c) => {
                out.push(NamedParameter::new(join(prefix, "weight"), c.weight(), ParamRole::Weight));
                if let Some(b) = c.bias() {
                    out.push(NamedParameter::new(join(prefix, "bias"), b, ParamRole::Bias));
                }
            }
            Self::Attention(a) => a.named_parameters(prefix, out),
            Self::Container(c) => {
                for (name, child) in c.iter() {
                    child.collect_parameters(&join(prefix, name), out);
                }
            }
            Self::Adapted(t) => {
                let start = out.len();
                t.base_layer().named_parameters(prefix, out);
                for p in &mut out[start..] {
                    if p.role == ParamRole::Bias && !matches!(t.base_layer(), BaseLayer::Attention(_)) {
                        p.role = ParamRole::AdaptedBias;
                    }
                }
                t.adapter_parameters(prefix, out);
            }
            Self::ModulesToSave(m) => m.collect_parameters(prefix, out),
        }
    }

    /// Forward pass of this node.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying tensor operations fail.
    pub fn forward(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        match self {
            Self::Linear(l) => Ok(l.forward(x)?),
            Self::Embedding(e) => Ok(e.forward(x)?),
            Self::Conv2d(c) => Ok(c.forward(x)?),
            Self::Attention(a) => a.forward(x, None, None, ctx),
            Self::Container(c) => c.forward(x, ctx),
            Self::Adapted(t) => t.forward(x, ctx),
            Self::ModulesToSave(m) => m.forward(x, ctx),
        }
    }

    /// Self-attention forward with optional cached keys/values and mask.
    ///
    /// # Errors
    ///
    /// Returns an error if this node is not an attention module.
    pub fn forward_attention(
        &self,
        x: &Tensor,
        past: Option<&KeyValue>,
        mask: Option<&Tensor>,
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        match self {
            Self::Attention(a) => a.forward(x, past, mask, ctx),
            Self::Adapted(t) => t.forward_attention(x, past, mask, ctx),
            other => Err(PeftError::InvalidConfig(format!(
                "{} is not an attention module",
                other.kind()
            ))),
        }
    }
}

/// Ordered named children.
#[derive(Debug, Clone, Default)]
pub struct Container {
    children: Vec<(String, Module)>,
}

impl Container {
    /// Create an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style child insertion.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, module: impl Into<Module>) -> Self {
        self.push(name, module);
        self
    }

    /// Append a child.
    pub fn push(&mut self, name: impl Into<String>, module: impl Into<Module>) {
        self.children.push((name.into(), module.into()));
    }

    /// Iterate over direct children.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.children.iter().map(|(n, m)| (n.as_str(), m))
    }

    /// Number of direct children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the container has no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn child(&self, name: &str) -> Option<&Module> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, m)| m)
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.children
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }

    /// Module at a dotted path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Module> {
        let mut segments = path.split('.');
        let mut current = self.child(segments.next()?)?;
        for segment in segments {
            current = current.child(segment)?;
        }
        Some(current)
    }

    /// Mutable module at a dotted path.
    pub fn get_mut(&mut self, path: &str) -> Option<&mut Module> {
        let mut segments = path.split('.');
        let mut current = self.child_mut(segments.next()?)?;
        for segment in segments {
            current = current.child_mut(segment)?;
        }
        Some(current)
    }

    /// Module at a dotted path, or a lookup error.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::ModuleNotFound`] if the path does not exist.
    pub fn module(&self, path: &str) -> Result<&Module> {
        self.get(path).ok_or_else(|| PeftError::ModuleNotFound {
            path: path.to_string(),
        })
    }

    /// Every module below the root in depth-first order, with dotted names.
    #[must_use]
    pub fn named_modules(&self) -> Vec<(String, &Module)> {
        let mut out = Vec::new();
        for (name, child) in self.iter() {
            out.push((name.to_string(), child));
            child.walk(name, &mut out);
        }
        out
    }

    /// Every parameter of the tree.
    #[must_use]
    pub fn named_parameters(&self) -> Vec<NamedParameter> {
        let mut out = Vec::new();
        for (name, child) in self.iter() {
            child.collect_parameters(name, &mut out);
        }
        out
    }

    /// Run the children in order.
    ///
    /// # Errors
    ///
    /// Returns an error if any child fails.
    pub fn forward(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        let mut h = x.clone();
        for (_, child) in &self.children {
            h = child.forward(&h, ctx)?;
        }
        Ok(h)
    }
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn linear(i: usize, o: usize) -> Linear {
        Linear::new(
            Tensor::ones((o, i), DType::F32, &Device::Cpu).unwrap(),
            None,
        )
    }

    #[test]
    fn test_container_paths() {
        let root = Container::new()
            .with("encoder", Container::new().with("proj", linear(4, 4)))
            .with("head", linear(4, 2));

        let names: Vec<String> = root.named_modules().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["encoder", "encoder.proj", "head"]);
        assert_eq!(root.module("encoder.proj").unwrap().kind(), ModuleKind::Linear);
        assert!(root.get("encoder.missing").is_none());
    }

    #[test]
    fn test_sequential_forward_shape() -> Result<()> {
        let root = Container::new().with("a", linear(4, 8)).with("b", linear(8, 2));
        let x = Tensor::ones((3, 4), DType::F32, &Device::Cpu)?;
        let y = root.forward(&x, &ForwardContext::eval())?;
        assert_eq!(y.dims(), &[3, 2]);
        // every weight is one: 4 -> 4.0 per unit, then 8 * 4.0
        assert_eq!(y.to_vec2::<f32>()?[0], vec![32.0, 32.0]);
        Ok(())
    }

    #[test]
    fn test_with_weight_rejects_shape_change() {
        let layer = BaseLayer::Linear(linear(4, 4));
        let bad = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            layer.with_weight(bad),
            Err(PeftError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_named_parameters_roles() {
        let root = Container::new().with(
            "proj",
            Linear::new(
                Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(),
                Some(Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap()),
            ),
        );
        let params = root.named_parameters();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "proj.weight");
        assert_eq!(params[1].role, ParamRole::Bias);
    }
}
