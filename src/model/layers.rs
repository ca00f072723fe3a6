//! Layer kinds and the dense layers a model graph is built from.

use anyhow::{bail, Result};
use candle_core::{Tensor, D};
use std::fmt;

/// Runtime kind of a graph node, used for observer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Embedding,
    Linear,
    Conv2d,
    /// Linear layer whose weights went through a quantization tool.
    QuantLinear,
    /// Conv2d layer whose kernel went through a quantization tool.
    QuantConv2d,
    Norm,
    Activation,
    Other,
}

impl LayerKind {
    /// Kinds a quantizer touches; the default observer selection.
    pub const QUANTIZABLE: [LayerKind; 4] = [
        LayerKind::Linear,
        LayerKind::Conv2d,
        LayerKind::QuantLinear,
        LayerKind::QuantConv2d,
    ];

    pub fn is_quantized(self) -> bool {
        matches!(self, LayerKind::QuantLinear | LayerKind::QuantConv2d)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Embedding => "Embedding",
            Self::Linear => "Linear",
            Self::Conv2d => "Conv2d",
            Self::QuantLinear => "QuantLinear",
            Self::QuantConv2d => "QuantConv2d",
            Self::Norm => "Norm",
            Self::Activation => "Activation",
            Self::Other => "Other",
        };
        f.write_str(s)
    }
}

pub trait Layer {
    /// Kind reported to observer selection
    fn kind(&self) -> LayerKind;

    /// Evaluate the layer on one input
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;
}

/// Token embedding table `[vocab, hidden]`.
#[derive(Debug, Clone)]
pub struct Embedding {
    table: Tensor,
}

impl Embedding {
    pub fn new(table: Tensor) -> Result<Self> {
        if table.rank() != 2 {
            bail!("embedding table must be 2-D, got {:?}", table.dims());
        }
        Ok(Self { table })
    }

    pub fn hidden_size(&self) -> usize {
        self.table.dims()[1]
    }

    pub fn vocab_size(&self) -> usize {
        self.table.dims()[0]
    }
}

impl Layer for Embedding {
    fn kind(&self) -> LayerKind {
        LayerKind::Embedding
    }

    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        if !ids.dtype().is_int() {
            bail!("embedding lookup expects integer ids, got {:?}", ids.dtype());
        }
        let mut out_dims = ids.dims().to_vec();
        out_dims.push(self.hidden_size());
        let flat = ids.flatten_all()?;
        Ok(self.table.index_select(&flat, 0)?.reshape(out_dims)?)
    }
}

/// Dense `y = x W^T + b` with `W: [out, in]`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if weight.rank() != 2 {
            bail!("linear weight must be 2-D, got {:?}", weight.dims());
        }
        if let Some(b) = &bias {
            if b.dims() != [weight.dims()[0]] {
                bail!(
                    "bias shape {:?} does not match {} output features",
                    b.dims(),
                    weight.dims()[0]
                );
            }
        }
        Ok(Self { weight, bias })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }
}

impl Layer for Linear {
    fn kind(&self) -> LayerKind {
        LayerKind::Linear
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let w = match *xs.dims() {
            [b1, b2, _, _] => self.weight.broadcast_left((b1, b2))?.t()?,
            [b, _, _] => self.weight.broadcast_left(b)?.t()?,
            _ => self.weight.t()?,
        };
        let ys = xs.matmul(&w)?;
        match &self.bias {
            Some(b) => Ok(ys.broadcast_add(b)?),
            None => Ok(ys),
        }
    }
}

/// 2-D convolution over `[batch, c_in, h, w]`.
#[derive(Debug, Clone)]
pub struct Conv2d {
    kernel: Tensor,
    bias: Option<Tensor>,
    padding: usize,
    stride: usize,
}

impl Conv2d {
    pub fn new(kernel: Tensor, bias: Option<Tensor>, padding: usize, stride: usize) -> Result<Self> {
        if kernel.rank() != 4 {
            bail!("conv2d kernel must be 4-D, got {:?}", kernel.dims());
        }
        if stride == 0 {
            bail!("conv2d stride must be positive");
        }
        Ok(Self {
            kernel,
            bias,
            padding,
            stride,
        })
    }

    pub fn kernel(&self) -> &Tensor {
        &self.kernel
    }

    pub(crate) fn with_kernel(&self, kernel: Tensor) -> Self {
        Self {
            kernel,
            ..self.clone()
        }
    }
}

impl Layer for Conv2d {
    fn kind(&self) -> LayerKind {
        LayerKind::Conv2d
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs.conv2d(&self.kernel, self.padding, self.stride, 1, 1)?;
        match &self.bias {
            Some(b) => {
                let b = b.reshape((1, b.elem_count(), 1, 1))?;
                Ok(ys.broadcast_add(&b)?)
            }
            None => Ok(ys),
        }
    }
}

/// Root-mean-square normalization over the last dimension.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }
}

impl Layer for RmsNorm {
    fn kind(&self) -> LayerKind {
        LayerKind::Norm
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ms = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = xs.broadcast_div(&(ms + self.eps)?.sqrt()?)?;
        Ok(normed.broadcast_mul(&self.weight)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Silu,
    Relu,
    Gelu,
}

impl Layer for Activation {
    fn kind(&self) -> LayerKind {
        LayerKind::Activation
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::Silu => xs.silu()?,
            Self::Relu => xs.relu()?,
            Self::Gelu => xs.gelu()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn linear_applies_weight_and_bias() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[1f32, 0.0], [0.0, 2.0], [1.0, 1.0]], &dev).unwrap();
        let b = Tensor::new(&[0f32, 0.0, 1.0], &dev).unwrap();
        let lin = Linear::new(w, Some(b)).unwrap();
        let x = Tensor::new(&[[3f32, 4.0]], &dev).unwrap();
        let y = lin.forward(&x).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![3.0, 8.0, 8.0]]);
        assert_eq!((lin.in_features(), lin.out_features()), (2, 3));
    }

    #[test]
    fn linear_handles_batched_sequences() {
        let dev = Device::Cpu;
        let lin = Linear::new(Tensor::ones((4, 4), DType::F32, &dev).unwrap(), None).unwrap();
        let x = Tensor::ones((2, 3, 4), DType::F32, &dev).unwrap();
        assert_eq!(lin.forward(&x).unwrap().dims(), &[2, 3, 4]);
    }

    #[test]
    fn embedding_keeps_id_shape() {
        let dev = Device::Cpu;
        let table = Tensor::arange(0f32, 12.0, &dev).unwrap().reshape((4, 3)).unwrap();
        let emb = Embedding::new(table).unwrap();
        let ids = Tensor::new(&[[2u32, 0]], &dev).unwrap();
        let out = emb.forward(&ids).unwrap();
        assert_eq!(out.dims(), &[1, 2, 3]);
        assert_eq!(
            out.to_vec3::<f32>().unwrap(),
            vec![vec![vec![6.0, 7.0, 8.0], vec![0.0, 1.0, 2.0]]]
        );
    }

    #[test]
    fn embedding_rejects_float_input() {
        let dev = Device::Cpu;
        let emb = Embedding::new(Tensor::zeros((4, 3), DType::F32, &dev).unwrap()).unwrap();
        assert!(emb.forward(&Tensor::zeros(2, DType::F32, &dev).unwrap()).is_err());
    }

    #[test]
    fn conv2d_keeps_spatial_shape_with_padding() {
        let dev = Device::Cpu;
        let k = Tensor::ones((2, 2, 3, 3), DType::F32, &dev).unwrap();
        let conv = Conv2d::new(k, None, 1, 1).unwrap();
        let x = Tensor::ones((1, 2, 5, 5), DType::F32, &dev).unwrap();
        assert_eq!(conv.forward(&x).unwrap().dims(), &[1, 2, 5, 5]);
    }

    #[test]
    fn rms_norm_unit_rows() {
        let dev = Device::Cpu;
        let norm = RmsNorm::new(Tensor::ones(2, DType::F32, &dev).unwrap(), 0.0);
        let x = Tensor::new(&[[3f32, 3.0]], &dev).unwrap();
        let y = norm.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert!((y[0][0] - 1.0).abs() < 1e-6);
    }
}
