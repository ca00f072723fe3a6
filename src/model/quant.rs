//! Layers whose weights are stored as Q8K blocks.
//!
//! Both layers report a quantized [`LayerKind`], which is what LIM selection
//! targets by default.

use super::layers::{Conv2d, Layer, LayerKind, Linear};
use anyhow::{bail, Result};
use candle_core::quantized::k_quants::{matmul, BlockQ8K, QK_K};
use candle_core::quantized::GgmlType;
use candle_core::{DType, Tensor};

/// Linear layer evaluated with the Q8K block matmul.
#[derive(Debug, Clone)]
pub struct QuantLinear {
    blocks: Vec<BlockQ8K>,
    out_features: usize,
    in_features: usize,
    bias: Option<Tensor>,
}

impl QuantLinear {
    /// Quantize a dense layer. The inner dimension must be a multiple of `QK_K`.
    pub fn from_linear(linear: &Linear) -> Result<Self> {
        let (rows, k) = (linear.out_features(), linear.in_features());
        let data = linear
            .weight()
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let blocks = quantize_rows_q8k(rows, k, &data)?;
        Ok(Self {
            blocks,
            out_features: rows,
            in_features: k,
            bias: linear.bias().cloned(),
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Layer for QuantLinear {
    fn kind(&self) -> LayerKind {
        LayerKind::QuantLinear
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut dims = xs.dims().to_vec();
        let k = dims.last().copied().unwrap_or(0);
        if k == 0 || k != self.in_features {
            bail!(
                "input inner dim {k} does not match {} input features",
                self.in_features
            );
        }
        let m = xs.elem_count() / k;
        let lhs = xs.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mut dst = vec![0f32; m * self.out_features];
        matmul::<BlockQ8K>((m, k, self.out_features), &lhs, &self.blocks, &mut dst)
            .map_err(|e| anyhow::anyhow!("q8k matmul failed: {}", e))?;

        if let Some(last) = dims.last_mut() {
            *last = self.out_features;
        }
        let ys = Tensor::from_vec(dst, dims, xs.device())?;
        match &self.bias {
            Some(b) => Ok(ys.broadcast_add(b)?),
            None => Ok(ys),
        }
    }
}

/// Conv2d whose kernel went through a Q8K quantize/dequantize round.
#[derive(Debug, Clone)]
pub struct QuantConv2d {
    inner: Conv2d,
}

impl QuantConv2d {
    /// Each output channel's kernel (`c_in * kh * kw` values) must be a
    /// multiple of `QK_K`.
    pub fn from_conv2d(conv: &Conv2d) -> Result<Self> {
        let kernel = conv.kernel();
        let dims = kernel.dims().to_vec();
        let rows = dims[0];
        let k = kernel.elem_count() / rows.max(1);
        let data = kernel.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let blocks = quantize_rows_q8k(rows, k, &data)?;
        let mut restored = vec![0f32; rows * k];
        BlockQ8K::to_float(&blocks, &mut restored)?;
        let kernel = Tensor::from_vec(restored, dims, kernel.device())?;
        Ok(Self {
            inner: conv.with_kernel(kernel),
        })
    }
}

impl Layer for QuantConv2d {
    fn kind(&self) -> LayerKind {
        LayerKind::QuantConv2d
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.inner.forward(xs)
    }
}

pub fn quantize_rows_q8k(rows: usize, k: usize, data: &[f32]) -> Result<Vec<BlockQ8K>> {
    if k == 0 || k % QK_K != 0 {
        bail!("inner dim {k} not a positive multiple of {QK_K}");
    }
    let blocks_per_row = k / QK_K;
    let mut blocks = vec![BlockQ8K::zeros(); rows * blocks_per_row];
    for r in 0..rows {
        let row = &data[r * k..(r + 1) * k];
        let dst = &mut blocks[r * blocks_per_row..(r + 1) * blocks_per_row];
        BlockQ8K::from_float(row, dst)?;
    }
    Ok(blocks)
}
