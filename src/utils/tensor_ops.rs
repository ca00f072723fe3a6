//! Conversion from safetensors views to candle tensors.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use half::{bf16, f16};
use safetensors::tensor::{Dtype, TensorView};

/// Decode little-endian float payloads to f32.
pub fn tensor_to_f32(bytes: &[u8], dtype: Dtype) -> Result<Vec<f32>> {
    Ok(match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        other => bail!("unsupported float dtype {other:?}"),
    })
}

/// Build a tensor from a safetensors view.
///
/// Floating point payloads become F32, token id payloads keep an integer
/// dtype so the model can route them through its embedding.
pub fn view_to_tensor(view: &TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape = view.shape().to_vec();
    let bytes = view.data();
    let t = match view.dtype() {
        Dtype::F32 | Dtype::F16 | Dtype::BF16 => {
            Tensor::from_vec(tensor_to_f32(bytes, view.dtype())?, shape, device)?
        }
        Dtype::I64 => {
            let ids: Vec<i64> = bytes
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            Tensor::from_vec(ids, shape, device)?
        }
        Dtype::I32 => {
            let ids: Vec<i64> = bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                .collect();
            Tensor::from_vec(ids, shape, device)?
        }
        Dtype::U32 => {
            let ids: Vec<u32> = bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_vec(ids, shape, device)?
        }
        Dtype::U8 => Tensor::from_vec(bytes.to_vec(), shape, device)?,
        other => bail!("unsupported dtype {other:?}"),
    };
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_half_precision() {
        let bytes: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_bits().to_le_bytes())
            .collect();
        assert_eq!(tensor_to_f32(&bytes, Dtype::F16).unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn integer_views_stay_integer() {
        let ids: Vec<u8> = [3i64, 7].iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = TensorView::new(Dtype::I64, vec![1, 2], &ids).unwrap();
        let t = view_to_tensor(&view, &Device::Cpu).unwrap();
        assert!(t.dtype().is_int());
        assert_eq!(t.to_vec2::<i64>().unwrap(), vec![vec![3, 7]]);
    }
}
