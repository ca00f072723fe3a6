//! Layer input-output mismatch metric.

use super::error::LimError;
use anyhow::Result;
use candle_core::{DType, Tensor};

/// L2 norm of a whole tensor, accumulated in f64.
pub fn l2_norm(t: &Tensor) -> Result<f64> {
    let sq = t.to_dtype(DType::F64)?.sqr()?.sum_all()?;
    Ok(sq.to_scalar::<f64>()?.sqrt())
}

/// `||output - input|| / ||input||` for one layer.
///
/// Fails with [`LimError::ShapeMismatch`] when the shapes differ. A zero-norm
/// input yields `NaN`.
pub fn lim(layer: &str, input: &Tensor, output: &Tensor) -> Result<f64> {
    if input.shape() != output.shape() {
        return Err(LimError::ShapeMismatch {
            layer: layer.to_string(),
            input: input.dims().to_vec(),
            output: output.dims().to_vec(),
        }
        .into());
    }

    let input = input.to_dtype(DType::F64)?;
    let output = output.to_dtype(DType::F64)?;

    let input_norm = l2_norm(&input)?;
    if input_norm == 0.0 {
        return Ok(f64::NAN);
    }
    let diff_norm = l2_norm(&(output - &input)?)?;
    Ok(diff_norm / input_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use proptest::prelude::*;

    #[test]
    fn ones_to_twos_is_one() {
        let dev = Device::Cpu;
        let x = Tensor::ones((1, 4), DType::F32, &dev).unwrap();
        let y = (Tensor::ones((1, 4), DType::F32, &dev).unwrap() * 2.0).unwrap();
        let v = lim("l", &x, &y).unwrap();
        assert!((v - 1.0).abs() < 1e-12, "got {v}");
    }

    #[test]
    fn identical_tensors_give_zero() {
        let x = Tensor::new(&[[0.5f32, -1.0, 3.0]], &Device::Cpu).unwrap();
        assert_eq!(lim("l", &x, &x.clone()).unwrap(), 0.0);
    }

    #[test]
    fn shape_mismatch_is_typed() {
        let dev = Device::Cpu;
        let x = Tensor::ones((1, 4), DType::F32, &dev).unwrap();
        let y = Tensor::ones((1, 3), DType::F32, &dev).unwrap();
        let err = lim("proj", &x, &y).unwrap_err();
        match err.downcast_ref::<LimError>() {
            Some(LimError::ShapeMismatch { layer, input, output }) => {
                assert_eq!(layer, "proj");
                assert_eq!(input, &vec![1, 4]);
                assert_eq!(output, &vec![1, 3]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_input_is_nan() {
        let dev = Device::Cpu;
        let x = Tensor::zeros((2, 2), DType::F32, &dev).unwrap();
        let y = Tensor::ones((2, 2), DType::F32, &dev).unwrap();
        assert!(lim("l", &x, &y).unwrap().is_nan());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn lim_is_non_negative(
            pairs in proptest::collection::vec((-100f32..100f32, -100f32..100f32), 1..32)
        ) {
            let (xs, ys): (Vec<f32>, Vec<f32>) = pairs.into_iter().unzip();
            let n = xs.len();
            let x = Tensor::from_vec(xs.clone(), n, &Device::Cpu).unwrap();
            let y = Tensor::from_vec(ys.clone(), n, &Device::Cpu).unwrap();
            let v = lim("l", &x, &y).unwrap();
            if xs.iter().all(|&a| a == 0.0) {
                prop_assert!(v.is_nan());
            } else {
                prop_assert!(v >= 0.0);
                prop_assert_eq!(v == 0.0, xs == ys);
            }
        }
    }
}
