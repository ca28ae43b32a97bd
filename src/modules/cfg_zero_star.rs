//! CFG-Zero* guidance correction
//!
//! Early in the trajectory the unconditional prediction is poorly aligned
//! with the conditional one and plain CFG overshoots. The correction
//! projects the conditional prediction onto the unconditional one and uses
//! that projection as the guidance origin:
//!
//! ```text
//! alpha  = <cond, uncond> / (|uncond|^2 + eps)     (per batch element)
//! output = alpha * uncond + scale * (cond - alpha * uncond)
//! ```

use burn::prelude::*;

const EPS: f32 = 1e-8;

/// Zero-star patch parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfgZeroStar {
    /// Number of opening steps that use the corrected combination
    pub steps: usize,
}

impl CfgZeroStar {
    pub fn new(steps: usize) -> Self {
        Self { steps }
    }

    pub fn is_active(&self, step: usize) -> bool {
        step < self.steps
    }
}

/// Standard classifier-free guidance
pub fn cfg<B: Backend>(cond: Tensor<B, 5>, uncond: Tensor<B, 5>, scale: f32) -> Tensor<B, 5> {
    uncond.clone() + (cond - uncond) * scale
}

/// Per-batch projection coefficient of `cond` onto `uncond`, shaped `[B, 1, 1, 1, 1]`
pub fn optimized_scale<B: Backend>(cond: Tensor<B, 5>, uncond: Tensor<B, 5>) -> Tensor<B, 5> {
    let batch = cond.dims()[0];
    let dot = (cond * uncond.clone()).reshape([batch as i32, -1]).sum_dim(1);
    let norm = (uncond.clone() * uncond).reshape([batch as i32, -1]).sum_dim(1) + EPS;
    (dot / norm).reshape([batch, 1, 1, 1, 1])
}

/// Guidance with the zero-star origin
pub fn cfg_zero_star<B: Backend>(cond: Tensor<B, 5>, uncond: Tensor<B, 5>, scale: f32) -> Tensor<B, 5> {
    let alpha = optimized_scale(cond.clone(), uncond.clone());
    let origin = uncond * alpha;
    origin.clone() + (cond - origin) * scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn tensor(values: Vec<f32>) -> Tensor<TestBackend, 5> {
        let n = values.len();
        Tensor::from_data(TensorData::new(values, [1, 1, 1, 1, n]), &Default::default())
    }

    #[test]
    fn test_window() {
        let zero = CfgZeroStar::new(2);
        assert!(zero.is_active(0));
        assert!(zero.is_active(1));
        assert!(!zero.is_active(2));
        assert!(!CfgZeroStar::new(0).is_active(0));
    }

    #[test]
    fn test_parallel_predictions_match_cond() {
        // cond = 2 * uncond -> alpha = 2, origin = cond, output = cond
        let uncond = tensor(vec![1.0, 2.0, 3.0]);
        let cond = tensor(vec![2.0, 4.0, 6.0]);
        let out = cfg_zero_star(cond.clone(), uncond, 6.0);
        let out = out.into_data().to_vec::<f32>().unwrap();
        let expected = cond.into_data().to_vec::<f32>().unwrap();
        for (a, b) in out.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_orthogonal_predictions_drop_uncond() {
        let uncond = tensor(vec![1.0, 0.0]);
        let cond = tensor(vec![0.0, 1.0]);
        let out = cfg_zero_star(cond, uncond, 3.0).into_data().to_vec::<f32>().unwrap();
        assert!(out[0].abs() < 1e-6);
        assert!((out[1] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_plain_cfg_scale_one_is_cond() {
        let uncond = tensor(vec![5.0, -1.0]);
        let cond = tensor(vec![0.5, 0.25]);
        let out = cfg(cond.clone(), uncond, 1.0);
        out.into_data().assert_eq(&cond.into_data(), true);
    }
}
