//! Comparison operations on tensors. Element-wise results are `Bool` tensors.

use crate::storage::{Buffer, Storage};
use crate::tensor::Tensor;

impl Tensor {
    /// Element-wise `self > value`, usable directly as a boolean mask.
    pub fn gt_scalar(&self, value: f64) -> Tensor {
        let result: Vec<bool> = self.to_vec_f64().into_iter().map(|a| a > value).collect();
        Tensor::dense(
            Storage::new(Buffer::Bool(result), self.device()),
            self.shape().clone(),
        )
    }

    /// Whether any element is non-zero.
    pub fn any(&self) -> bool {
        self.to_vec_f64().iter().any(|&v| v != 0.0)
    }

    /// Same shape and element values. Dtypes may differ; values are
    /// compared after widening to f64.
    pub fn equal(&self, other: &Tensor) -> bool {
        self.shape() == other.shape() && self.to_vec_f64() == other.to_vec_f64()
    }
}

#[cfg(test)]
mod tests {
    use crate::{DType, Device, Tensor};

    #[test]
    fn test_gt_scalar_mask() {
        let a = Tensor::from_i64(&[0, 5, 2], &[3]);
        let m = a.gt_scalar(1.0);
        assert_eq!(m.dtype(), DType::Bool);
        assert_eq!(m.to_vec_bool(), vec![false, true, true]);
        assert!(m.any());
        assert!(!a.gt_scalar(5.0).any());
        let on_gpu = Tensor::zeros_on(&[2], DType::F32, Device::Cuda(0)).gt_scalar(0.0);
        assert_eq!(on_gpu.device(), Device::Cuda(0));
    }

    #[test]
    fn test_equal() {
        let a = Tensor::from_f32(&[1.0, 2.0], &[2]);
        assert!(a.equal(&Tensor::from_f64(&[1.0, 2.0], &[2])));
        assert!(!a.equal(&Tensor::from_f32(&[1.0, 2.0], &[1, 2])));
        assert!(!a.equal(&Tensor::from_f32(&[1.0, 2.5], &[2])));
    }
}
