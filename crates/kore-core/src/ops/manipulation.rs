//! Tensor manipulation operations: cat, stack, unbind, split, chunk.
//!
//! `cat` and `stack` allocate fresh storage; `unbind`, `split` and `chunk`
//! return views of the source.

use crate::error::KoreError;
use crate::shape::normalize_axis;
use crate::tensor::Tensor;
use crate::Result;

fn check_axis(axis: isize, ndim: usize, extra: usize) -> Result<usize> {
    normalize_axis(axis, ndim, extra).ok_or(KoreError::InvalidAxis { axis, ndim })
}

impl Tensor {
    /// Concatenate tensors along a given axis.
    ///
    /// All tensors must share dtype, device and every dimension except `axis`.
    pub fn cat(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
        if tensors.is_empty() {
            return Err(KoreError::StorageError("cat: empty tensor list".into()));
        }
        let first = tensors[0];
        let ndim = first.ndim();
        if ndim == 0 {
            return Err(KoreError::StorageError("cat: cannot concatenate scalars".into()));
        }
        let axis = check_axis(axis, ndim, 0)?;

        for t in &tensors[1..] {
            if t.dtype() != first.dtype() {
                return Err(KoreError::DTypeMismatch {
                    expected: first.dtype(),
                    got: t.dtype(),
                });
            }
            if t.device() != first.device() {
                return Err(KoreError::DeviceMismatch {
                    expected: first.device(),
                    got: t.device(),
                });
            }
            let compatible = t.ndim() == ndim
                && (0..ndim).all(|d| d == axis || t.shape().dims()[d] == first.shape().dims()[d]);
            if !compatible {
                return Err(KoreError::ShapeMismatch {
                    expected: first.shape().dims().to_vec(),
                    got: t.shape().dims().to_vec(),
                });
            }
        }

        let mut out_shape: Vec<usize> = first.shape().dims().to_vec();
        out_shape[axis] = tensors.iter().map(|t| t.shape().dims()[axis]).sum();
        let out = Tensor::zeros_on(&out_shape, first.dtype(), first.device());

        let mut start = 0;
        for t in tensors {
            let len = t.shape().dims()[axis];
            out.slice_at(axis, start, len, 1)?.copy_(t)?;
            start += len;
        }
        Ok(out)
    }

    /// Stack tensors along a new axis.
    ///
    /// All tensors must have the same shape. A new dimension is inserted at `axis`.
    pub fn stack(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
        if tensors.is_empty() {
            return Err(KoreError::StorageError("stack: empty tensor list".into()));
        }
        let first = tensors[0];
        let axis = check_axis(axis, first.ndim(), 1)?;

        for t in &tensors[1..] {
            if t.shape() != first.shape() {
                return Err(KoreError::ShapeMismatch {
                    expected: first.shape().dims().to_vec(),
                    got: t.shape().dims().to_vec(),
                });
            }
        }

        let unsqueezed = tensors
            .iter()
            .map(|t| t.unsqueeze_at(axis))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Tensor> = unsqueezed.iter().collect();
        Tensor::cat(&refs, axis as isize)
    }

    /// Views of each index along `axis`, with that dimension removed.
    pub fn unbind(&self, axis: isize) -> Result<Vec<Tensor>> {
        let axis = check_axis(axis, self.ndim(), 0)?;
        (0..self.shape().dims()[axis])
            .map(|i| self.select_at(axis, i))
            .collect()
    }

    /// Split into views of `split_size` along an axis. The last piece may be smaller.
    pub fn split(&self, split_size: usize, axis: isize) -> Result<Vec<Tensor>> {
        if split_size == 0 {
            return Err(KoreError::StorageError("split: split_size must be > 0".into()));
        }
        let axis = check_axis(axis, self.ndim(), 0)?;
        let dim_size = self.shape().dims()[axis];

        let mut pieces = Vec::with_capacity(dim_size.div_ceil(split_size));
        let mut start = 0;
        while start < dim_size {
            let len = split_size.min(dim_size - start);
            pieces.push(self.slice_at(axis, start, len, 1)?);
            start += len;
        }
        Ok(pieces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DType, Device};

    #[test]
    fn test_cat_axis0() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = Tensor::from_f32(&[5.0, 6.0], &[1, 2]);
        let c = Tensor::cat(&[&a, &b], 0).unwrap();
        assert_eq!(c.shape().dims(), &[3, 2]);
        assert_eq!(c.to_vec_f32(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(!c.shares_storage(&a));
    }

    #[test]
    fn test_cat_axis1() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = Tensor::from_f32(&[5.0, 6.0], &[2, 1]);
        let c = Tensor::cat(&[&a, &b], -1).unwrap();
        assert_eq!(c.to_vec_f32(), vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
    }

    #[test]
    fn test_cat_rejects_mismatch() {
        let a = Tensor::zeros(&[2, 2], DType::F32);
        assert!(Tensor::cat(&[&a, &Tensor::zeros(&[2, 3], DType::F32)], 0).is_err());
        assert!(matches!(
            Tensor::cat(&[&a, &Tensor::zeros(&[2, 2], DType::I64)], 0),
            Err(KoreError::DTypeMismatch { .. })
        ));
        assert!(matches!(
            Tensor::cat(&[&a, &Tensor::zeros_on(&[2, 2], DType::F32, Device::Cuda(0))], 0),
            Err(KoreError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn test_stack() {
        let a = Tensor::from_i64(&[1, 2], &[2]);
        let b = Tensor::from_i64(&[3, 4], &[2]);
        let s = Tensor::stack(&[&a, &b], 0).unwrap();
        assert_eq!(s.shape().dims(), &[2, 2]);
        assert_eq!(s.dtype(), DType::I64);
        let s1 = Tensor::stack(&[&a, &b], 1).unwrap();
        assert_eq!(s1.to_vec_i64(), vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_unbind_views() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let cols = t.unbind(1).unwrap();
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[2].to_vec_f32(), vec![3.0, 6.0]);
        cols[0].fill_(0.0).unwrap();
        assert_eq!(t.to_vec_f32(), vec![0.0, 2.0, 3.0, 0.0, 5.0, 6.0]);
    }

    #[test]
    fn test_split() {
        let t = Tensor::arange(0.0, 10.0, 1.0);
        let parts = t.split(4, 0).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].to_vec_f32(), vec![8.0, 9.0]);
        assert!(t.split(0, 0).is_err());
    }
}
