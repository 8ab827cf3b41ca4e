//! Element-wise arithmetic operations on tensors.
//!
//! Results are freshly allocated on the left operand's device. Mixed dtypes
//! promote to the wider float type; bool operands compute as 0/1.

use crate::device::Device;
use crate::dtype::DType;
use crate::error::KoreError;
use crate::shape::Shape;
use crate::storage::{Buffer, Storage};
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Element-wise addition: self + other.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, |a, b| a + b)
    }

    /// Element-wise multiplication: self * other.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, |a, b| a * b)
    }

    /// Scalar addition: self + scalar.
    pub fn add_scalar(&self, scalar: f64) -> Tensor {
        unary_op(self, |a| a + scalar)
    }

    /// Scalar multiplication: self * scalar.
    pub fn mul_scalar(&self, scalar: f64) -> Tensor {
        unary_op(self, |a| a * scalar)
    }

    /// Sum of all elements.
    pub fn sum_all(&self) -> f64 {
        self.to_vec_f64().iter().sum()
    }
}

fn result_dtype(a: DType, b: DType) -> DType {
    match (a, b) {
        (a, b) if a == b && a != DType::Bool => a,
        (DType::F64, _) | (_, DType::F64) => DType::F64,
        (DType::I64, DType::I64) => DType::I64,
        (DType::I64, DType::Bool) | (DType::Bool, DType::I64) => DType::I64,
        _ => DType::F32,
    }
}

fn from_values(values: Vec<f64>, dtype: DType, shape: Shape, device: Device) -> Tensor {
    let buffer = Buffer::F64(values).cast(dtype);
    Tensor::dense(Storage::new(buffer, device), shape)
}

/// Apply a unary operation element-wise. Bool inputs produce f32.
fn unary_op(a: &Tensor, op: impl Fn(f64) -> f64) -> Tensor {
    let dtype = result_dtype(a.dtype(), a.dtype());
    let result: Vec<f64> = a.to_vec_f64().into_iter().map(op).collect();
    from_values(result, dtype, a.shape().clone(), a.device())
}

/// Apply a binary operation element-wise with broadcasting.
fn binary_op(a: &Tensor, b: &Tensor, op: impl Fn(f64, f64) -> f64) -> Result<Tensor> {
    if a.device() != b.device() {
        return Err(KoreError::DeviceMismatch {
            expected: a.device(),
            got: b.device(),
        });
    }
    let out_shape = a
        .shape()
        .broadcast_with(b.shape())
        .ok_or_else(|| KoreError::ShapeMismatch {
            expected: a.shape().dims().to_vec(),
            got: b.shape().dims().to_vec(),
        })?;

    let x = a.expand(out_shape.dims())?.to_vec_f64();
    let y = b.expand(out_shape.dims())?.to_vec_f64();
    let result: Vec<f64> = x.iter().zip(y.iter()).map(|(&x, &y)| op(x, y)).collect();
    Ok(from_values(
        result,
        result_dtype(a.dtype(), b.dtype()),
        out_shape,
        a.device(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_broadcast() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = Tensor::from_f32(&[10.0, 20.0, 30.0], &[3]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.shape().dims(), &[2, 3]);
        assert_eq!(c.to_vec_f32(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_mul() {
        let a = Tensor::from_f64(&[6.0, 8.0], &[2]);
        let b = Tensor::from_f64(&[2.0, 4.0], &[2]);
        assert_eq!(a.mul(&b).unwrap().to_vec_f64(), vec![12.0, 32.0]);
    }

    #[test]
    fn test_dtype_promotion() {
        let i = Tensor::from_i64(&[1, 2], &[2]);
        assert_eq!(i.add(&i).unwrap().dtype(), DType::I64);
        assert_eq!(i.add(&Tensor::from_f32(&[0.5, 0.5], &[2])).unwrap().dtype(), DType::F32);
        assert_eq!(i.add(&Tensor::from_f64(&[0.5, 0.5], &[2])).unwrap().dtype(), DType::F64);
        assert_eq!(Tensor::from_bool(&[true], &[1]).add_scalar(1.0).dtype(), DType::F32);
    }

    #[test]
    fn test_scalar_ops() {
        let a = Tensor::from_f32(&[1.0, -2.0], &[2]);
        assert_eq!(a.mul_scalar(2.0).to_vec_f32(), vec![2.0, -4.0]);
        assert_eq!(a.add_scalar(1.0).to_vec_f32(), vec![2.0, -1.0]);
        assert_eq!(a.sum_all(), -1.0);
    }

    #[test]
    fn test_incompatible_shapes() {
        let a = Tensor::zeros(&[2, 3], DType::F32);
        let b = Tensor::zeros(&[4], DType::F32);
        assert!(matches!(a.add(&b), Err(KoreError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_result_keeps_device() {
        let a = Tensor::zeros_on(&[2], DType::F32, Device::Cuda(1));
        assert_eq!(a.add_scalar(1.0).device(), Device::Cuda(1));
        assert!(a.add(&Tensor::zeros(&[2], DType::F32)).is_err());
    }
}
