//! Aliasing and write-through behaviour of tensor views.
//! Run with: cargo test -p kore-core --test view_tests

use kore_core::{index_shape, DType, Device, KoreError, StorageMode, Tensor, TensorIndex};
use rstest::rstest;

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "element {} differs: {} vs {} (tol={})",
            i, x, y, tol
        );
    }
}

fn cube() -> Tensor {
    Tensor::arange(0.0, 60.0, 1.0).reshape(&[3, 4, 5]).unwrap()
}

// ============================================================================
// Chained views
// ============================================================================

#[test]
fn test_chained_views_write_through() {
    let t = cube();
    let v = t
        .permute(&[2, 0, 1])
        .unwrap()
        .unsqueeze(0)
        .unwrap()
        .index(&[0.into(), (1..3).into(), (..).into(), vec![3, 1].into()])
        .unwrap();
    assert_eq!(v.shape().dims(), &[2, 3, 2]);
    v.fill_(-1.0).unwrap();

    // v[k, i, j] aliases t[i, pick[j], 1 + k]
    for i in 0..3 {
        for &r in &[1, 3] {
            for c in 1..3 {
                let x = t.index(&[i.into(), r.into(), c.into()]).unwrap().item().unwrap();
                assert_eq!(x, -1.0, "t[{i}, {r}, {c}]");
            }
        }
    }
    let untouched = t.index(&[0.into(), 0.into(), 0.into()]).unwrap();
    assert_eq!(untouched.item().unwrap(), 0.0);
}

#[test]
fn test_source_writes_visible_in_mask_view() {
    let t = cube();
    let mask = t.select(2, 0).unwrap().gt_scalar(25.0);
    let picked = t.index(&[mask.into()]).unwrap();
    assert_eq!(picked.shape().dims(), &[6, 5]);
    t.zero_().unwrap();
    assert!(!picked.any());
}

#[test]
fn test_expand_then_copy_into_slice() {
    let t = Tensor::zeros(&[4, 3], DType::F32);
    let row = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
    t.narrow(0, 1, 2).unwrap().copy_(&row).unwrap();
    assert_close(
        &t.to_vec_f32(),
        &[0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 0.0, 0.0, 0.0],
        1e-6,
    );
}

#[test]
fn test_comparison_mask_over_transpose() {
    let t = cube();
    let tt = t.transpose(0, 2).unwrap();
    assert_eq!(tt.shape().dims(), &[5, 4, 3]);

    let high = tt.gt_scalar(56.5);
    assert_eq!(high.dtype(), DType::Bool);
    let picked = tt.index(&[high.into()]).unwrap();
    assert_eq!(picked.to_vec_f32(), vec![57.0, 58.0, 59.0]);

    picked.fill_(-2.0).unwrap();
    let hits = t.to_vec_f32().iter().filter(|&&v| v == -2.0).count();
    assert_eq!(hits, 3);
}

#[test]
fn test_unbind_stack_roundtrip() {
    let t = cube();
    let parts = t.unbind(1).unwrap();
    let refs: Vec<&Tensor> = parts.iter().collect();
    let back = Tensor::stack(&refs, 1).unwrap();
    assert!(back.equal(&t));
    assert!(!back.shares_storage(&t));
}

// ============================================================================
// Devices and storage modes
// ============================================================================

#[test]
fn test_device_transfer_keeps_values() {
    let t = cube();
    let g = t.to(Device::Cuda(0)).unwrap();
    assert_eq!(g.device(), Device::Cuda(0));
    assert!(g.equal(&t));
    let v = g.select(0, 1).unwrap();
    assert_eq!(v.device(), Device::Cuda(0));
}

#[test]
fn test_storage_mode_visible_through_views() {
    let t = cube();
    let v = t.select(0, 0).unwrap();
    t.share_memory_().unwrap();
    assert!(v.is_shared());
    assert_eq!(v.storage_mode(), StorageMode::Shared);
    assert!(matches!(v.memmap_(), Err(KoreError::InvalidStorageMode { .. })));
}

#[test]
fn test_memmap_rejects_device_tensors() {
    let g = Tensor::zeros_on(&[2], DType::F32, Device::Cuda(0));
    assert!(g.memmap_().is_err());
    assert!(!g.is_memmapped());
}

// ============================================================================
// Index validation
// ============================================================================

#[rstest]
#[case(vec![], &[3, 4, 5])]
#[case(vec![0.into()], &[4, 5])]
#[case(vec![(..).into(), (-1).into()], &[3, 5])]
#[case(vec![TensorIndex::NewAxis, 1.into()], &[1, 4, 5])]
#[case(vec![(0..2).into(), vec![3, 1, 0].into()], &[2, 3, 5])]
#[case(vec![TensorIndex::step_by(None, None, 2)], &[2, 4, 5])]
fn test_index_shape_matches_view(#[case] idx: Vec<TensorIndex>, #[case] expected: &[usize]) {
    let t = cube();
    assert_eq!(index_shape(t.shape().dims(), &idx).unwrap().dims(), expected);
    assert_eq!(t.index(&idx).unwrap().shape().dims(), expected);
}

#[rstest]
#[case(vec![3.into()])]
#[case(vec![(-4).into()])]
#[case(vec![0.into(), 0.into(), 0.into(), 0.into()])]
#[case(vec![(..).into(), vec![4].into()])]
fn test_index_out_of_range(#[case] idx: Vec<TensorIndex>) {
    let t = cube();
    assert!(matches!(t.index(&idx), Err(KoreError::InvalidIndex(_))));
}

#[test]
fn test_two_advanced_items_rejected() {
    let t = cube();
    let err = t
        .index(&[vec![0].into(), TensorIndex::Full, vec![1].into()])
        .unwrap_err();
    assert!(matches!(err, KoreError::InvalidIndex(_)));
}

#[test]
fn test_empty_slice_has_zero_extent() {
    let t = cube();
    let e = t.index(&[(3..).into()]).unwrap();
    assert_eq!(e.shape().dims(), &[0, 4, 5]);
    assert_eq!(e.numel(), 0);
    e.fill_(1.0).unwrap();
    assert_eq!(t.sum_all(), (0..60).sum::<i32>() as f64);
}
